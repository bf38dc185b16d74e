use serde::{de, Deserialize, Deserializer, Serialize};
use std::fmt;

use crate::error::ValidationError;

/// Name fragment that marks the output of a compress operation.
pub const COMPRESSED_MARKER: &str = "_compressed";

pub const IMAGE_EXTENSIONS: &[&str] = &["jpg", "jpeg", "png", "gif", "bmp", "webp"];
pub const VIDEO_EXTENSIONS: &[&str] = &["mp4", "avi", "mov", "wmv", "flv", "webm", "mkv"];
pub const AUDIO_EXTENSIONS: &[&str] = &["mp3", "wav", "flac", "aac", "ogg", "m4a"];

// --- Identifiers ---

/// Server-issued item identifier. The backend sends numeric ids today, but
/// the core never does arithmetic on them.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(transparent)]
pub struct ItemId(String);

/// Folders share the item id space.
pub type FolderId = ItemId;

impl ItemId {
    const MAX_LENGTH: usize = 128;

    pub fn new(id: impl Into<String>) -> Result<Self, ValidationError> {
        let id = id.into().trim().to_string();
        if id.is_empty() {
            return Err(ValidationError::InvalidId("ItemId cannot be empty".into()));
        }
        if id.len() > Self::MAX_LENGTH {
            return Err(ValidationError::InvalidId(format!(
                "ItemId exceeds {} characters",
                Self::MAX_LENGTH
            )));
        }
        if id.chars().any(|c| c.is_control() || c == '/') {
            return Err(ValidationError::InvalidId(
                "ItemId contains invalid characters".into(),
            ));
        }
        Ok(Self(id))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ItemId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<u64> for ItemId {
    fn from(id: u64) -> Self {
        Self(id.to_string())
    }
}

impl<'de> Deserialize<'de> for ItemId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Raw {
            Number(i64),
            Text(String),
        }

        match Raw::deserialize(deserializer)? {
            Raw::Number(n) => ItemId::new(n.to_string()).map_err(de::Error::custom),
            Raw::Text(s) => ItemId::new(s).map_err(de::Error::custom),
        }
    }
}

/// Unix timestamp in milliseconds
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct UnixTimeMs(pub u64);

impl UnixTimeMs {
    pub fn now() -> Self {
        Self(u64::try_from(chrono::Utc::now().timestamp_millis()).unwrap_or(0))
    }
}

// --- Items ---

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ItemKind {
    File,
    Folder,
}

impl ItemKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ItemKind::File => "file",
            ItemKind::Folder => "folder",
        }
    }
}

/// Addresses one item on the backend, which routes files and folders to
/// different endpoints.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ItemRef {
    pub id: ItemId,
    pub kind: ItemKind,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MediaKind {
    Image,
    Video,
    Audio,
    Other,
}

impl MediaKind {
    /// Classifies by extension first, then by MIME type.
    pub fn classify(name: &str, mime_type: Option<&str>) -> Self {
        if let Some(ext) = extension_of(name) {
            if IMAGE_EXTENSIONS.contains(&ext.as_str()) {
                return MediaKind::Image;
            }
            if VIDEO_EXTENSIONS.contains(&ext.as_str()) {
                return MediaKind::Video;
            }
            if AUDIO_EXTENSIONS.contains(&ext.as_str()) {
                return MediaKind::Audio;
            }
        }
        match mime_type.map(str::to_ascii_lowercase) {
            Some(m) if m.starts_with("image/") => MediaKind::Image,
            Some(m) if m.starts_with("video/") => MediaKind::Video,
            Some(m) if m.starts_with("audio/") => MediaKind::Audio,
            _ => MediaKind::Other,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct FileItem {
    pub id: ItemId,
    pub name: String,
    pub parent_id: Option<FolderId>,
    pub modified_at: Option<UnixTimeMs>,
    pub url: String,
    pub size_bytes: Option<u64>,
    pub mime_type: Option<String>,
    pub favorite: bool,
}

impl FileItem {
    /// Lower-cased extension, if the name has one.
    pub fn extension(&self) -> Option<String> {
        extension_of(&self.name)
    }

    pub fn is_compressed_variant(&self) -> bool {
        self.name.contains(COMPRESSED_MARKER)
    }

    pub fn media_kind(&self) -> MediaKind {
        MediaKind::classify(&self.name, self.mime_type.as_deref())
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct FolderItem {
    pub id: FolderId,
    pub name: String,
    pub parent_id: Option<FolderId>,
    pub modified_at: Option<UnixTimeMs>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum Item {
    File(FileItem),
    Folder(FolderItem),
}

impl Item {
    pub fn id(&self) -> &ItemId {
        match self {
            Item::File(f) => &f.id,
            Item::Folder(f) => &f.id,
        }
    }

    pub fn name(&self) -> &str {
        match self {
            Item::File(f) => &f.name,
            Item::Folder(f) => &f.name,
        }
    }

    pub fn kind(&self) -> ItemKind {
        match self {
            Item::File(_) => ItemKind::File,
            Item::Folder(_) => ItemKind::Folder,
        }
    }

    pub fn parent_id(&self) -> Option<&FolderId> {
        match self {
            Item::File(f) => f.parent_id.as_ref(),
            Item::Folder(f) => f.parent_id.as_ref(),
        }
    }

    pub fn item_ref(&self) -> ItemRef {
        ItemRef {
            id: self.id().clone(),
            kind: self.kind(),
        }
    }

    pub fn as_file(&self) -> Option<&FileItem> {
        match self {
            Item::File(f) => Some(f),
            Item::Folder(_) => None,
        }
    }
}

// --- Name helpers ---

pub fn extension_of(name: &str) -> Option<String> {
    let (stem, ext) = name.rsplit_once('.')?;
    if stem.is_empty() || ext.is_empty() {
        return None;
    }
    Some(ext.to_ascii_lowercase())
}

/// `"photo.png"` with extension `"zip"` becomes `"photo_compressed.zip"`.
pub fn compressed_name(original: &str, extension: &str) -> String {
    let base = match original.rsplit_once('.') {
        Some((stem, _)) if !stem.is_empty() => stem,
        _ => original,
    };
    format!("{base}{COMPRESSED_MARKER}.{extension}")
}

/// Trims and checks a user-supplied item name.
pub fn validate_item_name(raw: &str, max_len: usize) -> Result<String, ValidationError> {
    let name = raw.trim();
    if name.is_empty() {
        return Err(ValidationError::EmptyName);
    }
    let len = name.chars().count();
    if len > max_len {
        return Err(ValidationError::NameTooLong { len, max: max_len });
    }
    if let Some(ch) = name
        .chars()
        .find(|c| *c == '/' || *c == '\\' || c.is_control())
    {
        return Err(ValidationError::InvalidNameCharacter { ch });
    }
    Ok(name.to_string())
}
