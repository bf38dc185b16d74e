//! Compression settings and the rules for which settings a selection offers.
//!
//! All images get quality and image format, all videos get bitrate and video
//! format, anything else (including mixed selections) is archived and only
//! chooses an archive format and level.

use serde::{Deserialize, Serialize};

use crate::error::ValidationError;
use crate::model::MediaKind;

/// Ratio reported when the backend omits one.
pub const DEFAULT_COMPRESSION_RATIO: f64 = 60.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Quality {
    Low,
    #[default]
    Medium,
    High,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ImageFormat {
    #[default]
    Jpeg,
    Png,
    Webp,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VideoFormat {
    #[default]
    Mp4,
    Webm,
}

/// Target video bitrate tier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Bitrate {
    Low,
    #[default]
    Medium,
    High,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum ArchiveFormat {
    #[default]
    #[serde(rename = "zip")]
    Zip,
    #[serde(rename = "rar")]
    Rar,
    #[serde(rename = "7z")]
    SevenZip,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CompressionLevel {
    Fast,
    #[default]
    Balanced,
    Maximum,
}

/// What the backend is asked to do. Serialized as the compress request body.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum CompressionSettings {
    Image {
        quality: Quality,
        format: ImageFormat,
    },
    Video {
        bitrate: Bitrate,
        format: VideoFormat,
    },
    Archive {
        format: ArchiveFormat,
        level: CompressionLevel,
    },
}

impl CompressionSettings {
    pub fn dialog_kind(&self) -> DialogKind {
        match self {
            CompressionSettings::Image { .. } => DialogKind::Image,
            CompressionSettings::Video { .. } => DialogKind::Video,
            CompressionSettings::Archive { .. } => DialogKind::Archive,
        }
    }

    /// Extension of the file the backend will produce.
    pub fn output_extension(&self) -> &'static str {
        match self {
            CompressionSettings::Image { format, .. } => match format {
                ImageFormat::Jpeg => "jpg",
                ImageFormat::Png => "png",
                ImageFormat::Webp => "webp",
            },
            CompressionSettings::Video { format, .. } => match format {
                VideoFormat::Mp4 => "mp4",
                VideoFormat::Webm => "webm",
            },
            CompressionSettings::Archive { format, .. } => match format {
                ArchiveFormat::Zip => "zip",
                ArchiveFormat::Rar => "rar",
                ArchiveFormat::SevenZip => "7z",
            },
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DialogKind {
    Image,
    Video,
    Archive,
}

/// The settings panel for a set of files.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompressionDialog {
    pub kind: DialogKind,
    pub item_count: usize,
}

impl CompressionDialog {
    /// `None` for an empty selection.
    pub fn for_kinds(kinds: impl IntoIterator<Item = MediaKind>) -> Option<Self> {
        let mut item_count = 0;
        let mut all_images = true;
        let mut all_videos = true;
        for kind in kinds {
            item_count += 1;
            all_images &= kind == MediaKind::Image;
            all_videos &= kind == MediaKind::Video;
        }
        if item_count == 0 {
            return None;
        }
        let kind = if all_images {
            DialogKind::Image
        } else if all_videos {
            DialogKind::Video
        } else {
            DialogKind::Archive
        };
        Some(Self { kind, item_count })
    }

    pub fn offers_quality(&self) -> bool {
        self.kind == DialogKind::Image
    }

    pub fn offers_bitrate(&self) -> bool {
        self.kind == DialogKind::Video
    }

    pub fn offers_archive_level(&self) -> bool {
        self.kind == DialogKind::Archive
    }

    pub fn default_settings(&self) -> CompressionSettings {
        match self.kind {
            DialogKind::Image => CompressionSettings::Image {
                quality: Quality::default(),
                format: ImageFormat::default(),
            },
            DialogKind::Video => CompressionSettings::Video {
                bitrate: Bitrate::default(),
                format: VideoFormat::default(),
            },
            DialogKind::Archive => CompressionSettings::Archive {
                format: ArchiveFormat::default(),
                level: CompressionLevel::default(),
            },
        }
    }

    pub fn accepts(&self, settings: &CompressionSettings) -> Result<(), ValidationError> {
        if settings.dialog_kind() == self.kind {
            Ok(())
        } else {
            Err(ValidationError::IncompatibleSettings(format!(
                "{:?} settings offered for {:?} selection",
                settings.dialog_kind(),
                self.kind
            )))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_all_images_get_quality_and_format() {
        let dialog = CompressionDialog::for_kinds([MediaKind::Image, MediaKind::Image]).unwrap();
        assert_eq!(dialog.kind, DialogKind::Image);
        assert!(dialog.offers_quality());
        assert!(!dialog.offers_bitrate());
        assert_eq!(dialog.item_count, 2);
    }

    #[test]
    fn test_all_videos_get_bitrate() {
        let dialog = CompressionDialog::for_kinds([MediaKind::Video]).unwrap();
        assert_eq!(dialog.kind, DialogKind::Video);
        assert!(dialog.offers_bitrate());
        assert!(!dialog.offers_quality());
    }

    #[test]
    fn test_mixed_or_other_is_archive_only() {
        let mixed = CompressionDialog::for_kinds([MediaKind::Image, MediaKind::Video]).unwrap();
        assert_eq!(mixed.kind, DialogKind::Archive);
        assert!(!mixed.offers_quality());
        assert!(!mixed.offers_bitrate());

        let audio = CompressionDialog::for_kinds([MediaKind::Audio]).unwrap();
        assert_eq!(audio.kind, DialogKind::Archive);
    }

    #[test]
    fn test_empty_selection_has_no_dialog() {
        assert!(CompressionDialog::for_kinds(std::iter::empty()).is_none());
    }

    #[test]
    fn test_accepts_only_matching_settings() {
        let dialog = CompressionDialog::for_kinds([MediaKind::Other]).unwrap();
        assert!(dialog.accepts(&dialog.default_settings()).is_ok());
        let image = CompressionSettings::Image {
            quality: Quality::High,
            format: ImageFormat::Webp,
        };
        assert!(matches!(
            dialog.accepts(&image),
            Err(ValidationError::IncompatibleSettings(_))
        ));
    }

    #[test]
    fn test_wire_format() {
        let settings = CompressionSettings::Archive {
            format: ArchiveFormat::SevenZip,
            level: CompressionLevel::Maximum,
        };
        assert_eq!(
            serde_json::to_value(settings).unwrap(),
            serde_json::json!({"type": "archive", "format": "7z", "level": "maximum"})
        );
        assert_eq!(settings.output_extension(), "7z");
    }
}
