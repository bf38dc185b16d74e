//! Scripted fakes for the remote ports.
//!
//! `FakeMetadataApi` keeps an in-memory backend and can be told to fail or
//! hold any call. `FakeObjectStore` does the same for object uploads.
//! `StaticTokens` answers token lookups with a fixed session.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::sync::{Notify, Semaphore};
use tokio_util::sync::CancellationToken;

use crate::auth::{AuthToken, TokenProvider};
use crate::compression::CompressionSettings;
use crate::error::{CoreError, CoreResult};
use crate::model::{compressed_name, FileItem, FolderId, FolderItem, Item, ItemId, ItemKind, ItemRef, UnixTimeMs};
use crate::remote::{CompressionReceipt, MetadataApi, RegisterObject};
use crate::upload::{ObjectStore, ProgressFn, StoredObject, UploadSource};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Holds a call until the test releases it.
pub struct Gate {
    entered: Notify,
    released: Semaphore,
}

impl Gate {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            entered: Notify::new(),
            released: Semaphore::new(0),
        })
    }

    /// Resolves once a call has reached the gate.
    pub async fn entered(&self) {
        self.entered.notified().await;
    }

    /// Lets one held call through.
    pub fn release(&self) {
        self.released.add_permits(1);
    }

    async fn pass(&self) {
        self.entered.notify_one();
        if let Ok(permit) = self.released.acquire().await {
            permit.forget();
        }
    }
}

pub fn file(id: u64, name: &str) -> FileItem {
    FileItem {
        id: ItemId::from(id),
        name: name.to_string(),
        parent_id: None,
        modified_at: Some(UnixTimeMs(1_700_000_000_000 + id)),
        url: format!("https://objects.example.com/{id}/{name}"),
        size_bytes: Some(1_000),
        mime_type: None,
        favorite: false,
    }
}

pub fn folder(id: u64, name: &str, parent: Option<FolderId>) -> FolderItem {
    FolderItem {
        id: ItemId::from(id),
        name: name.to_string(),
        parent_id: parent,
        modified_at: None,
    }
}

#[derive(Default)]
struct Backend {
    files: Vec<FileItem>,
    folders: Vec<FolderItem>,
}

#[derive(Default)]
struct Script {
    always: HashMap<&'static str, CoreError>,
    once: HashMap<&'static str, CoreError>,
    gates: HashMap<&'static str, Arc<Gate>>,
    calls: Vec<&'static str>,
}

// ============================================================================
// Metadata API
// ============================================================================

pub struct FakeMetadataApi {
    backend: Mutex<Backend>,
    script: Mutex<Script>,
    next_id: AtomicU64,
}

impl Default for FakeMetadataApi {
    fn default() -> Self {
        Self::new()
    }
}

impl FakeMetadataApi {
    pub fn new() -> Self {
        Self {
            backend: Mutex::new(Backend::default()),
            script: Mutex::new(Script::default()),
            next_id: AtomicU64::new(1_000),
        }
    }

    pub fn add_file(&self, file: FileItem) {
        lock(&self.backend).files.push(file);
    }

    pub fn add_folder(&self, folder: FolderItem) {
        lock(&self.backend).folders.push(folder);
    }

    pub fn files(&self) -> Vec<FileItem> {
        lock(&self.backend).files.clone()
    }

    pub fn folders(&self) -> Vec<FolderItem> {
        lock(&self.backend).folders.clone()
    }

    /// Every call to `op` fails until `clear_failure`.
    pub fn fail(&self, op: &'static str, error: CoreError) {
        lock(&self.script).always.insert(op, error);
    }

    pub fn fail_once(&self, op: &'static str, error: CoreError) {
        lock(&self.script).once.insert(op, error);
    }

    pub fn clear_failure(&self, op: &'static str) {
        let mut script = lock(&self.script);
        script.always.remove(op);
        script.once.remove(op);
    }

    /// Calls to `op` wait at the returned gate.
    pub fn hold(&self, op: &'static str) -> Arc<Gate> {
        let gate = Gate::new();
        lock(&self.script).gates.insert(op, Arc::clone(&gate));
        gate
    }

    pub fn call_count(&self, op: &str) -> usize {
        lock(&self.script).calls.iter().filter(|c| **c == op).count()
    }

    async fn enter(&self, op: &'static str) -> CoreResult<()> {
        let gate = {
            let mut script = lock(&self.script);
            script.calls.push(op);
            script.gates.get(op).cloned()
        };
        if let Some(gate) = gate {
            gate.pass().await;
        }
        let mut script = lock(&self.script);
        if let Some(error) = script.once.remove(op) {
            return Err(error);
        }
        match script.always.get(op) {
            Some(error) => Err(error.clone()),
            None => Ok(()),
        }
    }

    fn next_id(&self) -> ItemId {
        ItemId::from(self.next_id.fetch_add(1, Ordering::SeqCst))
    }

    fn not_found(id: &ItemId) -> CoreError {
        CoreError::rejected(Some(404), format!("item {id} not found"))
    }
}

#[async_trait::async_trait]
impl MetadataApi for FakeMetadataApi {
    async fn list_files(&self, folder: Option<&FolderId>) -> CoreResult<Vec<FileItem>> {
        self.enter("list_files").await?;
        Ok(lock(&self.backend)
            .files
            .iter()
            .filter(|f| f.parent_id.as_ref() == folder)
            .cloned()
            .collect())
    }

    async fn list_folders(&self, parent: Option<&FolderId>) -> CoreResult<Vec<FolderItem>> {
        self.enter("list_folders").await?;
        Ok(lock(&self.backend)
            .folders
            .iter()
            .filter(|f| f.parent_id.as_ref() == parent)
            .cloned()
            .collect())
    }

    async fn search(&self, query: &str) -> CoreResult<Vec<FileItem>> {
        self.enter("search").await?;
        let needle = query.to_lowercase();
        Ok(lock(&self.backend)
            .files
            .iter()
            .filter(|f| f.name.to_lowercase().contains(&needle))
            .cloned()
            .collect())
    }

    async fn create_folder(&self, name: &str, parent: Option<&FolderId>) -> CoreResult<FolderItem> {
        self.enter("create_folder").await?;
        let folder = FolderItem {
            id: self.next_id(),
            name: name.to_string(),
            parent_id: parent.cloned(),
            modified_at: Some(UnixTimeMs::now()),
        };
        lock(&self.backend).folders.push(folder.clone());
        Ok(folder)
    }

    async fn rename(&self, item: &ItemRef, new_name: &str) -> CoreResult<Option<Item>> {
        self.enter("rename").await?;
        let mut backend = lock(&self.backend);
        match item.kind {
            ItemKind::File => {
                let file = backend
                    .files
                    .iter_mut()
                    .find(|f| f.id == item.id)
                    .ok_or_else(|| Self::not_found(&item.id))?;
                file.name = new_name.to_string();
                Ok(Some(Item::File(file.clone())))
            }
            ItemKind::Folder => {
                let folder = backend
                    .folders
                    .iter_mut()
                    .find(|f| f.id == item.id)
                    .ok_or_else(|| Self::not_found(&item.id))?;
                folder.name = new_name.to_string();
                Ok(Some(Item::Folder(folder.clone())))
            }
        }
    }

    async fn delete(&self, item: &ItemRef) -> CoreResult<()> {
        self.enter("delete").await?;
        let mut backend = lock(&self.backend);
        let before = backend.files.len() + backend.folders.len();
        match item.kind {
            ItemKind::File => backend.files.retain(|f| f.id != item.id),
            ItemKind::Folder => backend.folders.retain(|f| f.id != item.id),
        }
        if backend.files.len() + backend.folders.len() == before {
            return Err(Self::not_found(&item.id));
        }
        Ok(())
    }

    async fn toggle_favorite(&self, id: &ItemId) -> CoreResult<Option<FileItem>> {
        self.enter("toggle_favorite").await?;
        let mut backend = lock(&self.backend);
        let file = backend
            .files
            .iter_mut()
            .find(|f| &f.id == id)
            .ok_or_else(|| Self::not_found(id))?;
        file.favorite = !file.favorite;
        Ok(Some(file.clone()))
    }

    async fn compress(
        &self,
        id: &ItemId,
        settings: &CompressionSettings,
    ) -> CoreResult<CompressionReceipt> {
        self.enter("compress").await?;
        let new_id = self.next_id();
        let mut backend = lock(&self.backend);
        let original = backend
            .files
            .iter()
            .find(|f| &f.id == id)
            .cloned()
            .ok_or_else(|| Self::not_found(id))?;
        let compressed = FileItem {
            id: new_id,
            name: compressed_name(&original.name, settings.output_extension()),
            size_bytes: original.size_bytes.map(|s| s / 2),
            favorite: false,
            modified_at: Some(UnixTimeMs::now()),
            ..original
        };
        backend.files.push(compressed.clone());
        Ok(CompressionReceipt {
            compression_ratio: 50.0,
            item: Some(compressed),
        })
    }

    async fn register(&self, object: &RegisterObject) -> CoreResult<FileItem> {
        self.enter("register").await?;
        let file = FileItem {
            id: self.next_id(),
            name: object.name.clone(),
            parent_id: object.parent_id.clone(),
            modified_at: Some(UnixTimeMs::now()),
            url: object.url.clone(),
            size_bytes: Some(object.size_bytes),
            mime_type: Some(object.mime_type.clone()),
            favorite: false,
        };
        lock(&self.backend).files.push(file.clone());
        Ok(file)
    }

    async fn download_url(&self, id: &ItemId) -> CoreResult<String> {
        self.enter("download_url").await?;
        lock(&self.backend)
            .files
            .iter()
            .find(|f| &f.id == id)
            .map(|f| format!("{}?download=1", f.url))
            .ok_or_else(|| Self::not_found(id))
    }
}

// ============================================================================
// Object store
// ============================================================================

#[derive(Default)]
pub struct FakeObjectStore {
    failure: Mutex<Option<CoreError>>,
    gate: Mutex<Option<Arc<Gate>>>,
    stored: Mutex<Vec<StoredObject>>,
}

impl FakeObjectStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_with(&self, error: CoreError) {
        *lock(&self.failure) = Some(error);
    }

    /// Every upload waits at the returned gate after reporting 50%.
    pub fn hold(&self) -> Arc<Gate> {
        let gate = Gate::new();
        *lock(&self.gate) = Some(Arc::clone(&gate));
        gate
    }

    pub fn stored(&self) -> Vec<StoredObject> {
        lock(&self.stored).clone()
    }
}

#[async_trait::async_trait]
impl ObjectStore for FakeObjectStore {
    async fn put_object(
        &self,
        source: &UploadSource,
        on_progress: ProgressFn,
        cancel: CancellationToken,
    ) -> CoreResult<StoredObject> {
        on_progress(50);
        let gate = lock(&self.gate).clone();
        if let Some(gate) = gate {
            tokio::select! {
                biased;
                () = cancel.cancelled() => return Err(CoreError::Cancelled),
                () = gate.pass() => {}
            }
        }
        if cancel.is_cancelled() {
            return Err(CoreError::Cancelled);
        }
        if let Some(error) = lock(&self.failure).clone() {
            return Err(error);
        }

        let mut stored = lock(&self.stored);
        let object = StoredObject {
            url: format!(
                "https://objects.example.com/{}/{}",
                stored.len(),
                source.handle.file_name()
            ),
            size_bytes: source.content.len() as u64,
        };
        stored.push(object.clone());
        drop(stored);
        on_progress(100);
        Ok(object)
    }
}

// ============================================================================
// Tokens
// ============================================================================

pub struct StaticTokens(Option<AuthToken>);

impl StaticTokens {
    pub fn signed_in() -> Arc<Self> {
        Arc::new(Self(Some(AuthToken::new("test-token"))))
    }

    pub fn signed_out() -> Arc<Self> {
        Arc::new(Self(None))
    }
}

#[async_trait::async_trait]
impl TokenProvider for StaticTokens {
    async fn auth_token(&self) -> CoreResult<Option<AuthToken>> {
        Ok(self.0.clone())
    }
}
