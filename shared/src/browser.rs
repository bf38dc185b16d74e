//! One browsing session: the folder on screen, its listing, the menu and
//! selection state, and the two coordinators that change things remotely.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, RwLock};
use tracing::{info, instrument, warn};

use crate::auth::{TokenProvider, TokenStore};
use crate::capabilities::{KeyNamespace, KeyValueStore, ReqwestTransport, TypedKvStore};
use crate::compression::{CompressionDialog, CompressionSettings};
use crate::config::ClientConfig;
use crate::error::{CoreError, CoreResult, Notice, ValidationError};
use crate::event::{CoreEvent, EventBus};
use crate::model::{validate_item_name, FileItem, FolderId, FolderItem, Item, ItemId};
use crate::mutation::{BatchCompressReport, CompressOutcome, MutationCoordinator};
use crate::navigation::{Breadcrumb, NavigationState};
use crate::remote::{HttpMetadataClient, MetadataApi};
use crate::selection::{FileAction, FolderAction, MenuCommand, SelectionMachine, SelectionState};
use crate::store::{Category, ItemCollectionStore, SharedStore, SortOption};
use crate::upload::{
    HttpObjectStore, ObjectStore, ObjectUploadClient, UploadCoordinator, UploadJobId, UploadSource,
};

const VIEW_PREFERENCES_KEY: &str = "view";

/// Everything the session needs from the outside world.
#[derive(Clone)]
pub struct CoreContext {
    pub config: ClientConfig,
    pub api: Arc<dyn MetadataApi>,
    pub objects: Arc<dyn ObjectStore>,
    pub tokens: Arc<dyn TokenProvider>,
    pub kv: Arc<dyn KeyValueStore>,
    pub events: Arc<EventBus>,
}

impl CoreContext {
    pub fn new(
        config: ClientConfig,
        api: Arc<dyn MetadataApi>,
        objects: Arc<dyn ObjectStore>,
        tokens: Arc<dyn TokenProvider>,
        kv: Arc<dyn KeyValueStore>,
    ) -> CoreResult<Self> {
        config.validate()?;
        let events = Arc::new(EventBus::new(config.event_buffer));
        Ok(Self {
            config,
            api,
            objects,
            tokens,
            kv,
            events,
        })
    }

    /// Production wiring: `reqwest` for both the backend and the object
    /// store, and the bearer token read from `kv`.
    pub fn connect(config: ClientConfig, kv: Arc<dyn KeyValueStore>) -> CoreResult<Self> {
        config.validate()?;
        let tokens = Arc::new(TokenStore::new(Arc::clone(&kv), &config.token_key)?);
        let transport = Arc::new(ReqwestTransport::new()?);
        let api = Arc::new(HttpMetadataClient::new(
            &config,
            transport,
            Arc::clone(&tokens) as Arc<dyn TokenProvider>,
        )?);
        let objects = Arc::new(HttpObjectStore::new(&config)?);
        Self::new(config, api, objects, tokens, kv)
    }

    pub fn token_store(&self) -> CoreResult<TokenStore> {
        TokenStore::new(Arc::clone(&self.kv), &self.config.token_key)
    }
}

/// Extra input some menu commands need.
#[derive(Debug, Clone, PartialEq, Default)]
pub enum CommandArgs {
    #[default]
    None,
    Name(String),
    Compression(CompressionSettings),
}

#[derive(Debug, Clone, PartialEq)]
pub enum CommandOutcome {
    /// The shell should open this URL in a viewer.
    Open { url: String },
    Download { url: String },
    Navigated,
    Updated(Item),
    Deleted,
    Compressed(CompressOutcome),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
struct ViewPreferences {
    category: Category,
    sort: SortOption,
}

/// Snapshot for rendering.
#[derive(Debug, Clone, PartialEq)]
pub struct BrowserView {
    pub breadcrumbs: Vec<Breadcrumb>,
    pub folder_id: Option<FolderId>,
    pub items: Vec<Item>,
    pub category: Category,
    pub sort: SortOption,
    pub search_query: Option<String>,
    pub loading: bool,
    pub selection: SelectionState,
}

pub struct FileBrowser {
    ctx: CoreContext,
    store: SharedStore,
    navigation: RwLock<NavigationState>,
    selection: Mutex<SelectionMachine>,
    mutations: MutationCoordinator,
    uploads: UploadCoordinator,
    preferences: TypedKvStore<ViewPreferences>,
}

impl FileBrowser {
    pub fn new(ctx: CoreContext) -> Self {
        let store = ItemCollectionStore::shared();
        let mutations = MutationCoordinator::new(
            Arc::clone(&ctx.api),
            Arc::clone(&store),
            Arc::clone(&ctx.events),
            ctx.config.max_name_length,
        );
        let uploads = UploadCoordinator::new(
            ObjectUploadClient::new(
                Arc::clone(&ctx.objects),
                Arc::clone(&ctx.api),
                Arc::clone(&ctx.tokens),
            ),
            Arc::clone(&store),
            Arc::clone(&ctx.events),
            Arc::clone(&ctx.kv),
            ctx.config.max_concurrent_uploads,
        );
        let preferences = TypedKvStore::new(Arc::clone(&ctx.kv), KeyNamespace::Settings);
        Self {
            ctx,
            store,
            navigation: RwLock::new(NavigationState::new()),
            selection: Mutex::new(SelectionMachine::new()),
            mutations,
            uploads,
            preferences,
        }
    }

    /// Restores saved view preferences and unfinished registrations, then
    /// loads the root folder.
    #[instrument(skip(self))]
    pub async fn open(&self) -> CoreResult<()> {
        match self.preferences.get(VIEW_PREFERENCES_KEY).await {
            Ok(Some(prefs)) => {
                let mut store = self.store.write().await;
                store.set_category(prefs.category);
                store.set_sort(prefs.sort);
            }
            Ok(None) => {}
            Err(e) => warn!(error = %e, "could not read view preferences"),
        }
        match self.uploads.restore_pending().await {
            Ok(restored) if !restored.is_empty() => {
                self.ctx.events.publish(CoreEvent::Notice(Notice::warning(
                    "PENDING_REGISTRATIONS",
                    format!("{} uploaded file(s) still need to be saved.", restored.len()),
                )));
            }
            Ok(_) => {}
            Err(e) => warn!(error = %e, "could not restore pending registrations"),
        }
        self.navigate().await
    }

    pub fn subscribe(&self) -> broadcast::Receiver<CoreEvent> {
        self.ctx.events.subscribe()
    }

    pub fn acknowledge_sign_in(&self) {
        self.ctx.events.acknowledge_sign_in();
    }

    pub fn uploads(&self) -> &UploadCoordinator {
        &self.uploads
    }

    pub fn mutations(&self) -> &MutationCoordinator {
        &self.mutations
    }

    fn selection(&self) -> MutexGuard<'_, SelectionMachine> {
        self.selection.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn fail<T>(&self, error: impl Into<CoreError>) -> CoreResult<T> {
        let error = error.into();
        self.ctx.events.report(&error);
        Err(error)
    }

    pub async fn view(&self) -> BrowserView {
        let breadcrumbs = self.navigation.read().await.breadcrumbs().to_vec();
        let view = self.store.read().await.view();
        BrowserView {
            breadcrumbs,
            folder_id: view.folder_id,
            items: view.items,
            category: view.category,
            sort: view.sort,
            search_query: view.search_query,
            loading: view.loading,
            selection: self.selection().state().clone(),
        }
    }

    // ========================================================================
    // Loading and navigation
    // ========================================================================

    /// Refetches the folder on screen, keeping its items until the new
    /// listing arrives.
    #[instrument(skip(self))]
    pub async fn refresh(&self) -> CoreResult<()> {
        let folder = self.navigation.read().await.current_folder_id().cloned();
        let generation = self.store.write().await.begin_reload();
        self.fetch(folder, generation).await
    }

    async fn navigate(&self) -> CoreResult<()> {
        self.selection().clear();
        let folder = self.navigation.read().await.current_folder_id().cloned();
        let generation = self.store.write().await.reset_for(folder.clone());
        self.ctx.events.publish(CoreEvent::NavigationChanged {
            folder_id: folder.clone(),
        });
        self.fetch(folder, generation).await
    }

    async fn fetch(&self, folder: Option<FolderId>, generation: u64) -> CoreResult<()> {
        let (files, folders) = tokio::join!(
            self.ctx.api.list_files(folder.as_ref()),
            self.ctx.api.list_folders(folder.as_ref())
        );
        let (mut files, mut folders) = match (files, folders) {
            (Ok(files), Ok(folders)) => (files, folders),
            (Err(e), _) | (_, Err(e)) => {
                self.store.write().await.finish_loading(generation);
                return self.fail(e);
            }
        };
        // Listings may leave out the parent the request already implies.
        for file in files.iter_mut().filter(|f| f.parent_id.is_none()) {
            file.parent_id.clone_from(&folder);
        }
        for child in folders.iter_mut().filter(|f| f.parent_id.is_none()) {
            child.parent_id.clone_from(&folder);
        }

        let applied = {
            let mut store = self.store.write().await;
            let applied = store.replace_contents(generation, files, folders);
            if applied {
                let mut selection = self.selection();
                selection.retain(|id| store.find(id).is_some());
            }
            applied
        };
        if applied {
            self.ctx.events.publish(CoreEvent::ItemsChanged { folder_id: folder });
        } else {
            info!("discarded listing for a folder no longer displayed");
        }
        Ok(())
    }

    #[instrument(skip(self), fields(folder_id = %folder_id))]
    pub async fn enter_folder(&self, folder_id: &FolderId) -> CoreResult<()> {
        let folder = self
            .store
            .read()
            .await
            .folders()
            .iter()
            .find(|f| &f.id == folder_id)
            .cloned();
        let Some(folder) = folder else {
            return self.fail(ValidationError::UnknownItem(folder_id.clone()));
        };
        if let Err(e) = self.navigation.write().await.enter_folder(&folder) {
            return self.fail(e);
        }
        self.navigate().await
    }

    pub async fn jump_to_breadcrumb(&self, index: usize) -> CoreResult<()> {
        if let Err(e) = self.navigation.write().await.jump_to_breadcrumb(index) {
            return self.fail(e);
        }
        self.navigate().await
    }

    /// Goes up one level. Does nothing at the root.
    pub async fn go_up(&self) -> CoreResult<()> {
        if !self.navigation.write().await.pop() {
            return Ok(());
        }
        self.navigate().await
    }

    // ========================================================================
    // View preferences and search
    // ========================================================================

    pub async fn set_category(&self, category: Category) {
        self.store.write().await.set_category(category);
        self.save_preferences().await;
    }

    pub async fn set_sort(&self, sort: SortOption) {
        self.store.write().await.set_sort(sort);
        self.save_preferences().await;
    }

    async fn save_preferences(&self) {
        let (prefs, folder_id) = {
            let store = self.store.read().await;
            (
                ViewPreferences {
                    category: store.category(),
                    sort: store.sort(),
                },
                store.folder_id().cloned(),
            )
        };
        if let Err(e) = self.preferences.put(VIEW_PREFERENCES_KEY, &prefs).await {
            warn!(error = %e, "could not save view preferences");
        }
        self.ctx.events.publish(CoreEvent::ItemsChanged { folder_id });
    }

    /// A blank query clears the search.
    #[instrument(skip(self))]
    pub async fn search(&self, query: &str) -> CoreResult<()> {
        let query = query.trim();
        if query.is_empty() {
            self.clear_search().await;
            return Ok(());
        }
        let folder_id = {
            let mut store = self.store.write().await;
            store.begin_search(query.to_string());
            store.folder_id().cloned()
        };
        self.ctx.events.publish(CoreEvent::ItemsChanged {
            folder_id: folder_id.clone(),
        });

        let result = self.ctx.api.search(query).await;
        let (results, outcome) = match result {
            Ok(results) => (results, Ok(())),
            Err(e) => (Vec::new(), self.fail(e)),
        };
        if self.store.write().await.set_search_results(query, results) {
            self.ctx.events.publish(CoreEvent::ItemsChanged { folder_id });
        }
        outcome
    }

    pub async fn clear_search(&self) {
        let (cleared, folder_id) = {
            let mut store = self.store.write().await;
            (store.clear_search(), store.folder_id().cloned())
        };
        if cleared {
            self.ctx.events.publish(CoreEvent::ItemsChanged { folder_id });
        }
    }

    // ========================================================================
    // Item commands
    // ========================================================================

    #[instrument(skip(self))]
    pub async fn create_folder(&self, name: &str) -> CoreResult<FolderItem> {
        let name = match validate_item_name(name, self.ctx.config.max_name_length) {
            Ok(name) => name,
            Err(e) => return self.fail(e),
        };
        let parent = self.navigation.read().await.current_folder_id().cloned();
        let mut folder = match self.ctx.api.create_folder(&name, parent.as_ref()).await {
            Ok(folder) => folder,
            Err(e) => return self.fail(e),
        };
        if folder.parent_id.is_none() {
            folder.parent_id = parent;
        }
        if self.store.write().await.insert_folder(folder.clone()) {
            self.ctx.events.publish(CoreEvent::ItemsChanged {
                folder_id: folder.parent_id.clone(),
            });
        }
        info!(folder_id = %folder.id, "folder created");
        Ok(folder)
    }

    /// Opens the context menu for an item on screen and returns its entries.
    pub async fn open_menu(&self, item_id: &ItemId) -> CoreResult<Vec<MenuCommand>> {
        let Some(item) = self.store.read().await.find(item_id) else {
            return self.fail(ValidationError::UnknownItem(item_id.clone()));
        };
        self.selection().open_menu(&item);
        Ok(MenuCommand::available_for(&item))
    }

    pub fn close_menu(&self) {
        self.selection().close_menu();
    }

    pub async fn toggle_selection(&self, file_id: &ItemId) -> CoreResult<()> {
        let file = self.store.read().await.find(file_id);
        let Some(Item::File(file)) = file else {
            return self.fail(ValidationError::UnknownItem(file_id.clone()));
        };
        let result = self.selection().toggle(&file);
        result.or_else(|e| self.fail(e))
    }

    pub fn clear_selection(&self) {
        self.selection().clear();
    }

    /// Runs a menu entry against the item whose menu is open. The menu
    /// closes whatever the outcome.
    #[instrument(skip(self, args))]
    pub async fn dispatch(&self, command: MenuCommand, args: CommandArgs) -> CoreResult<CommandOutcome> {
        let target = {
            let mut selection = self.selection();
            let target = selection.menu_target().map(|(id, kind)| (id.clone(), kind));
            selection.close_menu();
            target
        };
        let item_id = match target {
            Some((id, kind)) if kind == command.target_kind() => id,
            Some(_) => {
                return self.fail(ValidationError::Selection(
                    "command does not apply to this item".to_string(),
                ))
            }
            None => return self.fail(ValidationError::Selection("no menu is open".to_string())),
        };

        match command {
            MenuCommand::File(FileAction::Open) => {
                let file = self.file_on_screen(&item_id).await?;
                Ok(CommandOutcome::Open { url: file.url })
            }
            MenuCommand::File(FileAction::Download) => match self.ctx.api.download_url(&item_id).await {
                Ok(url) => Ok(CommandOutcome::Download { url }),
                Err(e) => self.fail(e),
            },
            MenuCommand::File(FileAction::ToggleFavorite) => {
                let file = self.mutations.toggle_favorite(&item_id).await?;
                Ok(CommandOutcome::Updated(Item::File(file)))
            }
            MenuCommand::File(FileAction::Rename) | MenuCommand::Folder(FolderAction::Rename) => {
                let CommandArgs::Name(name) = args else {
                    return self.fail(ValidationError::EmptyName);
                };
                let item = self.mutations.rename(&item_id, &name).await?;
                Ok(CommandOutcome::Updated(item))
            }
            MenuCommand::File(FileAction::Delete) | MenuCommand::Folder(FolderAction::Delete) => {
                self.mutations.delete(&item_id).await?;
                Ok(CommandOutcome::Deleted)
            }
            MenuCommand::File(FileAction::Compress) => {
                let CommandArgs::Compression(settings) = args else {
                    return self.fail(ValidationError::IncompatibleSettings(
                        "no compression settings given".to_string(),
                    ));
                };
                let file = self.file_on_screen(&item_id).await?;
                let dialog = CompressionDialog::for_kinds([file.media_kind()]);
                if let Some(Err(e)) = dialog.map(|d| d.accepts(&settings)) {
                    return self.fail(e);
                }
                let outcome = self.mutations.compress(&item_id, &settings).await?;
                if outcome.compressed.is_none() {
                    self.refresh().await?;
                }
                Ok(CommandOutcome::Compressed(outcome))
            }
            MenuCommand::Folder(FolderAction::Open) => {
                self.enter_folder(&item_id).await?;
                Ok(CommandOutcome::Navigated)
            }
        }
    }

    async fn file_on_screen(&self, id: &ItemId) -> CoreResult<FileItem> {
        match self.store.read().await.find(id) {
            Some(Item::File(file)) => Ok(file),
            _ => self.fail(ValidationError::UnknownItem(id.clone())),
        }
    }

    /// The settings panel for the current multi-selection.
    pub async fn compression_dialog(&self) -> CoreResult<CompressionDialog> {
        let files = self.selected_files().await;
        let result = self.selection().batch_dialog(&files);
        result.or_else(|e| self.fail(e))
    }

    async fn selected_files(&self) -> Vec<FileItem> {
        let ids = self.selection().selected_ids().to_vec();
        let store = self.store.read().await;
        ids.iter()
            .filter_map(|id| match store.find(id) {
                Some(Item::File(file)) => Some(file),
                _ => None,
            })
            .collect()
    }

    /// Compresses every selected file in turn and clears the selection.
    #[instrument(skip(self, settings))]
    pub async fn batch_compress(&self, settings: &CompressionSettings) -> CoreResult<BatchCompressReport> {
        let dialog = self.compression_dialog().await?;
        if let Err(e) = dialog.accepts(settings) {
            return self.fail(e);
        }
        let ids = {
            let mut selection = self.selection();
            let ids = selection.selected_ids().to_vec();
            selection.clear();
            ids
        };

        let report = self.mutations.compress_batch(&ids, settings).await;
        if report.failed > 0 {
            self.ctx.events.publish(CoreEvent::Notice(Notice::warning(
                "BATCH_COMPRESS_INCOMPLETE",
                format!("{} of {} file(s) could not be compressed.", report.failed, ids.len()),
            )));
        }
        if report.succeeded > 0 {
            self.refresh().await?;
        }
        Ok(report)
    }

    /// Starts uploading into the folder on screen.
    pub async fn upload(&self, source: UploadSource) -> UploadJobId {
        let folder = self.navigation.read().await.current_folder_id().cloned();
        self.uploads.submit(source, folder)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capabilities::MemoryKvStore;
    use crate::compression::{ArchiveFormat, CompressionLevel, ImageFormat, Quality};
    use crate::testing::{file, folder, FakeMetadataApi, FakeObjectStore, StaticTokens};
    use crate::upload::{LocalHandle, UploadPhase};
    use bytes::Bytes;

    struct Harness {
        browser: FileBrowser,
        api: Arc<FakeMetadataApi>,
        kv: Arc<dyn KeyValueStore>,
    }

    fn harness_with(api: Arc<FakeMetadataApi>, kv: Arc<dyn KeyValueStore>) -> Harness {
        let ctx = CoreContext::new(
            ClientConfig::default(),
            Arc::clone(&api) as Arc<dyn MetadataApi>,
            Arc::new(FakeObjectStore::new()),
            StaticTokens::signed_in(),
            Arc::clone(&kv),
        )
        .unwrap();
        Harness {
            browser: FileBrowser::new(ctx),
            api,
            kv,
        }
    }

    async fn opened() -> Harness {
        let api = Arc::new(FakeMetadataApi::new());
        api.add_folder(folder(10, "Docs", None));
        api.add_file(file(1, "a.txt"));
        let mut nested = file(2, "nested.png");
        nested.parent_id = Some(ItemId::from(10));
        api.add_file(nested);
        let h = harness_with(api, Arc::new(MemoryKvStore::new()));
        h.browser.open().await.unwrap();
        h
    }

    fn names(view: &BrowserView) -> Vec<&str> {
        view.items.iter().map(Item::name).collect()
    }

    #[tokio::test]
    async fn test_open_loads_root() {
        let h = opened().await;
        let view = h.browser.view().await;
        assert_eq!(view.folder_id, None);
        assert!(!view.loading);
        assert_eq!(names(&view), ["Docs", "a.txt"]);
        assert_eq!(view.breadcrumbs.len(), 1);
    }

    #[tokio::test]
    async fn test_view_lists_folders_before_sorted_files() {
        let api = Arc::new(FakeMetadataApi::new());
        let mut small = file(1, "small.bin");
        small.size_bytes = Some(50);
        let mut big = file(2, "big.bin");
        big.size_bytes = Some(100);
        let mut photos = folder(10, "Photos", None);
        photos.modified_at = Some(crate::model::UnixTimeMs(1_800_000_000_000));
        api.add_file(small);
        api.add_file(big);
        api.add_folder(photos);
        api.add_folder(folder(11, "Archive", None));
        let h = harness_with(api, Arc::new(MemoryKvStore::new()));
        h.browser.open().await.unwrap();

        h.browser.set_sort(SortOption::Size).await;
        assert_eq!(
            names(&h.browser.view().await),
            ["Photos", "Archive", "big.bin", "small.bin"]
        );

        h.browser.set_sort(SortOption::Date).await;
        assert_eq!(
            names(&h.browser.view().await),
            ["Photos", "Archive", "big.bin", "small.bin"]
        );

        h.browser.set_sort(SortOption::Type).await;
        h.browser.set_category(Category::Folders).await;
        assert_eq!(names(&h.browser.view().await), ["Photos", "Archive"]);
    }

    #[tokio::test]
    async fn test_enter_folder_resets_selection_and_refetches() {
        let h = opened().await;
        h.browser.toggle_selection(&ItemId::from(1)).await.unwrap();

        h.browser.enter_folder(&ItemId::from(10)).await.unwrap();
        let view = h.browser.view().await;
        assert_eq!(view.folder_id, Some(ItemId::from(10)));
        assert_eq!(names(&view), ["nested.png"]);
        assert_eq!(view.selection, SelectionState::Idle);
        assert_eq!(view.breadcrumbs[1].name, "Docs");

        h.browser.jump_to_breadcrumb(0).await.unwrap();
        assert_eq!(h.browser.view().await.items.len(), 2);
    }

    #[tokio::test]
    async fn test_late_listing_for_previous_folder_is_discarded() {
        let h = Arc::new(opened().await);
        let slow_gate = h.api.hold("list_files");

        let slow = Arc::clone(&h);
        let first = tokio::spawn(async move { slow.browser.enter_folder(&ItemId::from(10)).await });
        slow_gate.entered().await;

        let fast_gate = h.api.hold("list_files");
        let fast = Arc::clone(&h);
        let second = tokio::spawn(async move { fast.browser.go_up().await });
        fast_gate.entered().await;
        fast_gate.release();
        second.await.unwrap().unwrap();

        slow_gate.release();
        first.await.unwrap().unwrap();

        let view = h.browser.view().await;
        assert_eq!(view.folder_id, None);
        assert_eq!(view.items.len(), 2);
    }

    #[tokio::test]
    async fn test_search_replaces_listing_until_cleared() {
        let h = opened().await;
        h.browser.search("nested").await.unwrap();
        let view = h.browser.view().await;
        assert_eq!(names(&view), ["nested.png"]);
        assert_eq!(view.search_query.as_deref(), Some("nested"));

        h.browser.search("   ").await.unwrap();
        assert_eq!(h.browser.view().await.items.len(), 2);
    }

    #[tokio::test]
    async fn test_menu_dispatch_rename_and_delete() {
        let h = opened().await;
        h.browser.open_menu(&ItemId::from(1)).await.unwrap();
        let outcome = h
            .browser
            .dispatch(
                MenuCommand::File(FileAction::Rename),
                CommandArgs::Name("b.txt".into()),
            )
            .await
            .unwrap();
        assert!(matches!(outcome, CommandOutcome::Updated(ref item) if item.name() == "b.txt"));
        assert_eq!(h.browser.view().await.selection, SelectionState::Idle);

        h.browser.open_menu(&ItemId::from(10)).await.unwrap();
        assert!(h
            .browser
            .dispatch(MenuCommand::File(FileAction::Delete), CommandArgs::None)
            .await
            .is_err());

        h.browser.open_menu(&ItemId::from(10)).await.unwrap();
        h.browser
            .dispatch(MenuCommand::Folder(FolderAction::Delete), CommandArgs::None)
            .await
            .unwrap();
        assert_eq!(names(&h.browser.view().await), ["b.txt"]);
    }

    #[tokio::test]
    async fn test_dispatch_without_menu_is_rejected() {
        let h = opened().await;
        let err = h
            .browser
            .dispatch(MenuCommand::File(FileAction::Open), CommandArgs::None)
            .await
            .unwrap_err();
        assert!(matches!(err, CoreError::Validation(ValidationError::Selection(_))));
    }

    #[tokio::test]
    async fn test_single_compress_checks_settings_against_file_kind() {
        let h = opened().await;
        h.browser.open_menu(&ItemId::from(1)).await.unwrap();
        let image = CompressionSettings::Image {
            quality: Quality::High,
            format: ImageFormat::Webp,
        };
        assert!(h
            .browser
            .dispatch(MenuCommand::File(FileAction::Compress), CommandArgs::Compression(image))
            .await
            .is_err());
        assert_eq!(h.api.call_count("compress"), 0);
    }

    #[tokio::test]
    async fn test_batch_compress_from_selection() {
        let h = opened().await;
        h.api.add_file(file(3, "c.txt"));
        h.browser.refresh().await.unwrap();

        h.browser.toggle_selection(&ItemId::from(1)).await.unwrap();
        h.browser.toggle_selection(&ItemId::from(3)).await.unwrap();
        let dialog = h.browser.compression_dialog().await.unwrap();
        assert!(dialog.offers_archive_level());

        let report = h
            .browser
            .batch_compress(&CompressionSettings::Archive {
                format: ArchiveFormat::Zip,
                level: CompressionLevel::Fast,
            })
            .await
            .unwrap();
        assert_eq!(report.succeeded, 2);
        assert_eq!(report.average_ratio, Some(50.0));

        let view = h.browser.view().await;
        assert_eq!(view.selection, SelectionState::Idle);
        let mut names = names(&view);
        names.sort_unstable();
        assert_eq!(names, ["Docs", "a_compressed.zip", "c_compressed.zip"]);
    }

    #[tokio::test]
    async fn test_create_folder_appears_in_listing() {
        let h = opened().await;
        let created = h.browser.create_folder(" Photos ").await.unwrap();
        assert_eq!(created.name, "Photos");
        assert!(h
            .browser
            .view()
            .await
            .items
            .iter()
            .any(|i| i.name() == "Photos"));
    }

    #[tokio::test]
    async fn test_upload_targets_current_folder() {
        let h = opened().await;
        h.browser.enter_folder(&ItemId::from(10)).await.unwrap();
        let source = UploadSource::new(
            LocalHandle::new("content://1").with_name("new.txt"),
            Bytes::from_static(b"data"),
        );
        let id = h.browser.upload(source).await;
        let job = h.browser.uploads().wait(&id).await.unwrap();

        assert_eq!(job.phase, UploadPhase::Done);
        assert_eq!(job.target_folder_id, Some(ItemId::from(10)));
        assert!(h
            .browser
            .view()
            .await
            .items
            .iter()
            .any(|i| i.name() == "new.txt"));
    }

    #[tokio::test]
    async fn test_view_preferences_persist() {
        let h = opened().await;
        h.browser.set_sort(SortOption::Size).await;
        h.browser.set_category(Category::Folders).await;

        let reopened = harness_with(Arc::clone(&h.api), Arc::clone(&h.kv));
        reopened.browser.open().await.unwrap();
        let view = reopened.browser.view().await;
        assert_eq!(view.sort, SortOption::Size);
        assert_eq!(view.category, Category::Folders);
        assert_eq!(names(&view), ["Docs"]);
    }

    #[tokio::test]
    async fn test_listing_failure_reports_and_stops_loading() {
        let h = opened().await;
        h.api.fail("list_folders", CoreError::transport("offline"));
        let mut rx = h.browser.subscribe();

        assert!(h.browser.refresh().await.is_err());
        assert!(!h.browser.view().await.loading);
        assert!(matches!(rx.try_recv(), Ok(CoreEvent::Notice(_))));
    }
}
