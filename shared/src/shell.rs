//! Event entry point for UI shells.
//!
//! A shell forwards each user or platform event to [`FileBrowser::update`],
//! then renders [`FileBrowser::view`]. The typed methods on `FileBrowser`
//! remain available for shells that prefer direct calls.

use tracing::{debug, info_span, Instrument};

use crate::browser::{CommandArgs, CommandOutcome, FileBrowser};
use crate::compression::{CompressionDialog, CompressionSettings};
use crate::error::CoreResult;
use crate::model::{FileItem, FolderId, FolderItem, ItemId};
use crate::mutation::BatchCompressReport;
use crate::selection::MenuCommand;
use crate::store::{Category, SortOption};
use crate::upload::{UploadJob, UploadJobId, UploadSource};

#[derive(Debug, Clone)]
pub enum Event {
    AppStarted,
    RefreshRequested,
    SignInAcknowledged,

    FolderOpened { folder_id: FolderId },
    BreadcrumbSelected { index: usize },
    UpRequested,

    CategorySelected(Category),
    SortSelected(SortOption),
    SearchChanged { query: String },
    SearchCleared,

    CreateFolderRequested { name: String },
    MenuOpened { item_id: ItemId },
    MenuClosed,
    CommandChosen { command: MenuCommand, args: CommandArgs },

    SelectionToggled { item_id: ItemId },
    SelectionCleared,
    CompressionDialogRequested,
    BatchCompressRequested(CompressionSettings),

    FilePicked(UploadSource),
    UploadCancelled(UploadJobId),
    UploadAcknowledged(UploadJobId),
    RegistrationRetried(UploadJobId),
}

impl Event {
    pub const fn name(&self) -> &'static str {
        match self {
            Self::AppStarted => "app_started",
            Self::RefreshRequested => "refresh_requested",
            Self::SignInAcknowledged => "sign_in_acknowledged",
            Self::FolderOpened { .. } => "folder_opened",
            Self::BreadcrumbSelected { .. } => "breadcrumb_selected",
            Self::UpRequested => "up_requested",
            Self::CategorySelected(_) => "category_selected",
            Self::SortSelected(_) => "sort_selected",
            Self::SearchChanged { .. } => "search_changed",
            Self::SearchCleared => "search_cleared",
            Self::CreateFolderRequested { .. } => "create_folder_requested",
            Self::MenuOpened { .. } => "menu_opened",
            Self::MenuClosed => "menu_closed",
            Self::CommandChosen { .. } => "command_chosen",
            Self::SelectionToggled { .. } => "selection_toggled",
            Self::SelectionCleared => "selection_cleared",
            Self::CompressionDialogRequested => "compression_dialog_requested",
            Self::BatchCompressRequested(_) => "batch_compress_requested",
            Self::FilePicked(_) => "file_picked",
            Self::UploadCancelled(_) => "upload_cancelled",
            Self::UploadAcknowledged(_) => "upload_acknowledged",
            Self::RegistrationRetried(_) => "registration_retried",
        }
    }

    /// Everything except lifecycle events comes from a user gesture.
    pub const fn is_user_initiated(&self) -> bool {
        !matches!(self, Self::AppStarted | Self::SignInAcknowledged)
    }
}

/// What an event produced besides the updated view.
#[derive(Debug, Clone)]
pub enum Reply {
    None,
    Menu(Vec<MenuCommand>),
    Command(CommandOutcome),
    FolderCreated(FolderItem),
    Dialog(CompressionDialog),
    BatchCompressed(BatchCompressReport),
    UploadStarted(UploadJobId),
    UploadDismissed(UploadJob),
    Registered(FileItem),
}

impl FileBrowser {
    /// Routes one event. Failures are also published on the event bus, so
    /// shells that only render notices may ignore the error.
    pub async fn update(&self, event: Event) -> CoreResult<Reply> {
        let span = info_span!("update", event = event.name());
        if event.is_user_initiated() {
            debug!(parent: &span, "user action");
        }
        self.route(event).instrument(span).await
    }

    async fn route(&self, event: Event) -> CoreResult<Reply> {
        let reply = match event {
            Event::AppStarted => {
                self.open().await?;
                Reply::None
            }
            Event::RefreshRequested => {
                self.refresh().await?;
                Reply::None
            }
            Event::SignInAcknowledged => {
                self.acknowledge_sign_in();
                Reply::None
            }

            Event::FolderOpened { folder_id } => {
                self.enter_folder(&folder_id).await?;
                Reply::None
            }
            Event::BreadcrumbSelected { index } => {
                self.jump_to_breadcrumb(index).await?;
                Reply::None
            }
            Event::UpRequested => {
                self.go_up().await?;
                Reply::None
            }

            Event::CategorySelected(category) => {
                self.set_category(category).await;
                Reply::None
            }
            Event::SortSelected(sort) => {
                self.set_sort(sort).await;
                Reply::None
            }
            Event::SearchChanged { query } => {
                self.search(&query).await?;
                Reply::None
            }
            Event::SearchCleared => {
                self.clear_search().await;
                Reply::None
            }

            Event::CreateFolderRequested { name } => {
                Reply::FolderCreated(self.create_folder(&name).await?)
            }
            Event::MenuOpened { item_id } => Reply::Menu(self.open_menu(&item_id).await?),
            Event::MenuClosed => {
                self.close_menu();
                Reply::None
            }
            Event::CommandChosen { command, args } => {
                Reply::Command(self.dispatch(command, args).await?)
            }

            Event::SelectionToggled { item_id } => {
                self.toggle_selection(&item_id).await?;
                Reply::None
            }
            Event::SelectionCleared => {
                self.clear_selection();
                Reply::None
            }
            Event::CompressionDialogRequested => Reply::Dialog(self.compression_dialog().await?),
            Event::BatchCompressRequested(settings) => {
                Reply::BatchCompressed(self.batch_compress(&settings).await?)
            }

            Event::FilePicked(source) => Reply::UploadStarted(self.upload(source).await),
            Event::UploadCancelled(id) => {
                self.uploads().cancel(&id)?;
                Reply::None
            }
            Event::UploadAcknowledged(id) => {
                Reply::UploadDismissed(self.uploads().acknowledge(&id).await?)
            }
            Event::RegistrationRetried(id) => {
                Reply::Registered(self.uploads().retry_registration(&id).await?)
            }
        };
        Ok(reply)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::browser::CoreContext;
    use crate::capabilities::MemoryKvStore;
    use crate::config::ClientConfig;
    use crate::error::CoreError;
    use crate::model::Item;
    use crate::remote::MetadataApi;
    use crate::selection::FileAction;
    use crate::testing::{file, folder, FakeMetadataApi, FakeObjectStore, StaticTokens};
    use crate::upload::{LocalHandle, UploadPhase};
    use bytes::Bytes;
    use std::sync::Arc;

    async fn started() -> (FileBrowser, Arc<FakeMetadataApi>) {
        let api = Arc::new(FakeMetadataApi::new());
        api.add_folder(folder(10, "Docs", None));
        api.add_file(file(1, "a.txt"));
        let ctx = CoreContext::new(
            ClientConfig::default(),
            Arc::clone(&api) as Arc<dyn MetadataApi>,
            Arc::new(FakeObjectStore::new()),
            StaticTokens::signed_in(),
            Arc::new(MemoryKvStore::new()),
        )
        .unwrap();
        let browser = FileBrowser::new(ctx);
        assert!(matches!(browser.update(Event::AppStarted).await.unwrap(), Reply::None));
        (browser, api)
    }

    #[test]
    fn test_event_names_and_origin() {
        assert_eq!(Event::AppStarted.name(), "app_started");
        assert!(!Event::AppStarted.is_user_initiated());
        assert_eq!(Event::UpRequested.name(), "up_requested");
        assert!(Event::UpRequested.is_user_initiated());
    }

    #[tokio::test]
    async fn test_navigation_events_drive_the_view() {
        let (browser, _) = started().await;
        browser
            .update(Event::FolderOpened {
                folder_id: ItemId::from(10),
            })
            .await
            .unwrap();
        assert_eq!(browser.view().await.folder_id, Some(ItemId::from(10)));

        browser.update(Event::UpRequested).await.unwrap();
        let view = browser.view().await;
        assert_eq!(view.folder_id, None);
        let names: Vec<&str> = view.items.iter().map(Item::name).collect();
        assert_eq!(names, ["Docs", "a.txt"]);
    }

    #[tokio::test]
    async fn test_menu_events_reply_with_commands_and_outcomes() {
        let (browser, api) = started().await;
        let Reply::Menu(commands) = browser
            .update(Event::MenuOpened {
                item_id: ItemId::from(1),
            })
            .await
            .unwrap()
        else {
            panic!("expected the menu commands");
        };
        assert!(commands.contains(&MenuCommand::File(FileAction::Rename)));

        let reply = browser
            .update(Event::CommandChosen {
                command: MenuCommand::File(FileAction::Rename),
                args: CommandArgs::Name("b.txt".into()),
            })
            .await
            .unwrap();
        assert!(matches!(reply, Reply::Command(CommandOutcome::Updated(_))));
        assert_eq!(api.files()[0].name, "b.txt");
    }

    #[tokio::test]
    async fn test_failed_event_returns_the_error() {
        let (browser, _) = started().await;
        let err = browser
            .update(Event::BreadcrumbSelected { index: 4 })
            .await
            .unwrap_err();
        assert!(matches!(err, CoreError::Validation(_)));
    }

    #[tokio::test]
    async fn test_file_picked_starts_an_upload() {
        let (browser, _) = started().await;
        let source = UploadSource::new(
            LocalHandle::new("content://1").with_name("n.txt"),
            Bytes::from_static(b"data"),
        );
        let Reply::UploadStarted(id) = browser.update(Event::FilePicked(source)).await.unwrap()
        else {
            panic!("expected an upload job");
        };
        assert_eq!(browser.uploads().wait(&id).await.unwrap().phase, UploadPhase::Done);

        let reply = browser.update(Event::UploadAcknowledged(id)).await.unwrap();
        assert!(matches!(reply, Reply::UploadDismissed(job) if job.phase == UploadPhase::Done));
    }
}
