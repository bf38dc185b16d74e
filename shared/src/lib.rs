//! Client core for a cloud file library.
//!
//! The crate owns everything between the UI shell and the network: folder
//! navigation, the displayed listing with its category and sort views,
//! optimistic rename/delete/favourite/compress mutations with rollback,
//! the context-menu and multi-select state, and the two-step object upload
//! pipeline. Shells send each [`Event`] to [`FileBrowser::update`] and render
//! from [`FileBrowser::view`] whenever a [`CoreEvent`] arrives.

#![forbid(unsafe_code)]
#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::too_many_lines)]
#![allow(clippy::missing_errors_doc)]

pub mod auth;
pub mod browser;
pub mod capabilities;
pub mod compression;
pub mod config;
pub mod error;
pub mod event;
pub mod model;
pub mod mutation;
pub mod navigation;
pub mod remote;
pub mod selection;
pub mod shell;
pub mod store;
pub mod upload;

#[cfg(any(test, feature = "test-utils"))]
pub mod testing;

pub use auth::{AuthToken, TokenProvider, TokenStore};
pub use browser::{BrowserView, CommandArgs, CommandOutcome, CoreContext, FileBrowser};
pub use compression::{CompressionDialog, CompressionSettings, DialogKind};
pub use config::ClientConfig;
pub use error::{CoreError, CoreResult, ErrorKind, Notice, NoticeLevel, ValidationError};
pub use event::{CoreEvent, EventBus};
pub use model::{FileItem, FolderId, FolderItem, Item, ItemId, ItemKind, MediaKind};
pub use mutation::{BatchCompressReport, CompressOutcome, MutationCoordinator, MutationKind};
pub use navigation::{Breadcrumb, NavigationState};
pub use remote::{HttpMetadataClient, MetadataApi};
pub use selection::{FileAction, FolderAction, MenuCommand, SelectionState};
pub use shell::{Event, Reply};
pub use store::{Category, SortOption};
pub use upload::{LocalHandle, UploadCoordinator, UploadJob, UploadJobId, UploadPhase, UploadSource};
