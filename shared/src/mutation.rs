//! Optimistic item changes.
//!
//! Each change validates input, snapshots the item, applies the change to
//! the store, calls the backend and then confirms or restores the snapshot.
//! Only one change per item may be in flight.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use serde::{Deserialize, Serialize};
use tracing::{info, instrument, warn};
use uuid::Uuid;

use crate::compression::CompressionSettings;
use crate::error::{CoreError, CoreResult, Notice, ValidationError};
use crate::event::{CoreEvent, EventBus};
use crate::model::{validate_item_name, FileItem, FolderId, FolderItem, Item, ItemId, ItemKind, ItemRef};
use crate::remote::MetadataApi;
use crate::store::{ItemCollectionStore, SharedStore};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MutationKind {
    Rename,
    Delete,
    Favorite,
    Compress,
}

impl MutationKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            MutationKind::Rename => "rename",
            MutationKind::Delete => "delete",
            MutationKind::Favorite => "favorite",
            MutationKind::Compress => "compress",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MutationPhase {
    AppliedLocally,
    Confirmed,
    RolledBack,
}

#[derive(Debug, Clone, PartialEq)]
pub struct PendingMutation {
    pub mutation_id: Uuid,
    pub item_id: ItemId,
    pub kind: MutationKind,
    /// The item as it was before the local change.
    pub previous_snapshot: Option<Item>,
    pub phase: MutationPhase,
}

/// Result of compressing one file.
#[derive(Debug, Clone, PartialEq)]
pub struct CompressOutcome {
    /// `None` when the backend did not describe the new file; a refetch
    /// will show it.
    pub compressed: Option<FileItem>,
    pub compression_ratio: f64,
    pub original_deleted: bool,
    /// Set when the copy exists but the original could not be removed.
    pub warning: Option<Notice>,
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct BatchCompressReport {
    pub succeeded: usize,
    pub failed: usize,
    /// Mean over successful items; `None` if nothing succeeded.
    pub average_ratio: Option<f64>,
    pub warnings: Vec<Notice>,
}

// ============================================================================
// In-flight bookkeeping
// ============================================================================

/// Releases the item's slot when dropped, whatever the outcome.
struct InFlight<'a> {
    owner: &'a MutationCoordinator,
    item_id: ItemId,
    kind: MutationKind,
}

impl InFlight<'_> {
    fn record_snapshot(&self, snapshot: Item) {
        if let Some(pending) = self.owner.lock().get_mut(&self.item_id) {
            pending.previous_snapshot = Some(snapshot);
        }
    }

    fn set_phase(&self, phase: MutationPhase) {
        if let Some(pending) = self.owner.lock().get_mut(&self.item_id) {
            pending.phase = phase;
        }
    }
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.owner.lock().remove(&self.item_id);
    }
}

/// Keeps local fields the backend echo leaves out.
fn merge_file(local: &FileItem, server: FileItem) -> FileItem {
    FileItem {
        parent_id: server.parent_id.or_else(|| local.parent_id.clone()),
        modified_at: server.modified_at.or(local.modified_at),
        url: if server.url.is_empty() {
            local.url.clone()
        } else {
            server.url
        },
        size_bytes: server.size_bytes.or(local.size_bytes),
        mime_type: server.mime_type.or_else(|| local.mime_type.clone()),
        ..server
    }
}

fn merge_item(local: &Item, server: Item) -> Item {
    match (local, server) {
        (Item::File(local), Item::File(server)) => Item::File(merge_file(local, server)),
        (Item::Folder(local), Item::Folder(server)) => Item::Folder(FolderItem {
            parent_id: server.parent_id.or_else(|| local.parent_id.clone()),
            modified_at: server.modified_at.or(local.modified_at),
            ..server
        }),
        (local, _) => local.clone(),
    }
}

// ============================================================================
// Coordinator
// ============================================================================

pub struct MutationCoordinator {
    api: Arc<dyn MetadataApi>,
    store: SharedStore,
    events: Arc<EventBus>,
    max_name_length: usize,
    in_flight: Mutex<HashMap<ItemId, PendingMutation>>,
}

impl MutationCoordinator {
    pub fn new(
        api: Arc<dyn MetadataApi>,
        store: SharedStore,
        events: Arc<EventBus>,
        max_name_length: usize,
    ) -> Self {
        Self {
            api,
            store,
            events,
            max_name_length,
            in_flight: Mutex::new(HashMap::new()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<ItemId, PendingMutation>> {
        self.in_flight.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn pending(&self) -> Vec<PendingMutation> {
        self.lock().values().cloned().collect()
    }

    pub fn is_pending(&self, item_id: &ItemId) -> bool {
        self.lock().contains_key(item_id)
    }

    fn reject<T>(&self, error: impl Into<CoreError>) -> CoreResult<T> {
        let error = error.into();
        self.events.report(&error);
        Err(error)
    }

    fn claim(&self, item_id: &ItemId, kind: MutationKind) -> CoreResult<InFlight<'_>> {
        {
            let mut in_flight = self.lock();
            if let Some(existing) = in_flight.get(item_id) {
                warn!(
                    item_id = %item_id,
                    pending = existing.kind.as_str(),
                    requested = kind.as_str(),
                    "mutation rejected, another is in flight"
                );
                drop(in_flight);
                return self.reject(CoreError::ConcurrentMutationRejected {
                    item_id: item_id.clone(),
                });
            }
            in_flight.insert(
                item_id.clone(),
                PendingMutation {
                    mutation_id: Uuid::new_v4(),
                    item_id: item_id.clone(),
                    kind,
                    previous_snapshot: None,
                    phase: MutationPhase::AppliedLocally,
                },
            );
        }
        Ok(InFlight {
            owner: self,
            item_id: item_id.clone(),
            kind,
        })
    }

    fn applied(&self, slot: &InFlight<'_>, folder_id: Option<FolderId>) {
        self.events.publish(CoreEvent::MutationApplied {
            item_id: slot.item_id.clone(),
            kind: slot.kind,
        });
        self.events.publish(CoreEvent::ItemsChanged { folder_id });
    }

    fn confirmed(&self, slot: &InFlight<'_>) {
        slot.set_phase(MutationPhase::Confirmed);
        info!(item_id = %slot.item_id, kind = slot.kind.as_str(), "mutation confirmed");
        self.events.publish(CoreEvent::MutationConfirmed {
            item_id: slot.item_id.clone(),
            kind: slot.kind,
        });
    }

    fn rolled_back(&self, slot: &InFlight<'_>, error: &CoreError) {
        slot.set_phase(MutationPhase::RolledBack);
        warn!(
            item_id = %slot.item_id,
            kind = slot.kind.as_str(),
            error = %error,
            "mutation rolled back"
        );
        if matches!(error, CoreError::AuthenticationRequired) {
            self.events.request_sign_in();
        }
        self.events.publish(CoreEvent::MutationRolledBack {
            item_id: slot.item_id.clone(),
            kind: slot.kind,
            notice: error.notice(),
        });
    }

    /// Runs `undo` against the store. Nothing is restored when the item's
    /// folder is no longer displayed.
    async fn restore(&self, undo: impl FnOnce(&mut ItemCollectionStore) -> bool) {
        let folder_id = {
            let mut store = self.store.write().await;
            if !undo(&mut store) {
                return;
            }
            store.folder_id().cloned()
        };
        self.events.publish(CoreEvent::ItemsChanged { folder_id });
    }

    // ========================================================================
    // Operations
    // ========================================================================

    /// Renaming to the current name is a no-op and never reaches the backend.
    #[instrument(skip(self), fields(item_id = %item_id))]
    pub async fn rename(&self, item_id: &ItemId, new_name: &str) -> CoreResult<Item> {
        let name = match validate_item_name(new_name, self.max_name_length) {
            Ok(name) => name,
            Err(e) => return self.reject(e),
        };
        let slot = self.claim(item_id, MutationKind::Rename)?;

        let (previous, folder_id) = {
            let mut store = self.store.write().await;
            match store.find(item_id) {
                Some(current) if current.name() == name => return Ok(current),
                Some(_) => {}
                None => return self.reject(ValidationError::UnknownItem(item_id.clone())),
            }
            match store.apply_rename(item_id, &name) {
                Some(previous) => (previous, store.folder_id().cloned()),
                None => return self.reject(ValidationError::UnknownItem(item_id.clone())),
            }
        };
        slot.record_snapshot(previous.clone());
        self.applied(&slot, folder_id);

        match self.api.rename(&previous.item_ref(), &name).await {
            Ok(echo) => {
                let mut local = previous.clone();
                match &mut local {
                    Item::File(f) => f.name.clone_from(&name),
                    Item::Folder(f) => f.name.clone_from(&name),
                }
                let confirmed = match echo {
                    Some(server) if server.id() == item_id && server.kind() == local.kind() => {
                        merge_item(&local, server)
                    }
                    _ => local,
                };
                self.store.write().await.replace_item(confirmed.clone());
                self.confirmed(&slot);
                Ok(confirmed)
            }
            Err(e) => {
                self.restore(|store| store.replace_item(previous)).await;
                self.rolled_back(&slot, &e);
                Err(e)
            }
        }
    }

    /// Flips the favourite flag. Running it twice restores the original
    /// state.
    #[instrument(skip(self), fields(item_id = %item_id))]
    pub async fn toggle_favorite(&self, item_id: &ItemId) -> CoreResult<FileItem> {
        let slot = self.claim(item_id, MutationKind::Favorite)?;

        let (previous, folder_id) = {
            let mut store = self.store.write().await;
            let Some(Item::File(current)) = store.find(item_id) else {
                return self.reject(ValidationError::UnknownItem(item_id.clone()));
            };
            match store.set_favorite(item_id, !current.favorite) {
                Some(previous) => (previous, store.folder_id().cloned()),
                None => return self.reject(ValidationError::UnknownItem(item_id.clone())),
            }
        };
        slot.record_snapshot(Item::File(previous.clone()));
        self.applied(&slot, folder_id);

        match self.api.toggle_favorite(item_id).await {
            Ok(echo) => {
                let local = FileItem {
                    favorite: !previous.favorite,
                    ..previous.clone()
                };
                let confirmed = match echo {
                    Some(server) if &server.id == item_id => merge_file(&local, server),
                    _ => local,
                };
                self.store
                    .write()
                    .await
                    .replace_item(Item::File(confirmed.clone()));
                self.confirmed(&slot);
                Ok(confirmed)
            }
            Err(e) => {
                self.restore(|store| store.replace_item(Item::File(previous)))
                    .await;
                self.rolled_back(&slot, &e);
                Err(e)
            }
        }
    }

    /// Removes the item at once; a failure puts it back where it was.
    #[instrument(skip(self), fields(item_id = %item_id))]
    pub async fn delete(&self, item_id: &ItemId) -> CoreResult<()> {
        let slot = self.claim(item_id, MutationKind::Delete)?;

        let (removed, folder_id) = {
            let mut store = self.store.write().await;
            match store.remove(item_id) {
                Some(removed) => (removed, store.folder_id().cloned()),
                None => return self.reject(ValidationError::UnknownItem(item_id.clone())),
            }
        };
        slot.record_snapshot(removed.item.clone());
        self.applied(&slot, folder_id);

        match self.api.delete(&removed.item.item_ref()).await {
            Ok(()) => {
                self.confirmed(&slot);
                Ok(())
            }
            Err(e) => {
                self.restore(|store| store.restore(removed)).await;
                self.rolled_back(&slot, &e);
                Err(e)
            }
        }
    }

    /// Asks the backend for a compressed copy, shows it, then deletes the
    /// original. A failed delete is a warning, not a failure.
    #[instrument(skip(self, settings), fields(item_id = %item_id))]
    pub async fn compress(
        &self,
        item_id: &ItemId,
        settings: &CompressionSettings,
    ) -> CoreResult<CompressOutcome> {
        let slot = self.claim(item_id, MutationKind::Compress)?;

        let original = match self.store.read().await.find(item_id) {
            Some(Item::File(file)) => file,
            Some(Item::Folder(_)) | None => {
                return self.reject(ValidationError::UnknownItem(item_id.clone()))
            }
        };
        if original.is_compressed_variant() {
            return self.reject(ValidationError::IncompatibleSettings(format!(
                "{} is already compressed",
                original.name
            )));
        }
        slot.record_snapshot(Item::File(original.clone()));

        let receipt = match self.api.compress(item_id, settings).await {
            Ok(receipt) => receipt,
            Err(e) => {
                // Nothing was changed locally.
                self.rolled_back(&slot, &e);
                return Err(e);
            }
        };

        let compressed = receipt.item.map(|mut item| {
            if item.parent_id.is_none() {
                item.parent_id = original.parent_id.clone();
            }
            item
        });
        if let Some(item) = &compressed {
            if self.store.write().await.insert_file(item.clone()) {
                self.events.publish(CoreEvent::ItemsChanged {
                    folder_id: item.parent_id.clone(),
                });
            }
        }

        let (original_deleted, warning) = match self
            .api
            .delete(&ItemRef {
                id: item_id.clone(),
                kind: ItemKind::File,
            })
            .await
        {
            Ok(()) => {
                if self.store.write().await.remove(item_id).is_some() {
                    self.events.publish(CoreEvent::ItemsChanged {
                        folder_id: original.parent_id.clone(),
                    });
                }
                (true, None)
            }
            Err(e) => {
                warn!(error = %e, "compressed copy created, original kept");
                let notice = Notice::warning(
                    "ORIGINAL_NOT_DELETED",
                    format!(
                        "{} was compressed, but the original could not be deleted.",
                        original.name
                    ),
                );
                self.events.publish(CoreEvent::Notice(notice.clone()));
                (false, Some(notice))
            }
        };

        self.confirmed(&slot);
        info!(ratio = receipt.compression_ratio, original_deleted, "file compressed");
        Ok(CompressOutcome {
            compressed,
            compression_ratio: receipt.compression_ratio,
            original_deleted,
            warning,
        })
    }

    /// One compression per file, in order. A failure does not stop the
    /// batch.
    #[instrument(skip(self, item_ids, settings), fields(count = item_ids.len()))]
    pub async fn compress_batch(
        &self,
        item_ids: &[ItemId],
        settings: &CompressionSettings,
    ) -> BatchCompressReport {
        let mut report = BatchCompressReport::default();
        let mut ratio_sum = 0.0;
        for item_id in item_ids {
            match self.compress(item_id, settings).await {
                Ok(outcome) => {
                    report.succeeded += 1;
                    ratio_sum += outcome.compression_ratio;
                    report.warnings.extend(outcome.warning);
                }
                Err(_) => report.failed += 1,
            }
        }
        if report.succeeded > 0 {
            report.average_ratio = Some(ratio_sum / report.succeeded as f64);
        }
        info!(
            succeeded = report.succeeded,
            failed = report.failed,
            "batch compression finished"
        );
        report
    }
}
