use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use serde::{Deserialize, Serialize};
use tokio::sync::{watch, Semaphore};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, instrument, warn};
use uuid::Uuid;

use super::{registration_for, LocalHandle, ObjectUploadClient, ProgressFn, StoredObject, UploadSource};
use crate::capabilities::{KeyNamespace, KeyValueStore, TypedKvStore};
use crate::error::{CoreError, CoreResult, ValidationError};
use crate::event::{CoreEvent, EventBus};
use crate::model::{FileItem, FolderId};
use crate::remote::RegisterObject;
use crate::store::SharedStore;

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct UploadJobId(String);

impl UploadJobId {
    pub fn new() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for UploadJobId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for UploadJobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum UploadStage {
    Uploading,
    Registering,
}

// ============================================================================
// Job state machine
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum UploadPhase {
    Picked,
    Uploading,
    Registering,
    Done,
    Failed { during: UploadStage },
    Cancelled,
}

impl UploadPhase {
    pub fn state_name(&self) -> &'static str {
        match self {
            UploadPhase::Picked => "picked",
            UploadPhase::Uploading => "uploading",
            UploadPhase::Registering => "registering",
            UploadPhase::Done => "done",
            UploadPhase::Failed { .. } => "failed",
            UploadPhase::Cancelled => "cancelled",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            UploadPhase::Done | UploadPhase::Failed { .. } | UploadPhase::Cancelled
        )
    }

    pub fn can_cancel(&self) -> bool {
        matches!(self, UploadPhase::Picked | UploadPhase::Uploading)
    }

    /// A failed registration may go back to `Registering` for a retry.
    pub fn can_transition_to(&self, next: &UploadPhase) -> bool {
        use UploadPhase::{Cancelled, Done, Failed, Picked, Registering, Uploading};
        match (self, next) {
            (Picked, Uploading) | (Uploading, Registering) | (Registering, Done) => true,
            (from, Cancelled) => from.can_cancel(),
            (Uploading, Failed { during }) => *during == UploadStage::Uploading,
            (Registering, Failed { during }) => *during == UploadStage::Registering,
            (
                Failed {
                    during: UploadStage::Registering,
                },
                Registering,
            ) => true,
            _ => false,
        }
    }
}

#[derive(Debug, Clone)]
pub struct UploadJob {
    pub id: UploadJobId,
    pub handle: LocalHandle,
    pub target_folder_id: Option<FolderId>,
    pub phase: UploadPhase,
    pub progress_percent: u8,
    pub error: Option<CoreError>,
    /// Set once the backend has registered the file.
    pub item: Option<FileItem>,
}

/// A stored object whose registration has not gone through. Persisted so a
/// retry can happen after a restart.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PendingRegistration {
    pub job_id: UploadJobId,
    pub handle: LocalHandle,
    pub request: RegisterObject,
}

struct JobSlot {
    seq: u64,
    job: UploadJob,
    cancel: CancellationToken,
    pending: Option<RegisterObject>,
    phase_tx: watch::Sender<UploadPhase>,
}

#[derive(Default)]
struct JobTable {
    next_seq: u64,
    slots: HashMap<UploadJobId, JobSlot>,
}

// ============================================================================
// Coordinator
// ============================================================================

/// Runs upload jobs as independent tasks. At most `max_concurrent` jobs are
/// past `Picked` at any time.
#[derive(Clone)]
pub struct UploadCoordinator {
    inner: Arc<Inner>,
}

struct Inner {
    client: ObjectUploadClient,
    store: SharedStore,
    events: Arc<EventBus>,
    jobs: Mutex<JobTable>,
    permits: Arc<Semaphore>,
    pending: TypedKvStore<PendingRegistration>,
}

impl UploadCoordinator {
    pub fn new(
        client: ObjectUploadClient,
        store: SharedStore,
        events: Arc<EventBus>,
        kv: Arc<dyn KeyValueStore>,
        max_concurrent: usize,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                client,
                store,
                events,
                jobs: Mutex::new(JobTable::default()),
                permits: Arc::new(Semaphore::new(max_concurrent.max(1))),
                pending: TypedKvStore::new(kv, KeyNamespace::PendingRegistrations),
            }),
        }
    }

    /// Creates a job in `Picked` and starts it in the background.
    #[instrument(skip(self, source), fields(name = source.handle.file_name()))]
    pub fn submit(&self, source: UploadSource, target_folder_id: Option<FolderId>) -> UploadJobId {
        let id = UploadJobId::new();
        let cancel = CancellationToken::new();
        let job = UploadJob {
            id: id.clone(),
            handle: source.handle.clone(),
            target_folder_id: target_folder_id.clone(),
            phase: UploadPhase::Picked,
            progress_percent: 0,
            error: None,
            item: None,
        };
        self.inner.insert(job, cancel.clone(), None);
        info!(job_id = %id, "upload job created");
        self.inner.publish_phase(&id, UploadPhase::Picked);

        tokio::spawn(Arc::clone(&self.inner).run(id.clone(), source, target_folder_id, cancel));
        id
    }

    pub fn job(&self, id: &UploadJobId) -> Option<UploadJob> {
        self.inner
            .lock()
            .slots
            .get(id)
            .map(|slot| slot.job.clone())
    }

    /// All jobs in submission order.
    pub fn jobs(&self) -> Vec<UploadJob> {
        let table = self.inner.lock();
        let mut slots: Vec<_> = table.slots.values().collect();
        slots.sort_by_key(|slot| slot.seq);
        slots.into_iter().map(|slot| slot.job.clone()).collect()
    }

    /// Resolves once the job reaches a terminal phase.
    pub async fn wait(&self, id: &UploadJobId) -> CoreResult<UploadJob> {
        let mut rx = {
            let table = self.inner.lock();
            let slot = table.slots.get(id).ok_or_else(|| unknown_job(id))?;
            slot.phase_tx.subscribe()
        };
        rx.wait_for(UploadPhase::is_terminal)
            .await
            .map_err(|_| unknown_job(id))?;
        self.job(id).ok_or_else(|| unknown_job(id))
    }

    /// Only `Picked` and `Uploading` jobs can be cancelled.
    #[instrument(skip(self), fields(job_id = %id))]
    pub fn cancel(&self, id: &UploadJobId) -> CoreResult<()> {
        {
            let mut table = self.inner.lock();
            let slot = table.slots.get_mut(id).ok_or_else(|| unknown_job(id))?;
            if !slot.job.phase.can_cancel() {
                return Err(ValidationError::InvalidUploadPhase {
                    phase: slot.job.phase.state_name(),
                    action: "cancelled",
                }
                .into());
            }
            slot.job.phase = UploadPhase::Cancelled;
            slot.phase_tx.send_replace(UploadPhase::Cancelled);
            slot.cancel.cancel();
        }
        info!("upload cancelled");
        self.inner.publish_phase(id, UploadPhase::Cancelled);
        Ok(())
    }

    /// Dismisses a finished job. A pending registration is dropped with it.
    #[instrument(skip(self), fields(job_id = %id))]
    pub async fn acknowledge(&self, id: &UploadJobId) -> CoreResult<UploadJob> {
        let slot = {
            let mut table = self.inner.lock();
            let slot = table.slots.get(id).ok_or_else(|| unknown_job(id))?;
            if !slot.job.phase.is_terminal() {
                return Err(ValidationError::InvalidUploadPhase {
                    phase: slot.job.phase.state_name(),
                    action: "acknowledged",
                }
                .into());
            }
            table.slots.remove(id).ok_or_else(|| unknown_job(id))?
        };
        if slot.pending.is_some() {
            self.inner.forget_pending(id).await;
        }
        Ok(slot.job)
    }

    /// Re-runs phase B for a job whose registration failed.
    #[instrument(skip(self), fields(job_id = %id))]
    pub async fn retry_registration(&self, id: &UploadJobId) -> CoreResult<FileItem> {
        let request = {
            let mut table = self.inner.lock();
            let slot = table.slots.get_mut(id).ok_or_else(|| unknown_job(id))?;
            let request = match (&slot.pending, slot.job.phase) {
                (Some(request), phase) if phase.can_transition_to(&UploadPhase::Registering) => {
                    request.clone()
                }
                _ => {
                    return Err(ValidationError::InvalidUploadPhase {
                        phase: slot.job.phase.state_name(),
                        action: "retried",
                    }
                    .into())
                }
            };
            slot.job.phase = UploadPhase::Registering;
            slot.job.error = None;
            slot.phase_tx.send_replace(UploadPhase::Registering);
            request
        };
        self.inner.publish_phase(id, UploadPhase::Registering);
        self.inner.register(id, request).await
    }

    pub async fn pending_registrations(&self) -> CoreResult<Vec<PendingRegistration>> {
        Ok(self
            .inner
            .pending
            .values()
            .await?
            .into_iter()
            .map(|(_, pending)| pending)
            .collect())
    }

    /// Re-creates failed jobs for registrations persisted by an earlier
    /// session, so `retry_registration` can pick them up.
    pub async fn restore_pending(&self) -> CoreResult<Vec<UploadJobId>> {
        let mut restored = Vec::new();
        for pending in self.pending_registrations().await? {
            if self.job(&pending.job_id).is_some() {
                continue;
            }
            let object = StoredObject {
                url: pending.request.url.clone(),
                size_bytes: pending.request.size_bytes,
            };
            let job = UploadJob {
                id: pending.job_id.clone(),
                handle: pending.handle,
                target_folder_id: pending.request.parent_id.clone(),
                phase: UploadPhase::Failed {
                    during: UploadStage::Registering,
                },
                progress_percent: 100,
                error: Some(CoreError::PartialUpload {
                    object,
                    message: "registration did not complete before the app closed".to_string(),
                }),
                item: None,
            };
            self.inner
                .insert(job, CancellationToken::new(), Some(pending.request));
            restored.push(pending.job_id);
        }
        if !restored.is_empty() {
            info!(count = restored.len(), "restored pending registrations");
        }
        Ok(restored)
    }
}

fn unknown_job(id: &UploadJobId) -> CoreError {
    ValidationError::UnknownUploadJob(id.to_string()).into()
}

impl Inner {
    fn lock(&self) -> MutexGuard<'_, JobTable> {
        self.jobs.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn insert(&self, job: UploadJob, cancel: CancellationToken, pending: Option<RegisterObject>) {
        let (phase_tx, _) = watch::channel(job.phase);
        let mut table = self.lock();
        table.next_seq += 1;
        let seq = table.next_seq;
        table.slots.insert(
            job.id.clone(),
            JobSlot {
                seq,
                job,
                cancel,
                pending,
                phase_tx,
            },
        );
    }

    fn publish_phase(&self, id: &UploadJobId, phase: UploadPhase) {
        self.events.publish(CoreEvent::UploadPhaseChanged {
            job_id: id.clone(),
            phase,
        });
    }

    /// Applies `next` if the job allows it. `false` means the job moved on
    /// (usually cancelled) and the caller should stop.
    fn transition(
        &self,
        id: &UploadJobId,
        next: UploadPhase,
        update: impl FnOnce(&mut JobSlot),
    ) -> bool {
        {
            let mut table = self.lock();
            let Some(slot) = table.slots.get_mut(id) else {
                return false;
            };
            if !slot.job.phase.can_transition_to(&next) {
                return false;
            }
            slot.job.phase = next;
            update(slot);
            slot.phase_tx.send_replace(next);
        }
        self.publish_phase(id, next);
        true
    }

    fn record_progress(&self, id: &UploadJobId, percent: u8) {
        let changed = {
            let mut table = self.lock();
            match table.slots.get_mut(id) {
                Some(slot)
                    if slot.job.phase == UploadPhase::Uploading
                        && percent > slot.job.progress_percent =>
                {
                    slot.job.progress_percent = percent;
                    true
                }
                _ => false,
            }
        };
        if changed {
            self.events.publish(CoreEvent::UploadProgress {
                job_id: id.clone(),
                percent,
            });
        }
    }

    async fn run(
        self: Arc<Self>,
        id: UploadJobId,
        source: UploadSource,
        target: Option<FolderId>,
        cancel: CancellationToken,
    ) {
        let _permit = tokio::select! {
            biased;
            () = cancel.cancelled() => return,
            permit = Arc::clone(&self.permits).acquire_owned() => match permit {
                Ok(permit) => permit,
                Err(_) => return,
            },
        };
        if !self.transition(&id, UploadPhase::Uploading, |_| {}) {
            return;
        }

        let progress: ProgressFn = {
            let inner = Arc::clone(&self);
            let id = id.clone();
            Arc::new(move |percent| inner.record_progress(&id, percent))
        };
        let stored = match self.client.store(&source, progress, cancel).await {
            Ok(stored) => stored,
            Err(CoreError::Cancelled) => {
                self.transition(&id, UploadPhase::Cancelled, |_| {});
                return;
            }
            Err(e) => {
                self.fail(&id, UploadStage::Uploading, e);
                return;
            }
        };

        let request = registration_for(&source.handle, &stored, target.as_ref());
        if !self.transition(&id, UploadPhase::Registering, |slot| {
            slot.job.progress_percent = 100;
        }) {
            warn!(job_id = %id, url = %stored.url, "job cancelled after the object was stored");
            return;
        }
        // Failures are recorded on the job and reported as events.
        let _ = self.register(&id, request).await;
    }

    async fn register(&self, id: &UploadJobId, request: RegisterObject) -> CoreResult<FileItem> {
        match self.client.register(&request).await {
            Ok(mut item) => {
                if item.parent_id.is_none() {
                    item.parent_id = request.parent_id.clone();
                }
                self.forget_pending(id).await;
                self.complete(id, item.clone()).await;
                Ok(item)
            }
            Err(e) => {
                self.remember_pending(id, &request).await;
                self.fail(id, UploadStage::Registering, e.clone());
                Err(e)
            }
        }
    }

    async fn complete(&self, id: &UploadJobId, item: FileItem) {
        let inserted = self.store.write().await.insert_file(item.clone());
        if inserted {
            self.events.publish(CoreEvent::ItemsChanged {
                folder_id: item.parent_id.clone(),
            });
        }
        let name = item.name.clone();
        self.transition(id, UploadPhase::Done, move |slot| {
            slot.pending = None;
            slot.job.item = Some(item);
        });
        info!(job_id = %id, name = %name, inserted, "upload complete");
    }

    fn fail(&self, id: &UploadJobId, during: UploadStage, e: CoreError) {
        match during {
            UploadStage::Uploading => warn!(job_id = %id, error = %e, "upload failed"),
            UploadStage::Registering => error!(job_id = %id, error = %e, "registration failed"),
        }
        self.events.report(&e);
        self.transition(id, UploadPhase::Failed { during }, move |slot| {
            slot.job.error = Some(e);
        });
    }

    async fn remember_pending(&self, id: &UploadJobId, request: &RegisterObject) {
        let handle = {
            let mut table = self.lock();
            let Some(slot) = table.slots.get_mut(id) else {
                return;
            };
            slot.pending = Some(request.clone());
            slot.job.handle.clone()
        };
        let pending = PendingRegistration {
            job_id: id.clone(),
            handle,
            request: request.clone(),
        };
        if let Err(e) = self.pending.put(id.as_str(), &pending).await {
            warn!(job_id = %id, error = %e, "could not persist pending registration");
        }
    }

    async fn forget_pending(&self, id: &UploadJobId) {
        if let Err(e) = self.pending.remove(id.as_str()).await {
            warn!(job_id = %id, error = %e, "could not clear pending registration");
        }
    }
}
