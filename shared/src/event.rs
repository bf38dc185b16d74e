use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::broadcast;
use tracing::debug;

use crate::error::{CoreError, Notice};
use crate::model::{FolderId, ItemId};
use crate::mutation::MutationKind;
use crate::upload::{UploadJobId, UploadPhase};

/// Everything the UI shell needs to re-render or notify. Delivered over a
/// broadcast channel; slow subscribers may miss events and should re-read
/// the view.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum CoreEvent {
    /// The displayed listing changed.
    ItemsChanged { folder_id: Option<FolderId> },
    NavigationChanged { folder_id: Option<FolderId> },
    UploadPhaseChanged {
        job_id: UploadJobId,
        phase: UploadPhase,
    },
    UploadProgress { job_id: UploadJobId, percent: u8 },
    MutationApplied { item_id: ItemId, kind: MutationKind },
    MutationConfirmed { item_id: ItemId, kind: MutationKind },
    MutationRolledBack {
        item_id: ItemId,
        kind: MutationKind,
        notice: Notice,
    },
    Notice(Notice),
    /// Published at most once until the shell acknowledges it.
    SignInRequired,
}

pub struct EventBus {
    sender: broadcast::Sender<CoreEvent>,
    sign_in_pending: AtomicBool,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self {
            sender,
            sign_in_pending: AtomicBool::new(false),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<CoreEvent> {
        self.sender.subscribe()
    }

    pub fn publish(&self, event: CoreEvent) {
        // No subscribers is fine; the shell may not be listening yet.
        if self.sender.send(event).is_err() {
            debug!("event dropped, no subscribers");
        }
    }

    /// Routes a failure to the shell. Authentication failures collapse into
    /// a single sign-in prompt.
    pub fn report(&self, error: &CoreError) {
        if matches!(error, CoreError::AuthenticationRequired) {
            self.request_sign_in();
        } else {
            self.publish(CoreEvent::Notice(error.notice()));
        }
    }

    pub fn request_sign_in(&self) {
        if !self.sign_in_pending.swap(true, Ordering::SeqCst) {
            self.publish(CoreEvent::SignInRequired);
        }
    }

    pub fn acknowledge_sign_in(&self) {
        self.sign_in_pending.store(false, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::NoticeLevel;

    #[tokio::test]
    async fn test_sign_in_prompt_is_deduplicated() {
        let bus = EventBus::new(16);
        let mut rx = bus.subscribe();

        bus.report(&CoreError::AuthenticationRequired);
        bus.report(&CoreError::AuthenticationRequired);
        bus.publish(CoreEvent::ItemsChanged { folder_id: None });

        assert_eq!(rx.recv().await.unwrap(), CoreEvent::SignInRequired);
        assert_eq!(
            rx.recv().await.unwrap(),
            CoreEvent::ItemsChanged { folder_id: None }
        );

        bus.acknowledge_sign_in();
        bus.report(&CoreError::AuthenticationRequired);
        assert_eq!(rx.recv().await.unwrap(), CoreEvent::SignInRequired);
    }

    #[tokio::test]
    async fn test_other_errors_become_notices() {
        let bus = EventBus::new(4);
        let mut rx = bus.subscribe();
        bus.report(&CoreError::transport("reset"));

        match rx.recv().await.unwrap() {
            CoreEvent::Notice(notice) => assert_eq!(notice.level, NoticeLevel::Failure),
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[test]
    fn test_publish_without_subscribers() {
        EventBus::new(1).publish(CoreEvent::SignInRequired);
    }
}
