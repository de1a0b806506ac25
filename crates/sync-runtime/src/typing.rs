use std::sync::Arc;

use sync_core::{ActivityKind, ConversationEvent, RemoteActivity, SyncError};
use tracing::{debug, trace};

use crate::shared::ConversationShared;

/// Local activity publishing and remote typing view for one conversation.
#[derive(Debug, Clone)]
pub struct TypingSignalTracker {
    shared: Arc<ConversationShared>,
}

impl TypingSignalTracker {
    pub(crate) fn new(shared: Arc<ConversationShared>) -> Self {
        Self { shared }
    }

    /// Announce local activity unless an identical signal went out recently.
    ///
    /// Upload signals sent by media sends count against the same window. The
    /// request is fire-and-forget; returns whether one was issued.
    pub fn publish_local_activity(&self, kind: ActivityKind) -> Result<bool, SyncError> {
        let now_ms = self.shared.clock.now_ms();
        if !self.shared.claim_activity(kind, now_ms)? {
            trace!(conversation_id = %self.shared.conversation_id, ?kind, "activity throttled");
            return Ok(false);
        }

        let shared = Arc::clone(&self.shared);
        tokio::spawn(async move {
            if let Err(err) = shared
                .transport
                .publish_activity(&shared.conversation_id, kind)
                .await
            {
                debug!(
                    conversation_id = %shared.conversation_id,
                    ?kind,
                    error = %err,
                    "activity publish failed"
                );
            }
        });
        Ok(true)
    }

    /// Replace the remote view with a server snapshot.
    pub fn on_remote_snapshot(&self, entries: Vec<RemoteActivity>) -> Result<(), SyncError> {
        let now_ms = self.shared.clock.now_ms();
        let changed = self
            .shared
            .with_reconciler(|reconciler| reconciler.apply_typing_snapshot(entries, now_ms))?;
        if changed {
            self.emit_changed();
        }
        Ok(())
    }

    /// Expire remote entries with `expires_at_ms <= now_ms`. Returns how many were removed.
    pub fn prune(&self, now_ms: u64) -> Result<usize, SyncError> {
        let expired = self
            .shared
            .with_reconciler(|reconciler| reconciler.prune_typing(now_ms))?;
        if expired > 0 {
            self.emit_changed();
        }
        Ok(expired)
    }

    fn emit_changed(&self) {
        self.shared.emit(ConversationEvent::TypingChanged {
            conversation_id: self.shared.conversation_id.clone(),
        });
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use sync_core::SyncConfig;

    use super::*;
    use crate::testing::{CONV, Harness, T0};

    fn activity(user_id: &str, started_at_ms: u64) -> RemoteActivity {
        RemoteActivity {
            user_id: user_id.into(),
            display_name: user_id.into(),
            kind: ActivityKind::Typing,
            started_at_ms,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn throttles_same_kind_and_passes_kind_change() {
        let h = Harness::new(SyncConfig::default());
        let tracker = TypingSignalTracker::new(Arc::clone(&h.shared));

        assert!(tracker.publish_local_activity(ActivityKind::Typing).expect("publish"));
        h.clock.advance(Duration::from_secs(1));
        assert!(!tracker.publish_local_activity(ActivityKind::Typing).expect("publish"));
        assert!(
            tracker
                .publish_local_activity(ActivityKind::UploadingVideo)
                .expect("publish")
        );
        h.clock.advance(Duration::from_secs(3));
        assert!(
            tracker
                .publish_local_activity(ActivityKind::UploadingVideo)
                .expect("publish")
        );

        tokio::time::sleep(Duration::from_millis(1)).await;
        let published = h.server.published_activity().expect("log");
        assert_eq!(
            published,
            vec![
                (CONV.to_owned(), ActivityKind::Typing),
                (CONV.to_owned(), ActivityKind::UploadingVideo),
                (CONV.to_owned(), ActivityKind::UploadingVideo),
            ]
        );
    }

    #[tokio::test]
    async fn snapshot_skips_local_user_and_prunes_at_exact_expiry() {
        let h = Harness::new(SyncConfig::default());
        let tracker = TypingSignalTracker::new(Arc::clone(&h.shared));

        tracker
            .on_remote_snapshot(vec![activity("u-bob", T0), activity("u-alice", T0)])
            .expect("snapshot");
        let typing = h.snapshot().typing_users;
        assert_eq!(typing.len(), 1);
        assert_eq!(typing["u-bob"].expires_at_ms, T0 + 5_000);

        assert_eq!(tracker.prune(T0 + 4_000).expect("prune"), 0);
        assert_eq!(tracker.prune(T0 + 5_000).expect("prune"), 1);
        assert!(h.snapshot().typing_users.is_empty());
    }

    #[tokio::test]
    async fn typing_from_six_seconds_ago_is_already_expired() {
        let h = Harness::new(SyncConfig::default());
        h.clock.set(T0 + 6_000);
        let tracker = TypingSignalTracker::new(Arc::clone(&h.shared));
        let mut events = h.shared.events.subscribe();

        tracker
            .on_remote_snapshot(vec![activity("u-bob", T0)])
            .expect("snapshot");
        assert!(h.snapshot().typing_users.is_empty());
        assert!(events.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn restart_clears_the_publish_window() {
        let h = Harness::new(SyncConfig {
            poll_interval_ms: 60_000,
            ..SyncConfig::default()
        });
        let tracker = TypingSignalTracker::new(Arc::clone(&h.shared));
        h.scheduler.start().await.expect("start");
        assert!(tracker.publish_local_activity(ActivityKind::Typing).expect("publish"));
        assert!(!tracker.publish_local_activity(ActivityKind::Typing).expect("publish"));

        h.scheduler.stop().await.expect("stop");
        h.scheduler.start().await.expect("restart");
        assert!(tracker.publish_local_activity(ActivityKind::Typing).expect("publish"));
        h.scheduler.stop().await.expect("stop");
    }
}
