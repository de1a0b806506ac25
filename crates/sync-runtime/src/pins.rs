use std::sync::Arc;

use sync_core::{ConversationEvent, PinnedMessage, SyncError, TriggerReason};
use tracing::debug;

use crate::{scheduler::tick, shared::ConversationShared};

/// Pin and unpin requests.
///
/// Nothing is inserted optimistically: a completed call marks the pinned list
/// dirty and asks for a fetch round, which replaces the local set wholesale.
#[derive(Debug, Clone)]
pub struct PinCoordinator {
    shared: Arc<ConversationShared>,
}

impl PinCoordinator {
    pub(crate) fn new(shared: Arc<ConversationShared>) -> Self {
        Self { shared }
    }

    pub async fn pin(&self, message_ref: u64) -> Result<(), SyncError> {
        let result = self
            .shared
            .transport
            .pin_message(&self.shared.conversation_id, message_ref)
            .await;
        self.after_call("pin", result)
    }

    pub async fn unpin(&self, pin_id: u64) -> Result<(), SyncError> {
        let result = self
            .shared
            .transport
            .unpin_message(&self.shared.conversation_id, pin_id)
            .await;
        self.after_call("unpin", result)
    }

    /// Replace the local pinned list with an authoritative one.
    pub fn merge(&self, server_pins: Vec<PinnedMessage>) -> Result<bool, SyncError> {
        let changed = self
            .shared
            .with_reconciler(|reconciler| reconciler.merge_pins(server_pins))?;
        if changed {
            self.shared.emit(ConversationEvent::PinsChanged {
                conversation_id: self.shared.conversation_id.clone(),
            });
        }
        Ok(changed)
    }

    pub fn pinned(&self) -> Result<Vec<PinnedMessage>, SyncError> {
        self.shared
            .with_reconciler(|reconciler| reconciler.state().pinned().to_vec())
    }

    fn after_call(&self, action: &str, result: Result<(), SyncError>) -> Result<(), SyncError> {
        // The server may have applied the call even when the response failed.
        self.shared.mark_pins_dirty();
        result?;
        let started = tick(&self.shared, TriggerReason::PinsChanged);
        debug!(
            conversation_id = %self.shared.conversation_id,
            action,
            refresh_started = started,
            "pin list marked dirty"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use sync_core::{SchedulerPhase, SyncConfig};

    use super::*;
    use crate::testing::{CONV, Harness, T0, bob};

    fn quiet() -> SyncConfig {
        SyncConfig {
            poll_interval_ms: 60_000,
            ..SyncConfig::default()
        }
    }

    #[tokio::test(start_paused = true)]
    async fn pin_then_unpin_ends_at_authoritative_state() {
        let h = Harness::new(quiet());
        let message_id = h.server.post_remote(CONV, &bob(), "pin me").expect("post");
        h.scheduler.start().await.expect("start");
        tokio::time::sleep(Duration::from_millis(5)).await;
        let pins = PinCoordinator::new(Arc::clone(&h.shared));

        pins.pin(message_id).await.expect("pin");
        tokio::time::sleep(Duration::from_millis(5)).await;
        let pinned = pins.pinned().expect("pinned");
        assert_eq!(pinned.len(), 1);
        assert_eq!(pinned[0].message_ref, message_id);

        pins.unpin(pinned[0].pin_id).await.expect("unpin");
        tokio::time::sleep(Duration::from_millis(5)).await;
        assert!(pins.pinned().expect("pinned").is_empty());
        h.scheduler.stop().await.expect("stop");
    }

    #[tokio::test(start_paused = true)]
    async fn unpin_during_refresh_round_settles_on_next_merge() {
        let h = Harness::new(quiet());
        let message_id = h.server.post_remote(CONV, &bob(), "pin me").expect("post");
        h.scheduler.start().await.expect("start");
        tokio::time::sleep(Duration::from_millis(5)).await;
        h.server
            .set_latency(Duration::from_millis(20))
            .expect("latency");
        let pins = PinCoordinator::new(Arc::clone(&h.shared));

        pins.pin(message_id).await.expect("pin");
        // Let the refresh round read the pinned list, then unpin while it is in flight.
        tokio::time::sleep(Duration::from_millis(1)).await;
        assert_eq!(h.scheduler.phase(), SchedulerPhase::Fetching);
        let round_view = h.server.pins(CONV).expect("server pins");
        assert_eq!(round_view.len(), 1);
        pins.unpin(round_view[0].pin_id).await.expect("unpin");
        assert!(h.shared.pins_dirty());

        tokio::time::sleep(Duration::from_millis(25)).await;
        assert_eq!(h.scheduler.phase(), SchedulerPhase::Idle);
        assert_eq!(pins.pinned().expect("pinned"), round_view);
        assert!(h.shared.pins_dirty());

        assert!(h.scheduler.trigger_immediate(TriggerReason::Manual));
        tokio::time::sleep(Duration::from_millis(25)).await;
        assert!(pins.pinned().expect("pinned").is_empty());
        assert!(h.server.pins(CONV).expect("server pins").is_empty());
        assert!(!h.shared.pins_dirty());
        h.scheduler.stop().await.expect("stop");
    }

    #[tokio::test(start_paused = true)]
    async fn pin_is_not_inserted_before_refetch() {
        let h = Harness::new(quiet());
        let message_id = h.server.post_remote(CONV, &bob(), "pin me").expect("post");
        let pins = PinCoordinator::new(Arc::clone(&h.shared));

        pins.pin(message_id).await.expect("pin");
        assert!(pins.pinned().expect("pinned").is_empty());
        assert!(h.shared.pins_dirty());
    }

    #[tokio::test(start_paused = true)]
    async fn dirty_mark_survives_dropped_trigger() {
        let h = Harness::new(quiet());
        let message_id = h.server.post_remote(CONV, &bob(), "pin me").expect("post");
        h.scheduler.start().await.expect("start");
        tokio::time::sleep(Duration::from_millis(5)).await;

        h.server
            .set_latency(Duration::from_millis(50))
            .expect("latency");
        assert!(h.scheduler.trigger_immediate(TriggerReason::Manual));
        let pins = PinCoordinator::new(Arc::clone(&h.shared));
        pins.pin(message_id).await.expect("pin");
        assert!(h.shared.pins_dirty());

        tokio::time::sleep(Duration::from_millis(60)).await;
        assert!(pins.pinned().expect("pinned").is_empty());

        assert!(h.scheduler.trigger_immediate(TriggerReason::Manual));
        tokio::time::sleep(Duration::from_millis(60)).await;
        assert_eq!(pins.pinned().expect("pinned").len(), 1);
        assert!(!h.shared.pins_dirty());
        h.scheduler.stop().await.expect("stop");
    }

    #[tokio::test(start_paused = true)]
    async fn failed_call_still_marks_dirty() {
        let h = Harness::new(quiet());
        let pins = PinCoordinator::new(Arc::clone(&h.shared));
        let err = pins.unpin(404).await.expect_err("unknown pin");
        assert_eq!(err.code, "pin_not_found");
        assert!(h.shared.pins_dirty());
    }

    #[test]
    fn merge_orders_newest_first_and_reports_changes() {
        let h = Harness::new(quiet());
        let pins = PinCoordinator::new(Arc::clone(&h.shared));
        let server = vec![
            PinnedMessage {
                pin_id: 1,
                message_ref: 10,
                pinned_by: "u-bob".into(),
                pinned_at_ms: T0,
            },
            PinnedMessage {
                pin_id: 2,
                message_ref: 11,
                pinned_by: "u-bob".into(),
                pinned_at_ms: T0 + 1,
            },
        ];

        assert!(pins.merge(server.clone()).expect("merge"));
        assert!(!pins.merge(server).expect("merge"));
        let ordered: Vec<u64> = pins
            .pinned()
            .expect("pinned")
            .iter()
            .map(|pin| pin.pin_id)
            .collect();
        assert_eq!(ordered, vec![2, 1]);
    }
}
