use std::sync::Arc;

use sync_core::{
    ActivityKind, ConversationSnapshot, EventStream, OutgoingPayload, SchedulerPhase, SyncConfig,
    SyncError, TriggerReason, UserRef,
};
use sync_transport::ChatTransport;
use tracing::{info, warn};

use crate::{
    clock::Clock, outbox::OutboxCoordinator, pins::PinCoordinator, scheduler::SyncScheduler,
    shared::ConversationShared, typing::TypingSignalTracker,
};

/// Everything the UI needs for one open conversation.
#[derive(Debug)]
pub struct ConversationEngine {
    shared: Arc<ConversationShared>,
    scheduler: SyncScheduler,
    outbox: OutboxCoordinator,
    typing: TypingSignalTracker,
    pins: PinCoordinator,
}

impl ConversationEngine {
    pub fn new(
        conversation_id: impl Into<String>,
        local_user: UserRef,
        config: SyncConfig,
        transport: Arc<dyn ChatTransport>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let shared =
            ConversationShared::new(conversation_id.into(), local_user, config, transport, clock);
        Self {
            scheduler: SyncScheduler::new(Arc::clone(&shared)),
            outbox: OutboxCoordinator::new(Arc::clone(&shared)),
            typing: TypingSignalTracker::new(Arc::clone(&shared)),
            pins: PinCoordinator::new(Arc::clone(&shared)),
            shared,
        }
    }

    pub fn conversation_id(&self) -> &str {
        &self.shared.conversation_id
    }

    /// Start syncing and mark the conversation read.
    ///
    /// The read marker is folded into the next merge; a failed `mark_read`
    /// request is logged and does not fail the open.
    pub async fn open(&self) -> Result<(), SyncError> {
        self.scheduler.start().await?;
        self.shared
            .with_reconciler(|reconciler| reconciler.request_mark_read())?;
        if let Err(err) = self
            .shared
            .transport
            .mark_read(&self.shared.conversation_id)
            .await
        {
            warn!(
                conversation_id = %self.shared.conversation_id,
                error = %err,
                "mark read request failed"
            );
        }
        info!(conversation_id = %self.shared.conversation_id, "conversation opened");
        Ok(())
    }

    pub async fn close(&self) -> Result<(), SyncError> {
        self.scheduler.stop().await?;
        info!(conversation_id = %self.shared.conversation_id, "conversation closed");
        Ok(())
    }

    pub fn phase(&self) -> SchedulerPhase {
        self.scheduler.phase()
    }

    pub fn snapshot(&self) -> Result<ConversationSnapshot, SyncError> {
        self.shared
            .with_reconciler(|reconciler| reconciler.state().snapshot())
    }

    pub fn subscribe(&self) -> EventStream {
        self.shared.events.subscribe()
    }

    pub fn scheduler(&self) -> &SyncScheduler {
        &self.scheduler
    }

    pub fn outbox(&self) -> &OutboxCoordinator {
        &self.outbox
    }

    pub fn typing(&self) -> &TypingSignalTracker {
        &self.typing
    }

    pub fn pins(&self) -> &PinCoordinator {
        &self.pins
    }

    pub fn send_text(&self, text: impl Into<String>) -> Result<String, SyncError> {
        self.outbox.enqueue(OutgoingPayload::text(text))
    }

    pub fn enqueue(&self, payload: OutgoingPayload) -> Result<String, SyncError> {
        self.outbox.enqueue(payload)
    }

    pub fn retry(&self, client_temp_id: &str) -> Result<(), SyncError> {
        self.outbox.retry(client_temp_id)
    }

    pub fn discard(&self, client_temp_id: &str) -> Result<(), SyncError> {
        self.outbox.discard(client_temp_id)
    }

    pub fn publish_activity(&self, kind: ActivityKind) -> Result<bool, SyncError> {
        self.typing.publish_local_activity(kind)
    }

    pub async fn pin(&self, message_ref: u64) -> Result<(), SyncError> {
        self.pins.pin(message_ref).await
    }

    pub async fn unpin(&self, pin_id: u64) -> Result<(), SyncError> {
        self.pins.unpin(pin_id).await
    }

    pub fn trigger_immediate(&self, reason: TriggerReason) -> bool {
        self.scheduler.trigger_immediate(reason)
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use sync_core::{ConversationEvent, DeliveryState};
    use sync_transport::InMemoryChatServer;

    use super::*;
    use crate::{
        clock::ManualClock,
        testing::{CONV, T0, alice, bob},
    };

    fn engine(server: &InMemoryChatServer) -> ConversationEngine {
        ConversationEngine::new(
            CONV,
            alice(),
            SyncConfig {
                poll_interval_ms: 1_000,
                ..SyncConfig::default()
            },
            Arc::new(server.clone()),
            Arc::new(ManualClock::new(T0)),
        )
    }

    #[tokio::test(start_paused = true)]
    async fn open_fetches_and_marks_read_once() {
        let server = InMemoryChatServer::new(alice());
        server.set_now_ms(T0);
        server.post_remote(CONV, &bob(), "unread 1").expect("post");
        server.post_remote(CONV, &bob(), "unread 2").expect("post");
        let engine = engine(&server);

        engine.open().await.expect("open");
        tokio::time::sleep(Duration::from_millis(5)).await;

        let snapshot = engine.snapshot().expect("snapshot");
        assert_eq!(snapshot.messages.len(), 2);
        assert_eq!(snapshot.read_marker, Some(2));
        assert_eq!(snapshot.unread_count, 0);
        assert_eq!(server.mark_read_calls().expect("calls"), vec![CONV.to_owned()]);

        server.post_remote(CONV, &bob(), "fresh").expect("post");
        tokio::time::sleep(Duration::from_millis(1_000)).await;
        let later = engine.snapshot().expect("snapshot");
        assert_eq!(later.unread_count, 1);
        assert_eq!(server.mark_read_calls().expect("calls").len(), 1);
        engine.close().await.expect("close");
    }

    #[tokio::test(start_paused = true)]
    async fn hi_round_trip_keeps_single_entry() {
        let server = InMemoryChatServer::new(alice());
        server.set_now_ms(T0);
        let engine = engine(&server);
        let mut events = engine.subscribe();
        engine.open().await.expect("open");

        let tmp = engine.send_text("hi").expect("send");
        let pending = engine.snapshot().expect("snapshot");
        assert_eq!(pending.messages.len(), 1);
        assert_eq!(pending.messages[0].delivery_state, DeliveryState::PendingSend);

        tokio::time::sleep(Duration::from_millis(5)).await;
        let sent = engine.snapshot().expect("snapshot");
        assert_eq!(sent.messages.len(), 1);
        assert_eq!(sent.messages[0].client_temp_id, tmp);
        assert_eq!(sent.messages[0].delivery_state, DeliveryState::Sent);

        tokio::time::sleep(Duration::from_millis(1_000)).await;
        assert_eq!(engine.snapshot().expect("snapshot").messages.len(), 1);

        let mut saw_new = false;
        while let Ok(event) = events.try_recv() {
            if let ConversationEvent::MessagesChanged { introduced_new, .. } = event {
                saw_new |= introduced_new;
            }
        }
        assert!(saw_new);
        engine.close().await.expect("close");
    }

    #[tokio::test(start_paused = true)]
    async fn close_rejects_further_sends() {
        let server = InMemoryChatServer::new(alice());
        let engine = engine(&server);
        engine.open().await.expect("open");
        engine.close().await.expect("close");

        assert_eq!(engine.phase(), SchedulerPhase::Stopped);
        let err = engine.send_text("late").expect_err("closed");
        assert_eq!(err.category, sync_core::SyncErrorCategory::InvalidState);
    }
}
