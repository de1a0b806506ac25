use tokio::sync::broadcast;

use crate::types::ConversationEvent;

/// Broadcast event stream type used by conversation observers.
pub type EventStream = broadcast::Receiver<ConversationEvent>;

/// Fan-out channel for conversation events.
#[derive(Clone, Debug)]
pub struct EventChannel {
    event_tx: broadcast::Sender<ConversationEvent>,
}

impl EventChannel {
    /// Create a channel with the given buffer (at least 1).
    pub fn new(event_buffer: usize) -> Self {
        let (event_tx, _) = broadcast::channel(event_buffer.max(1));
        Self { event_tx }
    }

    /// Subscribe to emitted events.
    pub fn subscribe(&self) -> EventStream {
        self.event_tx.subscribe()
    }

    /// Number of live subscribers.
    pub fn subscriber_count(&self) -> usize {
        self.event_tx.receiver_count()
    }

    /// Emit an event to all subscribers.
    ///
    /// Emission is best-effort; lagged subscribers are handled by `broadcast`.
    pub fn emit(&self, event: ConversationEvent) {
        let _ = self.event_tx.send(event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::SchedulerPhase;

    #[tokio::test]
    async fn fans_out_events_to_subscribers() {
        let channel = EventChannel::new(16);
        let mut a = channel.subscribe();
        let mut b = channel.subscribe();

        channel.emit(ConversationEvent::PhaseChanged {
            conversation_id: "c1".into(),
            phase: SchedulerPhase::Idle,
        });

        let event_a = a.recv().await.expect("subscriber a should receive event");
        let event_b = b.recv().await.expect("subscriber b should receive event");
        assert_eq!(event_a, event_b);
    }

    #[test]
    fn emitting_without_subscribers_is_silent() {
        let channel = EventChannel::new(0);
        assert_eq!(channel.subscriber_count(), 0);
        channel.emit(ConversationEvent::PinsChanged {
            conversation_id: "c1".into(),
        });
    }
}
