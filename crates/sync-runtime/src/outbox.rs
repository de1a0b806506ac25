use std::sync::Arc;

use sync_core::{
    ActivityKind, ConversationEvent, OutgoingPayload, Reconciler, SendOutcome, SyncError,
    normalize_send_failure,
};
use tracing::{debug, trace, warn};

use crate::shared::ConversationShared;

/// Optimistic send pipeline for one conversation.
///
/// Placeholders appear synchronously in the log; the network request runs on a
/// spawned task and its result is folded back under the scheduler generation
/// that issued it.
#[derive(Debug, Clone)]
pub struct OutboxCoordinator {
    shared: Arc<ConversationShared>,
}

impl OutboxCoordinator {
    pub(crate) fn new(shared: Arc<ConversationShared>) -> Self {
        Self { shared }
    }

    /// Insert a `PendingSend` placeholder and send it in the background.
    ///
    /// Fails with an invalid-state error while the scheduler is stopped.
    pub fn enqueue(&self, payload: OutgoingPayload) -> Result<String, SyncError> {
        let now_ms = self.shared.clock.now_ms();
        let send = self.shared.with_running("enqueue", |generation, reconciler| {
            let client_temp_id = reconciler.enqueue_local(payload, now_ms)?;
            prepare_send(reconciler, generation, client_temp_id)
        })?;
        self.shared.emit(ConversationEvent::MessagesChanged {
            conversation_id: self.shared.conversation_id.clone(),
            introduced_new: true,
        });
        let client_temp_id = send.client_temp_id.clone();
        self.dispatch(send);
        Ok(client_temp_id)
    }

    /// Resend a failed entry under the same correlation ID.
    pub fn retry(&self, client_temp_id: &str) -> Result<(), SyncError> {
        let send = self.shared.with_running("retry", |generation, reconciler| {
            prepare_send(reconciler, generation, client_temp_id.to_owned())
        })?;
        self.dispatch(send);
        self.shared.emit(ConversationEvent::MessagesChanged {
            conversation_id: self.shared.conversation_id.clone(),
            introduced_new: false,
        });
        Ok(())
    }

    /// Give up on a failed or queued entry and remove its placeholder.
    pub fn discard(&self, client_temp_id: &str) -> Result<(), SyncError> {
        self.shared
            .with_reconciler(|reconciler| reconciler.discard_send(client_temp_id))??;
        debug!(
            conversation_id = %self.shared.conversation_id,
            %client_temp_id,
            "discarded local send"
        );
        self.shared.emit(ConversationEvent::MessagesChanged {
            conversation_id: self.shared.conversation_id.clone(),
            introduced_new: false,
        });
        Ok(())
    }

    /// Fold a send result produced outside this coordinator into the current run.
    pub fn on_transport_result(
        &self,
        client_temp_id: &str,
        outcome: SendOutcome,
    ) -> Result<(), SyncError> {
        let generation = self
            .shared
            .with_machine(|machine| machine.require_running("on_transport_result"))??;
        apply_send_outcome(&self.shared, generation, client_temp_id, outcome);
        Ok(())
    }

    fn dispatch(&self, send: PreparedSend) {
        let PreparedSend {
            generation,
            client_temp_id,
            attempt,
            payload,
        } = send;
        debug!(
            conversation_id = %self.shared.conversation_id,
            %client_temp_id,
            attempt,
            "sending"
        );

        let upload = ActivityKind::for_media(payload.kind());
        let shared = Arc::clone(&self.shared);
        tokio::spawn(async move {
            if let Some(activity) = upload {
                publish_upload(&shared, &client_temp_id, activity).await;
            }
            let outcome: SendOutcome = shared
                .transport
                .send_message(&shared.conversation_id, &client_temp_id, &payload)
                .await
                .into();
            apply_send_outcome(&shared, generation, &client_temp_id, outcome);
        });
    }
}

/// A send moved to `Sending` under a known generation.
struct PreparedSend {
    generation: u64,
    client_temp_id: String,
    attempt: u32,
    payload: OutgoingPayload,
}

fn prepare_send(
    reconciler: &mut Reconciler,
    generation: u64,
    client_temp_id: String,
) -> Result<PreparedSend, SyncError> {
    let attempt = reconciler.begin_send(&client_temp_id)?;
    let payload = reconciler
        .outbox()
        .get(&client_temp_id)
        .map(|entry| entry.payload.clone())
        .ok_or_else(|| SyncError::internal("outbox entry vanished during send"))?;
    Ok(PreparedSend {
        generation,
        client_temp_id,
        attempt,
        payload,
    })
}

async fn publish_upload(shared: &ConversationShared, client_temp_id: &str, activity: ActivityKind) {
    match shared.claim_activity(activity, shared.clock.now_ms()) {
        Ok(true) => {}
        Ok(false) => {
            trace!(conversation_id = %shared.conversation_id, %client_temp_id, "upload activity throttled");
            return;
        }
        Err(err) => {
            debug!(conversation_id = %shared.conversation_id, error = %err, "upload activity skipped");
            return;
        }
    }
    if let Err(err) = shared
        .transport
        .publish_activity(&shared.conversation_id, activity)
        .await
    {
        debug!(
            conversation_id = %shared.conversation_id,
            %client_temp_id,
            error = %err,
            "upload activity not published"
        );
    }
}

fn apply_send_outcome(
    shared: &ConversationShared,
    generation: u64,
    client_temp_id: &str,
    outcome: SendOutcome,
) {
    let applied = shared.with_current(generation, |reconciler| match outcome {
        SendOutcome::Confirmed(record) => reconciler
            .confirm_send(client_temp_id, record)
            .map(|report| {
                report.changed().then(|| ConversationEvent::MessagesChanged {
                    conversation_id: shared.conversation_id.clone(),
                    introduced_new: report.introduced_new(),
                })
            }),
        SendOutcome::Failed(err) => {
            let failure = normalize_send_failure(err);
            let failed = reconciler.fail_send(client_temp_id, &failure);
            if failed {
                reconciler.record_error(failure.clone());
            }
            Ok(failed.then(|| ConversationEvent::SendFailed {
                conversation_id: shared.conversation_id.clone(),
                client_temp_id: client_temp_id.to_owned(),
                code: failure.code,
            }))
        }
    });

    match applied {
        Ok(Some(Ok(Some(event)))) => {
            if matches!(event, ConversationEvent::SendFailed { .. }) {
                shared.emit(ConversationEvent::MessagesChanged {
                    conversation_id: shared.conversation_id.clone(),
                    introduced_new: false,
                });
            }
            shared.emit(event);
        }
        Ok(Some(Ok(None))) => {}
        Ok(None) => debug!(
            conversation_id = %shared.conversation_id,
            %client_temp_id,
            generation,
            "discarding send result from previous run"
        ),
        Ok(Some(Err(err))) | Err(err) => warn!(
            conversation_id = %shared.conversation_id,
            %client_temp_id,
            error = %err,
            "send result not applied"
        ),
    }
}
