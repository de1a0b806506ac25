//! Merge of fetched batches and local requests into a [`ConversationState`].

use std::{cmp::Ordering, collections::HashMap};

use tracing::{debug, warn};

use crate::{
    conversation::ConversationState,
    error::{SyncError, SyncErrorCategory},
    normalization::{NormalizedRecord, normalize_record},
    outbox::{Outbox, OutboxState},
    types::{
        DeliveryState, Message, OutgoingPayload, PinnedMessage, RawMessage, RemoteActivity,
        SyncConfig, UserRef,
    },
};

/// Summary of one merge pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MergeReport {
    /// Messages not previously present in the log.
    pub appended: usize,
    /// Existing confirmed messages whose mutable fields changed.
    pub updated: usize,
    /// Malformed records skipped.
    pub dropped: usize,
    /// Local placeholders resolved by a server record.
    pub confirmed: Vec<String>,
}

impl MergeReport {
    /// Whether the merge introduced a message not seen before.
    pub fn introduced_new(&self) -> bool {
        self.appended > 0
    }

    /// Whether the message log changed at all.
    pub fn changed(&self) -> bool {
        self.appended > 0 || self.updated > 0 || !self.confirmed.is_empty()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
struct PendingRequests {
    mark_read: bool,
}

/// Single writer of a [`ConversationState`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reconciler {
    state: ConversationState,
    outbox: Outbox,
    local_user: UserRef,
    legacy_match_window_ms: u64,
    pending: PendingRequests,
}

impl Reconciler {
    pub fn new(conversation_id: impl Into<String>, local_user: UserRef, config: &SyncConfig) -> Self {
        Self {
            state: ConversationState::new(conversation_id, config.typing_ttl_ms),
            outbox: Outbox::default(),
            local_user,
            legacy_match_window_ms: config.legacy_match_window_ms,
            pending: PendingRequests::default(),
        }
    }

    pub fn state(&self) -> &ConversationState {
        &self.state
    }

    pub fn outbox(&self) -> &Outbox {
        &self.outbox
    }

    pub fn local_user(&self) -> &UserRef {
        &self.local_user
    }

    /// Merge a fetched batch into the log.
    ///
    /// Re-applying the same batch is a no-op.
    pub fn reconcile(
        &mut self,
        conversation_id: &str,
        batch: Vec<RawMessage>,
    ) -> Result<MergeReport, SyncError> {
        if conversation_id != self.state.conversation_id {
            return Err(SyncError::conversation_mismatch(
                &self.state.conversation_id,
                conversation_id,
            ));
        }

        let mut report = MergeReport::default();
        let mut by_id: HashMap<u64, usize> = HashMap::new();
        let mut by_temp_id: HashMap<String, usize> = HashMap::new();
        for (idx, message) in self.state.messages.iter().enumerate() {
            if let Some(id) = message.id {
                by_id.insert(id, idx);
            }
            by_temp_id.insert(message.client_temp_id.clone(), idx);
        }

        for raw in batch {
            let NormalizedRecord {
                message: incoming,
                echoed_temp_id,
            } = match normalize_record(raw, &self.local_user.user_id) {
                Ok(record) => record,
                Err(err) => {
                    warn!(
                        conversation_id = %self.state.conversation_id,
                        error = %err,
                        "dropping malformed record"
                    );
                    report.dropped += 1;
                    continue;
                }
            };
            let Some(id) = incoming.id else {
                continue;
            };

            if let Some(&idx) = by_id.get(&id) {
                if overwrite_mutable(&mut self.state.messages[idx], &incoming) {
                    report.updated += 1;
                }
                continue;
            }

            let placeholder = if echoed_temp_id {
                by_temp_id
                    .get(&incoming.client_temp_id)
                    .copied()
                    .filter(|&idx| !self.state.messages[idx].is_confirmed())
            } else {
                self.legacy_match(&incoming)
            };

            if let Some(idx) = placeholder {
                let client_temp_id = self.state.messages[idx].client_temp_id.clone();
                if !echoed_temp_id {
                    debug!(
                        conversation_id = %self.state.conversation_id,
                        %client_temp_id,
                        message_id = id,
                        "matched send by text and sender without correlation id"
                    );
                }
                self.state.messages[idx] = Message {
                    client_temp_id: client_temp_id.clone(),
                    ..incoming
                };
                by_id.insert(id, idx);
                self.outbox.confirm(&client_temp_id);
                report.confirmed.push(client_temp_id);
                continue;
            }

            if echoed_temp_id && incoming.sender.is_local {
                debug!(
                    conversation_id = %self.state.conversation_id,
                    client_temp_id = %incoming.client_temp_id,
                    message_id = id,
                    "confirmation without local outbox entry, treating as new message"
                );
            }

            let idx = self.state.messages.len();
            by_id.insert(id, idx);
            by_temp_id.insert(incoming.client_temp_id.clone(), idx);
            self.state.messages.push(incoming);
            report.appended += 1;
        }

        self.outbox.take_confirmed();
        self.fold_pending();
        self.state.messages.sort_by(log_order);

        if report.changed() || report.dropped > 0 {
            debug!(
                conversation_id = %self.state.conversation_id,
                appended = report.appended,
                updated = report.updated,
                confirmed = report.confirmed.len(),
                dropped = report.dropped,
                "merged batch"
            );
        }
        Ok(report)
    }

    /// Insert an optimistic placeholder and register it in the outbox.
    pub fn enqueue_local(
        &mut self,
        payload: OutgoingPayload,
        now_ms: u64,
    ) -> Result<String, SyncError> {
        if payload.body().trim().is_empty() && payload.media_ref().is_none() {
            return Err(SyncError::new(
                SyncErrorCategory::Rejected,
                "empty_payload",
                "refusing to send a message without text or media",
            ));
        }

        let client_temp_id = Outbox::new_temp_id();
        self.state.messages.push(Message {
            id: None,
            client_temp_id: client_temp_id.clone(),
            text: payload.body().to_owned(),
            sender: self.local_user.clone(),
            kind: payload.kind(),
            media_ref: payload.media_ref().map(ToOwned::to_owned),
            delivery_state: DeliveryState::PendingSend,
            delivered_at_ms: None,
            read_at_ms: None,
            created_at_ms: now_ms,
        });
        self.state.messages.sort_by(log_order);
        self.outbox.queue(client_temp_id.clone(), payload, now_ms);

        debug!(
            conversation_id = %self.state.conversation_id,
            %client_temp_id,
            "queued local send"
        );
        Ok(client_temp_id)
    }

    /// Mark an outbox entry as in flight. Returns its attempt number.
    pub fn begin_send(&mut self, client_temp_id: &str) -> Result<u32, SyncError> {
        let attempt = self.outbox.begin_send(client_temp_id)?;
        if let Some(message) = self.placeholder_mut(client_temp_id) {
            message.delivery_state = DeliveryState::PendingSend;
        }
        Ok(attempt)
    }

    /// Merge the server's confirmation of a local send.
    ///
    /// A confirmation whose outbox entry is already gone is merged like any
    /// fetched record.
    pub fn confirm_send(
        &mut self,
        client_temp_id: &str,
        mut record: RawMessage,
    ) -> Result<MergeReport, SyncError> {
        if record.client_temp_id.is_none() {
            record.client_temp_id = Some(client_temp_id.to_owned());
        }
        let conversation_id = self.state.conversation_id.clone();
        self.reconcile(&conversation_id, vec![record])
    }

    /// Flag a send as failed. Returns `false` when the send already resolved.
    pub fn fail_send(&mut self, client_temp_id: &str, error: &SyncError) -> bool {
        match self.outbox.get(client_temp_id).map(|entry| entry.state) {
            Some(OutboxState::Sending) | Some(OutboxState::Queued) => {}
            _ => {
                debug!(
                    conversation_id = %self.state.conversation_id,
                    %client_temp_id,
                    "ignoring failure for send that is no longer in flight"
                );
                return false;
            }
        }
        if self.outbox.mark_failed(client_temp_id).is_err() {
            return false;
        }
        if let Some(message) = self.placeholder_mut(client_temp_id) {
            message.delivery_state = DeliveryState::Failed;
        }
        warn!(
            conversation_id = %self.state.conversation_id,
            %client_temp_id,
            code = %error.code,
            "send failed"
        );
        true
    }

    /// Fail every send still marked in flight.
    ///
    /// Used when the scheduler stops: results of those requests will be
    /// discarded as stale, and a later fetch echo still resolves any that the
    /// server accepted.
    pub fn abandon_in_flight_sends(&mut self) -> Vec<String> {
        let in_flight: Vec<String> = self
            .outbox
            .entries()
            .filter(|entry| entry.state == OutboxState::Sending)
            .map(|entry| entry.client_temp_id.clone())
            .collect();
        for client_temp_id in &in_flight {
            if self.outbox.mark_failed(client_temp_id).is_ok()
                && let Some(message) = self.placeholder_mut(client_temp_id)
            {
                message.delivery_state = DeliveryState::Failed;
            }
        }
        if !in_flight.is_empty() {
            debug!(
                conversation_id = %self.state.conversation_id,
                count = in_flight.len(),
                "abandoned in-flight sends"
            );
        }
        in_flight
    }

    /// Drop a failed or queued send together with its placeholder.
    pub fn discard_send(&mut self, client_temp_id: &str) -> Result<(), SyncError> {
        self.outbox.discard(client_temp_id)?;
        self.state.messages.retain(|message| {
            message.is_confirmed() || message.client_temp_id != client_temp_id
        });
        Ok(())
    }

    /// Queue a mark-read request; it is folded during the next merge pass.
    pub fn request_mark_read(&mut self) {
        self.pending.mark_read = true;
    }

    /// Replace remote typing state and prune it against `now_ms`.
    ///
    /// Returns `true` when the visible typing set differs from before.
    pub fn apply_typing_snapshot(&mut self, snapshot: Vec<RemoteActivity>, now_ms: u64) -> bool {
        let before = self.state.typing.clone();
        self.state
            .typing
            .apply_snapshot(snapshot, &self.local_user.user_id);
        self.state.typing.prune(now_ms);
        self.state.typing != before
    }

    /// Expire remote typing entries. Returns the number removed.
    pub fn prune_typing(&mut self, now_ms: u64) -> usize {
        self.state.typing.prune(now_ms)
    }

    /// Replace the pinned set with the server's list.
    pub fn merge_pins(&mut self, pins: Vec<PinnedMessage>) -> bool {
        self.state.pins.merge(pins)
    }

    pub fn set_in_flight(&mut self, in_flight: bool) {
        self.state.in_flight = in_flight;
    }

    /// Record a completed fetch round.
    pub fn record_sync(&mut self, now_ms: u64) {
        self.state.last_synced_at_ms = Some(now_ms);
        self.state.last_error = None;
    }

    /// Record a failed operation for the UI.
    pub fn record_error(&mut self, error: SyncError) {
        self.state.last_error = Some(error);
    }

    fn fold_pending(&mut self) {
        if !self.pending.mark_read {
            return;
        }
        if let Some(max_id) = self.state.max_confirmed_id() {
            let marker = self.state.read_marker.unwrap_or(0).max(max_id);
            self.state.read_marker = Some(marker);
            self.pending.mark_read = false;
        }
    }

    fn placeholder_mut(&mut self, client_temp_id: &str) -> Option<&mut Message> {
        self.state
            .messages
            .iter_mut()
            .find(|message| !message.is_confirmed() && message.client_temp_id == client_temp_id)
    }

    fn legacy_match(&self, incoming: &Message) -> Option<usize> {
        if !incoming.sender.is_local {
            return None;
        }
        self.state
            .messages
            .iter()
            .enumerate()
            .filter(|(_, message)| !message.is_confirmed())
            .filter(|(_, message)| message.text == incoming.text && message.kind == incoming.kind)
            .filter(|(_, message)| {
                self.outbox
                    .get(&message.client_temp_id)
                    .is_some_and(|entry| entry.state == OutboxState::Sending)
            })
            .map(|(idx, message)| (idx, message.created_at_ms.abs_diff(incoming.created_at_ms)))
            .filter(|(_, distance)| *distance <= self.legacy_match_window_ms)
            .min_by_key(|(_, distance)| *distance)
            .map(|(idx, _)| idx)
    }
}

fn overwrite_mutable(existing: &mut Message, incoming: &Message) -> bool {
    let changed = existing.delivery_state != incoming.delivery_state
        || existing.delivered_at_ms != incoming.delivered_at_ms
        || existing.read_at_ms != incoming.read_at_ms
        || existing.text != incoming.text
        || existing.media_ref != incoming.media_ref;
    if changed {
        existing.delivery_state = incoming.delivery_state;
        existing.delivered_at_ms = incoming.delivered_at_ms;
        existing.read_at_ms = incoming.read_at_ms;
        existing.text.clone_from(&incoming.text);
        existing.media_ref.clone_from(&incoming.media_ref);
    }
    changed
}

/// `(createdAt, id)` for confirmed messages; unconfirmed ones sort after
/// confirmed peers with the same timestamp, by correlation ID.
fn log_order(a: &Message, b: &Message) -> Ordering {
    a.created_at_ms
        .cmp(&b.created_at_ms)
        .then_with(|| match (a.id, b.id) {
            (Some(x), Some(y)) => x.cmp(&y),
            (Some(_), None) => Ordering::Less,
            (None, Some(_)) => Ordering::Greater,
            (None, None) => a.client_temp_id.cmp(&b.client_temp_id),
        })
}
