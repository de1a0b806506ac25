use std::{
    collections::HashMap,
    sync::{
        Arc, RwLock,
        atomic::{AtomicU64, AtomicUsize, Ordering},
    },
    time::{Duration, SystemTime, UNIX_EPOCH},
};

use async_trait::async_trait;
use sync_core::{
    ActivityKind, DeliveryState, OutgoingPayload, PinnedMessage, RawMessage, RemoteActivity,
    SyncError, SyncErrorCategory, UserRef,
};
use tracing::trace;

use crate::ChatTransport;

#[derive(Debug, Default)]
struct ConversationData {
    messages: Vec<RawMessage>,
    typing: Vec<RemoteActivity>,
    pins: Vec<PinnedMessage>,
}

#[derive(Debug)]
struct ServerData {
    conversations: HashMap<String, ConversationData>,
    next_message_id: u64,
    next_pin_id: u64,
    latency: Duration,
    echo_client_temp_id: bool,
    failing_fetches: u32,
    failing_sends: u32,
    published: Vec<(String, ActivityKind)>,
    mark_read_calls: Vec<String>,
}

#[derive(Debug)]
struct ServerInner {
    client_user: UserRef,
    data: RwLock<ServerData>,
    now_ms: AtomicU64,
    fetch_calls: AtomicUsize,
    fetches_in_flight: AtomicUsize,
    max_fetches_in_flight: AtomicUsize,
    send_calls: AtomicUsize,
}

/// In-process chat backend serving one authenticated client user.
///
/// Cloning shares the same backing store.
#[derive(Clone, Debug)]
pub struct InMemoryChatServer {
    inner: Arc<ServerInner>,
}

struct InFlightGuard<'a>(&'a AtomicUsize);

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

impl InMemoryChatServer {
    /// Create a server whose transport calls act as `client_user`.
    pub fn new(client_user: UserRef) -> Self {
        let now_ms = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|elapsed| elapsed.as_millis() as u64)
            .unwrap_or(0);
        Self {
            inner: Arc::new(ServerInner {
                client_user,
                data: RwLock::new(ServerData {
                    conversations: HashMap::new(),
                    next_message_id: 1,
                    next_pin_id: 1,
                    latency: Duration::ZERO,
                    echo_client_temp_id: true,
                    failing_fetches: 0,
                    failing_sends: 0,
                    published: Vec::new(),
                    mark_read_calls: Vec::new(),
                }),
                now_ms: AtomicU64::new(now_ms),
                fetch_calls: AtomicUsize::new(0),
                fetches_in_flight: AtomicUsize::new(0),
                max_fetches_in_flight: AtomicUsize::new(0),
                send_calls: AtomicUsize::new(0),
            }),
        }
    }

    /// Server clock used to stamp new messages and pins.
    pub fn now_ms(&self) -> u64 {
        self.inner.now_ms.load(Ordering::SeqCst)
    }

    pub fn set_now_ms(&self, now_ms: u64) {
        self.inner.now_ms.store(now_ms, Ordering::SeqCst);
    }

    /// Artificial delay applied to message fetch, send and mark-read calls.
    pub fn set_latency(&self, latency: Duration) -> Result<(), SyncError> {
        self.write()?.latency = latency;
        Ok(())
    }

    /// When `false`, send responses and fetched records omit `client_temp_id`.
    pub fn set_echo_client_temp_id(&self, echo: bool) -> Result<(), SyncError> {
        self.write()?.echo_client_temp_id = echo;
        Ok(())
    }

    /// Fail the next `count` message fetches with a network error.
    pub fn fail_next_fetches(&self, count: u32) -> Result<(), SyncError> {
        self.write()?.failing_fetches = count;
        Ok(())
    }

    /// Fail the next `count` sends with a network error.
    pub fn fail_next_sends(&self, count: u32) -> Result<(), SyncError> {
        self.write()?.failing_sends = count;
        Ok(())
    }

    /// Store a message authored by another participant and return its ID.
    pub fn post_remote(
        &self,
        conversation_id: &str,
        sender: &UserRef,
        text: &str,
    ) -> Result<u64, SyncError> {
        let now_ms = self.now_ms();
        let mut data = self.write()?;
        let id = data.next_message_id;
        data.next_message_id += 1;
        data.conversations
            .entry(conversation_id.to_owned())
            .or_default()
            .messages
            .push(RawMessage {
                id: Some(id),
                text: Some(text.to_owned()),
                sender_id: Some(sender.user_id.clone()),
                sender_name: Some(sender.display_name.clone()),
                delivery_state: Some(DeliveryState::Sent),
                created_at_ms: Some(now_ms),
                ..RawMessage::default()
            });
        Ok(id)
    }

    /// Store an arbitrary record, valid or not, as the server would return it.
    pub fn insert_raw(&self, conversation_id: &str, record: RawMessage) -> Result<(), SyncError> {
        self.write()?
            .conversations
            .entry(conversation_id.to_owned())
            .or_default()
            .messages
            .push(record);
        Ok(())
    }

    /// Update delivery state of a stored message, as a recipient's client would.
    pub fn set_delivery_state(
        &self,
        conversation_id: &str,
        message_id: u64,
        state: DeliveryState,
    ) -> Result<(), SyncError> {
        let now_ms = self.now_ms();
        let mut data = self.write()?;
        let record = data
            .conversations
            .get_mut(conversation_id)
            .and_then(|conversation| {
                conversation
                    .messages
                    .iter_mut()
                    .find(|record| record.id == Some(message_id))
            })
            .ok_or_else(|| not_found("message_not_found", message_id))?;
        record.delivery_state = Some(state);
        match state {
            DeliveryState::Delivered => record.delivered_at_ms = Some(now_ms),
            DeliveryState::Read => record.read_at_ms = Some(now_ms),
            _ => {}
        }
        Ok(())
    }

    /// Replace the activity list reported for a conversation.
    pub fn set_typing(
        &self,
        conversation_id: &str,
        activities: Vec<RemoteActivity>,
    ) -> Result<(), SyncError> {
        self.write()?
            .conversations
            .entry(conversation_id.to_owned())
            .or_default()
            .typing = activities;
        Ok(())
    }

    /// Pin a message on behalf of another participant.
    pub fn pin_as(
        &self,
        conversation_id: &str,
        user_id: &str,
        message_id: u64,
    ) -> Result<u64, SyncError> {
        let now_ms = self.now_ms();
        let mut data = self.write()?;
        Ok(pin_locked(&mut data, conversation_id, user_id, message_id, now_ms))
    }

    pub fn messages(&self, conversation_id: &str) -> Result<Vec<RawMessage>, SyncError> {
        Ok(self
            .read()?
            .conversations
            .get(conversation_id)
            .map(|conversation| conversation.messages.clone())
            .unwrap_or_default())
    }

    pub fn pins(&self, conversation_id: &str) -> Result<Vec<PinnedMessage>, SyncError> {
        Ok(self
            .read()?
            .conversations
            .get(conversation_id)
            .map(|conversation| conversation.pins.clone())
            .unwrap_or_default())
    }

    /// Activity signals received from the client, in arrival order.
    pub fn published_activity(&self) -> Result<Vec<(String, ActivityKind)>, SyncError> {
        Ok(self.read()?.published.clone())
    }

    pub fn mark_read_calls(&self) -> Result<Vec<String>, SyncError> {
        Ok(self.read()?.mark_read_calls.clone())
    }

    pub fn fetch_calls(&self) -> usize {
        self.inner.fetch_calls.load(Ordering::SeqCst)
    }

    pub fn send_calls(&self) -> usize {
        self.inner.send_calls.load(Ordering::SeqCst)
    }

    /// Highest number of simultaneously running message fetches observed.
    pub fn max_fetches_in_flight(&self) -> usize {
        self.inner.max_fetches_in_flight.load(Ordering::SeqCst)
    }

    async fn simulate_latency(&self) -> Result<(), SyncError> {
        let latency = self.read()?.latency;
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }
        Ok(())
    }

    fn read(&self) -> Result<std::sync::RwLockReadGuard<'_, ServerData>, SyncError> {
        self.inner
            .data
            .read()
            .map_err(|_| SyncError::internal("poisoned lock"))
    }

    fn write(&self) -> Result<std::sync::RwLockWriteGuard<'_, ServerData>, SyncError> {
        self.inner
            .data
            .write()
            .map_err(|_| SyncError::internal("poisoned lock"))
    }
}

#[async_trait]
impl ChatTransport for InMemoryChatServer {
    async fn fetch_messages(
        &self,
        conversation_id: &str,
        since_id: Option<u64>,
    ) -> Result<Vec<RawMessage>, SyncError> {
        self.inner.fetch_calls.fetch_add(1, Ordering::SeqCst);
        let running = self.inner.fetches_in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        let _guard = InFlightGuard(&self.inner.fetches_in_flight);
        self.inner
            .max_fetches_in_flight
            .fetch_max(running, Ordering::SeqCst);

        self.simulate_latency().await?;

        let mut data = self.write()?;
        if data.failing_fetches > 0 {
            data.failing_fetches -= 1;
            return Err(SyncError::transport("injected fetch failure"));
        }

        let echo = data.echo_client_temp_id;
        let since = since_id.unwrap_or(0);
        let mut batch: Vec<RawMessage> = data
            .conversations
            .get(conversation_id)
            .map(|conversation| {
                conversation
                    .messages
                    .iter()
                    .filter(|record| record.id.is_none_or(|id| id > since))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default();
        if !echo {
            for record in &mut batch {
                record.client_temp_id = None;
            }
        }
        trace!(conversation_id, ?since_id, count = batch.len(), "served fetch");
        Ok(batch)
    }

    async fn send_message(
        &self,
        conversation_id: &str,
        client_temp_id: &str,
        payload: &OutgoingPayload,
    ) -> Result<RawMessage, SyncError> {
        self.inner.send_calls.fetch_add(1, Ordering::SeqCst);
        self.simulate_latency().await?;

        let now_ms = self.now_ms();
        let mut data = self.write()?;
        if data.failing_sends > 0 {
            data.failing_sends -= 1;
            return Err(SyncError::transport("injected send failure"));
        }

        let echo = data.echo_client_temp_id;
        // Retries of an already stored send return the stored record.
        let existing = data.conversations.get(conversation_id).and_then(|conversation| {
            conversation
                .messages
                .iter()
                .find(|record| record.client_temp_id.as_deref() == Some(client_temp_id))
                .cloned()
        });
        if let Some(mut record) = existing {
            if !echo {
                record.client_temp_id = None;
            }
            return Ok(record);
        }

        let id = data.next_message_id;
        data.next_message_id += 1;
        let record = RawMessage {
            id: Some(id),
            client_temp_id: Some(client_temp_id.to_owned()),
            text: Some(payload.body().to_owned()),
            sender_id: Some(self.inner.client_user.user_id.clone()),
            sender_name: Some(self.inner.client_user.display_name.clone()),
            kind: Some(payload.kind()),
            media_ref: payload.media_ref().map(ToOwned::to_owned),
            delivery_state: Some(DeliveryState::Sent),
            delivered_at_ms: None,
            read_at_ms: None,
            created_at_ms: Some(now_ms),
        };
        data.conversations
            .entry(conversation_id.to_owned())
            .or_default()
            .messages
            .push(record.clone());

        let mut response = record;
        if !echo {
            response.client_temp_id = None;
        }
        Ok(response)
    }

    async fn publish_activity(
        &self,
        conversation_id: &str,
        kind: ActivityKind,
    ) -> Result<(), SyncError> {
        let now_ms = self.now_ms();
        let user = &self.inner.client_user;
        let mut data = self.write()?;
        data.published.push((conversation_id.to_owned(), kind));
        let typing = &mut data
            .conversations
            .entry(conversation_id.to_owned())
            .or_default()
            .typing;
        typing.retain(|activity| activity.user_id != user.user_id);
        typing.push(RemoteActivity {
            user_id: user.user_id.clone(),
            display_name: user.display_name.clone(),
            kind,
            started_at_ms: now_ms,
        });
        Ok(())
    }

    async fn fetch_typing(&self, conversation_id: &str) -> Result<Vec<RemoteActivity>, SyncError> {
        Ok(self
            .read()?
            .conversations
            .get(conversation_id)
            .map(|conversation| conversation.typing.clone())
            .unwrap_or_default())
    }

    async fn fetch_pins(&self, conversation_id: &str) -> Result<Vec<PinnedMessage>, SyncError> {
        self.pins(conversation_id)
    }

    async fn pin_message(&self, conversation_id: &str, message_id: u64) -> Result<(), SyncError> {
        let now_ms = self.now_ms();
        let user_id = self.inner.client_user.user_id.clone();
        let mut data = self.write()?;
        let exists = data
            .conversations
            .get(conversation_id)
            .is_some_and(|conversation| {
                conversation
                    .messages
                    .iter()
                    .any(|record| record.id == Some(message_id))
            });
        if !exists {
            return Err(not_found("message_not_found", message_id));
        }
        pin_locked(&mut data, conversation_id, &user_id, message_id, now_ms);
        Ok(())
    }

    async fn unpin_message(&self, conversation_id: &str, pin_id: u64) -> Result<(), SyncError> {
        let mut data = self.write()?;
        let pins = &mut data
            .conversations
            .entry(conversation_id.to_owned())
            .or_default()
            .pins;
        let before = pins.len();
        pins.retain(|pin| pin.pin_id != pin_id);
        if pins.len() == before {
            return Err(not_found("pin_not_found", pin_id));
        }
        Ok(())
    }

    async fn mark_read(&self, conversation_id: &str) -> Result<(), SyncError> {
        self.simulate_latency().await?;
        self.write()?.mark_read_calls.push(conversation_id.to_owned());
        Ok(())
    }
}

fn pin_locked(
    data: &mut ServerData,
    conversation_id: &str,
    user_id: &str,
    message_id: u64,
    now_ms: u64,
) -> u64 {
    let next_pin_id = data.next_pin_id;
    let pins = &mut data
        .conversations
        .entry(conversation_id.to_owned())
        .or_default()
        .pins;
    if let Some(existing) = pins.iter().find(|pin| pin.message_ref == message_id) {
        return existing.pin_id;
    }
    pins.push(PinnedMessage {
        pin_id: next_pin_id,
        message_ref: message_id,
        pinned_by: user_id.to_owned(),
        pinned_at_ms: now_ms,
    });
    data.next_pin_id += 1;
    next_pin_id
}

fn not_found(code: &str, id: u64) -> SyncError {
    SyncError::new(SyncErrorCategory::Rejected, code, format!("{code}: {id}"))
}
