//! Request/response contract between the sync engine and the chat backend.
//!
//! The engine never talks HTTP itself; it is handed a [`ChatTransport`]
//! implementation. [`InMemoryChatServer`] is a complete in-process backend used
//! by tests and the smoke binary.

use async_trait::async_trait;
use sync_core::{
    ActivityKind, OutgoingPayload, PinnedMessage, RawMessage, RemoteActivity, SyncError,
};

mod memory;

pub use memory::InMemoryChatServer;

/// Backend endpoints consumed by the engine.
///
/// Implementations are expected to bound every call with their own timeout and
/// report it as a [`sync_core::SyncErrorCategory::Timeout`] error.
#[async_trait]
pub trait ChatTransport: Send + Sync {
    /// Messages of a conversation, oldest first, with `id > since_id` when given.
    async fn fetch_messages(
        &self,
        conversation_id: &str,
        since_id: Option<u64>,
    ) -> Result<Vec<RawMessage>, SyncError>;

    /// Submit a message; the returned record carries the server ID.
    async fn send_message(
        &self,
        conversation_id: &str,
        client_temp_id: &str,
        payload: &OutgoingPayload,
    ) -> Result<RawMessage, SyncError>;

    /// Announce what the local user is doing. Fire-and-forget.
    async fn publish_activity(
        &self,
        conversation_id: &str,
        kind: ActivityKind,
    ) -> Result<(), SyncError>;

    /// Current activity of all participants.
    async fn fetch_typing(&self, conversation_id: &str) -> Result<Vec<RemoteActivity>, SyncError>;

    /// Authoritative pinned list.
    async fn fetch_pins(&self, conversation_id: &str) -> Result<Vec<PinnedMessage>, SyncError>;

    async fn pin_message(&self, conversation_id: &str, message_id: u64) -> Result<(), SyncError>;

    async fn unpin_message(&self, conversation_id: &str, pin_id: u64) -> Result<(), SyncError>;

    /// Mark the whole conversation as read for the local user.
    async fn mark_read(&self, conversation_id: &str) -> Result<(), SyncError>;
}
