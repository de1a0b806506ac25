use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::{
    error::SyncError,
    pins::PinSet,
    typing::RemoteTyping,
    types::{Message, PinnedMessage, TypingEntry},
};

/// In-memory view of one conversation.
///
/// Fields are only written by [`crate::Reconciler`]; everyone else reads through
/// the accessors or a [`ConversationSnapshot`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConversationState {
    pub(crate) conversation_id: String,
    pub(crate) messages: Vec<Message>,
    pub(crate) typing: RemoteTyping,
    pub(crate) pins: PinSet,
    pub(crate) last_synced_at_ms: Option<u64>,
    pub(crate) in_flight: bool,
    pub(crate) last_error: Option<SyncError>,
    pub(crate) read_marker: Option<u64>,
}

impl ConversationState {
    pub(crate) fn new(conversation_id: impl Into<String>, typing_ttl_ms: u64) -> Self {
        Self {
            conversation_id: conversation_id.into(),
            messages: Vec::new(),
            typing: RemoteTyping::new(typing_ttl_ms),
            pins: PinSet::default(),
            last_synced_at_ms: None,
            in_flight: false,
            last_error: None,
            read_marker: None,
        }
    }

    pub fn conversation_id(&self) -> &str {
        &self.conversation_id
    }

    /// Message log in display order.
    pub fn messages(&self) -> &[Message] {
        &self.messages
    }

    pub fn typing_users(&self) -> &BTreeMap<String, TypingEntry> {
        self.typing.entries()
    }

    pub fn pinned(&self) -> &[PinnedMessage] {
        self.pins.pins()
    }

    pub fn pin_set(&self) -> &PinSet {
        &self.pins
    }

    pub fn last_synced_at_ms(&self) -> Option<u64> {
        self.last_synced_at_ms
    }

    pub fn in_flight(&self) -> bool {
        self.in_flight
    }

    pub fn last_error(&self) -> Option<&SyncError> {
        self.last_error.as_ref()
    }

    /// Highest server ID covered by the last folded mark-read request.
    pub fn read_marker(&self) -> Option<u64> {
        self.read_marker
    }

    pub fn find_by_id(&self, id: u64) -> Option<&Message> {
        self.messages.iter().find(|message| message.id == Some(id))
    }

    pub fn find_by_temp_id(&self, client_temp_id: &str) -> Option<&Message> {
        self.messages
            .iter()
            .find(|message| message.client_temp_id == client_temp_id)
    }

    /// Confirmed messages from other participants newer than the read marker.
    pub fn unread_count(&self) -> usize {
        let marker = self.read_marker.unwrap_or(0);
        self.messages
            .iter()
            .filter(|message| !message.sender.is_local)
            .filter(|message| message.id.is_some_and(|id| id > marker))
            .count()
    }

    /// Highest confirmed server ID.
    pub fn max_confirmed_id(&self) -> Option<u64> {
        self.messages.iter().filter_map(|message| message.id).max()
    }

    /// Fetch cursor that re-requests the newest `overlap` confirmed messages.
    ///
    /// `None` asks for the full recent history.
    pub fn sync_cursor(&self, overlap: usize) -> Option<u64> {
        let mut ids: Vec<u64> = self.messages.iter().filter_map(|message| message.id).collect();
        if ids.len() <= overlap {
            return None;
        }
        ids.sort_unstable();
        ids.get(ids.len() - overlap - 1).copied()
    }

    /// Owned copy for UI consumers.
    pub fn snapshot(&self) -> ConversationSnapshot {
        ConversationSnapshot {
            conversation_id: self.conversation_id.clone(),
            messages: self.messages.clone(),
            typing_users: self.typing.entries().clone(),
            pinned: self.pins.pins().to_vec(),
            last_synced_at_ms: self.last_synced_at_ms,
            in_flight: self.in_flight,
            last_error: self.last_error.clone(),
            read_marker: self.read_marker,
            unread_count: self.unread_count(),
        }
    }
}

/// Read-only copy of a conversation handed to the UI layer.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ConversationSnapshot {
    pub conversation_id: String,
    pub messages: Vec<Message>,
    pub typing_users: BTreeMap<String, TypingEntry>,
    pub pinned: Vec<PinnedMessage>,
    pub last_synced_at_ms: Option<u64>,
    pub in_flight: bool,
    pub last_error: Option<SyncError>,
    pub read_marker: Option<u64>,
    pub unread_count: usize,
}
