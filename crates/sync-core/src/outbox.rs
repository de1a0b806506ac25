use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use crate::{
    error::{SyncError, SyncErrorCategory},
    types::OutgoingPayload,
};

const LOCAL_TEMP_ID_PREFIX: &str = "tmp-";

/// Lifecycle of a locally submitted message.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum OutboxState {
    Queued,
    Sending,
    Confirmed,
    Failed,
}

/// One message awaiting server confirmation.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct OutboxEntry {
    pub client_temp_id: String,
    pub payload: OutgoingPayload,
    /// Number of send requests issued so far.
    pub attempts: u32,
    pub state: OutboxState,
    pub created_at_ms: u64,
}

/// Outbox bookkeeping failures. All of them are caller contract violations.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum OutboxError {
    #[error("no outbox entry for '{0}'")]
    UnknownEntry(String),
    #[error("outbox entry '{client_temp_id}' cannot move from {from:?} to {to:?}")]
    InvalidTransition {
        client_temp_id: String,
        from: OutboxState,
        to: OutboxState,
    },
}

impl From<OutboxError> for SyncError {
    fn from(err: OutboxError) -> Self {
        let code = match err {
            OutboxError::UnknownEntry(_) => "outbox_unknown_entry",
            OutboxError::InvalidTransition { .. } => "outbox_invalid_transition",
        };
        SyncError::new(SyncErrorCategory::InvalidState, code, err.to_string())
    }
}

/// Ledger of local sends keyed by client correlation ID.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Outbox {
    entries: BTreeMap<String, OutboxEntry>,
}

impl Outbox {
    /// Fresh client correlation ID.
    pub fn new_temp_id() -> String {
        format!("{LOCAL_TEMP_ID_PREFIX}{}", Uuid::new_v4())
    }

    pub fn get(&self, client_temp_id: &str) -> Option<&OutboxEntry> {
        self.entries.get(client_temp_id)
    }

    pub fn entries(&self) -> impl Iterator<Item = &OutboxEntry> {
        self.entries.values()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Register a new submission in `Queued` state.
    pub fn queue(
        &mut self,
        client_temp_id: String,
        payload: OutgoingPayload,
        created_at_ms: u64,
    ) -> &OutboxEntry {
        self.entries
            .entry(client_temp_id.clone())
            .or_insert(OutboxEntry {
                client_temp_id,
                payload,
                attempts: 0,
                state: OutboxState::Queued,
                created_at_ms,
            })
    }

    /// Move a queued or failed entry to `Sending` and return its attempt number.
    pub fn begin_send(&mut self, client_temp_id: &str) -> Result<u32, OutboxError> {
        let entry = self.entry_mut(client_temp_id)?;
        match entry.state {
            OutboxState::Queued | OutboxState::Failed => {
                entry.state = OutboxState::Sending;
                entry.attempts = entry.attempts.saturating_add(1);
                Ok(entry.attempts)
            }
            from => Err(OutboxError::InvalidTransition {
                client_temp_id: client_temp_id.to_owned(),
                from,
                to: OutboxState::Sending,
            }),
        }
    }

    /// Record a transport failure for an in-flight entry.
    pub fn mark_failed(&mut self, client_temp_id: &str) -> Result<(), OutboxError> {
        let entry = self.entry_mut(client_temp_id)?;
        match entry.state {
            OutboxState::Sending | OutboxState::Queued => {
                entry.state = OutboxState::Failed;
                Ok(())
            }
            from => Err(OutboxError::InvalidTransition {
                client_temp_id: client_temp_id.to_owned(),
                from,
                to: OutboxState::Failed,
            }),
        }
    }

    /// Mark an entry as echoed by the server. Returns `false` when unknown.
    pub fn confirm(&mut self, client_temp_id: &str) -> bool {
        match self.entries.get_mut(client_temp_id) {
            Some(entry) => {
                entry.state = OutboxState::Confirmed;
                true
            }
            None => false,
        }
    }

    /// Remove confirmed entries once their messages are merged.
    pub fn take_confirmed(&mut self) -> Vec<OutboxEntry> {
        let confirmed: Vec<String> = self
            .entries
            .iter()
            .filter(|(_, entry)| entry.state == OutboxState::Confirmed)
            .map(|(id, _)| id.clone())
            .collect();
        confirmed
            .into_iter()
            .filter_map(|id| self.entries.remove(&id))
            .collect()
    }

    /// Drop an entry the caller gave up on. In-flight entries cannot be discarded.
    pub fn discard(&mut self, client_temp_id: &str) -> Result<OutboxEntry, OutboxError> {
        let state = self.entry_mut(client_temp_id)?.state;
        if state == OutboxState::Sending {
            return Err(OutboxError::InvalidTransition {
                client_temp_id: client_temp_id.to_owned(),
                from: state,
                to: OutboxState::Failed,
            });
        }
        self.entries
            .remove(client_temp_id)
            .ok_or_else(|| OutboxError::UnknownEntry(client_temp_id.to_owned()))
    }

    fn entry_mut(&mut self, client_temp_id: &str) -> Result<&mut OutboxEntry, OutboxError> {
        self.entries
            .get_mut(client_temp_id)
            .ok_or_else(|| OutboxError::UnknownEntry(client_temp_id.to_owned()))
    }
}
