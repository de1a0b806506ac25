//! Core model of the polled chat synchronization engine.
//!
//! This crate owns the per-conversation state, the merge rules between fetched
//! and optimistic entries, outbox bookkeeping, typing expiry, the pinned set and
//! the scheduler lifecycle. It performs no I/O.

/// Conversation event channel.
pub mod channel;
/// Per-conversation snapshot and read accessors.
pub mod conversation;
/// Stable error type and HTTP classification helper.
pub mod error;
/// Validation of fetched records and send outcomes.
pub mod normalization;
/// Local send ledger.
pub mod outbox;
/// Pinned message set.
pub mod pins;
/// Single writer merging fetched and local changes.
pub mod reconciler;
/// Scheduler lifecycle and generation counter.
pub mod state_machine;
/// Shared data model (messages, payloads, config, events).
pub mod types;
/// Activity throttle and remote typing expiry.
pub mod typing;

pub use channel::{EventChannel, EventStream};
pub use conversation::{ConversationSnapshot, ConversationState};
pub use error::{SyncError, SyncErrorCategory, classify_http_status};
pub use normalization::{
    MalformedRecord, NormalizedRecord, SendOutcome, normalize_record, normalize_send_failure,
};
pub use outbox::{Outbox, OutboxEntry, OutboxError, OutboxState};
pub use pins::PinSet;
pub use reconciler::{MergeReport, Reconciler};
pub use state_machine::{FetchDisposition, SchedulerStateMachine};
pub use types::{
    ActivityKind, ConversationEvent, DeliveryState, Message, MessageKind, OutgoingPayload,
    PinnedMessage, RawMessage, RemoteActivity, SchedulerPhase, SyncConfig, TriggerReason,
    TypingEntry, UserRef,
};
pub use typing::{ActivityThrottle, RemoteTyping};
