//! Tokio runtime for the chat sync engine.
//!
//! Each open conversation gets a [`ConversationEngine`] bundling a
//! [`SyncScheduler`], an [`OutboxCoordinator`], a [`TypingSignalTracker`] and a
//! [`PinCoordinator`] over one shared [`sync_core::Reconciler`]. Conversations
//! share nothing mutable.

pub mod clock;
mod engine;
mod outbox;
mod pins;
mod registry;
mod scheduler;
mod shared;
#[cfg(test)]
mod testing;
mod typing;

pub use clock::{Clock, ManualClock, SystemClock};
pub use engine::ConversationEngine;
pub use outbox::OutboxCoordinator;
pub use pins::PinCoordinator;
pub use registry::ConversationRegistry;
pub use scheduler::SyncScheduler;
pub use typing::TypingSignalTracker;
