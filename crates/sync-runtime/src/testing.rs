use std::sync::Arc;

use sync_core::{ConversationSnapshot, SyncConfig, UserRef};
use sync_transport::InMemoryChatServer;

use crate::{clock::ManualClock, scheduler::SyncScheduler, shared::ConversationShared};

pub(crate) const CONV: &str = "conv-1";
pub(crate) const T0: u64 = 1_731_000_000_000;

pub(crate) fn alice() -> UserRef {
    UserRef::local("u-alice", "Alice")
}

pub(crate) fn bob() -> UserRef {
    UserRef::remote("u-bob", "Bob")
}

pub(crate) struct Harness {
    pub(crate) server: InMemoryChatServer,
    pub(crate) clock: Arc<ManualClock>,
    pub(crate) shared: Arc<ConversationShared>,
    pub(crate) scheduler: SyncScheduler,
}

impl Harness {
    pub(crate) fn new(config: SyncConfig) -> Self {
        let server = InMemoryChatServer::new(alice());
        server.set_now_ms(T0);
        let clock = Arc::new(ManualClock::new(T0));
        let shared = ConversationShared::new(
            CONV.to_owned(),
            alice(),
            config,
            Arc::new(server.clone()),
            clock.clone(),
        );
        let scheduler = SyncScheduler::new(Arc::clone(&shared));
        Self {
            server,
            clock,
            shared,
            scheduler,
        }
    }

    pub(crate) fn snapshot(&self) -> ConversationSnapshot {
        self.shared
            .with_reconciler(|reconciler| reconciler.state().snapshot())
            .expect("conversation lock")
    }
}
