use std::{collections::HashMap, fmt, sync::Arc};

use sync_core::{SyncConfig, SyncError, TriggerReason, UserRef};
use sync_transport::ChatTransport;
use tokio::sync::Mutex;
use tracing::debug;

use crate::{clock::Clock, engine::ConversationEngine};

/// Open conversations keyed by ID, each with its own independent engine.
pub struct ConversationRegistry {
    local_user: UserRef,
    config: SyncConfig,
    transport: Arc<dyn ChatTransport>,
    clock: Arc<dyn Clock>,
    engines: Mutex<HashMap<String, Arc<ConversationEngine>>>,
}

impl fmt::Debug for ConversationRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConversationRegistry")
            .field("local_user", &self.local_user)
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl ConversationRegistry {
    pub fn new(
        local_user: UserRef,
        config: SyncConfig,
        transport: Arc<dyn ChatTransport>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            local_user,
            config,
            transport,
            clock,
            engines: Mutex::new(HashMap::new()),
        }
    }

    /// Open a conversation, or re-focus it when it is already open.
    ///
    /// The engine is registered before its open requests run, so the map lock
    /// is never held across network calls. A failed open unregisters it again.
    pub async fn open(&self, conversation_id: &str) -> Result<Arc<ConversationEngine>, SyncError> {
        let engine = {
            let mut engines = self.engines.lock().await;
            if let Some(engine) = engines.get(conversation_id) {
                engine.trigger_immediate(TriggerReason::Opened);
                return Ok(Arc::clone(engine));
            }
            let engine = Arc::new(ConversationEngine::new(
                conversation_id,
                self.local_user.clone(),
                self.config.clone(),
                Arc::clone(&self.transport),
                Arc::clone(&self.clock),
            ));
            engines.insert(conversation_id.to_owned(), Arc::clone(&engine));
            engine
        };

        if let Err(err) = engine.open().await {
            let mut engines = self.engines.lock().await;
            if engines
                .get(conversation_id)
                .is_some_and(|registered| Arc::ptr_eq(registered, &engine))
            {
                engines.remove(conversation_id);
            }
            return Err(err);
        }
        Ok(engine)
    }

    /// Stop and forget a conversation. Returns `false` when it was not open.
    pub async fn close(&self, conversation_id: &str) -> Result<bool, SyncError> {
        let engine = self.engines.lock().await.remove(conversation_id);
        match engine {
            Some(engine) => {
                engine.close().await?;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    pub async fn get(&self, conversation_id: &str) -> Option<Arc<ConversationEngine>> {
        self.engines.lock().await.get(conversation_id).cloned()
    }

    pub async fn open_conversations(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.engines.lock().await.keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Route a push notification to its conversation. Unknown IDs are ignored.
    pub async fn on_push_hint(&self, conversation_id: &str) -> bool {
        match self.get(conversation_id).await {
            Some(engine) => engine.trigger_immediate(TriggerReason::PushHint),
            None => {
                debug!(%conversation_id, "push hint for conversation that is not open");
                false
            }
        }
    }

    pub async fn close_all(&self) -> Result<(), SyncError> {
        let engines: Vec<Arc<ConversationEngine>> =
            self.engines.lock().await.drain().map(|(_, engine)| engine).collect();
        for engine in engines {
            engine.close().await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use sync_transport::InMemoryChatServer;

    use super::*;
    use crate::{
        clock::ManualClock,
        testing::{T0, alice, bob},
    };

    fn registry(server: &InMemoryChatServer) -> ConversationRegistry {
        ConversationRegistry::new(
            alice(),
            SyncConfig {
                poll_interval_ms: 60_000,
                ..SyncConfig::default()
            },
            Arc::new(server.clone()),
            Arc::new(ManualClock::new(T0)),
        )
    }

    #[tokio::test(start_paused = true)]
    async fn push_hint_refreshes_only_the_named_conversation() {
        let server = InMemoryChatServer::new(alice());
        let registry = registry(&server);
        let a = registry.open("conv-a").await.expect("open a");
        let b = registry.open("conv-b").await.expect("open b");
        tokio::time::sleep(Duration::from_millis(5)).await;

        server.post_remote("conv-a", &bob(), "ping").expect("post");
        server.post_remote("conv-b", &bob(), "pong").expect("post");
        assert!(registry.on_push_hint("conv-a").await);
        assert!(!registry.on_push_hint("conv-unknown").await);
        tokio::time::sleep(Duration::from_millis(5)).await;

        assert_eq!(a.snapshot().expect("snapshot").messages.len(), 1);
        assert!(b.snapshot().expect("snapshot").messages.is_empty());
        registry.close_all().await.expect("close all");
        assert!(registry.open_conversations().await.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn reopening_returns_the_same_engine() {
        let server = InMemoryChatServer::new(alice());
        let registry = registry(&server);
        let first = registry.open("conv-a").await.expect("open");
        tokio::time::sleep(Duration::from_millis(5)).await;
        let second = registry.open("conv-a").await.expect("reopen");
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(registry.open_conversations().await, vec!["conv-a".to_owned()]);

        assert!(registry.close("conv-a").await.expect("close"));
        assert!(!registry.close("conv-a").await.expect("close again"));
    }

    #[tokio::test(start_paused = true)]
    async fn slow_open_does_not_block_other_conversations() {
        let server = InMemoryChatServer::new(alice());
        let registry = Arc::new(registry(&server));
        registry.open("conv-b").await.expect("open b");
        tokio::time::sleep(Duration::from_millis(5)).await;

        server
            .set_latency(Duration::from_millis(200))
            .expect("latency");
        let opening = {
            let registry = Arc::clone(&registry);
            tokio::spawn(async move { registry.open("conv-a").await.map(|_| ()) })
        };
        tokio::time::sleep(Duration::from_millis(1)).await;

        let hinted = tokio::time::timeout(
            Duration::from_millis(10),
            registry.on_push_hint("conv-b"),
        )
        .await
        .expect("registry lock held across open");
        assert!(hinted);
        assert!(registry.get("conv-a").await.is_some());

        opening.await.expect("join").expect("open a");
        assert_eq!(
            registry.open_conversations().await,
            vec!["conv-a".to_owned(), "conv-b".to_owned()]
        );
        registry.close_all().await.expect("close all");
    }
}
