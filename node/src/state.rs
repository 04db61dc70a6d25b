use crate::config::AppConfig;
use crate::messaging::{MessagingContext, MessagingOrchestrator};
use crate::realtime::LocalTransport;
use crate::storage::KeyValueStore;
use deskchat_messaging::ConversationId;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::debug;

/// Shared state behind the HTTP routes: one orchestrator per conversation
/// that has been touched since startup.
pub struct AppState {
    config: AppConfig,
    context: MessagingContext,
    transport: LocalTransport,
    sessions: Mutex<HashMap<ConversationId, Arc<MessagingOrchestrator>>>,
}

impl AppState {
    pub fn new(config: AppConfig, store: Arc<dyn KeyValueStore>) -> Arc<Self> {
        let transport = LocalTransport::new();
        let context =
            MessagingContext::new(store, Arc::new(transport.clone()), &config.workspace_id);
        Arc::new(Self {
            config,
            context,
            transport,
            sessions: Mutex::new(HashMap::new()),
        })
    }

    pub fn config(&self) -> &AppConfig {
        &self.config
    }

    pub fn build_id(&self) -> &str {
        &self.config.build_id
    }

    pub fn context(&self) -> &MessagingContext {
        &self.context
    }

    pub fn transport(&self) -> &LocalTransport {
        &self.transport
    }

    /// Returns the open orchestrator for `conversation_id`, opening it on
    /// first use.
    pub async fn orchestrator(&self, conversation_id: &ConversationId) -> Arc<MessagingOrchestrator> {
        let mut sessions = self.sessions.lock().await;
        if let Some(existing) = sessions.get(conversation_id) {
            return Arc::clone(existing);
        }

        debug!(conversation_id = %conversation_id, "opening conversation session");
        let orchestrator = Arc::new(
            MessagingOrchestrator::open(
                self.context.clone(),
                conversation_id.clone(),
                self.config.pipeline_config(),
            )
            .await,
        );
        sessions.insert(conversation_id.clone(), Arc::clone(&orchestrator));
        orchestrator
    }

    pub async fn open_sessions(&self) -> usize {
        self.sessions.lock().await.len()
    }
}
