use std::sync::Arc;

use crate::auth::TokenVerifier;
use crate::config::Config;
use crate::connection::ConnectionManager;
use crate::presence::PresenceRegistry;
use crate::services::{ConversationEngine, ReconciliationService};
use crate::store::ConversationStore;

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub store: Arc<dyn ConversationStore>,
    pub presence: PresenceRegistry,
    pub connections: Arc<ConnectionManager>,
    pub engine: Arc<ConversationEngine>,
    pub reconciliation: Arc<ReconciliationService>,
    pub verifier: Arc<dyn TokenVerifier>,
}

impl AppState {
    /// Wires the component graph: one injected PresenceRegistry shared by the
    /// ConnectionManager, which in turn serves the engine's fan-out.
    pub fn new(
        config: Arc<Config>,
        store: Arc<dyn ConversationStore>,
        verifier: Arc<dyn TokenVerifier>,
    ) -> Self {
        let presence = PresenceRegistry::new();
        let connections = Arc::new(ConnectionManager::new(
            presence.clone(),
            config.offline_queue_capacity,
        ));
        let engine = Arc::new(ConversationEngine::new(
            store.clone(),
            connections.clone(),
            &config,
        ));
        let reconciliation = Arc::new(ReconciliationService::new(
            store.clone(),
            config.catchup_batch_limit,
        ));

        Self {
            config,
            store,
            presence,
            connections,
            engine,
            reconciliation,
            verifier,
        }
    }
}
