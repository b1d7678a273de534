//! Shared application state.

use std::sync::Arc;

use agentdesk_core::AgentDeskConfig;
use agentdesk_runtime::{EventBus, Orchestrator};
use agentdesk_store::SqliteStore;

use crate::agent::EchoAgent;

/// Shared application state accessible from all route handlers.
pub struct AppState {
    pub config: AgentDeskConfig,
    pub store: Arc<SqliteStore>,
    pub bus: EventBus,
    pub orchestrator: Orchestrator,
}

impl AppState {
    pub fn new(config: AgentDeskConfig, store: Arc<SqliteStore>) -> Self {
        let bus = EventBus::new();
        let agent = Arc::new(EchoAgent::new(store.clone()));
        let orchestrator = Orchestrator::new(
            store.clone(),
            store.clone(),
            agent,
            Arc::new(bus.clone()),
            config.lease_ttl,
        );

        Self {
            config,
            store,
            bus,
            orchestrator,
        }
    }
}
