use std::sync::Arc;

use weft_domain::config::Config;
use weft_pipeline::Orchestrator;
use weft_providers::ProviderRegistry;
use weft_session::SessionRegistry;

use crate::connection::ConnectionManager;

/// Shared application state passed to all API handlers.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    /// Socket-session → outbound channel map.
    pub connections: Arc<ConnectionManager>,
    /// Chat-session → cancellation token registry.
    pub sessions: Arc<SessionRegistry>,
    pub providers: Arc<ProviderRegistry>,
    pub orchestrator: Arc<Orchestrator>,
}
