use std::sync::Arc;
use std::time::Instant;

use dagline_core::config::GatewayConfig;
use dagline_core::event::EventBus;
use dagline_core::traits::RunStore;
use dagline_core::types::EngineType;
use dagline_engine::RunLauncher;

/// Shared application state for axum handlers.
pub struct AppState {
    pub config: GatewayConfig,
    pub store: Arc<dyn RunStore>,
    pub bus: Arc<EventBus>,
    pub launcher: Arc<RunLauncher>,
    /// Engine used when a run request does not name one.
    pub default_engine: EngineType,
    pub started_at: Instant,
}
