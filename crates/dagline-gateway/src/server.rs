use std::sync::Arc;
use std::time::Instant;

use axum::routing::{get, patch, post};
use axum::Router;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tower_http::cors::CorsLayer;
use tracing::info;

use dagline_core::config::GatewayConfig;
use dagline_core::event::EventBus;
use dagline_core::traits::RunStore;
use dagline_core::types::EngineType;
use dagline_engine::RunLauncher;

use crate::routes;
use crate::state::AppState;

/// Build the REST + WebSocket router.
pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        // WebSocket
        .route("/ws", get(routes::ws_handler))
        // REST API
        .route("/api/health", get(routes::health))
        .route("/api/metrics", get(routes::metrics))
        .route("/api/dag-runs", get(routes::list_runs))
        .route("/api/dag-runs", post(routes::create_run))
        .route("/api/dag-runs/{id}", get(routes::get_run))
        .route("/api/dag-runs/{id}/status", patch(routes::update_run_status))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// WebSocket + HTTP gateway server built on axum.
pub struct GatewayServer {
    config: GatewayConfig,
    store: Arc<dyn RunStore>,
    bus: Arc<EventBus>,
    launcher: Arc<RunLauncher>,
    default_engine: EngineType,
}

impl GatewayServer {
    pub fn new(
        config: GatewayConfig,
        store: Arc<dyn RunStore>,
        bus: Arc<EventBus>,
        launcher: Arc<RunLauncher>,
        default_engine: EngineType,
    ) -> Self {
        Self {
            config,
            store,
            bus,
            launcher,
            default_engine,
        }
    }

    /// Run the gateway server until the cancellation token is triggered.
    pub async fn run(&self, shutdown: CancellationToken) -> anyhow::Result<()> {
        let state = Arc::new(AppState {
            config: self.config.clone(),
            store: self.store.clone(),
            bus: self.bus.clone(),
            launcher: self.launcher.clone(),
            default_engine: self.default_engine,
            started_at: Instant::now(),
        });

        let app = router(state);

        let listener = TcpListener::bind(&self.config.bind).await?;
        info!(bind = %self.config.bind, "Gateway listening");

        axum::serve(listener, app)
            .with_graceful_shutdown(async move { shutdown.cancelled().await })
            .await?;

        info!("Gateway shut down");
        Ok(())
    }
}
