//! `RelayServer` — Axum HTTP + WebSocket server.

use std::sync::Arc;
use std::time::Instant;

use axum::extract::{State, WebSocketUpgrade};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Json, Response};
use axum::routing::get;
use axum::Router;
use metrics::counter;
use metrics_exporter_prometheus::PrometheusHandle;
use tower_http::trace::TraceLayer;
use tracing::info;
use uuid::Uuid;

use relay_backend::BackendConnector;

use crate::config::ServerConfig;
use crate::health::{self, HealthResponse};
use crate::registry::MethodRegistry;
use crate::session::{run_session, Session};
use crate::sessions::SessionRegistry;

/// Shared state accessible from Axum handlers.
#[derive(Clone)]
pub struct AppState {
    /// Server configuration.
    pub config: Arc<ServerConfig>,
    /// Registered methods.
    pub registry: Arc<MethodRegistry>,
    /// Backend handle establishment.
    pub connector: Arc<dyn BackendConnector>,
    /// Live sessions.
    pub sessions: Arc<SessionRegistry>,
    /// When the server started.
    pub start_time: Instant,
    /// Prometheus render handle, when metrics are installed.
    pub metrics: Option<PrometheusHandle>,
}

/// The relay bridge server.
pub struct RelayServer {
    state: AppState,
}

impl RelayServer {
    /// Create a new server.
    pub fn new(
        config: ServerConfig,
        registry: MethodRegistry,
        connector: Arc<dyn BackendConnector>,
    ) -> Self {
        Self {
            state: AppState {
                config: Arc::new(config),
                registry: Arc::new(registry),
                connector,
                sessions: Arc::new(SessionRegistry::new()),
                start_time: Instant::now(),
                metrics: None,
            },
        }
    }

    /// Attach an installed Prometheus handle for the `/metrics` endpoint.
    #[must_use]
    pub fn with_metrics(mut self, handle: PrometheusHandle) -> Self {
        self.state.metrics = Some(handle);
        self
    }

    /// Get the server configuration.
    pub fn config(&self) -> &ServerConfig {
        &self.state.config
    }

    /// Get the method registry.
    pub fn registry(&self) -> &Arc<MethodRegistry> {
        &self.state.registry
    }

    /// Get the session registry.
    pub fn sessions(&self) -> &Arc<SessionRegistry> {
        &self.state.sessions
    }

    /// Build the Axum router with all routes.
    pub fn router(&self) -> Router {
        Router::new()
            .route("/health", get(health_handler))
            .route("/metrics", get(metrics_handler))
            .route("/ws", get(ws_handler))
            .layer(TraceLayer::new_for_http())
            .with_state(self.state.clone())
    }

    /// Bind the configured address and serve in a background task.
    ///
    /// The task drains once the session registry's shutdown is initiated.
    /// Returns the bound address (useful with port `0`) and the task handle.
    pub async fn listen(
        &self,
    ) -> std::io::Result<(std::net::SocketAddr, tokio::task::JoinHandle<()>)> {
        let listener = tokio::net::TcpListener::bind((
            self.state.config.host.as_str(),
            self.state.config.port,
        ))
        .await?;
        let addr = listener.local_addr()?;
        let router = self.router();
        let stop = self.state.sessions.child_token();

        let handle = tokio::spawn(async move {
            if let Err(err) = axum::serve(listener, router)
                .with_graceful_shutdown(stop.cancelled_owned())
                .await
            {
                tracing::error!(error = %err, "server error");
            }
        });

        info!(%addr, "listening");
        Ok((addr, handle))
    }
}

/// GET /health
async fn health_handler(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(health::health_check(
        state.start_time,
        state.sessions.count(),
        state.sessions.in_flight_total(),
    ))
}

/// GET /metrics
async fn metrics_handler(State(state): State<AppState>) -> Response {
    match &state.metrics {
        Some(handle) => handle.render().into_response(),
        None => StatusCode::NOT_FOUND.into_response(),
    }
}

/// GET /ws — WebSocket upgrade.
async fn ws_handler(State(state): State<AppState>, ws: WebSocketUpgrade) -> Response {
    if state.sessions.is_shutting_down() {
        return StatusCode::SERVICE_UNAVAILABLE.into_response();
    }
    if state.sessions.count() >= state.config.max_connections {
        counter!("ws_connections_rejected_total").increment(1);
        return StatusCode::SERVICE_UNAVAILABLE.into_response();
    }

    let session = Arc::new(Session::new(
        format!("sess_{}", Uuid::now_v7()),
        state.sessions.child_token(),
        state.config.max_in_flight_per_session,
    ));

    ws.max_message_size(state.config.max_message_size)
        .on_upgrade(move |socket| run_session(socket, session, state))
}
