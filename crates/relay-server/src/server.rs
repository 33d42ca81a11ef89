//! `RelayServer`: Axum HTTP + WebSocket server.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::Router;
use axum::extract::State;
use axum::http::{StatusCode, header};
use axum::response::{IntoResponse, Json, Response};
use axum::routing::get;
use metrics_exporter_prometheus::PrometheusHandle;
use relay_settings::ServerSettings;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tower_http::services::ServeDir;
use tower_http::trace::TraceLayer;
use tracing::{error, info};

use crate::coordinator::{Coordinator, CoordinatorConfig, CoordinatorHandle};
use crate::errors::RelayError;
use crate::health::{self, HealthResponse};
use crate::ingress::ws_handler;
use crate::shutdown::ShutdownCoordinator;

/// Shared state accessible from Axum handlers.
#[derive(Clone)]
pub struct AppState {
    /// Front door to the dispatch loop.
    pub coordinator: CoordinatorHandle,
    /// Server settings.
    pub settings: Arc<ServerSettings>,
    /// When the server started.
    pub start_time: Instant,
    /// Renders `/metrics` when a recorder is installed.
    pub metrics: Option<PrometheusHandle>,
}

/// The relay server, not yet listening.
pub struct RelayServer {
    settings: Arc<ServerSettings>,
    coordinator: Coordinator,
    handle: CoordinatorHandle,
    shutdown: ShutdownCoordinator,
    metrics: Option<PrometheusHandle>,
    start_time: Instant,
}

impl RelayServer {
    /// Create a server. Settings are expected to be validated.
    pub fn new(settings: ServerSettings) -> Self {
        let (coordinator, handle) = Coordinator::new(CoordinatorConfig::from(&settings));
        Self {
            settings: Arc::new(settings),
            coordinator,
            handle,
            shutdown: ShutdownCoordinator::new(),
            metrics: None,
            start_time: Instant::now(),
        }
    }

    /// Serve `/metrics` from `handle`.
    #[must_use]
    pub fn with_metrics(mut self, handle: PrometheusHandle) -> Self {
        self.metrics = Some(handle);
        self
    }

    /// Handle to the coordinator.
    pub fn coordinator(&self) -> &CoordinatorHandle {
        &self.handle
    }

    /// Shutdown coordinator.
    pub fn shutdown(&self) -> &ShutdownCoordinator {
        &self.shutdown
    }

    /// Server settings.
    pub fn settings(&self) -> &ServerSettings {
        &self.settings
    }

    /// Build the Axum router with all routes.
    pub fn router(&self) -> Router {
        let state = AppState {
            coordinator: self.handle.clone(),
            settings: Arc::clone(&self.settings),
            start_time: self.start_time,
            metrics: self.metrics.clone(),
        };

        Router::new()
            .route(&self.settings.ws_path, get(ws_handler))
            .route("/health", get(health_handler))
            .route("/metrics", get(metrics_handler))
            .fallback_service(ServeDir::new(&self.settings.static_dir))
            .layer(TraceLayer::new_for_http())
            .with_state(state)
    }

    /// Bind the listener and start the dispatch loop and HTTP server.
    pub async fn listen(self) -> Result<ServerHandle, RelayError> {
        let addr = self.settings.bind_addr();
        let listener = TcpListener::bind(&addr)
            .await
            .map_err(|source| RelayError::Bind {
                addr: addr.clone(),
                source,
            })?;
        let local_addr = listener.local_addr()?;
        let router = self.router();

        let Self {
            settings,
            coordinator,
            handle,
            shutdown,
            ..
        } = self;
        let token = shutdown.token();

        let dispatch = tokio::spawn(coordinator.run(token.clone()));
        let http = tokio::spawn(async move {
            let result = axum::serve(listener, router)
                .with_graceful_shutdown(async move { token.cancelled().await })
                .await;
            if let Err(e) = result {
                error!(error = %e, "http server failed");
            }
        });

        info!(
            %local_addr,
            ws_path = %settings.ws_path,
            static_dir = %settings.static_dir.display(),
            "relay listening"
        );

        Ok(ServerHandle {
            local_addr,
            coordinator: handle,
            shutdown,
            tasks: vec![dispatch, http],
            shutdown_timeout: settings.shutdown_timeout(),
        })
    }
}

/// A running server.
pub struct ServerHandle {
    local_addr: SocketAddr,
    coordinator: CoordinatorHandle,
    shutdown: ShutdownCoordinator,
    tasks: Vec<JoinHandle<()>>,
    shutdown_timeout: Duration,
}

impl ServerHandle {
    /// Address the listener is bound to.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Handle to the running coordinator.
    pub fn coordinator(&self) -> &CoordinatorHandle {
        &self.coordinator
    }

    /// Token cancelled when shutdown begins.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.token()
    }

    /// Stop accepting, close every connection, and wait for the server tasks.
    /// Returns `false` if they did not finish within the shutdown timeout.
    pub async fn shutdown(self) -> bool {
        info!("shutting down relay");
        self.shutdown
            .graceful_shutdown(self.tasks, self.shutdown_timeout)
            .await
    }
}

/// GET /health
async fn health_handler(State(state): State<AppState>) -> Json<HealthResponse> {
    let connections = state.coordinator.connection_count();
    Json(health::health_check(state.start_time, connections))
}

/// GET /metrics
async fn metrics_handler(State(state): State<AppState>) -> Response {
    match &state.metrics {
        Some(handle) => (
            [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
            handle.render(),
        )
            .into_response(),
        None => (
            StatusCode::SERVICE_UNAVAILABLE,
            "metrics recorder not installed",
        )
            .into_response(),
    }
}
