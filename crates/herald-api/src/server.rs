//! HTTP server configuration and request routing.
//!
//! Requests flow through middleware in order:
//! 1. Request ID generation
//! 2. Request/response logging
//! 3. Operator secret check (`/internal/*` only)
//! 4. Timeout enforcement (all routes except the drain trigger)
//! 5. Handler execution
//!
//! The drain trigger carries its own hard ceiling, which is longer than the
//! generic request timeout, so it sits outside the timeout layer.
//!
//! # Graceful Shutdown
//!
//! The server stops accepting connections on SIGINT or SIGTERM and lets
//! in-flight requests finish.

use std::{net::SocketAddr, sync::Arc, time::Duration};

use axum::{
    extract::Request,
    middleware::{self, Next},
    response::Response,
    routing::{get, post},
    Router,
};
use herald_core::Clock;
use herald_delivery::{DeliveryStorage, Dispatcher, DrainScheduler};
use tower_http::{timeout::TimeoutLayer, trace::TraceLayer};
use tracing::{info, warn};
use uuid::Uuid;

use crate::{handlers, middleware::auth::{operator_auth, OperatorSecret}};

/// Shared state handed to every handler.
#[derive(Clone)]
pub struct AppState {
    /// Retry store, used by health checks.
    pub storage: Arc<dyn DeliveryStorage>,
    /// Immediate delivery of incoming events.
    pub dispatcher: Arc<Dispatcher>,
    /// Retry drain.
    pub scheduler: Arc<DrainScheduler>,
    /// Time source for deadlines and timestamps.
    pub clock: Arc<dyn Clock>,
    /// Secret guarding internal routes.
    pub operator_secret: OperatorSecret,
    /// Budget handed to each drain run.
    pub drain_budget: Duration,
    /// Ceiling the drain trigger races the run against.
    pub drain_hard_timeout: Duration,
    /// Timeout for every other route.
    pub request_timeout: Duration,
}

/// Creates the Axum router with all routes and middleware.
///
/// # Example
///
/// ```no_run
/// use herald_api::{create_router, AppState};
///
/// fn build(state: AppState) {
///     let app = create_router(state);
///     // Serve the app...
/// }
/// ```
pub fn create_router(state: AppState) -> Router {
    let timeout = TimeoutLayer::new(state.request_timeout);

    let health_routes = Router::new()
        .route("/health", get(handlers::health_check))
        .route("/live", get(handlers::liveness_check))
        .layer(timeout.clone());

    let event_routes =
        Router::new().route("/internal/events", post(handlers::ingest_event)).layer(timeout);

    let drain_routes =
        Router::new().route("/internal/webhooks/retry", post(handlers::trigger_drain));

    let internal_routes = event_routes
        .merge(drain_routes)
        .layer(middleware::from_fn_with_state(state.clone(), operator_auth));

    Router::new()
        .merge(health_routes)
        .merge(internal_routes)
        .layer(TraceLayer::new_for_http())
        .layer(middleware::from_fn(inject_request_id))
        .with_state(state)
}

/// Adds an X-Request-Id header to every response.
async fn inject_request_id(req: Request, next: Next) -> Response {
    let request_id = Uuid::new_v4().to_string();

    let mut req = req;
    req.extensions_mut().insert(request_id.clone());

    let mut response = next.run(req).await;

    if let Ok(header_value) = request_id.parse() {
        response.headers_mut().insert("X-Request-Id", header_value);
    }

    response
}

/// Starts the HTTP server with graceful shutdown support.
///
/// # Errors
///
/// Returns `std::io::Error` if the address cannot be bound or serving fails.
pub async fn start_server(state: AppState, addr: SocketAddr) -> Result<(), std::io::Error> {
    if !state.operator_secret.is_configured() {
        warn!("OPERATOR_SECRET is not set, internal routes will reject every request");
    }

    let app = create_router(state);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    let actual_addr = listener.local_addr()?;

    info!(addr = %actual_addr, "HTTP server listening");

    axum::serve(listener, app).with_graceful_shutdown(shutdown_signal()).await?;

    info!("HTTP server stopped gracefully");
    Ok(())
}

/// Waits for CTRL+C or SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!("Failed to install Ctrl+C handler: {}", e);
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            },
            Err(e) => {
                tracing::error!("Failed to install SIGTERM handler: {}", e);
            },
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {
            info!("Received CTRL+C, starting graceful shutdown");
        },
        () = terminate => {
            info!("Received SIGTERM, starting graceful shutdown");
        },
    }
}
