use anyhow::Result;
use axum::{
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Json},
    routing::get,
    Router,
};
use parley_broker::Broker;
use serde_json::json;
use std::{net::SocketAddr, sync::Arc};
use tokio_util::sync::CancellationToken;
use tower_http::{
    cors::CorsLayer,
    trace::{DefaultMakeSpan, DefaultOnResponse, TraceLayer},
};
use tracing::{info, warn, Level};

pub mod routes;

/// Server application state
pub struct AppState {
    /// The chat transport core
    pub broker: Arc<Broker>,
}

impl AppState {
    pub fn new(broker: Arc<Broker>) -> Self {
        Self { broker }
    }
}

/// Start the HTTP server and run until Ctrl-C.
pub async fn start(addr: SocketAddr, broker: Arc<Broker>) -> Result<()> {
    let shutdown = CancellationToken::new();
    let signal = shutdown.clone();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => info!("Shutdown signal received"),
            Err(e) => warn!(error = %e, "Failed to listen for shutdown signal"),
        }
        signal.cancel();
    });

    serve(addr, broker, shutdown).await
}

/// Serve until `shutdown` is cancelled.
pub async fn serve(addr: SocketAddr, broker: Arc<Broker>, shutdown: CancellationToken) -> Result<()> {
    let listener = tokio::net::TcpListener::bind(addr).await?;
    serve_on(listener, broker, shutdown).await
}

async fn serve_on(
    listener: tokio::net::TcpListener,
    broker: Arc<Broker>,
    shutdown: CancellationToken,
) -> Result<()> {
    let app = create_router(Arc::new(AppState::new(broker)));
    info!("Starting Axum HTTP server on {}", listener.local_addr()?);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown.cancelled_owned())
        .await?;

    Ok(())
}

/// Create the Axum router with all routes and middleware
fn create_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .with_state(Arc::clone(&state))
        .merge(routes::websocket::router(state))
        .layer(
            TraceLayer::new_for_http()
                .make_span_with(DefaultMakeSpan::new().level(Level::INFO))
                .on_response(DefaultOnResponse::new().level(Level::INFO)),
        )
        .layer(CorsLayer::permissive())
}

/// Health check endpoint (for load balancers)
async fn health_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let broker = &state.broker;
    if broker.is_shutdown() {
        warn!("Health check: broker shutting down");
        return (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(json!({
                "status": "unhealthy",
                "service": "parley-server",
                "version": env!("CARGO_PKG_VERSION"),
                "error": "broker shutting down"
            })),
        );
    }

    (
        StatusCode::OK,
        Json(json!({
            "status": "healthy",
            "service": "parley-server",
            "version": env!("CARGO_PKG_VERSION"),
            "connections": broker.registry().connection_count(),
            "rooms": broker.sequencer().room_count(),
            "sessions": broker.sessions().session_count().await
        })),
    )
}
