//! Peer RPC server
//!
//! | Route                   | Purpose                                  |
//! |-------------------------|------------------------------------------|
//! | `GET  /peer/envelope`     | last published envelope (404 before any) |
//! | `GET  /peer/challenge`    | join challenge                           |
//! | `POST /peer/authenticate` | join request, answers `true`/`false`     |
//! | `POST /peer/snapshot`     | snapshot push for a newly admitted node  |
//! | `GET  /peer/whoami`       | this node's public key                   |
//! | `GET  /metrics`           | Prometheus exposition                    |
//!
//! Envelope reads never touch the actor: they clone the published `Arc`.

use crate::actor::NodeHandle;
use crate::engine::PublishedEnvelope;
use crate::join::AuthenticationRequest;
use crate::metrics::Metrics;
use crate::Error;
use axum::{
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use ledger_core::{LedgerSnapshot, PublicKey};
use tracing::{info, warn};

/// Shared state of the peer server
#[derive(Clone, Debug)]
pub struct ServerState {
    /// Actor handle
    pub handle: NodeHandle,

    /// Published envelope
    pub published: PublishedEnvelope,

    /// This node's key
    pub public_key: PublicKey,

    /// Metrics collector
    pub metrics: Metrics,
}

impl IntoResponse for Error {
    fn into_response(self) -> Response {
        let status = match &self {
            Error::Validation(_) | Error::ProtocolMismatch { .. } => StatusCode::BAD_REQUEST,
            Error::Ledger(inner) if !inner.is_fatal() => StatusCode::BAD_REQUEST,
            Error::Concurrency(_) => StatusCode::SERVICE_UNAVAILABLE,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        (status, self.to_string()).into_response()
    }
}

async fn envelope(State(state): State<ServerState>) -> Response {
    let published = state.published.read().clone();
    match published {
        Some(envelope) => Json(envelope.as_ref().clone()).into_response(),
        None => StatusCode::NOT_FOUND.into_response(),
    }
}

async fn challenge(State(state): State<ServerState>) -> Result<String, Error> {
    state.handle.challenge().await
}

async fn authenticate(
    State(state): State<ServerState>,
    Json(request): Json<AuthenticationRequest>,
) -> Result<Json<bool>, Error> {
    Ok(Json(state.handle.authenticate(request).await?))
}

async fn push_snapshot(
    State(state): State<ServerState>,
    Json(snapshot): Json<LedgerSnapshot>,
) -> Result<StatusCode, Error> {
    state.handle.push_snapshot(snapshot).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn who_am_i(State(state): State<ServerState>) -> String {
    state.public_key.clone()
}

async fn metrics_handler(State(state): State<ServerState>) -> Result<String, Error> {
    state
        .metrics
        .export()
        .map_err(|e| Error::Other(format!("metrics export failed: {}", e)))
}

/// Router with every peer route
pub fn router(state: ServerState) -> Router {
    Router::new()
        .route("/peer/envelope", get(envelope))
        .route("/peer/challenge", get(challenge))
        .route("/peer/authenticate", post(authenticate))
        .route("/peer/snapshot", post(push_snapshot))
        .route("/peer/whoami", get(who_am_i))
        .route("/metrics", get(metrics_handler))
        .with_state(state)
}

/// Serve the peer routes on `listen_addr` until the task is dropped
pub async fn serve(listen_addr: &str, state: ServerState) -> crate::Result<()> {
    let listener = tokio::net::TcpListener::bind(listen_addr).await?;
    info!(addr = %listen_addr, "Peer RPC listening");
    if let Err(e) = axum::serve(listener, router(state)).await {
        warn!(error = %e, "Peer RPC server stopped");
        return Err(Error::Io(e));
    }
    Ok(())
}
