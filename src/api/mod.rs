//! HTTP + WebSocket control plane (§6).
//!
//! Router layout grounded on `crates/matrixon-api/src/routes.rs`'s nested
//! `Router::new().route(...).nest(...)` style, with axum 0.7's `{param}`
//! path syntax (the grounding file used the older `:param` form, which
//! doesn't parse under the axum version this workspace actually pins).

mod auth;
mod devices;
mod protocols;
mod ws;

use std::future::Future;
use std::time::Duration;

use axum::middleware;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::{Json, Router};
use serde_json::json;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use crate::error::GatewayError;
use crate::AppState;

const RPC_TIMEOUT: Duration = Duration::from_secs(5);

/// Wraps a manual-step/step-test RPC with the five-second client-side
/// timeout called for in the concurrency model (§5).
async fn with_rpc_timeout<F, T>(fut: F) -> Result<T, GatewayError>
where
    F: Future<Output = Result<T, GatewayError>>,
{
    tokio::time::timeout(RPC_TIMEOUT, fut)
        .await
        .unwrap_or_else(|_| Err(GatewayError::Timeout("rpc timed out after 5s".to_string())))
}

pub fn router(state: AppState) -> Router {
    let protected = Router::new()
        .nest("/api/protocols", protocols::router())
        .nest("/api/devices", devices::router())
        .route_layer(middleware::from_fn_with_state(
            state.clone(),
            auth::require_api_key,
        ));

    // The WebSocket upgrade checks the pre-shared key itself (§4.5) so a
    // mismatch can close with code 4401 instead of failing the handshake
    // with a bare HTTP 401.
    Router::new()
        .route("/health", get(health))
        .route("/ws", get(ws::handler))
        .merge(protected)
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

async fn health() -> impl IntoResponse {
    Json(json!({"status": "ok"}))
}
