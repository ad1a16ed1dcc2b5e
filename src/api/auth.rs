//! Pre-shared key authentication (§6): `X-API-Key` header, else `api_key`
//! query parameter. Applied identically to REST and the WebSocket upgrade.

use axum::extract::{Query, Request, State};
use axum::http::HeaderMap;
use axum::middleware::Next;
use axum::response::Response;
use serde::Deserialize;

use crate::error::GatewayError;
use crate::AppState;

#[derive(Debug, Deserialize)]
pub struct ApiKeyQuery {
    pub api_key: Option<String>,
}

fn extract_key(headers: &HeaderMap, query_key: Option<&str>) -> Option<String> {
    headers
        .get("X-API-Key")
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
        .or_else(|| query_key.map(str::to_string))
}

pub fn key_matches(state: &AppState, headers: &HeaderMap, query_key: Option<&str>) -> bool {
    match extract_key(headers, query_key) {
        Some(key) => key == state.config.api_key,
        None => false,
    }
}

/// REST middleware: rejects with `GatewayError::Auth` (401) on key mismatch.
pub async fn require_api_key(
    State(state): State<AppState>,
    Query(query): Query<ApiKeyQuery>,
    headers: HeaderMap,
    request: Request,
    next: Next,
) -> Result<Response, GatewayError> {
    if !key_matches(&state, &headers, query.api_key.as_deref()) {
        return Err(GatewayError::Auth);
    }
    Ok(next.run(request).await)
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    fn state_with_key(key: &str) -> AppState {
        AppState::test_fixture(key)
    }

    #[test]
    fn header_key_is_preferred_over_query() {
        let state = state_with_key("secret");
        let mut headers = HeaderMap::new();
        headers.insert("X-API-Key", HeaderValue::from_static("secret"));
        assert!(key_matches(&state, &headers, Some("wrong")));
    }

    #[test]
    fn mismatched_key_is_rejected() {
        let state = state_with_key("secret");
        let headers = HeaderMap::new();
        assert!(!key_matches(&state, &headers, Some("nope")));
    }
}
