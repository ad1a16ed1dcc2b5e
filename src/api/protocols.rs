//! `/api/protocols` (§6): CRUD over protocol templates plus the import/export
//! and step/template dry-run test endpoints.

use std::collections::HashMap;

use axum::extract::{Path, State};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::Value;

use crate::error::GatewayError;
use crate::executor;
use crate::model::ProtocolTemplate;
use crate::AppState;

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/", get(list).post(create))
        .route("/import", post(import))
        .route(
            "/{id}",
            get(read).put(update).delete(remove),
        )
        .route("/{id}/export", get(export))
        .route("/{id}/test", post(test_template))
        .route("/{id}/test-step", post(test_step))
}

async fn list(State(state): State<AppState>) -> Json<Vec<ProtocolTemplate>> {
    Json(state.templates.list())
}

async fn create(
    State(state): State<AppState>,
    Json(tpl): Json<ProtocolTemplate>,
) -> Result<Json<ProtocolTemplate>, GatewayError> {
    Ok(Json(state.templates.create(tpl)?))
}

async fn read(
    State(state): State<AppState>,
    Path(id): Path<u64>,
) -> Result<Json<ProtocolTemplate>, GatewayError> {
    Ok(Json(state.templates.get(id)?))
}

async fn update(
    State(state): State<AppState>,
    Path(id): Path<u64>,
    Json(tpl): Json<ProtocolTemplate>,
) -> Result<Json<ProtocolTemplate>, GatewayError> {
    Ok(Json(state.templates.update(id, tpl)?))
}

async fn remove(
    State(state): State<AppState>,
    Path(id): Path<u64>,
) -> Result<Json<Value>, GatewayError> {
    let in_use = state.devices.references_template(id);
    state.templates.delete(id, in_use)?;
    Ok(Json(serde_json::json!({"deleted": true})))
}

async fn import(
    State(state): State<AppState>,
    Json(tpl): Json<ProtocolTemplate>,
) -> Result<Json<ProtocolTemplate>, GatewayError> {
    if state.templates.list().iter().any(|t| t.name == tpl.name) {
        return Err(GatewayError::Conflict(format!(
            "a template named '{}' already exists",
            tpl.name
        )));
    }
    Ok(Json(state.templates.create(tpl)?))
}

async fn export(
    State(state): State<AppState>,
    Path(id): Path<u64>,
) -> Result<Json<ProtocolTemplate>, GatewayError> {
    Ok(Json(state.templates.get(id)?))
}

#[derive(Debug, Deserialize)]
struct TestTemplateRequest {
    #[serde(default)]
    vars: HashMap<String, Value>,
    #[serde(default)]
    connection_params: HashMap<String, Value>,
}

/// Full dry-run: runs setup+poll steps against a freshly built driver and
/// returns the rendered output, without touching any device's runtime state.
/// The ephemeral driver is always disconnected, even if setup/poll fails.
async fn test_template(
    State(state): State<AppState>,
    Path(id): Path<u64>,
    Json(req): Json<TestTemplateRequest>,
) -> Result<Json<Value>, GatewayError> {
    let tpl = state.templates.get(id)?;
    let mut driver = crate::driver::build_driver(
        tpl.protocol_type,
        req.connection_params,
        state.config.simulate_on_connect_fail,
    );
    let result = async {
        driver.connect().await?;
        let setup = executor::run_setup_steps(&tpl, driver.as_mut(), &req.vars).await?;
        let steps = executor::run_poll_steps(&tpl, driver.as_mut(), &req.vars, &setup).await?;
        let ctx = executor::build_context(&req.vars, &steps);
        Ok(executor::render_output(&tpl, &ctx))
    }
    .await;
    let _ = driver.disconnect().await;
    result.map(Json)
}

#[derive(Debug, Deserialize)]
struct TestStepRequest {
    step_id: String,
    #[serde(default)]
    vars: HashMap<String, Value>,
    #[serde(default)]
    params: HashMap<String, Value>,
    #[serde(default)]
    allow_write: bool,
    #[serde(default)]
    connection_params: HashMap<String, Value>,
}

async fn test_step(
    State(state): State<AppState>,
    Path(id): Path<u64>,
    Json(req): Json<TestStepRequest>,
) -> Result<Json<executor::ManualStepResult>, GatewayError> {
    let tpl = state.templates.get(id)?;
    let result = crate::api::with_rpc_timeout(state.manager.test_step(
        &tpl,
        &req.step_id,
        &req.vars,
        &req.params,
        req.allow_write,
        req.connection_params,
    ))
    .await?;
    Ok(Json(result))
}
