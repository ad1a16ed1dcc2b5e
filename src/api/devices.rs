//! `/api/devices` (§6): CRUD by id and by `device_code`, enable/disable, and
//! the manual-execute RPC.

use std::collections::HashMap;

use axum::extract::{Path, State};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::Value;

use crate::error::GatewayError;
use crate::executor::ManualStepResult;
use crate::model::Device;
use crate::AppState;

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/", get(list).post(create))
        .route("/{id}", get(read).put(update).delete(remove))
        .route("/{id}/enable", post(enable))
        .route("/{id}/disable", post(disable))
        .route("/{id}/execute", post(execute))
        .route("/by-code/{code}", get(read_by_code).put(update_by_code).delete(remove_by_code))
}

async fn list(State(state): State<AppState>) -> Json<Vec<Device>> {
    Json(state.devices.list())
}

async fn create(
    State(state): State<AppState>,
    Json(device): Json<Device>,
) -> Result<Json<Device>, GatewayError> {
    let device = state.devices.create(device)?;
    if device.enabled {
        state.manager.start_device(device.id).await?;
    }
    Ok(Json(device))
}

async fn read(State(state): State<AppState>, Path(id): Path<u64>) -> Result<Json<Device>, GatewayError> {
    Ok(Json(state.devices.get(id)?))
}

async fn update(
    State(state): State<AppState>,
    Path(id): Path<u64>,
    Json(device): Json<Device>,
) -> Result<Json<Device>, GatewayError> {
    let device = state.devices.update(id, device)?;
    state.manager.reload_device(id).await?;
    Ok(Json(device))
}

async fn remove(State(state): State<AppState>, Path(id): Path<u64>) -> Result<Json<Value>, GatewayError> {
    state.manager.remove_device(id).await?;
    state.devices.delete(id)?;
    Ok(Json(serde_json::json!({"deleted": true})))
}

fn find_by_code(state: &AppState, code: &str) -> Result<Device, GatewayError> {
    let normalized = crate::model::normalize_device_code(code)
        .ok_or_else(|| GatewayError::Validation("invalid device_code".to_string()))?;
    state
        .devices
        .list()
        .into_iter()
        .find(|d| d.device_code == normalized)
        .ok_or_else(|| GatewayError::NotFound(format!("device '{code}' not found")))
}

async fn read_by_code(State(state): State<AppState>, Path(code): Path<String>) -> Result<Json<Device>, GatewayError> {
    Ok(Json(find_by_code(&state, &code)?))
}

async fn update_by_code(
    State(state): State<AppState>,
    Path(code): Path<String>,
    Json(device): Json<Device>,
) -> Result<Json<Device>, GatewayError> {
    let existing = find_by_code(&state, &code)?;
    let updated = state.devices.update(existing.id, device)?;
    state.manager.reload_device(existing.id).await?;
    Ok(Json(updated))
}

async fn remove_by_code(State(state): State<AppState>, Path(code): Path<String>) -> Result<Json<Value>, GatewayError> {
    let existing = find_by_code(&state, &code)?;
    state.manager.remove_device(existing.id).await?;
    state.devices.delete(existing.id)?;
    Ok(Json(serde_json::json!({"deleted": true})))
}

async fn enable(State(state): State<AppState>, Path(id): Path<u64>) -> Result<Json<Device>, GatewayError> {
    let device = state.devices.set_enabled(id, true)?;
    state.manager.reload_device(id).await?;
    Ok(Json(device))
}

async fn disable(State(state): State<AppState>, Path(id): Path<u64>) -> Result<Json<Device>, GatewayError> {
    let device = state.devices.set_enabled(id, false)?;
    state.manager.reload_device(id).await?;
    Ok(Json(device))
}

#[derive(Debug, Deserialize)]
struct ExecuteRequest {
    step_id: String,
    #[serde(default)]
    params: HashMap<String, Value>,
}

async fn execute(
    State(state): State<AppState>,
    Path(id): Path<u64>,
    Json(req): Json<ExecuteRequest>,
) -> Result<Json<ManualStepResult>, GatewayError> {
    let result = crate::api::with_rpc_timeout(
        state.manager.execute_manual_step(id, &req.step_id, req.params),
    )
    .await?;
    Ok(Json(result))
}
