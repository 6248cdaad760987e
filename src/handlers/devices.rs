use axum::Json;
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;

use super::{ok, ok_message, ok_page};
use crate::AppState;
use crate::auth::{Principal, Role};
use crate::error::ApiError;
use crate::models::device::{
    DeviceCommandRequest, DeviceListFilter, RegisterDeviceRequest, UpdateDeviceRequest,
    UpdateDeviceStatusRequest,
};
use crate::models::validate_page;

pub async fn list_devices(
    State(state): State<AppState>,
    principal: Principal,
    Query(filter): Query<DeviceListFilter>,
) -> Result<impl IntoResponse, ApiError> {
    principal.require(Role::Staff)?;
    let (page, limit) = validate_page(filter.page, filter.limit, 100, 20)?;
    let (devices, pagination) = state.registry.list(&filter, page, limit)?;
    Ok(ok_page(devices, pagination))
}

/// `:id` may be the internal id or the external `deviceId`.
pub async fn get_device(
    State(state): State<AppState>,
    principal: Principal,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    principal.require(Role::Staff)?;
    Ok(ok(state.registry.get(&id)?))
}

/// Public: devices self-register over HTTP the same way they do over the
/// registration topic.
pub async fn register_device(
    State(state): State<AppState>,
    Json(req): Json<RegisterDeviceRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let device = state.registry.auto_register(&req).await?;
    Ok((StatusCode::CREATED, ok(device)))
}

pub async fn approve_device(
    State(state): State<AppState>,
    principal: Principal,
    Path(device_id): Path<String>,
    body: axum::body::Bytes,
) -> Result<impl IntoResponse, ApiError> {
    principal.require(Role::Admin)?;
    // Extra metadata is optional; an empty body approves as-is.
    let extra: Option<UpdateDeviceRequest> = if body.is_empty() {
        None
    } else {
        Some(serde_json::from_slice(&body).map_err(|e| {
            ApiError::validation(format!("bad approval payload: {e}"))
        })?)
    };
    let device = state.registry.approve(&device_id, extra.as_ref())?;
    Ok(ok(device))
}

pub async fn update_device(
    State(state): State<AppState>,
    principal: Principal,
    Path(id): Path<String>,
    Json(req): Json<UpdateDeviceRequest>,
) -> Result<impl IntoResponse, ApiError> {
    principal.require(Role::Admin)?;
    Ok(ok(state.registry.update_metadata(&id, &req)?))
}

pub async fn update_device_status(
    State(state): State<AppState>,
    principal: Principal,
    Path(device_id): Path<String>,
    Json(req): Json<UpdateDeviceStatusRequest>,
) -> Result<impl IntoResponse, ApiError> {
    principal.require(Role::Admin)?;
    let device = state.registry.set_status(&device_id, req.status).await?;
    Ok(ok(device))
}

pub async fn send_command(
    State(state): State<AppState>,
    principal: Principal,
    Path(device_id): Path<String>,
    Json(req): Json<DeviceCommandRequest>,
) -> Result<impl IntoResponse, ApiError> {
    principal.require(Role::Admin)?;
    let payload = req.payload.as_ref().or(req.data.as_ref());
    state.registry.send_command(&device_id, &req.command, payload)?;
    Ok(ok_message(format!("command '{}' dispatched", req.command)))
}

pub async fn send_now(
    State(state): State<AppState>,
    principal: Principal,
    Path(device_id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    principal.require(Role::Staff)?;
    state.registry.send_now(&device_id)?;
    Ok(ok_message("reading solicited"))
}

pub async fn recover_device(
    State(state): State<AppState>,
    principal: Principal,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    principal.require(Role::Admin)?;
    Ok(ok(state.registry.recover(&id)?))
}

pub async fn delete_device(
    State(state): State<AppState>,
    principal: Principal,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    principal.require(Role::Admin)?;
    state
        .registry
        .soft_delete(&id, Some(&principal.user_id))
        .await?;
    Ok(ok_message("device deleted (recoverable for 30 days)"))
}

pub async fn deleted_devices(
    State(state): State<AppState>,
    principal: Principal,
) -> Result<impl IntoResponse, ApiError> {
    principal.require(Role::Admin)?;
    Ok(ok(state.registry.deleted()?))
}

pub async fn device_stats(
    State(state): State<AppState>,
    principal: Principal,
) -> Result<impl IntoResponse, ApiError> {
    principal.require(Role::Staff)?;
    Ok(ok(state.registry.stats()?))
}

pub async fn pending_devices(
    State(state): State<AppState>,
    principal: Principal,
) -> Result<impl IntoResponse, ApiError> {
    principal.require(Role::Admin)?;
    Ok(ok(state.registry.pending()?))
}

/// Manual trigger for the offline sweep (also runs on a schedule).
pub async fn check_offline(
    State(state): State<AppState>,
    principal: Principal,
) -> Result<impl IntoResponse, ApiError> {
    principal.require(Role::Admin)?;
    let flipped = state.registry.sweep_offline().await?;
    Ok(ok(serde_json::json!({ "markedOffline": flipped })))
}
