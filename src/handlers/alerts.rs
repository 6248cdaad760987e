use axum::extract::{Path, Query, State};
use axum::response::IntoResponse;
use serde::Deserialize;

use super::{ok, ok_page};
use crate::AppState;
use crate::auth::{Principal, Role};
use crate::error::ApiError;
use crate::models::alert::{AlertListFilter, ResolveAllRequest, ResolveRequest};
use crate::models::validate_page;

pub async fn list_alerts(
    State(state): State<AppState>,
    principal: Principal,
    Query(filter): Query<AlertListFilter>,
) -> Result<impl IntoResponse, ApiError> {
    principal.require(Role::Staff)?;
    let (page, limit) = validate_page(filter.page, filter.limit, 100, 20)?;
    let (alerts, total) = state.store.list_alerts(&filter, page, limit)?;
    Ok(ok_page(
        alerts,
        crate::models::Pagination::new(page, limit, total),
    ))
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatisticsQuery {
    pub device_id: Option<String>,
}

pub async fn alert_statistics(
    State(state): State<AppState>,
    principal: Principal,
    Query(query): Query<StatisticsQuery>,
) -> Result<impl IntoResponse, ApiError> {
    principal.require(Role::Staff)?;
    Ok(ok(state.alerts.statistics(query.device_id.as_deref())?))
}

pub async fn unacknowledged_count(
    State(state): State<AppState>,
    principal: Principal,
    Query(query): Query<StatisticsQuery>,
) -> Result<impl IntoResponse, ApiError> {
    principal.require(Role::Staff)?;
    let count = state
        .store
        .unacknowledged_count(query.device_id.as_deref())?;
    Ok(ok(serde_json::json!({ "count": count })))
}

pub async fn device_alerts(
    State(state): State<AppState>,
    principal: Principal,
    Path(device_id): Path<String>,
    Query(filter): Query<AlertListFilter>,
) -> Result<impl IntoResponse, ApiError> {
    principal.require(Role::Staff)?;
    let (page, limit) = validate_page(filter.page, filter.limit, 100, 20)?;
    let filter = AlertListFilter {
        device_id: Some(device_id),
        ..filter
    };
    let (alerts, total) = state.store.list_alerts(&filter, page, limit)?;
    Ok(ok_page(
        alerts,
        crate::models::Pagination::new(page, limit, total),
    ))
}

pub async fn resolve_all(
    State(state): State<AppState>,
    principal: Principal,
    body: axum::body::Bytes,
) -> Result<impl IntoResponse, ApiError> {
    principal.require(Role::Staff)?;
    let filter: ResolveAllRequest = if body.is_empty() {
        ResolveAllRequest::default()
    } else {
        serde_json::from_slice(&body)
            .map_err(|e| ApiError::validation(format!("bad filter payload: {e}")))?
    };
    let resolved = state
        .alerts
        .resolve_all(&principal.user_id, &filter)
        .await?;
    Ok(ok(serde_json::json!({ "resolved": resolved })))
}

pub async fn acknowledge_alert(
    State(state): State<AppState>,
    principal: Principal,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    principal.require(Role::Staff)?;
    Ok(ok(state.alerts.acknowledge(&id, &principal.user_id).await?))
}

pub async fn resolve_alert(
    State(state): State<AppState>,
    principal: Principal,
    Path(id): Path<String>,
    body: axum::body::Bytes,
) -> Result<impl IntoResponse, ApiError> {
    principal.require(Role::Staff)?;
    let req: ResolveRequest = if body.is_empty() {
        ResolveRequest::default()
    } else {
        serde_json::from_slice(&body)
            .map_err(|e| ApiError::validation(format!("bad resolve payload: {e}")))?
    };
    Ok(ok(state
        .alerts
        .resolve(&id, &principal.user_id, req.notes.as_deref())
        .await?))
}

pub async fn delete_alert(
    State(state): State<AppState>,
    principal: Principal,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    principal.require(Role::Admin)?;
    state.alerts.delete(&id)?;
    Ok(super::ok_message("alert deleted"))
}
