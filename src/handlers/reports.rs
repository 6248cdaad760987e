use axum::Json;
use axum::extract::{Path, Query, State};
use axum::http::{StatusCode, header};
use axum::response::IntoResponse;

use super::{ok, ok_message, ok_page};
use crate::AppState;
use crate::auth::{Principal, Role};
use crate::error::ApiError;
use crate::models::report::{CreateReportRequest, ReportListFilter};
use crate::models::validate_page;

pub async fn create_report(
    State(state): State<AppState>,
    principal: Principal,
    Json(req): Json<CreateReportRequest>,
) -> Result<impl IntoResponse, ApiError> {
    principal.require(Role::Staff)?;
    let report = state.reports.create(&req, &principal.user_id).await?;
    Ok((StatusCode::CREATED, ok(report)))
}

pub async fn list_reports(
    State(state): State<AppState>,
    principal: Principal,
    Query(filter): Query<ReportListFilter>,
) -> Result<impl IntoResponse, ApiError> {
    principal.require(Role::Staff)?;
    let (page, limit) = validate_page(filter.page, filter.limit, 100, 20)?;
    let (reports, total) = state.store.list_reports(&filter, page, limit)?;
    Ok(ok_page(
        reports,
        crate::models::Pagination::new(page, limit, total),
    ))
}

/// Any authenticated principal may read a report it generated; staff may
/// read all of them.
fn authorize_report_access(
    principal: &Principal,
    generated_by: &str,
) -> Result<(), ApiError> {
    if principal.user_id == generated_by {
        return Ok(());
    }
    principal.require(Role::Staff)
}

pub async fn get_report(
    State(state): State<AppState>,
    principal: Principal,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let report = state
        .store
        .get_report(&id)?
        .ok_or_else(|| ApiError::not_found("report not found"))?;
    authorize_report_access(&principal, &report.generated_by)?;
    Ok(ok(report))
}

pub async fn download_report(
    State(state): State<AppState>,
    principal: Principal,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let (report, bytes) = state.reports.download(&id).await?;
    authorize_report_access(&principal, &report.generated_by)?;
    let file = report
        .file
        .as_ref()
        .ok_or_else(|| ApiError::conflict("report has no artifact"))?;
    let headers = [
        (header::CONTENT_TYPE, file.content_type.clone()),
        (
            header::CONTENT_DISPOSITION,
            format!("attachment; filename=\"{}\"", file.filename),
        ),
    ];
    Ok((headers, bytes))
}

pub async fn delete_report(
    State(state): State<AppState>,
    principal: Principal,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    principal.require(Role::Admin)?;
    state.reports.delete(&id).await?;
    Ok(ok_message("report deleted"))
}

/// Manual trigger for the report expiry sweep.
pub async fn delete_expired_reports(
    State(state): State<AppState>,
    principal: Principal,
) -> Result<impl IntoResponse, ApiError> {
    principal.require(Role::Admin)?;
    let deleted = state.reports.sweep_expired().await.map_err(ApiError::Internal)?;
    Ok(ok(serde_json::json!({ "deleted": deleted })))
}

pub async fn report_statistics(
    State(state): State<AppState>,
    principal: Principal,
) -> Result<impl IntoResponse, ApiError> {
    principal.require(Role::Staff)?;
    Ok(ok(state.reports.statistics()?))
}
