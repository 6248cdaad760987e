use axum::Json;
use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use serde::Deserialize;

use super::{ok, ok_page};
use crate::AppState;
use crate::auth::{Principal, Role};
use crate::bridge::build_reading;
use crate::error::ApiError;
use crate::models::reading::{
    Granularity, IncomingReading, ReadingListFilter, ReadingResponse,
};
use crate::models::validate_page;
use crate::store::parse_iso;

pub async fn list_readings(
    State(state): State<AppState>,
    principal: Principal,
    Query(filter): Query<ReadingListFilter>,
) -> Result<impl IntoResponse, ApiError> {
    principal.require(Role::Staff)?;
    let (page, limit) = validate_page(filter.page, filter.limit, 1000, 50)?;
    let (rows, total) = state.store.query_readings(&filter, page, limit)?;
    let rows: Vec<ReadingResponse> = rows.into_iter().map(Into::into).collect();
    Ok(ok_page(rows, crate::models::Pagination::new(page, limit, total)))
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WindowQuery {
    pub device_id: Option<String>,
    pub start: Option<String>,
    pub end: Option<String>,
}

impl WindowQuery {
    fn bounds_ms(&self) -> Result<(Option<i64>, Option<i64>), ApiError> {
        let parse = |field: &str, value: Option<&str>| -> Result<Option<i64>, ApiError> {
            match value {
                None => Ok(None),
                Some(v) => parse_iso(v)
                    .map(|t| Some(t.timestamp_millis()))
                    .ok_or_else(|| {
                        ApiError::invalid_fields(
                            format!("{field} must be an RFC 3339 timestamp"),
                            vec![field.to_string()],
                        )
                    }),
            }
        };
        Ok((
            parse("start", self.start.as_deref())?,
            parse("end", self.end.as_deref())?,
        ))
    }
}

pub async fn reading_statistics(
    State(state): State<AppState>,
    principal: Principal,
    Query(query): Query<WindowQuery>,
) -> Result<impl IntoResponse, ApiError> {
    principal.require(Role::Staff)?;
    let (start, end) = query.bounds_ms()?;
    let stats = state
        .store
        .reading_statistics(query.device_id.as_deref(), start, end)?;
    Ok(ok(stats))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AggregateQuery {
    pub device_id: Option<String>,
    pub start: Option<String>,
    pub end: Option<String>,
    pub granularity: Granularity,
}

/// Time-bucketed aggregates. Unlike the analytics summary, the range here
/// is always explicit.
pub async fn aggregated_readings(
    State(state): State<AppState>,
    principal: Principal,
    Query(query): Query<AggregateQuery>,
) -> Result<impl IntoResponse, ApiError> {
    principal.require(Role::Staff)?;
    let window = WindowQuery {
        device_id: query.device_id.clone(),
        start: query.start.clone(),
        end: query.end.clone(),
    };
    let (start, end) = window.bounds_ms()?;
    let (Some(start), Some(end)) = (start, end) else {
        return Err(ApiError::invalid_fields(
            "start and end are required",
            vec!["start".into(), "end".into()],
        ));
    };
    let readings =
        state
            .store
            .readings_in_window(query.device_id.as_deref(), start, end, 500_000)?;
    let buckets = crate::aggregate::aggregate(&readings, query.granularity);
    Ok(ok(buckets))
}

pub async fn count_readings(
    State(state): State<AppState>,
    principal: Principal,
    Query(filter): Query<ReadingListFilter>,
) -> Result<impl IntoResponse, ApiError> {
    principal.require(Role::Staff)?;
    let count = state.store.count_readings(&filter)?;
    Ok(ok(serde_json::json!({ "count": count })))
}

/// Public ingestion path; mirrors the sensor-data topic pipeline.
pub async fn create_reading(
    State(state): State<AppState>,
    Json(incoming): Json<IncomingReading>,
) -> Result<impl IntoResponse, ApiError> {
    let device_id = incoming
        .device_id
        .clone()
        .filter(|d| !d.trim().is_empty())
        .ok_or_else(|| {
            ApiError::invalid_fields("deviceId is required", vec!["deviceId".into()])
        })?;
    let reading = build_reading(&device_id, incoming)
        .map_err(|e| ApiError::validation(e.to_string()))?;

    state.store.insert_reading(&reading)?;
    state.registry.touch_last_seen(&device_id)?;
    let (name, location) = match state.store.get_device(&device_id)? {
        Some(d) => (d.name, d.location.label()),
        None => (device_id.clone(), String::new()),
    };
    if let Err(e) = state
        .alerts
        .evaluate(&device_id, &name, &location, &reading)
        .await
    {
        // The reading is already accepted; evaluation failures are logged.
        tracing::warn!(device = %device_id, "alert evaluation failed: {e:#}");
    }
    let response: ReadingResponse = reading.into();
    state.fanout.broadcast_reading(response.clone()).await;
    Ok((StatusCode::CREATED, ok(response)))
}

/// Best-effort bulk catch-up. Rows are applied independently; the response
/// counts what was accepted.
pub async fn bulk_create_readings(
    State(state): State<AppState>,
    principal: Principal,
    Json(batch): Json<Vec<IncomingReading>>,
) -> Result<impl IntoResponse, ApiError> {
    principal.require(Role::Admin)?;
    let total = batch.len();
    let mut accepted = 0usize;
    let mut touched: std::collections::HashSet<String> = std::collections::HashSet::new();
    for incoming in batch {
        let Some(device_id) = incoming
            .device_id
            .clone()
            .filter(|d| !d.trim().is_empty())
        else {
            continue;
        };
        let Ok(reading) = build_reading(&device_id, incoming) else {
            continue;
        };
        if state.store.insert_reading(&reading).is_ok() {
            accepted += 1;
            touched.insert(device_id);
        }
    }
    for device_id in &touched {
        let _ = state.registry.touch_last_seen(device_id);
    }
    Ok(ok(serde_json::json!({
        "accepted": accepted,
        "rejected": total - accepted,
    })))
}

/// Manual trigger for the readings retention sweep.
pub async fn delete_old_readings(
    State(state): State<AppState>,
    principal: Principal,
) -> Result<impl IntoResponse, ApiError> {
    principal.require(Role::Admin)?;
    let cutoff = crate::store::iso_from(
        chrono::Utc::now() - chrono::Duration::days(state.config.retention.readings_days),
    );
    let deleted = state.store.delete_readings_before(&cutoff)?;
    Ok(ok(serde_json::json!({ "deleted": deleted })))
}
