use axum::extract::{Query, State};
use axum::response::IntoResponse;
use chrono::{Duration, Utc};
use serde::Deserialize;
use serde_json::json;

use super::ok;
use crate::AppState;
use crate::auth::{Principal, Role};
use crate::error::ApiError;
use crate::models::reading::Granularity;
use crate::store::parse_iso;

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AnalyticsWindow {
    pub device_id: Option<String>,
    pub start: Option<String>,
    pub end: Option<String>,
}

impl AnalyticsWindow {
    /// Trailing 24 hours when no range is given. The aggregation endpoints
    /// deliberately do not share this default.
    fn bounds_or_24h(&self) -> Result<(i64, i64), ApiError> {
        let now = Utc::now();
        let end = match self.end.as_deref() {
            None => now,
            Some(raw) => parse_iso(raw).ok_or_else(|| {
                ApiError::invalid_fields("end must be an RFC 3339 timestamp", vec!["end".into()])
            })?,
        };
        let start = match self.start.as_deref() {
            None => end - Duration::hours(24),
            Some(raw) => parse_iso(raw).ok_or_else(|| {
                ApiError::invalid_fields(
                    "start must be an RFC 3339 timestamp",
                    vec!["start".into()],
                )
            })?,
        };
        Ok((start.timestamp_millis(), end.timestamp_millis()))
    }
}

pub async fn summary(
    State(state): State<AppState>,
    principal: Principal,
    Query(window): Query<AnalyticsWindow>,
) -> Result<impl IntoResponse, ApiError> {
    principal.require(Role::Staff)?;
    let (start, end) = window.bounds_or_24h()?;
    let stats =
        state
            .store
            .reading_statistics(window.device_id.as_deref(), Some(start), Some(end))?;
    let devices = state.registry.stats()?;
    let alert_stats = state.alerts.statistics(window.device_id.as_deref())?;
    let unacknowledged = state
        .store
        .unacknowledged_count(window.device_id.as_deref())?;
    Ok(ok(json!({
        "readings": stats,
        "devices": devices,
        "alerts": alert_stats,
        "unacknowledgedAlerts": unacknowledged,
    })))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TrendsQuery {
    pub device_id: Option<String>,
    pub start: Option<String>,
    pub end: Option<String>,
    pub interval: TrendInterval,
}

#[derive(Debug, Clone, Copy, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TrendInterval {
    Minute,
    Hour,
    Day,
}

impl From<TrendInterval> for Granularity {
    fn from(i: TrendInterval) -> Self {
        match i {
            TrendInterval::Minute => Granularity::Minute,
            TrendInterval::Hour => Granularity::Hour,
            TrendInterval::Day => Granularity::Day,
        }
    }
}

/// Bucketed trends; an explicit range is required, like the raw
/// aggregation endpoint.
pub async fn trends(
    State(state): State<AppState>,
    principal: Principal,
    Query(query): Query<TrendsQuery>,
) -> Result<impl IntoResponse, ApiError> {
    principal.require(Role::Staff)?;
    let (Some(start), Some(end)) = (
        query.start.as_deref().and_then(parse_iso),
        query.end.as_deref().and_then(parse_iso),
    ) else {
        return Err(ApiError::invalid_fields(
            "start and end are required",
            vec!["start".into(), "end".into()],
        ));
    };
    let readings = state.store.readings_in_window(
        query.device_id.as_deref(),
        start.timestamp_millis(),
        end.timestamp_millis(),
        500_000,
    )?;
    let buckets = crate::aggregate::aggregate(&readings, query.interval.into());
    Ok(ok(buckets))
}

/// Per-parameter breakdown over the window (default trailing 24 h), paired
/// with the configured regulatory bands.
pub async fn parameters(
    State(state): State<AppState>,
    principal: Principal,
    Query(window): Query<AnalyticsWindow>,
) -> Result<impl IntoResponse, ApiError> {
    principal.require(Role::Staff)?;
    let (start, end) = window.bounds_or_24h()?;
    let stats =
        state
            .store
            .reading_statistics(window.device_id.as_deref(), Some(start), Some(end))?;
    let t = &state.config.thresholds;
    Ok(ok(json!({
        "statistics": stats,
        "thresholds": {
            "pH": {
                "warnMin": t.ph.warn_min,
                "warnMax": t.ph.warn_max,
                "critMin": t.ph.crit_min,
                "critMax": t.ph.crit_max,
            },
            "turbidity": { "warn": t.turbidity.warn, "crit": t.turbidity.crit },
            "tds": { "warn": t.tds.warn, "crit": t.tds.crit },
        },
    })))
}
