use serde::{Deserialize, Serialize};

/// One persisted sample. `timestamp_ms` is the device (or receive) clock in
/// epoch milliseconds; `created_at` is the server clock driving retention.
#[derive(Debug, Clone)]
pub struct Reading {
    pub id: String,
    pub device_id: String,
    pub timestamp_ms: i64,
    pub ph: Option<f64>,
    pub turbidity: Option<f64>,
    pub tds: Option<f64>,
    pub ph_valid: bool,
    pub turbidity_valid: bool,
    pub tds_valid: bool,
    pub is_deleted: bool,
    pub created_at: String,
}

impl Reading {
    pub fn timestamp_iso(&self) -> String {
        chrono::DateTime::from_timestamp_millis(self.timestamp_ms)
            .map(|t| t.format("%Y-%m-%dT%H:%M:%S%.3fZ").to_string())
            .unwrap_or_default()
    }
}

/// Wire shape, shared by the API and the sensor-data topic. Channel keys
/// follow the device firmware's casing (`pH`, `pH_valid`).
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReadingResponse {
    pub id: String,
    pub device_id: String,
    pub timestamp: String,
    #[serde(rename = "pH")]
    pub ph: Option<f64>,
    pub turbidity: Option<f64>,
    pub tds: Option<f64>,
    #[serde(rename = "pH_valid")]
    pub ph_valid: bool,
    #[serde(rename = "turbidity_valid")]
    pub turbidity_valid: bool,
    #[serde(rename = "tds_valid")]
    pub tds_valid: bool,
}

impl From<Reading> for ReadingResponse {
    fn from(r: Reading) -> Self {
        let timestamp = r.timestamp_iso();
        Self {
            id: r.id,
            device_id: r.device_id,
            timestamp,
            ph: r.ph,
            turbidity: r.turbidity,
            tds: r.tds,
            ph_valid: r.ph_valid,
            turbidity_valid: r.turbidity_valid,
            tds_valid: r.tds_valid,
        }
    }
}

/// Inbound sample, from `POST /sensor-readings` or the sensordata topic.
/// Every channel is optional; a missing `_valid` flag defaults to the
/// presence of the value.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct IncomingReading {
    #[serde(rename = "deviceId", default)]
    pub device_id: Option<String>,
    #[serde(rename = "pH")]
    pub ph: Option<f64>,
    pub turbidity: Option<f64>,
    pub tds: Option<f64>,
    #[serde(rename = "pH_valid")]
    pub ph_valid: Option<bool>,
    pub turbidity_valid: Option<bool>,
    pub tds_valid: Option<bool>,
    /// Epoch milliseconds; server receive time when absent.
    pub timestamp: Option<i64>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReadingListFilter {
    pub device_id: Option<String>,
    /// RFC 3339 bounds, inclusive.
    pub start: Option<String>,
    pub end: Option<String>,
    pub ph_min: Option<f64>,
    pub ph_max: Option<f64>,
    pub turbidity_min: Option<f64>,
    pub turbidity_max: Option<f64>,
    pub tds_min: Option<f64>,
    pub tds_max: Option<f64>,
    pub page: Option<i64>,
    pub limit: Option<i64>,
}

/// Per-channel aggregate over a window or bucket. Channels with no valid
/// samples are omitted (`None`).
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ChannelStats {
    pub min: f64,
    pub max: f64,
    pub avg: f64,
    pub count: i64,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReadingStatistics {
    pub count: i64,
    #[serde(rename = "pH")]
    pub ph: Option<ChannelStats>,
    pub turbidity: Option<ChannelStats>,
    pub tds: Option<ChannelStats>,
    pub time_range: Option<TimeRange>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TimeRange {
    pub start: String,
    pub end: String,
}

/// One UTC-calendar-aligned aggregation bucket, ascending by time.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AggregateBucket {
    /// Canonical bucket key, e.g. `2026-03-01T14:00:00Z` for an hour bucket.
    pub bucket_key: String,
    pub timestamp: String,
    pub count: i64,
    #[serde(rename = "pH")]
    pub ph: Option<ChannelStats>,
    pub turbidity: Option<ChannelStats>,
    pub tds: Option<ChannelStats>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Granularity {
    Minute,
    Hour,
    Day,
    Week,
    Month,
}
