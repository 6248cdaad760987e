//! Asynchronous report generation: a bounded job queue, a small worker pool
//! kept separate from the HTTP path, and per-type data bundles assembled
//! from store reads only. Rendering and artifact storage go through the
//! `Renderer` / `ObjectStore` seams.

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use serde_json::{Value, json};
use tokio::sync::{Mutex, mpsc};

use crate::aggregate::channel_summary;
use crate::config::{ReportConfig, Thresholds};
use crate::error::ApiError;
use crate::models::alert::Alert;
use crate::models::device::{DeviceListFilter, DeviceStatus};
use crate::models::report::{
    CreateReportRequest, Report, ReportFile, ReportStatistics, ReportStatus,
};
use crate::object_store::ObjectStore;
use crate::render::Renderer;
use crate::store::{Store, iso_from, now_iso, parse_iso};

/// Reports stuck `generating` longer than this are failed by the sweeper.
const STALE_GENERATING_SECS: i64 = 3600;

pub struct ReportBuilder {
    store: Arc<Store>,
    renderer: Arc<dyn Renderer>,
    objects: Arc<dyn ObjectStore>,
    thresholds: Thresholds,
    tx: mpsc::Sender<String>,
    expiry_days: i64,
    readings_cap: usize,
}

#[derive(Debug, Default, serde::Deserialize)]
#[serde(rename_all = "camelCase", default)]
struct ReportParams {
    device_id: Option<String>,
    device_ids: Option<Vec<String>>,
    start_date: Option<String>,
    end_date: Option<String>,
}

impl ReportParams {
    fn device_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.device_ids.clone().unwrap_or_default();
        if let Some(id) = &self.device_id
            && !ids.contains(id)
        {
            ids.push(id.clone());
        }
        ids
    }

    /// Report window; trailing 30 days when the caller gave no range.
    fn window(&self, now: DateTime<Utc>) -> (DateTime<Utc>, DateTime<Utc>) {
        let end = self
            .end_date
            .as_deref()
            .and_then(parse_iso)
            .unwrap_or(now);
        let start = self
            .start_date
            .as_deref()
            .and_then(parse_iso)
            .unwrap_or(end - Duration::days(30));
        (start, end)
    }
}

impl ReportBuilder {
    pub fn spawn(
        store: Arc<Store>,
        renderer: Arc<dyn Renderer>,
        objects: Arc<dyn ObjectStore>,
        thresholds: Thresholds,
        cfg: &ReportConfig,
    ) -> Arc<Self> {
        let (tx, rx) = mpsc::channel::<String>(64);
        let builder = Arc::new(Self {
            store,
            renderer,
            objects,
            thresholds,
            tx,
            expiry_days: cfg.expiry_days,
            readings_cap: cfg.readings_cap,
        });
        let rx = Arc::new(Mutex::new(rx));
        for worker in 0..cfg.workers.max(1) {
            let builder = Arc::clone(&builder);
            let rx = Arc::clone(&rx);
            tokio::spawn(async move {
                loop {
                    let job = rx.lock().await.recv().await;
                    match job {
                        Some(id) => builder.run_job(&id).await,
                        None => break,
                    }
                }
                tracing::debug!(worker, "report worker stopped");
            });
        }
        builder
    }

    /// Persist a `generating` report and enqueue its build job.
    pub async fn create(
        &self,
        req: &CreateReportRequest,
        generated_by: &str,
    ) -> Result<Report, ApiError> {
        if req.title.trim().is_empty() {
            return Err(ApiError::invalid_fields(
                "title must not be empty",
                vec!["title".into()],
            ));
        }
        // Surface malformed parameter maps at submission time.
        serde_json::from_value::<ReportParams>(req.parameters.clone()).map_err(|e| {
            ApiError::invalid_fields(format!("bad parameters: {e}"), vec!["parameters".into()])
        })?;

        let now = Utc::now();
        let report = Report {
            id: uuid::Uuid::new_v4().to_string(),
            report_type: req.report_type,
            title: req.title.trim().to_string(),
            description: req.description.clone(),
            status: ReportStatus::Generating,
            format: req.format,
            parameters: req.parameters.clone(),
            file: None,
            generated_by: generated_by.to_string(),
            generated_at: None,
            error_message: None,
            expires_at: iso_from(now + Duration::days(self.expiry_days)),
            created_at: iso_from(now),
        };
        self.store.insert_report(&report)?;
        if self.tx.send(report.id.clone()).await.is_err() {
            self.store
                .fail_report(&report.id, "report queue unavailable", &now_iso())?;
            return Err(ApiError::Unavailable("report queue unavailable".into()));
        }
        Ok(report)
    }

    async fn run_job(&self, id: &str) {
        let report = match self.store.get_report(id) {
            Ok(Some(report)) => report,
            Ok(None) => return,
            Err(e) => {
                tracing::error!(report = id, "report lookup failed: {e:#}");
                return;
            }
        };
        if report.status != ReportStatus::Generating {
            return;
        }
        match self.build(&report).await {
            Ok(file) => {
                if let Err(e) = self.store.complete_report(id, &file, &now_iso()) {
                    tracing::error!(report = id, "failed to record completion: {e:#}");
                } else {
                    tracing::info!(report = id, file = %file.filename, "report completed");
                }
            }
            Err(e) => {
                tracing::warn!(report = id, "report generation failed: {e:#}");
                if let Err(e) = self
                    .store
                    .fail_report(id, &format!("{e:#}"), &now_iso())
                {
                    tracing::error!(report = id, "failed to record failure: {e:#}");
                }
            }
        }
    }

    async fn build(&self, report: &Report) -> anyhow::Result<ReportFile> {
        let bundle = self.build_bundle(report)?;
        let bytes = self
            .renderer
            .render(report.report_type.as_str(), report.format, &bundle)
            .await?;
        let filename = format!(
            "{}-{}.{}",
            slug(&report.title),
            &report.id[..8],
            report.format.as_str()
        );
        let stored = self.objects.put(&filename, &bytes).await?;
        Ok(ReportFile {
            handle: stored.handle,
            filename,
            size: stored.size,
            content_type: report.format.content_type().to_string(),
        })
    }

    /// Assemble the per-type data bundle. Read-only against the store.
    fn build_bundle(&self, report: &Report) -> anyhow::Result<Value> {
        let params: ReportParams = serde_json::from_value(report.parameters.clone())?;
        let now = Utc::now();
        let (start, end) = params.window(now);
        let meta = json!({
            "title": report.title,
            "type": report.report_type.as_str(),
            "generatedAt": iso_from(now),
            "window": { "start": iso_from(start), "end": iso_from(end) },
        });
        let body = match report.report_type {
            crate::models::report::ReportType::WaterQuality => {
                self.water_quality_bundle(&params, start, end)?
            }
            crate::models::report::ReportType::DeviceStatus => self.device_status_bundle(now)?,
            crate::models::report::ReportType::Compliance => {
                self.compliance_bundle(&params, start, end)?
            }
            crate::models::report::ReportType::AlertSummary => {
                self.alert_summary_bundle(&params, start, end)?
            }
        };
        let mut bundle = body;
        bundle["report"] = meta;
        Ok(bundle)
    }

    fn water_quality_bundle(
        &self,
        params: &ReportParams,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> anyhow::Result<Value> {
        let device_ids = params.device_ids();
        let devices = self.resolve_devices(&device_ids)?;

        let mut readings = Vec::new();
        if device_ids.is_empty() {
            readings = self.store.readings_in_window(
                None,
                start.timestamp_millis(),
                end.timestamp_millis(),
                self.readings_cap,
            )?;
        } else {
            let per_device = (self.readings_cap / device_ids.len().max(1)).max(1);
            for id in &device_ids {
                readings.extend(self.store.readings_in_window(
                    Some(id),
                    start.timestamp_millis(),
                    end.timestamp_millis(),
                    per_device,
                )?);
            }
        }

        let ph: Vec<f64> = readings
            .iter()
            .filter(|r| r.ph_valid)
            .filter_map(|r| r.ph)
            .collect();
        let turbidity: Vec<f64> = readings
            .iter()
            .filter(|r| r.turbidity_valid)
            .filter_map(|r| r.turbidity)
            .collect();
        let tds: Vec<f64> = readings
            .iter()
            .filter(|r| r.tds_valid)
            .filter_map(|r| r.tds)
            .collect();

        let alerts = self
            .store
            .alerts_in_window(&device_ids, &iso_from(start), &iso_from(end))?;

        let reading_rows: Vec<Value> = readings
            .iter()
            .map(|r| {
                json!([
                    r.device_id,
                    r.timestamp_iso(),
                    r.ph,
                    r.turbidity,
                    r.tds,
                ])
            })
            .collect();

        Ok(json!({
            "devices": devices,
            "statistics": {
                "readingCount": readings.len(),
                "pH": channel_summary(&ph),
                "turbidity": channel_summary(&turbidity),
                "tds": channel_summary(&tds),
            },
            "alerts": alert_breakdown(&alerts),
            "tables": [
                {
                    "name": "Readings",
                    "columns": ["deviceId", "timestamp", "pH", "turbidity", "tds"],
                    "rows": reading_rows,
                },
                alerts_table(&alerts),
            ],
        }))
    }

    fn device_status_bundle(&self, now: DateTime<Utc>) -> anyhow::Result<Value> {
        let (devices, _) = self
            .store
            .list_devices(&DeviceListFilter::default(), 1, 1000)?;
        let mut rows = Vec::new();
        let mut snapshots = Vec::new();
        for device in devices {
            let open_alerts = self.store.open_alert_count(&device.device_id)?;
            let minutes_since_seen = device
                .last_seen
                .as_deref()
                .and_then(parse_iso)
                .map(|seen| (now - seen).num_minutes());
            let healthy = device.status == DeviceStatus::Online && open_alerts == 0;
            rows.push(json!([
                device.device_id,
                device.name,
                device.status.as_str(),
                device.registration_status.as_str(),
                minutes_since_seen,
                open_alerts,
                if healthy { "healthy" } else { "issues" },
            ]));
            snapshots.push(json!({
                "device": device,
                "minutesSinceSeen": minutes_since_seen,
                "openAlerts": open_alerts,
                "healthy": healthy,
            }));
        }
        Ok(json!({
            "devices": snapshots,
            "tables": [{
                "name": "Device status",
                "columns": ["deviceId", "name", "status", "registration",
                            "minutesSinceSeen", "openAlerts", "health"],
                "rows": rows,
            }],
        }))
    }

    fn compliance_bundle(
        &self,
        params: &ReportParams,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> anyhow::Result<Value> {
        let device_ids = {
            let ids = params.device_ids();
            if ids.is_empty() {
                let (devices, _) = self
                    .store
                    .list_devices(&DeviceListFilter::default(), 1, 1000)?;
                devices.into_iter().map(|d| d.device_id).collect()
            } else {
                ids
            }
        };
        let violations = self
            .store
            .alerts_in_window(&device_ids, &iso_from(start), &iso_from(end))?;

        let ph_band = self.thresholds.ph.warn_min..=self.thresholds.ph.warn_max;
        let turbidity_limit = self.thresholds.turbidity.warn;
        let tds_limit = self.thresholds.tds.warn;

        let mut rows = Vec::new();
        let mut per_device = Vec::new();
        for device_id in &device_ids {
            let readings = self.store.readings_in_window(
                Some(device_id),
                start.timestamp_millis(),
                end.timestamp_millis(),
                self.readings_cap,
            )?;
            let ph: Vec<f64> = readings
                .iter()
                .filter(|r| r.ph_valid)
                .filter_map(|r| r.ph)
                .collect();
            let turbidity: Vec<f64> = readings
                .iter()
                .filter(|r| r.turbidity_valid)
                .filter_map(|r| r.turbidity)
                .collect();
            let tds: Vec<f64> = readings
                .iter()
                .filter(|r| r.tds_valid)
                .filter_map(|r| r.tds)
                .collect();
            let ph_pct =
                crate::aggregate::compliance_percent(&ph, |v| ph_band.contains(&v));
            let turbidity_pct =
                crate::aggregate::compliance_percent(&turbidity, |v| v <= turbidity_limit);
            let tds_pct = crate::aggregate::compliance_percent(&tds, |v| v <= tds_limit);
            rows.push(json!([device_id, ph_pct, turbidity_pct, tds_pct]));
            per_device.push(json!({
                "deviceId": device_id,
                "pH": ph_pct,
                "turbidity": turbidity_pct,
                "tds": tds_pct,
            }));
        }

        Ok(json!({
            "violations": alert_breakdown(&violations),
            "compliance": per_device,
            "tables": [
                {
                    "name": "Compliance percentages",
                    "columns": ["deviceId", "pH %", "turbidity %", "tds %"],
                    "rows": rows,
                },
                alerts_table(&violations),
            ],
        }))
    }

    fn alert_summary_bundle(
        &self,
        params: &ReportParams,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> anyhow::Result<Value> {
        let alerts = self.store.alerts_in_window(
            &params.device_ids(),
            &iso_from(start),
            &iso_from(end),
        )?;
        Ok(json!({
            "summary": alert_breakdown(&alerts),
            "tables": [alerts_table(&alerts)],
        }))
    }

    fn resolve_devices(&self, device_ids: &[String]) -> anyhow::Result<Value> {
        if device_ids.is_empty() {
            let (devices, _) = self
                .store
                .list_devices(&DeviceListFilter::default(), 1, 1000)?;
            return Ok(serde_json::to_value(devices)?);
        }
        let mut devices = Vec::new();
        for id in device_ids {
            if let Some(device) = self.store.get_device_by_any_id(id)? {
                devices.push(device);
            }
        }
        Ok(serde_json::to_value(devices)?)
    }

    /// Stream the stored artifact for download.
    pub async fn download(&self, id: &str) -> Result<(Report, Vec<u8>), ApiError> {
        let report = self
            .store
            .get_report(id)?
            .ok_or_else(|| ApiError::not_found("report not found"))?;
        if report.status != ReportStatus::Completed {
            return Err(ApiError::conflict(format!(
                "report is {}",
                report.status.as_str()
            )));
        }
        let file = report
            .file
            .as_ref()
            .ok_or_else(|| ApiError::conflict("report has no artifact"))?;
        let bytes = self
            .objects
            .get(&file.handle)
            .await
            .map_err(|e| ApiError::Unavailable(format!("artifact unavailable: {e}")))?;
        Ok((report, bytes))
    }

    pub async fn delete(&self, id: &str) -> Result<(), ApiError> {
        match self.store.delete_report(id)? {
            None => Err(ApiError::not_found("report not found")),
            Some(handle) => {
                if let Some(handle) = handle
                    && let Err(e) = self.objects.delete(&handle).await
                {
                    tracing::warn!(report = id, "artifact delete failed: {e:#}");
                }
                Ok(())
            }
        }
    }

    /// Drop expired reports, artifact first, then the row. Also fails
    /// reports stranded in `generating` by a previous process.
    pub async fn sweep_expired(&self) -> anyhow::Result<usize> {
        let now = Utc::now();
        let stale_cutoff = iso_from(now - Duration::seconds(STALE_GENERATING_SECS));
        let stranded = self
            .store
            .fail_stale_generating(&stale_cutoff, &iso_from(now))?;
        if stranded > 0 {
            tracing::warn!(count = stranded, "failed stranded generating reports");
        }

        let expired = self.store.expired_reports(&iso_from(now))?;
        let mut ids = Vec::with_capacity(expired.len());
        for (id, handle) in expired {
            if let Some(handle) = handle
                && let Err(e) = self.objects.delete(&handle).await
            {
                tracing::warn!(report = %id, "expired artifact delete failed: {e:#}");
            }
            ids.push(id);
        }
        let count = self.store.delete_report_rows(&ids)?;
        Ok(count)
    }

    pub fn statistics(&self) -> Result<ReportStatistics, ApiError> {
        Ok(self.store.report_statistics()?)
    }
}

fn slug(title: &str) -> String {
    let slug: String = title
        .to_lowercase()
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '-' })
        .collect();
    let trimmed = slug.trim_matches('-');
    if trimmed.is_empty() {
        "report".to_string()
    } else {
        trimmed.chars().take(48).collect()
    }
}

fn alert_breakdown(alerts: &[Alert]) -> Value {
    let mut by_severity: BTreeMap<&str, i64> = BTreeMap::new();
    let mut by_status: BTreeMap<&str, i64> = BTreeMap::new();
    for alert in alerts {
        *by_severity.entry(alert.severity.as_str()).or_default() += 1;
        *by_status.entry(alert.status.as_str()).or_default() += 1;
    }
    json!({
        "total": alerts.len(),
        "bySeverity": by_severity,
        "byStatus": by_status,
    })
}

fn alerts_table(alerts: &[Alert]) -> Value {
    let rows: Vec<Value> = alerts
        .iter()
        .map(|a| {
            json!([
                a.device_id,
                a.parameter.label(),
                a.severity.as_str(),
                a.status.as_str(),
                a.value,
                a.threshold,
                a.occurrence_count,
                a.first_occurrence,
                a.last_occurrence,
            ])
        })
        .collect();
    json!({
        "name": "Alerts",
        "columns": ["deviceId", "parameter", "severity", "status", "value",
                    "threshold", "occurrences", "firstOccurrence", "lastOccurrence"],
        "rows": rows,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::report::{ReportFormat, ReportType};
    use crate::render::RendererStack;

    fn builder() -> (Arc<ReportBuilder>, Arc<Store>, tempfile::TempDir) {
        let store = Arc::new(Store::open_in_memory().unwrap());
        let dir = tempfile::tempdir().unwrap();
        let objects = Arc::new(crate::object_store::FsObjectStore::new(dir.path()).unwrap());
        let builder = ReportBuilder::spawn(
            Arc::clone(&store),
            Arc::new(RendererStack::new(None)),
            objects,
            Thresholds::default(),
            &ReportConfig::default(),
        );
        (builder, store, dir)
    }

    fn seed_reading(store: &Store, device: &str, ph: f64) {
        let now = Utc::now();
        store
            .insert_reading(&crate::models::reading::Reading {
                id: uuid::Uuid::new_v4().to_string(),
                device_id: device.to_string(),
                timestamp_ms: now.timestamp_millis(),
                ph: Some(ph),
                turbidity: Some(1.0),
                tds: Some(200.0),
                ph_valid: true,
                turbidity_valid: true,
                tds_valid: true,
                is_deleted: false,
                created_at: iso_from(now),
            })
            .unwrap();
    }

    #[tokio::test]
    async fn csv_report_completes_end_to_end() {
        let (builder, store, _dir) = builder();
        seed_reading(&store, "D1", 7.0);
        seed_reading(&store, "D1", 7.4);

        let report = builder
            .create(
                &CreateReportRequest {
                    report_type: ReportType::WaterQuality,
                    title: "Weekly water quality".to_string(),
                    description: String::new(),
                    format: ReportFormat::Csv,
                    parameters: json!({ "deviceId": "D1" }),
                },
                "U1",
            )
            .await
            .unwrap();
        assert_eq!(report.status, ReportStatus::Generating);

        // Wait for the worker to finish the job.
        let mut done = None;
        for _ in 0..100 {
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
            let current = store.get_report(&report.id).unwrap().unwrap();
            if current.status != ReportStatus::Generating {
                done = Some(current);
                break;
            }
        }
        let done = done.expect("report did not finish");
        assert_eq!(done.status, ReportStatus::Completed);
        let file = done.file.as_ref().unwrap();
        assert!(file.filename.ends_with(".csv"));
        assert_eq!(file.content_type, "text/csv");

        let (_, bytes) = builder.download(&report.id).await.unwrap();
        let csv = String::from_utf8(bytes).unwrap();
        assert!(csv.contains("Readings"));
        assert!(csv.contains("D1"));
    }

    #[tokio::test]
    async fn pdf_without_renderer_fails_the_report() {
        let (builder, store, _dir) = builder();
        let report = builder
            .create(
                &CreateReportRequest {
                    report_type: ReportType::AlertSummary,
                    title: "Alerts".to_string(),
                    description: String::new(),
                    format: ReportFormat::Pdf,
                    parameters: json!({}),
                },
                "U1",
            )
            .await
            .unwrap();

        let mut done = None;
        for _ in 0..100 {
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
            let current = store.get_report(&report.id).unwrap().unwrap();
            if current.status != ReportStatus::Generating {
                done = Some(current);
                break;
            }
        }
        let done = done.expect("report did not finish");
        assert_eq!(done.status, ReportStatus::Failed);
        assert!(done.error_message.unwrap().contains("external renderer"));

        let err = builder.download(&report.id).await.unwrap_err();
        assert!(matches!(err, ApiError::Conflict(_)));
    }

    #[tokio::test]
    async fn expired_reports_are_swept_with_artifacts() {
        let (builder, store, _dir) = builder();
        let report = builder
            .create(
                &CreateReportRequest {
                    report_type: ReportType::DeviceStatus,
                    title: "Fleet".to_string(),
                    description: String::new(),
                    format: ReportFormat::Csv,
                    parameters: json!({}),
                },
                "U1",
            )
            .await
            .unwrap();
        for _ in 0..100 {
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
            if store.get_report(&report.id).unwrap().unwrap().status != ReportStatus::Generating
            {
                break;
            }
        }
        // Force expiry.
        store
            .lock()
            .execute(
                "UPDATE reports SET expires_at = ?1 WHERE id = ?2",
                rusqlite::params![iso_from(Utc::now() - Duration::days(1)), report.id],
            )
            .unwrap();
        let swept = builder.sweep_expired().await.unwrap();
        assert_eq!(swept, 1);
        assert!(store.get_report(&report.id).unwrap().is_none());
    }

    #[test]
    fn slugs_are_filename_safe() {
        assert_eq!(slug("Weekly Water / Quality!"), "weekly-water---quality");
        assert_eq!(slug("///"), "report");
    }
}
