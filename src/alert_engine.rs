//! Threshold evaluation and the alert lifecycle.
//!
//! Each crossing either creates a new open alert or merges into the one
//! already open for `(device, parameter)` inside the cooldown window. The
//! store's conditional insert guarantees a single winner under concurrency;
//! losers take the merge path.

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};

use crate::config::{AlertConfig, Thresholds};
use crate::error::ApiError;
use crate::models::alert::{
    Alert, AlertStatistics, Parameter, ResolveAllRequest, Severity,
};
use crate::models::reading::Reading;
use crate::notifier::Notifier;
use crate::realtime::Fanout;
use crate::store::{AlertUpsert, Store, iso_from, now_iso};

/// A threshold crossing: the selected (highest) severity and the violated
/// regulatory boundary recorded on the alert.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Crossing {
    pub severity: Severity,
    pub threshold: f64,
}

pub struct AlertEngine {
    store: Arc<Store>,
    fanout: Arc<Fanout>,
    notifier: Notifier,
    thresholds: Thresholds,
    cooldowns: AlertConfig,
    recovery_window_days: i64,
}

impl AlertEngine {
    pub fn new(
        store: Arc<Store>,
        fanout: Arc<Fanout>,
        notifier: Notifier,
        thresholds: Thresholds,
        cooldowns: AlertConfig,
        recovery_window_days: i64,
    ) -> Self {
        Self {
            store,
            fanout,
            notifier,
            thresholds,
            cooldowns,
            recovery_window_days,
        }
    }

    fn cooldown(&self, severity: Severity) -> Duration {
        Duration::seconds(match severity {
            Severity::Critical => self.cooldowns.cooldown_critical_secs,
            Severity::Warning => self.cooldowns.cooldown_warning_secs,
            Severity::Advisory => self.cooldowns.cooldown_advisory_secs,
        })
    }

    /// Grade one channel value. Returns the highest severity crossed, or
    /// `None` inside the acceptable band.
    pub fn grade(&self, parameter: Parameter, value: f64) -> Option<Crossing> {
        match parameter {
            Parameter::Ph => {
                let t = &self.thresholds.ph;
                if value < t.warn_min || value > t.warn_max {
                    let threshold = if value < t.warn_min { t.warn_min } else { t.warn_max };
                    let severity = if value < t.crit_min || value > t.crit_max {
                        Severity::Critical
                    } else {
                        Severity::Warning
                    };
                    return Some(Crossing { severity, threshold });
                }
                if let Some(min) = t.advisory_min
                    && value < min
                {
                    return Some(Crossing {
                        severity: Severity::Advisory,
                        threshold: min,
                    });
                }
                if let Some(max) = t.advisory_max
                    && value > max
                {
                    return Some(Crossing {
                        severity: Severity::Advisory,
                        threshold: max,
                    });
                }
                None
            }
            Parameter::Turbidity | Parameter::Tds => {
                let t = if parameter == Parameter::Turbidity {
                    &self.thresholds.turbidity
                } else {
                    &self.thresholds.tds
                };
                if value > t.warn {
                    let severity = if value > t.crit {
                        Severity::Critical
                    } else {
                        Severity::Warning
                    };
                    return Some(Crossing {
                        severity,
                        threshold: t.warn,
                    });
                }
                if let Some(adv) = t.advisory
                    && value > adv
                {
                    return Some(Crossing {
                        severity: Severity::Advisory,
                        threshold: adv,
                    });
                }
                None
            }
        }
    }

    /// Evaluate one reading against every valid channel. Returns the alerts
    /// touched (created or merged).
    pub async fn evaluate(
        &self,
        device_id: &str,
        device_name: &str,
        device_location: &str,
        reading: &Reading,
    ) -> anyhow::Result<Vec<Alert>> {
        self.evaluate_at(device_id, device_name, device_location, reading, Utc::now())
            .await
    }

    pub async fn evaluate_at(
        &self,
        device_id: &str,
        device_name: &str,
        device_location: &str,
        reading: &Reading,
        now: DateTime<Utc>,
    ) -> anyhow::Result<Vec<Alert>> {
        let channels: [(Parameter, Option<f64>, bool); 3] = [
            (Parameter::Ph, reading.ph, reading.ph_valid),
            (Parameter::Turbidity, reading.turbidity, reading.turbidity_valid),
            (Parameter::Tds, reading.tds, reading.tds_valid),
        ];
        let mut touched = Vec::new();
        for (parameter, value, valid) in channels {
            let Some(value) = value else { continue };
            if !valid {
                continue;
            }
            let Some(crossing) = self.grade(parameter, value) else {
                continue;
            };
            let alert = self
                .create_or_merge(device_id, device_name, device_location, parameter, value, crossing, reading, now)
                .await?;
            touched.push(alert);
        }
        Ok(touched)
    }

    #[allow(clippy::too_many_arguments)]
    async fn create_or_merge(
        &self,
        device_id: &str,
        device_name: &str,
        device_location: &str,
        parameter: Parameter,
        value: f64,
        crossing: Crossing,
        reading: &Reading,
        now: DateTime<Utc>,
    ) -> anyhow::Result<Alert> {
        let occurred_at = DateTime::from_timestamp_millis(reading.timestamp_ms)
            .map(iso_from)
            .unwrap_or_else(|| iso_from(now));
        let cutoff = iso_from(now - self.cooldown(crossing.severity));
        let where_label = if device_location.is_empty() {
            device_name.to_string()
        } else {
            format!("{device_name} ({device_location})")
        };
        let message = format!(
            "{} {} {value}{unit} crossed the {} limit {}{unit} on {where_label}",
            crossing.severity.as_str(),
            parameter.label(),
            parameter.label(),
            crossing.threshold,
            unit = parameter.unit(),
        );
        let id = uuid::Uuid::new_v4().to_string();
        let (alert, created) = self.store.create_or_merge_alert(&AlertUpsert {
            id: &id,
            device_id,
            parameter,
            severity: crossing.severity,
            value,
            threshold: crossing.threshold,
            message: &message,
            occurred_at: &occurred_at,
            now: &iso_from(now),
            cooldown_cutoff: &cutoff,
        })?;
        if created {
            tracing::info!(
                device = device_id,
                parameter = parameter.label(),
                severity = crossing.severity.as_str(),
                value,
                "alert created"
            );
            self.fanout.broadcast_alert_created(alert.clone()).await;
            self.notifier.notify(alert.clone());
        } else {
            self.fanout.broadcast_alert_updated(alert.clone()).await;
        }
        Ok(alert)
    }

    pub async fn acknowledge(&self, alert_id: &str, user_id: &str) -> Result<Alert, ApiError> {
        let now = now_iso();
        let applied = self.store.try_acknowledge(alert_id, user_id, &now)?;
        if !applied {
            return match self.store.get_alert(alert_id)? {
                None => Err(ApiError::not_found("alert not found")),
                Some(a) => Err(ApiError::conflict(format!(
                    "alert already {}",
                    a.status.as_str()
                ))),
            };
        }
        let alert = self
            .store
            .get_alert(alert_id)?
            .ok_or_else(|| ApiError::not_found("alert not found"))?;
        self.fanout.broadcast_alert_updated(alert.clone()).await;
        Ok(alert)
    }

    pub async fn resolve(
        &self,
        alert_id: &str,
        user_id: &str,
        notes: Option<&str>,
    ) -> Result<Alert, ApiError> {
        let now = now_iso();
        let applied = self.store.try_resolve(alert_id, user_id, notes, &now)?;
        if !applied {
            return match self.store.get_alert(alert_id)? {
                None => Err(ApiError::not_found("alert not found")),
                Some(_) => Err(ApiError::conflict("alert already resolved")),
            };
        }
        let alert = self
            .store
            .get_alert(alert_id)?
            .ok_or_else(|| ApiError::not_found("alert not found"))?;
        self.fanout
            .broadcast_alert_resolved(alert.device_id.clone(), alert.id.clone())
            .await;
        Ok(alert)
    }

    pub async fn resolve_all(
        &self,
        user_id: &str,
        filter: &ResolveAllRequest,
    ) -> Result<usize, ApiError> {
        let now = now_iso();
        let affected = self.store.resolve_all(filter, user_id, &now)?;
        for (alert_id, device_id) in &affected {
            self.fanout
                .broadcast_alert_resolved(device_id.clone(), alert_id.clone())
                .await;
        }
        Ok(affected.len())
    }

    pub fn statistics(&self, device_id: Option<&str>) -> Result<AlertStatistics, ApiError> {
        Ok(self.store.alert_statistics(device_id)?)
    }

    /// Operator delete: tombstone with the standard recovery window.
    pub fn delete(&self, alert_id: &str) -> Result<(), ApiError> {
        let now = Utc::now();
        let purge_at = iso_from(now + Duration::days(self.recovery_window_days));
        if !self
            .store
            .soft_delete_alert(alert_id, &iso_from(now), &purge_at)?
        {
            return Err(ApiError::not_found("alert not found"));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::HydroConfig;
    use crate::store::parse_iso;

    fn engine() -> AlertEngine {
        let cfg = HydroConfig::default();
        AlertEngine::new(
            Arc::new(Store::open_in_memory().unwrap()),
            Arc::new(Fanout::new()),
            Notifier::disabled(),
            cfg.thresholds,
            cfg.alerts,
            30,
        )
    }

    fn reading(device: &str, ts: DateTime<Utc>, ph: f64) -> Reading {
        Reading {
            id: uuid::Uuid::new_v4().to_string(),
            device_id: device.to_string(),
            timestamp_ms: ts.timestamp_millis(),
            ph: Some(ph),
            turbidity: Some(1.0),
            tds: Some(200.0),
            ph_valid: true,
            turbidity_valid: true,
            tds_valid: true,
            is_deleted: false,
            created_at: iso_from(ts),
        }
    }

    #[test]
    fn grading_selects_highest_severity() {
        let engine = engine();
        let c = engine.grade(Parameter::Ph, 5.0).unwrap();
        assert_eq!(c.severity, Severity::Critical);
        assert_eq!(c.threshold, 6.5);
        let c = engine.grade(Parameter::Ph, 6.2).unwrap();
        assert_eq!(c.severity, Severity::Warning);
        assert_eq!(c.threshold, 6.5);
        let c = engine.grade(Parameter::Ph, 9.4).unwrap();
        assert_eq!(c.severity, Severity::Critical);
        assert_eq!(c.threshold, 8.5);
        assert!(engine.grade(Parameter::Ph, 7.0).is_none());
        let c = engine.grade(Parameter::Turbidity, 12.0).unwrap();
        assert_eq!(c.severity, Severity::Critical);
        assert_eq!(c.threshold, 5.0);
        let c = engine.grade(Parameter::Tds, 600.0).unwrap();
        assert_eq!(c.severity, Severity::Warning);
        assert_eq!(c.threshold, 500.0);
    }

    #[tokio::test]
    async fn first_crossing_creates_duplicate_merges() {
        let engine = engine();
        let t0 = parse_iso("2026-03-01T10:00:00Z").unwrap();

        let alerts = engine
            .evaluate_at("D1", "Tank 1", "B2 / F1", &reading("D1", t0, 5.0), t0)
            .await
            .unwrap();
        assert_eq!(alerts.len(), 1);
        let a = &alerts[0];
        assert_eq!(a.parameter, Parameter::Ph);
        assert_eq!(a.severity, Severity::Critical);
        assert_eq!(a.value, 5.0);
        assert_eq!(a.threshold, 6.5);
        assert_eq!(a.occurrence_count, 1);
        assert_eq!(a.first_occurrence, a.last_occurrence);

        // Second crossing two minutes later merges into the same alert.
        let t1 = t0 + Duration::minutes(2);
        let alerts = engine
            .evaluate_at("D1", "Tank 1", "B2 / F1", &reading("D1", t1, 4.8), t1)
            .await
            .unwrap();
        assert_eq!(alerts.len(), 1);
        let merged = &alerts[0];
        assert_eq!(merged.id, a.id);
        assert_eq!(merged.occurrence_count, 2);
        assert_eq!(merged.current_value, 4.8);
        assert_eq!(merged.value, 5.0);
        assert_eq!(merged.last_occurrence, iso_from(t1));
        assert_eq!(merged.first_occurrence, iso_from(t0));
    }

    #[tokio::test]
    async fn post_cooldown_crossing_creates_second_alert() {
        let engine = engine();
        let t0 = parse_iso("2026-03-01T10:00:00Z").unwrap();
        let a = engine
            .evaluate_at("D1", "Tank 1", "", &reading("D1", t0, 5.0), t0)
            .await
            .unwrap()
            .remove(0);

        // Critical cooldown is 10 min; 11 min later a new alert is created
        // even though the first is still open.
        let t2 = t0 + Duration::minutes(11);
        let b = engine
            .evaluate_at("D1", "Tank 1", "", &reading("D1", t2, 4.7), t2)
            .await
            .unwrap()
            .remove(0);
        assert_ne!(a.id, b.id);
        assert_eq!(b.occurrence_count, 1);
        assert_eq!(b.current_value, 4.7);

        let first = engine.store.get_alert(&a.id).unwrap().unwrap();
        assert!(!first.acknowledged);
        assert_eq!(first.occurrence_count, 1);
    }

    #[tokio::test]
    async fn acknowledge_then_resolve_then_conflict() {
        let engine = engine();
        let t0 = parse_iso("2026-03-01T10:00:00Z").unwrap();
        let a = engine
            .evaluate_at("D1", "Tank 1", "", &reading("D1", t0, 5.0), t0)
            .await
            .unwrap()
            .remove(0);

        let acked = engine.acknowledge(&a.id, "U1").await.unwrap();
        assert!(acked.acknowledged);
        assert_eq!(acked.status, crate::models::alert::AlertStatus::Acknowledged);
        assert_eq!(acked.acknowledged_by.as_deref(), Some("U1"));

        // A second acknowledge conflicts.
        let err = engine.acknowledge(&a.id, "U1").await.unwrap_err();
        assert!(matches!(err, ApiError::Conflict(_)));

        let resolved = engine
            .resolve(&a.id, "U2", Some("valve replaced"))
            .await
            .unwrap();
        assert_eq!(resolved.status, crate::models::alert::AlertStatus::Resolved);
        assert_eq!(resolved.resolved_by.as_deref(), Some("U2"));
        assert_eq!(resolved.resolution_notes.as_deref(), Some("valve replaced"));
        assert!(resolved.acknowledged);

        let err = engine.resolve(&a.id, "U2", None).await.unwrap_err();
        assert!(matches!(err, ApiError::Conflict(_)));
        let err = engine.acknowledge(&a.id, "U1").await.unwrap_err();
        assert!(matches!(err, ApiError::Conflict(_)));
    }

    #[tokio::test]
    async fn resolve_skips_ack_but_sets_ack_fields() {
        let engine = engine();
        let t0 = parse_iso("2026-03-01T10:00:00Z").unwrap();
        let a = engine
            .evaluate_at("D1", "Tank 1", "", &reading("D1", t0, 5.0), t0)
            .await
            .unwrap()
            .remove(0);
        let resolved = engine.resolve(&a.id, "U9", None).await.unwrap();
        assert!(resolved.acknowledged);
        assert_eq!(resolved.acknowledged_by.as_deref(), Some("U9"));
        assert!(resolved.resolved_at.is_some());
    }

    #[tokio::test]
    async fn acknowledged_alert_does_not_absorb_new_crossings() {
        let engine = engine();
        let t0 = parse_iso("2026-03-01T10:00:00Z").unwrap();
        let a = engine
            .evaluate_at("D1", "Tank 1", "", &reading("D1", t0, 5.0), t0)
            .await
            .unwrap()
            .remove(0);
        engine.acknowledge(&a.id, "U1").await.unwrap();

        // Within the cooldown, but the open alert is gone: a fresh one.
        let t1 = t0 + Duration::minutes(2);
        let b = engine
            .evaluate_at("D1", "Tank 1", "", &reading("D1", t1, 5.1), t1)
            .await
            .unwrap()
            .remove(0);
        assert_ne!(a.id, b.id);
        assert_eq!(b.occurrence_count, 1);
    }

    #[tokio::test]
    async fn invalid_channel_is_not_evaluated() {
        let engine = engine();
        let t0 = parse_iso("2026-03-01T10:00:00Z").unwrap();
        let mut r = reading("D1", t0, 5.0);
        r.ph_valid = false;
        let alerts = engine
            .evaluate_at("D1", "Tank 1", "", &r, t0)
            .await
            .unwrap();
        assert!(alerts.is_empty());
    }

    #[tokio::test]
    async fn resolve_all_counts_and_filters() {
        let engine = engine();
        let t0 = parse_iso("2026-03-01T10:00:00Z").unwrap();
        engine
            .evaluate_at("D1", "Tank 1", "", &reading("D1", t0, 5.0), t0)
            .await
            .unwrap();
        let mut r = reading("D2", t0, 7.0);
        r.turbidity = Some(12.0);
        engine
            .evaluate_at("D2", "Tank 2", "", &r, t0)
            .await
            .unwrap();

        let only_d1 = ResolveAllRequest {
            device_id: Some("D1".to_string()),
            ..Default::default()
        };
        let count = engine.resolve_all("U1", &only_d1).await.unwrap();
        assert_eq!(count, 1);
        let count = engine
            .resolve_all("U1", &ResolveAllRequest::default())
            .await
            .unwrap();
        assert_eq!(count, 1);
        let stats = engine.statistics(None).unwrap();
        assert_eq!(stats.by_status.resolved, 2);
        assert_eq!(stats.by_status.unacknowledged, 0);
    }
}
