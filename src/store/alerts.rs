use rusqlite::{Row, params};

use super::Store;
use crate::models::alert::{
    Alert, AlertListFilter, AlertStatistics, AlertStatus, Parameter, ResolveAllRequest, Severity,
};

const ALERT_COLS: &str = "id, device_id, parameter, severity, value, threshold, current_value, \
     message, status, acknowledged, acknowledged_at, acknowledged_by, resolved_at, resolved_by, \
     resolution_notes, occurrence_count, first_occurrence, last_occurrence, email_sent, \
     is_deleted, created_at, updated_at";

fn alert_from_row(row: &Row<'_>) -> rusqlite::Result<Alert> {
    let parameter: String = row.get(2)?;
    let severity: String = row.get(3)?;
    let status: String = row.get(8)?;
    Ok(Alert {
        id: row.get(0)?,
        device_id: row.get(1)?,
        parameter: Parameter::from_db(&parameter),
        severity: Severity::from_db(&severity),
        value: row.get(4)?,
        threshold: row.get(5)?,
        current_value: row.get(6)?,
        message: row.get(7)?,
        status: AlertStatus::from_db(&status),
        acknowledged: row.get(9)?,
        acknowledged_at: row.get(10)?,
        acknowledged_by: row.get(11)?,
        resolved_at: row.get(12)?,
        resolved_by: row.get(13)?,
        resolution_notes: row.get(14)?,
        occurrence_count: row.get(15)?,
        first_occurrence: row.get(16)?,
        last_occurrence: row.get(17)?,
        email_sent: row.get(18)?,
        is_deleted: row.get(19)?,
        created_at: row.get(20)?,
        updated_at: row.get(21)?,
    })
}

/// Parameters for the conditional create-or-merge pass.
pub struct AlertUpsert<'a> {
    pub id: &'a str,
    pub device_id: &'a str,
    pub parameter: Parameter,
    pub severity: Severity,
    pub value: f64,
    pub threshold: f64,
    pub message: &'a str,
    /// Reading timestamp, ISO.
    pub occurred_at: &'a str,
    pub now: &'a str,
    /// Open alerts created at/after this instant absorb the crossing.
    pub cooldown_cutoff: &'a str,
}

impl Store {
    /// Create a new open alert unless one for `(device, parameter)` already
    /// exists inside the cooldown window; in that case merge into it.
    /// The conditional insert and the fallback merge run in one transaction,
    /// so concurrent crossings produce exactly one creation — losers merge.
    /// Returns the resulting row and whether it was created.
    pub fn create_or_merge_alert(&self, up: &AlertUpsert<'_>) -> anyhow::Result<(Alert, bool)> {
        let mut conn = self.lock();
        let tx = conn.transaction()?;
        let inserted = tx.execute(
            "INSERT INTO alerts (id, device_id, parameter, severity, value, threshold, \
             current_value, message, status, acknowledged, occurrence_count, \
             first_occurrence, last_occurrence, email_sent, created_at, updated_at) \
             SELECT ?1, ?2, ?3, ?4, ?5, ?6, ?5, ?7, 'unacknowledged', 0, 1, ?8, ?8, 0, ?9, ?9 \
             WHERE NOT EXISTS ( \
                 SELECT 1 FROM alerts \
                 WHERE device_id = ?2 AND parameter = ?3 \
                   AND acknowledged = 0 AND is_deleted = 0 AND created_at >= ?10)",
            params![
                up.id,
                up.device_id,
                up.parameter.as_db(),
                up.severity.as_str(),
                up.value,
                up.threshold,
                up.message,
                up.occurred_at,
                up.now,
                up.cooldown_cutoff,
            ],
        )?;
        let (row_id, created) = if inserted > 0 {
            (up.id.to_string(), true)
        } else {
            let existing: String = tx.query_row(
                "SELECT id FROM alerts \
                 WHERE device_id = ?1 AND parameter = ?2 \
                   AND acknowledged = 0 AND is_deleted = 0 AND created_at >= ?3 \
                 ORDER BY created_at DESC LIMIT 1",
                params![up.device_id, up.parameter.as_db(), up.cooldown_cutoff],
                |row| row.get(0),
            )?;
            // MAX keeps late arrivals from moving last_occurrence backwards.
            tx.execute(
                "UPDATE alerts SET current_value = ?2, \
                 last_occurrence = MAX(last_occurrence, ?3), \
                 occurrence_count = occurrence_count + 1, updated_at = ?4 \
                 WHERE id = ?1",
                params![existing, up.value, up.occurred_at, up.now],
            )?;
            (existing, false)
        };
        let alert = {
            let mut stmt =
                tx.prepare(&format!("SELECT {ALERT_COLS} FROM alerts WHERE id = ?1"))?;
            stmt.query_row(params![row_id], alert_from_row)?
        };
        tx.commit()?;
        Ok((alert, created))
    }

    pub fn get_alert(&self, id: &str) -> anyhow::Result<Option<Alert>> {
        let conn = self.lock();
        let mut stmt = conn.prepare(&format!(
            "SELECT {ALERT_COLS} FROM alerts WHERE id = ?1 AND is_deleted = 0"
        ))?;
        let mut rows = stmt.query_map(params![id], alert_from_row)?;
        Ok(rows.next().transpose()?)
    }

    /// CAS `unacknowledged -> acknowledged`. False when the row is missing,
    /// deleted, or already past that state.
    pub fn try_acknowledge(&self, id: &str, user: &str, now: &str) -> anyhow::Result<bool> {
        let conn = self.lock();
        let count = conn.execute(
            "UPDATE alerts SET status = 'acknowledged', acknowledged = 1, \
             acknowledged_at = ?3, acknowledged_by = ?2, updated_at = ?3 \
             WHERE id = ?1 AND is_deleted = 0 AND status = 'unacknowledged'",
            params![id, user, now],
        )?;
        Ok(count > 0)
    }

    /// CAS to `resolved`, setting ack fields if the alert skipped that state.
    pub fn try_resolve(
        &self,
        id: &str,
        user: &str,
        notes: Option<&str>,
        now: &str,
    ) -> anyhow::Result<bool> {
        let conn = self.lock();
        let count = conn.execute(
            "UPDATE alerts SET status = 'resolved', acknowledged = 1, \
             acknowledged_at = COALESCE(acknowledged_at, ?4), \
             acknowledged_by = COALESCE(acknowledged_by, ?2), \
             resolved_at = ?4, resolved_by = ?2, \
             resolution_notes = COALESCE(?3, resolution_notes), updated_at = ?4 \
             WHERE id = ?1 AND is_deleted = 0 AND status != 'resolved'",
            params![id, user, notes, now],
        )?;
        Ok(count > 0)
    }

    /// Bulk resolve over the optional filter; one transaction. Returns the
    /// affected `(id, device_id)` pairs for per-alert event emission.
    pub fn resolve_all(
        &self,
        filter: &ResolveAllRequest,
        user: &str,
        now: &str,
    ) -> anyhow::Result<Vec<(String, String)>> {
        let mut conditions = vec![
            "is_deleted = 0".to_string(),
            "status != 'resolved'".to_string(),
        ];
        let mut args: Vec<Box<dyn rusqlite::ToSql>> = Vec::new();
        if let Some(severity) = filter.severity {
            args.push(Box::new(severity.as_str().to_string()));
            conditions.push(format!("severity = ?{}", args.len()));
        }
        if let Some(parameter) = filter.parameter {
            args.push(Box::new(parameter.as_db().to_string()));
            conditions.push(format!("parameter = ?{}", args.len()));
        }
        if let Some(device_id) = filter.device_id.as_deref() {
            args.push(Box::new(device_id.to_string()));
            conditions.push(format!("device_id = ?{}", args.len()));
        }
        let where_clause = conditions.join(" AND ");

        let mut conn = self.lock();
        let tx = conn.transaction()?;
        let affected: Vec<(String, String)> = {
            let mut stmt = tx.prepare(&format!(
                "SELECT id, device_id FROM alerts WHERE {where_clause}"
            ))?;
            stmt.query_map(
                rusqlite::params_from_iter(args.iter().map(|a| a.as_ref())),
                |row| Ok((row.get(0)?, row.get(1)?)),
            )?
            .collect::<Result<Vec<_>, _>>()?
        };
        for (id, _) in &affected {
            tx.execute(
                "UPDATE alerts SET status = 'resolved', acknowledged = 1, \
                 acknowledged_at = COALESCE(acknowledged_at, ?3), \
                 acknowledged_by = COALESCE(acknowledged_by, ?2), \
                 resolved_at = ?3, resolved_by = ?2, \
                 resolution_notes = COALESCE(?4, resolution_notes), updated_at = ?3 \
                 WHERE id = ?1",
                params![id, user, now, filter.notes.as_deref()],
            )?;
        }
        tx.commit()?;
        Ok(affected)
    }

    pub fn list_alerts(
        &self,
        filter: &AlertListFilter,
        page: i64,
        limit: i64,
    ) -> anyhow::Result<(Vec<Alert>, i64)> {
        let mut conditions = vec!["is_deleted = 0".to_string()];
        let mut args: Vec<Box<dyn rusqlite::ToSql>> = Vec::new();
        if let Some(device_id) = filter.device_id.as_deref() {
            args.push(Box::new(device_id.to_string()));
            conditions.push(format!("device_id = ?{}", args.len()));
        }
        if let Some(severity) = filter.severity {
            args.push(Box::new(severity.as_str().to_string()));
            conditions.push(format!("severity = ?{}", args.len()));
        }
        if let Some(status) = filter.status {
            args.push(Box::new(status.as_str().to_string()));
            conditions.push(format!("status = ?{}", args.len()));
        }
        if let Some(parameter) = filter.parameter {
            args.push(Box::new(parameter.as_db().to_string()));
            conditions.push(format!("parameter = ?{}", args.len()));
        }
        if let Some(acknowledged) = filter.acknowledged {
            args.push(Box::new(acknowledged));
            conditions.push(format!("acknowledged = ?{}", args.len()));
        }
        if let Some(start) = filter.start_date.as_deref().and_then(super::parse_iso) {
            args.push(Box::new(super::iso_from(start)));
            conditions.push(format!("created_at >= ?{}", args.len()));
        }
        if let Some(end) = filter.end_date.as_deref().and_then(super::parse_iso) {
            args.push(Box::new(super::iso_from(end)));
            conditions.push(format!("created_at <= ?{}", args.len()));
        }
        let where_clause = conditions.join(" AND ");

        let conn = self.lock();
        let total: i64 = conn.query_row(
            &format!("SELECT COUNT(*) FROM alerts WHERE {where_clause}"),
            rusqlite::params_from_iter(args.iter().map(|a| a.as_ref())),
            |row| row.get(0),
        )?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {ALERT_COLS} FROM alerts WHERE {where_clause} \
             ORDER BY created_at DESC LIMIT {limit} OFFSET {}",
            (page - 1) * limit
        ))?;
        let rows = stmt
            .query_map(
                rusqlite::params_from_iter(args.iter().map(|a| a.as_ref())),
                alert_from_row,
            )?
            .collect::<Result<Vec<_>, _>>()?;
        Ok((rows, total))
    }

    pub fn unacknowledged_count(&self, device_id: Option<&str>) -> anyhow::Result<i64> {
        let conn = self.lock();
        match device_id {
            Some(device_id) => conn
                .query_row(
                    "SELECT COUNT(*) FROM alerts \
                     WHERE acknowledged = 0 AND is_deleted = 0 AND device_id = ?1",
                    params![device_id],
                    |row| row.get(0),
                )
                .map_err(Into::into),
            None => conn
                .query_row(
                    "SELECT COUNT(*) FROM alerts WHERE acknowledged = 0 AND is_deleted = 0",
                    [],
                    |row| row.get(0),
                )
                .map_err(Into::into),
        }
    }

    /// Totals grouped by severity, status, and parameter in one pass.
    pub fn alert_statistics(&self, device_id: Option<&str>) -> anyhow::Result<AlertStatistics> {
        let conn = self.lock();
        let sql = match device_id {
            Some(_) => {
                "SELECT severity, status, parameter, COUNT(*) FROM alerts \
                 WHERE is_deleted = 0 AND device_id = ?1 \
                 GROUP BY severity, status, parameter"
            }
            None => {
                "SELECT severity, status, parameter, COUNT(*) FROM alerts \
                 WHERE is_deleted = 0 GROUP BY severity, status, parameter"
            }
        };
        let mut stmt = conn.prepare(sql)?;
        let mapper = |row: &Row<'_>| -> rusqlite::Result<(String, String, String, i64)> {
            Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?))
        };
        let groups: Vec<(String, String, String, i64)> = match device_id {
            Some(device_id) => stmt
                .query_map(params![device_id], mapper)?
                .collect::<Result<Vec<_>, _>>()?,
            None => stmt.query_map([], mapper)?.collect::<Result<Vec<_>, _>>()?,
        };

        let mut stats = AlertStatistics::default();
        for (severity, status, parameter, count) in groups {
            stats.total += count;
            match Severity::from_db(&severity) {
                Severity::Advisory => stats.by_severity.advisory += count,
                Severity::Warning => stats.by_severity.warning += count,
                Severity::Critical => stats.by_severity.critical += count,
            }
            match AlertStatus::from_db(&status) {
                AlertStatus::Unacknowledged => stats.by_status.unacknowledged += count,
                AlertStatus::Acknowledged => stats.by_status.acknowledged += count,
                AlertStatus::Resolved => stats.by_status.resolved += count,
            }
            match Parameter::from_db(&parameter) {
                Parameter::Ph => stats.by_parameter.ph += count,
                Parameter::Turbidity => stats.by_parameter.turbidity += count,
                Parameter::Tds => stats.by_parameter.tds += count,
            }
        }
        Ok(stats)
    }

    /// Window fetch for report bundles, ascending by creation.
    pub fn alerts_in_window(
        &self,
        device_ids: &[String],
        start: &str,
        end: &str,
    ) -> anyhow::Result<Vec<Alert>> {
        let conn = self.lock();
        let mut conditions = vec![
            "is_deleted = 0".to_string(),
            "created_at >= ?1".to_string(),
            "created_at <= ?2".to_string(),
        ];
        let mut args: Vec<Box<dyn rusqlite::ToSql>> =
            vec![Box::new(start.to_string()), Box::new(end.to_string())];
        if !device_ids.is_empty() {
            let placeholders: Vec<String> = device_ids
                .iter()
                .map(|id| {
                    args.push(Box::new(id.clone()));
                    format!("?{}", args.len())
                })
                .collect();
            conditions.push(format!("device_id IN ({})", placeholders.join(", ")));
        }
        let mut stmt = conn.prepare(&format!(
            "SELECT {ALERT_COLS} FROM alerts WHERE {} ORDER BY created_at ASC",
            conditions.join(" AND ")
        ))?;
        let rows = stmt
            .query_map(
                rusqlite::params_from_iter(args.iter().map(|a| a.as_ref())),
                alert_from_row,
            )?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    /// Operator delete is a tombstone, in line with the device cascade.
    pub fn soft_delete_alert(&self, id: &str, now: &str, purge_at: &str) -> anyhow::Result<bool> {
        let conn = self.lock();
        let count = conn.execute(
            "UPDATE alerts SET is_deleted = 1, deleted_at = ?2, \
             scheduled_permanent_deletion_at = ?3, updated_at = ?2 \
             WHERE id = ?1 AND is_deleted = 0",
            params![id, now, purge_at],
        )?;
        Ok(count > 0)
    }

    pub fn mark_email_sent(&self, id: &str, sent: bool) -> anyhow::Result<()> {
        let conn = self.lock();
        conn.execute(
            "UPDATE alerts SET email_sent = ?2 WHERE id = ?1",
            params![id, sent],
        )?;
        Ok(())
    }

    pub fn purge_deleted_alerts(&self, now: &str) -> anyhow::Result<usize> {
        let conn = self.lock();
        let count = conn.execute(
            "DELETE FROM alerts WHERE is_deleted = 1 AND scheduled_permanent_deletion_at <= ?1",
            params![now],
        )?;
        Ok(count)
    }
}
