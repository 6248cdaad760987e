use rusqlite::{Row, params};

use super::Store;
use crate::models::report::{
    Report, ReportFile, ReportFormat, ReportListFilter, ReportStatistics, ReportStatus, ReportType,
};

const REPORT_COLS: &str = "id, report_type, title, description, status, format, parameters, \
     file_handle, file_name, file_size, content_type, generated_by, generated_at, \
     error_message, expires_at, created_at";

fn report_from_row(row: &Row<'_>) -> rusqlite::Result<Report> {
    let report_type: String = row.get(1)?;
    let status: String = row.get(4)?;
    let format: String = row.get(5)?;
    let parameters: String = row.get(6)?;
    let file_handle: Option<String> = row.get(7)?;
    let file = match file_handle {
        Some(handle) => Some(ReportFile {
            handle,
            filename: row.get::<_, Option<String>>(8)?.unwrap_or_default(),
            size: row.get::<_, Option<i64>>(9)?.unwrap_or_default(),
            content_type: row.get::<_, Option<String>>(10)?.unwrap_or_default(),
        }),
        None => None,
    };
    Ok(Report {
        id: row.get(0)?,
        report_type: ReportType::from_db(&report_type),
        title: row.get(2)?,
        description: row.get(3)?,
        status: ReportStatus::from_db(&status),
        format: ReportFormat::from_db(&format),
        parameters: serde_json::from_str(&parameters)
            .unwrap_or(serde_json::Value::Object(Default::default())),
        file,
        generated_by: row.get(11)?,
        generated_at: row.get(12)?,
        error_message: row.get(13)?,
        expires_at: row.get(14)?,
        created_at: row.get(15)?,
    })
}

impl Store {
    pub fn insert_report(&self, r: &Report) -> anyhow::Result<()> {
        let conn = self.lock();
        conn.execute(
            "INSERT INTO reports (id, report_type, title, description, status, format, \
             parameters, generated_by, expires_at, created_at) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
            params![
                r.id,
                r.report_type.as_str(),
                r.title,
                r.description,
                r.status.as_str(),
                r.format.as_str(),
                serde_json::to_string(&r.parameters)?,
                r.generated_by,
                r.expires_at,
                r.created_at,
            ],
        )?;
        Ok(())
    }

    pub fn get_report(&self, id: &str) -> anyhow::Result<Option<Report>> {
        let conn = self.lock();
        let mut stmt =
            conn.prepare(&format!("SELECT {REPORT_COLS} FROM reports WHERE id = ?1"))?;
        let mut rows = stmt.query_map(params![id], report_from_row)?;
        Ok(rows.next().transpose()?)
    }

    pub fn list_reports(
        &self,
        filter: &ReportListFilter,
        page: i64,
        limit: i64,
    ) -> anyhow::Result<(Vec<Report>, i64)> {
        let mut conditions = vec!["1 = 1".to_string()];
        let mut args: Vec<Box<dyn rusqlite::ToSql>> = Vec::new();
        if let Some(status) = filter.status {
            args.push(Box::new(status.as_str().to_string()));
            conditions.push(format!("status = ?{}", args.len()));
        }
        if let Some(report_type) = filter.report_type {
            args.push(Box::new(report_type.as_str().to_string()));
            conditions.push(format!("report_type = ?{}", args.len()));
        }
        let where_clause = conditions.join(" AND ");

        let conn = self.lock();
        let total: i64 = conn.query_row(
            &format!("SELECT COUNT(*) FROM reports WHERE {where_clause}"),
            rusqlite::params_from_iter(args.iter().map(|a| a.as_ref())),
            |row| row.get(0),
        )?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {REPORT_COLS} FROM reports WHERE {where_clause} \
             ORDER BY created_at DESC LIMIT {limit} OFFSET {}",
            (page - 1) * limit
        ))?;
        let rows = stmt
            .query_map(
                rusqlite::params_from_iter(args.iter().map(|a| a.as_ref())),
                report_from_row,
            )?
            .collect::<Result<Vec<_>, _>>()?;
        Ok((rows, total))
    }

    /// Attach the rendered artifact and flip to `completed` in one update.
    pub fn complete_report(
        &self,
        id: &str,
        file: &ReportFile,
        now: &str,
    ) -> anyhow::Result<bool> {
        let conn = self.lock();
        let count = conn.execute(
            "UPDATE reports SET status = 'completed', file_handle = ?2, file_name = ?3, \
             file_size = ?4, content_type = ?5, generated_at = ?6, error_message = NULL \
             WHERE id = ?1 AND status = 'generating'",
            params![id, file.handle, file.filename, file.size, file.content_type, now],
        )?;
        Ok(count > 0)
    }

    pub fn fail_report(&self, id: &str, message: &str, now: &str) -> anyhow::Result<bool> {
        let conn = self.lock();
        let count = conn.execute(
            "UPDATE reports SET status = 'failed', error_message = ?2, generated_at = ?3 \
             WHERE id = ?1 AND status = 'generating'",
            params![id, message, now],
        )?;
        Ok(count > 0)
    }

    /// Delete a report row, returning its file handle for object cleanup.
    pub fn delete_report(&self, id: &str) -> anyhow::Result<Option<Option<String>>> {
        let mut conn = self.lock();
        let tx = conn.transaction()?;
        let handle: Option<Option<String>> = {
            let mut stmt = tx.prepare("SELECT file_handle FROM reports WHERE id = ?1")?;
            let mut rows = stmt.query_map(params![id], |row| row.get(0))?;
            rows.next().transpose()?
        };
        if handle.is_some() {
            tx.execute("DELETE FROM reports WHERE id = ?1", params![id])?;
        }
        tx.commit()?;
        Ok(handle)
    }

    /// Rows past `expires_at`, with their file handles.
    pub fn expired_reports(&self, now: &str) -> anyhow::Result<Vec<(String, Option<String>)>> {
        let conn = self.lock();
        let mut stmt =
            conn.prepare("SELECT id, file_handle FROM reports WHERE expires_at <= ?1")?;
        let rows = stmt
            .query_map(params![now], |row| Ok((row.get(0)?, row.get(1)?)))?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    pub fn delete_report_rows(&self, ids: &[String]) -> anyhow::Result<usize> {
        let mut conn = self.lock();
        let tx = conn.transaction()?;
        let mut count = 0;
        for id in ids {
            count += tx.execute("DELETE FROM reports WHERE id = ?1", params![id])?;
        }
        tx.commit()?;
        Ok(count)
    }

    /// Reports left `generating` by a previous process are unfinishable;
    /// the sweeper fails them on its first pass after startup.
    pub fn fail_stale_generating(&self, cutoff: &str, now: &str) -> anyhow::Result<usize> {
        let conn = self.lock();
        let count = conn.execute(
            "UPDATE reports SET status = 'failed', error_message = 'worker restarted', \
             generated_at = ?2 \
             WHERE status = 'generating' AND created_at < ?1",
            params![cutoff, now],
        )?;
        Ok(count)
    }

    pub fn report_statistics(&self) -> anyhow::Result<ReportStatistics> {
        let conn = self.lock();
        conn.query_row(
            "SELECT COUNT(*), \
                COUNT(CASE WHEN status = 'generating' THEN 1 END), \
                COUNT(CASE WHEN status = 'completed' THEN 1 END), \
                COUNT(CASE WHEN status = 'failed' THEN 1 END), \
                COALESCE(SUM(file_size), 0) \
             FROM reports",
            [],
            |row| {
                Ok(ReportStatistics {
                    total: row.get(0)?,
                    generating: row.get(1)?,
                    completed: row.get(2)?,
                    failed: row.get(3)?,
                    total_file_bytes: row.get(4)?,
                })
            },
        )
        .map_err(Into::into)
    }
}
