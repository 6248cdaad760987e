use rusqlite::{Row, params};

use super::Store;
use crate::models::reading::{
    ChannelStats, Reading, ReadingListFilter, ReadingStatistics, TimeRange,
};

const READING_COLS: &str = "id, device_id, timestamp, ph, turbidity, tds, ph_valid, \
     turbidity_valid, tds_valid, is_deleted, created_at";

fn reading_from_row(row: &Row<'_>) -> rusqlite::Result<Reading> {
    Ok(Reading {
        id: row.get(0)?,
        device_id: row.get(1)?,
        timestamp_ms: row.get(2)?,
        ph: row.get(3)?,
        turbidity: row.get(4)?,
        tds: row.get(5)?,
        ph_valid: row.get(6)?,
        turbidity_valid: row.get(7)?,
        tds_valid: row.get(8)?,
        is_deleted: row.get(9)?,
        created_at: row.get(10)?,
    })
}

/// Build the WHERE clause for a reading list query. Soft-deleted rows are
/// always excluded; range filters apply to the value regardless of the
/// `_valid` flag (an operator hunting a misbehaving probe wants those rows).
fn build_filter(
    filter: &ReadingListFilter,
) -> (String, Vec<Box<dyn rusqlite::ToSql>>) {
    let mut conditions = vec!["is_deleted = 0".to_string()];
    let mut args: Vec<Box<dyn rusqlite::ToSql>> = Vec::new();
    if let Some(device_id) = filter.device_id.as_deref() {
        args.push(Box::new(device_id.to_string()));
        conditions.push(format!("device_id = ?{}", args.len()));
    }
    if let Some(start) = filter.start.as_deref().and_then(super::parse_iso) {
        args.push(Box::new(start.timestamp_millis()));
        conditions.push(format!("timestamp >= ?{}", args.len()));
    }
    if let Some(end) = filter.end.as_deref().and_then(super::parse_iso) {
        args.push(Box::new(end.timestamp_millis()));
        conditions.push(format!("timestamp <= ?{}", args.len()));
    }
    let ranges: [(&str, Option<f64>, Option<f64>); 3] = [
        ("ph", filter.ph_min, filter.ph_max),
        ("turbidity", filter.turbidity_min, filter.turbidity_max),
        ("tds", filter.tds_min, filter.tds_max),
    ];
    for (col, min, max) in ranges {
        if let Some(min) = min {
            args.push(Box::new(min));
            conditions.push(format!("{col} >= ?{}", args.len()));
        }
        if let Some(max) = max {
            args.push(Box::new(max));
            conditions.push(format!("{col} <= ?{}", args.len()));
        }
    }
    (conditions.join(" AND "), args)
}

impl Store {
    pub fn insert_reading(&self, r: &Reading) -> anyhow::Result<()> {
        let conn = self.lock();
        conn.execute(
            "INSERT INTO readings (id, device_id, timestamp, ph, turbidity, tds, \
             ph_valid, turbidity_valid, tds_valid, created_at) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
            params![
                r.id,
                r.device_id,
                r.timestamp_ms,
                r.ph,
                r.turbidity,
                r.tds,
                r.ph_valid,
                r.turbidity_valid,
                r.tds_valid,
                r.created_at,
            ],
        )?;
        Ok(())
    }

    pub fn latest_reading(&self, device_id: &str) -> anyhow::Result<Option<Reading>> {
        let conn = self.lock();
        let mut stmt = conn.prepare(&format!(
            "SELECT {READING_COLS} FROM readings \
             WHERE device_id = ?1 AND is_deleted = 0 \
             ORDER BY timestamp DESC LIMIT 1"
        ))?;
        let mut rows = stmt.query_map(params![device_id], reading_from_row)?;
        Ok(rows.next().transpose()?)
    }

    pub fn query_readings(
        &self,
        filter: &ReadingListFilter,
        page: i64,
        limit: i64,
    ) -> anyhow::Result<(Vec<Reading>, i64)> {
        let (where_clause, args) = build_filter(filter);
        let conn = self.lock();
        let total: i64 = conn.query_row(
            &format!("SELECT COUNT(*) FROM readings WHERE {where_clause}"),
            rusqlite::params_from_iter(args.iter().map(|a| a.as_ref())),
            |row| row.get(0),
        )?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {READING_COLS} FROM readings WHERE {where_clause} \
             ORDER BY timestamp DESC LIMIT {limit} OFFSET {}",
            (page - 1) * limit
        ))?;
        let rows = stmt
            .query_map(
                rusqlite::params_from_iter(args.iter().map(|a| a.as_ref())),
                reading_from_row,
            )?
            .collect::<Result<Vec<_>, _>>()?;
        Ok((rows, total))
    }

    pub fn count_readings(&self, filter: &ReadingListFilter) -> anyhow::Result<i64> {
        let (where_clause, args) = build_filter(filter);
        let conn = self.lock();
        conn.query_row(
            &format!("SELECT COUNT(*) FROM readings WHERE {where_clause}"),
            rusqlite::params_from_iter(args.iter().map(|a| a.as_ref())),
            |row| row.get(0),
        )
        .map_err(Into::into)
    }

    /// Server-side summary statistics. Channels are aggregated over valid
    /// samples only; a channel with no valid sample comes back `None`.
    pub fn reading_statistics(
        &self,
        device_id: Option<&str>,
        start_ms: Option<i64>,
        end_ms: Option<i64>,
    ) -> anyhow::Result<Option<ReadingStatistics>> {
        let mut conditions = vec!["is_deleted = 0".to_string()];
        let mut args: Vec<Box<dyn rusqlite::ToSql>> = Vec::new();
        if let Some(device_id) = device_id {
            args.push(Box::new(device_id.to_string()));
            conditions.push(format!("device_id = ?{}", args.len()));
        }
        if let Some(start) = start_ms {
            args.push(Box::new(start));
            conditions.push(format!("timestamp >= ?{}", args.len()));
        }
        if let Some(end) = end_ms {
            args.push(Box::new(end));
            conditions.push(format!("timestamp <= ?{}", args.len()));
        }
        let where_clause = conditions.join(" AND ");

        let conn = self.lock();
        let sql = format!(
            "SELECT COUNT(*), \
                MIN(CASE WHEN ph_valid = 1 THEN ph END), \
                MAX(CASE WHEN ph_valid = 1 THEN ph END), \
                AVG(CASE WHEN ph_valid = 1 THEN ph END), \
                COUNT(CASE WHEN ph_valid = 1 AND ph IS NOT NULL THEN 1 END), \
                MIN(CASE WHEN turbidity_valid = 1 THEN turbidity END), \
                MAX(CASE WHEN turbidity_valid = 1 THEN turbidity END), \
                AVG(CASE WHEN turbidity_valid = 1 THEN turbidity END), \
                COUNT(CASE WHEN turbidity_valid = 1 AND turbidity IS NOT NULL THEN 1 END), \
                MIN(CASE WHEN tds_valid = 1 THEN tds END), \
                MAX(CASE WHEN tds_valid = 1 THEN tds END), \
                AVG(CASE WHEN tds_valid = 1 THEN tds END), \
                COUNT(CASE WHEN tds_valid = 1 AND tds IS NOT NULL THEN 1 END), \
                MIN(timestamp), MAX(timestamp) \
             FROM readings WHERE {where_clause}"
        );
        let stats = conn.query_row(
            &sql,
            rusqlite::params_from_iter(args.iter().map(|a| a.as_ref())),
            |row| {
                let count: i64 = row.get(0)?;
                let channel = |min: Option<f64>, max: Option<f64>, avg: Option<f64>, n: i64| {
                    match (min, max, avg) {
                        (Some(min), Some(max), Some(avg)) => Some(ChannelStats {
                            min,
                            max,
                            avg,
                            count: n,
                        }),
                        _ => None,
                    }
                };
                let ph = channel(row.get(1)?, row.get(2)?, row.get(3)?, row.get(4)?);
                let turbidity = channel(row.get(5)?, row.get(6)?, row.get(7)?, row.get(8)?);
                let tds = channel(row.get(9)?, row.get(10)?, row.get(11)?, row.get(12)?);
                let min_ts: Option<i64> = row.get(13)?;
                let max_ts: Option<i64> = row.get(14)?;
                Ok((count, ph, turbidity, tds, min_ts, max_ts))
            },
        )?;
        let (count, ph, turbidity, tds, min_ts, max_ts) = stats;
        if count == 0 {
            return Ok(None);
        }
        let to_iso = |ms: i64| {
            chrono::DateTime::from_timestamp_millis(ms)
                .map(super::iso_from)
                .unwrap_or_default()
        };
        Ok(Some(ReadingStatistics {
            count,
            ph,
            turbidity,
            tds,
            time_range: match (min_ts, max_ts) {
                (Some(a), Some(b)) => Some(TimeRange {
                    start: to_iso(a),
                    end: to_iso(b),
                }),
                _ => None,
            },
        }))
    }

    /// Ascending window fetch feeding the bucketing pass and report bundles.
    pub fn readings_in_window(
        &self,
        device_id: Option<&str>,
        start_ms: i64,
        end_ms: i64,
        cap: usize,
    ) -> anyhow::Result<Vec<Reading>> {
        let conn = self.lock();
        let rows = match device_id {
            Some(device_id) => {
                let mut stmt = conn.prepare(&format!(
                    "SELECT {READING_COLS} FROM readings \
                     WHERE device_id = ?1 AND is_deleted = 0 AND timestamp >= ?2 AND timestamp <= ?3 \
                     ORDER BY timestamp ASC LIMIT {cap}"
                ))?;
                stmt.query_map(params![device_id, start_ms, end_ms], reading_from_row)?
                    .collect::<Result<Vec<_>, _>>()?
            }
            None => {
                let mut stmt = conn.prepare(&format!(
                    "SELECT {READING_COLS} FROM readings \
                     WHERE is_deleted = 0 AND timestamp >= ?1 AND timestamp <= ?2 \
                     ORDER BY timestamp ASC LIMIT {cap}"
                ))?;
                stmt.query_map(params![start_ms, end_ms], reading_from_row)?
                    .collect::<Result<Vec<_>, _>>()?
            }
        };
        Ok(rows)
    }

    /// Retention: drop rows older than the cutoff on the `created_at` clock.
    pub fn delete_readings_before(&self, created_cutoff: &str) -> anyhow::Result<usize> {
        let conn = self.lock();
        let count = conn.execute(
            "DELETE FROM readings WHERE created_at < ?1",
            params![created_cutoff],
        )?;
        Ok(count)
    }

    /// Drop tombstoned rows whose permanent-deletion window has passed.
    pub fn purge_deleted_readings(&self, now: &str) -> anyhow::Result<usize> {
        let conn = self.lock();
        let count = conn.execute(
            "DELETE FROM readings WHERE is_deleted = 1 AND scheduled_permanent_deletion_at <= ?1",
            params![now],
        )?;
        Ok(count)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{iso_from, parse_iso};

    fn sample(device: &str, ts_ms: i64, ph: f64) -> Reading {
        Reading {
            id: uuid::Uuid::new_v4().to_string(),
            device_id: device.to_string(),
            timestamp_ms: ts_ms,
            ph: Some(ph),
            turbidity: Some(1.5),
            tds: Some(250.0),
            ph_valid: true,
            turbidity_valid: true,
            tds_valid: true,
            is_deleted: false,
            created_at: crate::store::now_iso(),
        }
    }

    fn ms(s: &str) -> i64 {
        parse_iso(s).unwrap().timestamp_millis()
    }

    #[test]
    fn query_sorts_newest_first_and_paginates() {
        let store = Store::open_in_memory().unwrap();
        let t0 = ms("2026-03-01T10:00:00Z");
        for i in 0..5 {
            store.insert_reading(&sample("D1", t0 + i * 1000, 7.0)).unwrap();
        }
        let filter = ReadingListFilter {
            device_id: Some("D1".to_string()),
            ..Default::default()
        };
        let (rows, total) = store.query_readings(&filter, 1, 2).unwrap();
        assert_eq!(total, 5);
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].timestamp_ms, t0 + 4000);
        assert!(rows[0].timestamp_ms > rows[1].timestamp_ms);

        let (page3, _) = store.query_readings(&filter, 3, 2).unwrap();
        assert_eq!(page3.len(), 1);
        assert_eq!(page3[0].timestamp_ms, t0);
    }

    #[test]
    fn range_filters_bound_values_and_time() {
        let store = Store::open_in_memory().unwrap();
        let t0 = ms("2026-03-01T10:00:00Z");
        store.insert_reading(&sample("D1", t0, 6.0)).unwrap();
        store.insert_reading(&sample("D1", t0 + 1000, 7.0)).unwrap();
        store.insert_reading(&sample("D1", t0 + 2000, 8.0)).unwrap();

        let filter = ReadingListFilter {
            ph_min: Some(6.5),
            ph_max: Some(7.5),
            ..Default::default()
        };
        let (rows, total) = store.query_readings(&filter, 1, 50).unwrap();
        assert_eq!(total, 1);
        assert_eq!(rows[0].ph, Some(7.0));

        let filter = ReadingListFilter {
            start: Some("2026-03-01T10:00:01Z".to_string()),
            end: Some("2026-03-01T10:00:02Z".to_string()),
            ..Default::default()
        };
        assert_eq!(store.count_readings(&filter).unwrap(), 2);
    }

    #[test]
    fn statistics_skip_invalid_channels_and_empty_windows() {
        let store = Store::open_in_memory().unwrap();
        assert!(store.reading_statistics(None, None, None).unwrap().is_none());

        let t0 = ms("2026-03-01T10:00:00Z");
        let mut bad_probe = sample("D1", t0, 3.0);
        bad_probe.ph_valid = false;
        store.insert_reading(&bad_probe).unwrap();
        store.insert_reading(&sample("D1", t0 + 1000, 7.0)).unwrap();
        store.insert_reading(&sample("D1", t0 + 2000, 7.4)).unwrap();

        let stats = store.reading_statistics(Some("D1"), None, None).unwrap().unwrap();
        assert_eq!(stats.count, 3);
        let ph = stats.ph.unwrap();
        // The invalid 3.0 sample is excluded from the aggregate.
        assert_eq!(ph.min, 7.0);
        assert_eq!(ph.max, 7.4);
        assert_eq!(ph.count, 2);
        let range = stats.time_range.unwrap();
        assert_eq!(range.start, "2026-03-01T10:00:00Z");
        assert_eq!(range.end, "2026-03-01T10:00:02Z");
    }

    #[test]
    fn duplicate_sample_yields_two_rows_never_more() {
        let store = Store::open_in_memory().unwrap();
        let t0 = ms("2026-03-01T10:00:00Z");
        store.insert_reading(&sample("D1", t0, 7.0)).unwrap();
        store.insert_reading(&sample("D1", t0, 7.0)).unwrap();
        assert_eq!(store.count_readings(&Default::default()).unwrap(), 2);
    }

    #[test]
    fn retention_uses_the_created_at_clock() {
        let store = Store::open_in_memory().unwrap();
        let t0 = ms("2026-03-01T10:00:00Z");
        let mut old = sample("D1", t0, 7.0);
        old.created_at = iso_from(chrono::Utc::now() - chrono::Duration::days(91));
        store.insert_reading(&old).unwrap();
        // Recent row with an old device timestamp survives.
        store.insert_reading(&sample("D1", t0, 7.1)).unwrap();

        let cutoff = iso_from(chrono::Utc::now() - chrono::Duration::days(90));
        assert_eq!(store.delete_readings_before(&cutoff).unwrap(), 1);
        assert_eq!(store.count_readings(&Default::default()).unwrap(), 1);
    }

    #[test]
    fn tombstone_purge_honors_the_schedule() {
        let store = Store::open_in_memory().unwrap();
        let t0 = ms("2026-03-01T10:00:00Z");
        store.insert_reading(&sample("D1", t0, 7.0)).unwrap();
        store.insert_reading(&sample("D2", t0, 7.0)).unwrap();
        let past = iso_from(chrono::Utc::now() - chrono::Duration::days(1));
        let future = iso_from(chrono::Utc::now() + chrono::Duration::days(29));
        store
            .lock()
            .execute(
                "UPDATE readings SET is_deleted = 1, deleted_at = ?1, \
                 scheduled_permanent_deletion_at = ?2 WHERE device_id = 'D1'",
                params![past, past],
            )
            .unwrap();
        store
            .lock()
            .execute(
                "UPDATE readings SET is_deleted = 1, deleted_at = ?1, \
                 scheduled_permanent_deletion_at = ?2 WHERE device_id = 'D2'",
                params![past, future],
            )
            .unwrap();
        assert_eq!(
            store.purge_deleted_readings(&crate::store::now_iso()).unwrap(),
            1
        );
    }
}
