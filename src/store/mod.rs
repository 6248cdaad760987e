mod alerts;
mod devices;
mod readings;
mod reports;

pub use alerts::AlertUpsert;

use rusqlite::Connection;
use std::path::PathBuf;
use std::sync::Mutex;

/// Embedded store owning the four collections: devices, readings, alerts,
/// reports. Statements run serialized behind the connection mutex, so a
/// multi-statement transaction is atomic with respect to every other caller.
pub struct Store {
    conn: Mutex<Connection>,
    path: Option<PathBuf>,
}

/// Entity timestamp format. Fixed-width UTC, so lexicographic order is
/// chronological order and string comparison works in SQL.
pub const ISO_FORMAT: &str = "%Y-%m-%dT%H:%M:%SZ";

pub fn now_iso() -> String {
    chrono::Utc::now().format(ISO_FORMAT).to_string()
}

pub fn iso_from(t: chrono::DateTime<chrono::Utc>) -> String {
    t.format(ISO_FORMAT).to_string()
}

pub fn parse_iso(s: &str) -> Option<chrono::DateTime<chrono::Utc>> {
    chrono::NaiveDateTime::parse_from_str(s, ISO_FORMAT)
        .map(|n| n.and_utc())
        .ok()
        .or_else(|| {
            chrono::DateTime::parse_from_rfc3339(s)
                .map(|t| t.with_timezone(&chrono::Utc))
                .ok()
        })
}

impl Store {
    pub fn open(path: &str) -> anyhow::Result<Self> {
        let conn = Connection::open(path)?;
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA foreign_keys=ON;")?;
        let db = Self {
            conn: Mutex::new(conn),
            path: Some(PathBuf::from(path)),
        };
        db.run_migrations()?;
        Ok(db)
    }

    /// In-memory store for tests.
    pub fn open_in_memory() -> anyhow::Result<Self> {
        let conn = Connection::open_in_memory()?;
        let db = Self {
            conn: Mutex::new(conn),
            path: None,
        };
        db.run_migrations()?;
        Ok(db)
    }

    pub(crate) fn lock(&self) -> std::sync::MutexGuard<'_, Connection> {
        match self.conn.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Cheap liveness probe for `/health`.
    pub fn ping(&self) -> bool {
        self.lock()
            .query_row("SELECT 1", [], |row| row.get::<_, i64>(0))
            .is_ok()
    }

    /// On-disk size of the database file, if file-backed.
    pub fn storage_bytes(&self) -> u64 {
        self.path
            .as_ref()
            .and_then(|p| std::fs::metadata(p).ok())
            .map(|m| m.len())
            .unwrap_or(0)
    }

    fn run_migrations(&self) -> anyhow::Result<()> {
        let conn = self.lock();
        conn.execute_batch(
            "
            CREATE TABLE IF NOT EXISTS devices (
                id                  TEXT PRIMARY KEY,
                device_id           TEXT NOT NULL UNIQUE,
                name                TEXT NOT NULL DEFAULT '',
                device_type         TEXT NOT NULL DEFAULT '',
                firmware_version    TEXT NOT NULL DEFAULT '',
                mac_address         TEXT NOT NULL DEFAULT '',
                ip_address          TEXT NOT NULL DEFAULT '',
                sensors             TEXT NOT NULL DEFAULT '[]',
                location            TEXT NOT NULL DEFAULT '{}',
                status              TEXT NOT NULL DEFAULT 'offline' CHECK(status IN ('online','offline')),
                registration_status TEXT NOT NULL DEFAULT 'pending' CHECK(registration_status IN ('pending','registered')),
                is_registered       INTEGER NOT NULL DEFAULT 0,
                last_seen           TEXT,
                registered_at       TEXT,
                is_deleted          INTEGER NOT NULL DEFAULT 0,
                deleted_at          TEXT,
                deleted_by          TEXT,
                scheduled_permanent_deletion_at TEXT,
                created_at          TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%SZ','now')),
                updated_at          TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%SZ','now'))
            );
            CREATE INDEX IF NOT EXISTS idx_devices_status ON devices(status, last_seen);
            CREATE INDEX IF NOT EXISTS idx_devices_deleted ON devices(is_deleted, scheduled_permanent_deletion_at);

            CREATE TABLE IF NOT EXISTS readings (
                id              TEXT PRIMARY KEY,
                device_id       TEXT NOT NULL,
                timestamp       INTEGER NOT NULL,
                ph              REAL,
                turbidity       REAL,
                tds             REAL,
                ph_valid        INTEGER NOT NULL DEFAULT 1,
                turbidity_valid INTEGER NOT NULL DEFAULT 1,
                tds_valid       INTEGER NOT NULL DEFAULT 1,
                is_deleted      INTEGER NOT NULL DEFAULT 0,
                deleted_at      TEXT,
                scheduled_permanent_deletion_at TEXT,
                created_at      TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%SZ','now'))
            );
            CREATE INDEX IF NOT EXISTS idx_readings_device_ts ON readings(device_id, timestamp DESC);
            CREATE INDEX IF NOT EXISTS idx_readings_ts ON readings(timestamp, device_id);
            CREATE INDEX IF NOT EXISTS idx_readings_deleted ON readings(is_deleted, scheduled_permanent_deletion_at);
            CREATE INDEX IF NOT EXISTS idx_readings_created ON readings(created_at);

            CREATE TABLE IF NOT EXISTS alerts (
                id               TEXT PRIMARY KEY,
                device_id        TEXT NOT NULL,
                parameter        TEXT NOT NULL CHECK(parameter IN ('ph','turbidity','tds')),
                severity         TEXT NOT NULL CHECK(severity IN ('advisory','warning','critical')),
                value            REAL NOT NULL,
                threshold        REAL NOT NULL,
                current_value    REAL NOT NULL,
                message          TEXT NOT NULL DEFAULT '',
                status           TEXT NOT NULL DEFAULT 'unacknowledged' CHECK(status IN ('unacknowledged','acknowledged','resolved')),
                acknowledged     INTEGER NOT NULL DEFAULT 0,
                acknowledged_at  TEXT,
                acknowledged_by  TEXT,
                resolved_at      TEXT,
                resolved_by      TEXT,
                resolution_notes TEXT,
                occurrence_count INTEGER NOT NULL DEFAULT 1,
                first_occurrence TEXT NOT NULL,
                last_occurrence  TEXT NOT NULL,
                email_sent       INTEGER NOT NULL DEFAULT 0,
                is_deleted       INTEGER NOT NULL DEFAULT 0,
                deleted_at       TEXT,
                scheduled_permanent_deletion_at TEXT,
                created_at       TEXT NOT NULL,
                updated_at       TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_alerts_open ON alerts(device_id, parameter, acknowledged, created_at DESC);
            CREATE INDEX IF NOT EXISTS idx_alerts_created ON alerts(created_at DESC);
            CREATE INDEX IF NOT EXISTS idx_alerts_deleted ON alerts(is_deleted, scheduled_permanent_deletion_at);

            CREATE TABLE IF NOT EXISTS reports (
                id            TEXT PRIMARY KEY,
                report_type   TEXT NOT NULL CHECK(report_type IN ('water-quality','device-status','compliance','alert-summary')),
                title         TEXT NOT NULL,
                description   TEXT NOT NULL DEFAULT '',
                status        TEXT NOT NULL DEFAULT 'generating' CHECK(status IN ('generating','completed','failed')),
                format        TEXT NOT NULL CHECK(format IN ('pdf','csv','xlsx')),
                parameters    TEXT NOT NULL DEFAULT '{}',
                file_handle   TEXT,
                file_name     TEXT,
                file_size     INTEGER,
                content_type  TEXT,
                generated_by  TEXT NOT NULL DEFAULT '',
                generated_at  TEXT,
                error_message TEXT,
                expires_at    TEXT NOT NULL,
                created_at    TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%SZ','now'))
            );
            CREATE INDEX IF NOT EXISTS idx_reports_expires ON reports(expires_at);
            ",
        )?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn iso_round_trip() {
        let now = chrono::Utc::now();
        let s = iso_from(now);
        let parsed = parse_iso(&s).unwrap();
        assert_eq!(parsed.timestamp(), now.timestamp());
    }

    #[test]
    fn iso_orders_lexicographically() {
        let early = iso_from(parse_iso("2026-03-01T10:00:00Z").unwrap());
        let late = iso_from(parse_iso("2026-03-01T10:05:00Z").unwrap());
        assert!(early < late);
    }

    #[test]
    fn migrations_are_idempotent() {
        let store = Store::open_in_memory().unwrap();
        store.run_migrations().unwrap();
        assert!(store.ping());
    }
}
