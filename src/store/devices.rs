use rusqlite::{Row, params};

use super::Store;
use crate::models::device::{
    Device, DeviceListFilter, DeviceLocation, DeviceStats, DeviceStatus, RegistrationStatus,
};

const DEVICE_COLS: &str = "id, device_id, name, device_type, firmware_version, mac_address, \
     ip_address, sensors, location, status, registration_status, is_registered, last_seen, \
     registered_at, is_deleted, deleted_at, deleted_by, scheduled_permanent_deletion_at, \
     created_at, updated_at";

fn device_from_row(row: &Row<'_>) -> rusqlite::Result<Device> {
    let sensors: String = row.get(7)?;
    let location: String = row.get(8)?;
    let status: String = row.get(9)?;
    let registration: String = row.get(10)?;
    Ok(Device {
        id: row.get(0)?,
        device_id: row.get(1)?,
        name: row.get(2)?,
        device_type: row.get(3)?,
        firmware_version: row.get(4)?,
        mac_address: row.get(5)?,
        ip_address: row.get(6)?,
        sensors: serde_json::from_str(&sensors).unwrap_or_default(),
        location: serde_json::from_str::<DeviceLocation>(&location).unwrap_or_default(),
        status: DeviceStatus::from_db(&status),
        registration_status: RegistrationStatus::from_db(&registration),
        is_registered: row.get(11)?,
        last_seen: row.get(12)?,
        registered_at: row.get(13)?,
        is_deleted: row.get(14)?,
        deleted_at: row.get(15)?,
        deleted_by: row.get(16)?,
        scheduled_permanent_deletion_at: row.get(17)?,
        created_at: row.get(18)?,
        updated_at: row.get(19)?,
    })
}

impl Store {
    pub fn insert_device(&self, d: &Device) -> anyhow::Result<()> {
        let conn = self.lock();
        conn.execute(
            "INSERT INTO devices (id, device_id, name, device_type, firmware_version, mac_address, \
             ip_address, sensors, location, status, registration_status, is_registered, last_seen, \
             registered_at, created_at, updated_at) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?15)",
            params![
                d.id,
                d.device_id,
                d.name,
                d.device_type,
                d.firmware_version,
                d.mac_address,
                d.ip_address,
                serde_json::to_string(&d.sensors)?,
                serde_json::to_string(&d.location)?,
                d.status.as_str(),
                d.registration_status.as_str(),
                d.is_registered,
                d.last_seen,
                d.registered_at,
                d.created_at,
            ],
        )?;
        Ok(())
    }

    /// Lookup by external `deviceId`, excluding soft-deleted rows.
    pub fn get_device(&self, device_id: &str) -> anyhow::Result<Option<Device>> {
        let conn = self.lock();
        let mut stmt = conn.prepare(&format!(
            "SELECT {DEVICE_COLS} FROM devices WHERE device_id = ?1 AND is_deleted = 0"
        ))?;
        let mut rows = stmt.query_map(params![device_id], device_from_row)?;
        Ok(rows.next().transpose()?)
    }

    /// Lookup by internal id or external `deviceId`, excluding soft-deleted.
    pub fn get_device_by_any_id(&self, id: &str) -> anyhow::Result<Option<Device>> {
        let conn = self.lock();
        let mut stmt = conn.prepare(&format!(
            "SELECT {DEVICE_COLS} FROM devices WHERE (id = ?1 OR device_id = ?1) AND is_deleted = 0"
        ))?;
        let mut rows = stmt.query_map(params![id], device_from_row)?;
        Ok(rows.next().transpose()?)
    }

    /// Lookup including soft-deleted rows (register conflict check, recover).
    pub fn get_device_any(&self, id: &str) -> anyhow::Result<Option<Device>> {
        let conn = self.lock();
        let mut stmt = conn.prepare(&format!(
            "SELECT {DEVICE_COLS} FROM devices WHERE id = ?1 OR device_id = ?1"
        ))?;
        let mut rows = stmt.query_map(params![id], device_from_row)?;
        Ok(rows.next().transpose()?)
    }

    pub fn update_device_metadata(&self, d: &Device, now: &str) -> anyhow::Result<bool> {
        let conn = self.lock();
        let count = conn.execute(
            "UPDATE devices SET name = ?2, device_type = ?3, firmware_version = ?4, \
             mac_address = ?5, ip_address = ?6, sensors = ?7, location = ?8, updated_at = ?9 \
             WHERE device_id = ?1 AND is_deleted = 0",
            params![
                d.device_id,
                d.name,
                d.device_type,
                d.firmware_version,
                d.mac_address,
                d.ip_address,
                serde_json::to_string(&d.sensors)?,
                serde_json::to_string(&d.location)?,
                now,
            ],
        )?;
        Ok(count > 0)
    }

    /// CAS `pending -> registered`. False when already registered or absent.
    pub fn approve_device(&self, device_id: &str, now: &str) -> anyhow::Result<bool> {
        let conn = self.lock();
        let count = conn.execute(
            "UPDATE devices SET registration_status = 'registered', is_registered = 1, \
             registered_at = ?2, updated_at = ?2 \
             WHERE device_id = ?1 AND is_deleted = 0 AND registration_status = 'pending'",
            params![device_id, now],
        )?;
        Ok(count > 0)
    }

    /// Presence reply: flips status online and refreshes `last_seen`.
    /// Returns the previous status so the caller can detect a transition.
    pub fn update_heartbeat(
        &self,
        device_id: &str,
        now: &str,
    ) -> anyhow::Result<Option<DeviceStatus>> {
        let mut conn = self.lock();
        let tx = conn.transaction()?;
        let prev: Option<String> = {
            let mut stmt = tx.prepare(
                "SELECT status FROM devices WHERE device_id = ?1 AND is_deleted = 0",
            )?;
            let mut rows = stmt.query_map(params![device_id], |row| row.get(0))?;
            rows.next().transpose()?
        };
        let Some(prev) = prev else {
            return Ok(None);
        };
        tx.execute(
            "UPDATE devices SET status = 'online', last_seen = ?2, updated_at = ?2 \
             WHERE device_id = ?1 AND is_deleted = 0",
            params![device_id, now],
        )?;
        tx.commit()?;
        Ok(Some(DeviceStatus::from_db(&prev)))
    }

    /// Data messages refresh `last_seen` without flipping status.
    pub fn update_last_seen_only(&self, device_id: &str, now: &str) -> anyhow::Result<bool> {
        let conn = self.lock();
        let count = conn.execute(
            "UPDATE devices SET last_seen = ?2, updated_at = ?2 \
             WHERE device_id = ?1 AND is_deleted = 0",
            params![device_id, now],
        )?;
        Ok(count > 0)
    }

    pub fn update_device_status(
        &self,
        device_id: &str,
        status: DeviceStatus,
        now: &str,
    ) -> anyhow::Result<Option<DeviceStatus>> {
        let mut conn = self.lock();
        let tx = conn.transaction()?;
        let prev: Option<String> = {
            let mut stmt = tx.prepare(
                "SELECT status FROM devices WHERE device_id = ?1 AND is_deleted = 0",
            )?;
            let mut rows = stmt.query_map(params![device_id], |row| row.get(0))?;
            rows.next().transpose()?
        };
        let Some(prev) = prev else {
            return Ok(None);
        };
        tx.execute(
            "UPDATE devices SET status = ?2, updated_at = ?3 \
             WHERE device_id = ?1 AND is_deleted = 0",
            params![device_id, status.as_str(), now],
        )?;
        tx.commit()?;
        Ok(Some(DeviceStatus::from_db(&prev)))
    }

    /// Flip every stale `online` device to `offline`; returns the flipped
    /// snapshots so the caller can emit one status event per transition.
    pub fn sweep_offline(&self, cutoff: &str, now: &str) -> anyhow::Result<Vec<Device>> {
        let mut conn = self.lock();
        let tx = conn.transaction()?;
        let stale: Vec<Device> = {
            let mut stmt = tx.prepare(&format!(
                "SELECT {DEVICE_COLS} FROM devices \
                 WHERE status = 'online' AND is_deleted = 0 \
                 AND (last_seen IS NULL OR last_seen < ?1)"
            ))?;
            let rows = stmt
                .query_map(params![cutoff], device_from_row)?
                .collect::<Result<Vec<_>, _>>()?;
            rows
        };
        for d in &stale {
            tx.execute(
                "UPDATE devices SET status = 'offline', updated_at = ?2 WHERE id = ?1",
                params![d.id, now],
            )?;
        }
        tx.commit()?;
        Ok(stale)
    }

    /// Tombstone the device and cascade the same `deleted_at` /
    /// `scheduled_permanent_deletion_at` to its readings and alerts.
    /// The whole cascade commits atomically.
    pub fn soft_delete_device(
        &self,
        device_id: &str,
        deleted_by: Option<&str>,
        now: &str,
        purge_at: &str,
    ) -> anyhow::Result<bool> {
        let mut conn = self.lock();
        let tx = conn.transaction()?;
        let count = tx.execute(
            "UPDATE devices SET is_deleted = 1, deleted_at = ?2, deleted_by = ?3, \
             scheduled_permanent_deletion_at = ?4, status = 'offline', updated_at = ?2 \
             WHERE device_id = ?1 AND is_deleted = 0",
            params![device_id, now, deleted_by, purge_at],
        )?;
        if count == 0 {
            return Ok(false);
        }
        tx.execute(
            "UPDATE readings SET is_deleted = 1, deleted_at = ?2, \
             scheduled_permanent_deletion_at = ?3 \
             WHERE device_id = ?1 AND is_deleted = 0",
            params![device_id, now, purge_at],
        )?;
        tx.execute(
            "UPDATE alerts SET is_deleted = 1, deleted_at = ?2, \
             scheduled_permanent_deletion_at = ?3, updated_at = ?2 \
             WHERE device_id = ?1 AND is_deleted = 0",
            params![device_id, now, purge_at],
        )?;
        tx.commit()?;
        Ok(true)
    }

    /// Clear the tombstones written by one cascade. Only rows sharing the
    /// device's `deleted_at` are restored; rows deleted independently stay.
    pub fn recover_device(&self, device_id: &str, deleted_at: &str, now: &str) -> anyhow::Result<bool> {
        let mut conn = self.lock();
        let tx = conn.transaction()?;
        let count = tx.execute(
            "UPDATE devices SET is_deleted = 0, deleted_at = NULL, deleted_by = NULL, \
             scheduled_permanent_deletion_at = NULL, updated_at = ?3 \
             WHERE device_id = ?1 AND is_deleted = 1 AND deleted_at = ?2",
            params![device_id, deleted_at, now],
        )?;
        if count == 0 {
            return Ok(false);
        }
        tx.execute(
            "UPDATE readings SET is_deleted = 0, deleted_at = NULL, \
             scheduled_permanent_deletion_at = NULL \
             WHERE device_id = ?1 AND is_deleted = 1 AND deleted_at = ?2",
            params![device_id, deleted_at],
        )?;
        tx.execute(
            "UPDATE alerts SET is_deleted = 0, deleted_at = NULL, \
             scheduled_permanent_deletion_at = NULL, updated_at = ?3 \
             WHERE device_id = ?1 AND is_deleted = 1 AND deleted_at = ?2",
            params![device_id, deleted_at, now],
        )?;
        tx.commit()?;
        Ok(true)
    }

    pub fn list_devices(&self, filter: &DeviceListFilter, page: i64, limit: i64) -> anyhow::Result<(Vec<Device>, i64)> {
        let mut conditions = vec!["is_deleted = 0".to_string()];
        let mut args: Vec<Box<dyn rusqlite::ToSql>> = Vec::new();
        if let Some(status) = filter.status {
            args.push(Box::new(status.as_str().to_string()));
            conditions.push(format!("status = ?{}", args.len()));
        }
        if let Some(reg) = filter.registration_status {
            args.push(Box::new(reg.as_str().to_string()));
            conditions.push(format!("registration_status = ?{}", args.len()));
        }
        if let Some(is_reg) = filter.is_registered {
            args.push(Box::new(is_reg));
            conditions.push(format!("is_registered = ?{}", args.len()));
        }
        if let Some(search) = filter.search.as_deref().filter(|s| !s.trim().is_empty()) {
            let like = format!("%{}%", search.trim().replace('%', "\\%"));
            args.push(Box::new(like));
            let n = args.len();
            conditions.push(format!(
                "(name LIKE ?{n} ESCAPE '\\' OR device_id LIKE ?{n} ESCAPE '\\' OR location LIKE ?{n} ESCAPE '\\')"
            ));
        }
        let where_clause = conditions.join(" AND ");

        let conn = self.lock();
        let total: i64 = conn.query_row(
            &format!("SELECT COUNT(*) FROM devices WHERE {where_clause}"),
            rusqlite::params_from_iter(args.iter().map(|a| a.as_ref())),
            |row| row.get(0),
        )?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {DEVICE_COLS} FROM devices WHERE {where_clause} \
             ORDER BY created_at DESC LIMIT {limit} OFFSET {}",
            (page - 1) * limit
        ))?;
        let rows = stmt
            .query_map(
                rusqlite::params_from_iter(args.iter().map(|a| a.as_ref())),
                device_from_row,
            )?
            .collect::<Result<Vec<_>, _>>()?;
        Ok((rows, total))
    }

    pub fn list_deleted_devices(&self) -> anyhow::Result<Vec<Device>> {
        let conn = self.lock();
        let mut stmt = conn.prepare(&format!(
            "SELECT {DEVICE_COLS} FROM devices WHERE is_deleted = 1 ORDER BY deleted_at DESC"
        ))?;
        let rows = stmt
            .query_map([], device_from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    pub fn list_pending_devices(&self) -> anyhow::Result<Vec<Device>> {
        let conn = self.lock();
        let mut stmt = conn.prepare(&format!(
            "SELECT {DEVICE_COLS} FROM devices \
             WHERE is_deleted = 0 AND registration_status = 'pending' \
             ORDER BY created_at DESC"
        ))?;
        let rows = stmt
            .query_map([], device_from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    pub fn device_stats(&self) -> anyhow::Result<DeviceStats> {
        let conn = self.lock();
        conn.query_row(
            "SELECT \
                COUNT(CASE WHEN is_deleted = 0 THEN 1 END), \
                COUNT(CASE WHEN is_deleted = 0 AND status = 'online' THEN 1 END), \
                COUNT(CASE WHEN is_deleted = 0 AND status = 'offline' THEN 1 END), \
                COUNT(CASE WHEN is_deleted = 0 AND is_registered = 1 THEN 1 END), \
                COUNT(CASE WHEN is_deleted = 0 AND registration_status = 'pending' THEN 1 END), \
                COUNT(CASE WHEN is_deleted = 1 THEN 1 END) \
             FROM devices",
            [],
            |row| {
                Ok(DeviceStats {
                    total: row.get(0)?,
                    online: row.get(1)?,
                    offline: row.get(2)?,
                    registered: row.get(3)?,
                    pending: row.get(4)?,
                    deleted: row.get(5)?,
                })
            },
        )
        .map_err(Into::into)
    }

    /// Open-alert count per device for list enrichment.
    pub fn open_alert_count(&self, device_id: &str) -> anyhow::Result<i64> {
        let conn = self.lock();
        conn.query_row(
            "SELECT COUNT(*) FROM alerts \
             WHERE device_id = ?1 AND is_deleted = 0 AND status != 'resolved'",
            params![device_id],
            |row| row.get(0),
        )
        .map_err(Into::into)
    }

    /// Remove a tombstoned device row so its `device_id` can be reused by a
    /// fresh registration. Cascaded child tombstones keep their own purge
    /// schedule.
    pub fn displace_deleted_device(&self, device_id: &str) -> anyhow::Result<bool> {
        let conn = self.lock();
        let count = conn.execute(
            "DELETE FROM devices WHERE device_id = ?1 AND is_deleted = 1",
            params![device_id],
        )?;
        Ok(count > 0)
    }

    /// Drop device rows whose permanent-deletion window has passed.
    pub fn purge_deleted_devices(&self, now: &str) -> anyhow::Result<usize> {
        let conn = self.lock();
        let count = conn.execute(
            "DELETE FROM devices WHERE is_deleted = 1 AND scheduled_permanent_deletion_at <= ?1",
            params![now],
        )?;
        Ok(count)
    }
}
