//! Device lifecycle: registration -> approval -> heartbeat -> offline sweep
//! -> soft-delete with cascade -> bounded recovery.
//!
//! Command publishes are best-effort: a broker failure is logged and never
//! fails the calling operation, except `send_command` which reports it.

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};

use crate::bridge::{BridgeHandle, command_topic};
use crate::error::ApiError;
use crate::models::device::{
    DeletedDevice, Device, DeviceListFilter, DeviceStats, DeviceStatus, DeviceWithReading,
    RegisterDeviceRequest, RegistrationStatus, UpdateDeviceRequest,
};
use crate::models::Pagination;
use crate::realtime::Fanout;
use crate::store::{Store, iso_from, now_iso, parse_iso};

pub struct DeviceRegistry {
    store: Arc<Store>,
    fanout: Arc<Fanout>,
    bridge: BridgeHandle,
    offline_threshold_secs: i64,
    recovery_window_days: i64,
}

impl DeviceRegistry {
    pub fn new(
        store: Arc<Store>,
        fanout: Arc<Fanout>,
        bridge: BridgeHandle,
        offline_threshold_secs: i64,
        recovery_window_days: i64,
    ) -> Self {
        Self {
            store,
            fanout,
            bridge,
            offline_threshold_secs,
            recovery_window_days,
        }
    }

    fn new_device(req: &RegisterDeviceRequest, status: DeviceStatus, now: &str) -> Device {
        Device {
            id: uuid::Uuid::new_v4().to_string(),
            device_id: req.device_id.clone(),
            name: if req.name.is_empty() {
                req.device_id.clone()
            } else {
                req.name.clone()
            },
            device_type: req.device_type.clone(),
            firmware_version: req.firmware_version.clone(),
            mac_address: req.mac_address.clone(),
            ip_address: req.ip_address.clone(),
            sensors: req.sensors.clone(),
            location: req.location.clone(),
            status,
            registration_status: RegistrationStatus::Pending,
            is_registered: false,
            last_seen: (status == DeviceStatus::Online).then(|| now.to_string()),
            registered_at: None,
            is_deleted: false,
            deleted_at: None,
            deleted_by: None,
            scheduled_permanent_deletion_at: None,
            created_at: now.to_string(),
            updated_at: now.to_string(),
        }
    }

    /// Operator registration. Conflicts when the id is already taken by a
    /// live device; a tombstoned row with the same id is displaced.
    pub fn register(&self, req: &RegisterDeviceRequest) -> Result<Device, ApiError> {
        if req.device_id.trim().is_empty() {
            return Err(ApiError::invalid_fields(
                "deviceId must not be empty",
                vec!["deviceId".into()],
            ));
        }
        let now = now_iso();
        if let Some(existing) = self.store.get_device_any(&req.device_id)? {
            if !existing.is_deleted {
                return Err(ApiError::conflict(format!(
                    "device {} already registered",
                    req.device_id
                )));
            }
            self.store.displace_deleted_device(&req.device_id)?;
        }
        let device = Self::new_device(req, DeviceStatus::Offline, &now);
        self.store.insert_device(&device)?;
        tracing::info!(device = %device.device_id, "device registered (pending approval)");
        Ok(device)
    }

    /// Idempotent upsert from the registration topic. An existing device
    /// gets its metadata refreshed and comes online; a new one is inserted
    /// online but pending approval. Status transitions emit a fanout event.
    pub async fn auto_register(&self, req: &RegisterDeviceRequest) -> Result<Device, ApiError> {
        if req.device_id.trim().is_empty() {
            return Err(ApiError::invalid_fields(
                "deviceId must not be empty",
                vec!["deviceId".into()],
            ));
        }
        let now = now_iso();
        match self.store.get_device_any(&req.device_id)? {
            Some(existing) if !existing.is_deleted => {
                let mut updated = existing.clone();
                if !req.name.is_empty() {
                    updated.name = req.name.clone();
                }
                if !req.device_type.is_empty() {
                    updated.device_type = req.device_type.clone();
                }
                if !req.firmware_version.is_empty() {
                    updated.firmware_version = req.firmware_version.clone();
                }
                if !req.mac_address.is_empty() {
                    updated.mac_address = req.mac_address.clone();
                }
                if !req.ip_address.is_empty() {
                    updated.ip_address = req.ip_address.clone();
                }
                if !req.sensors.is_empty() {
                    updated.sensors = req.sensors.clone();
                }
                self.store.update_device_metadata(&updated, &now)?;
                let prev = self.store.update_heartbeat(&req.device_id, &now)?;
                let device = self
                    .store
                    .get_device(&req.device_id)?
                    .ok_or_else(|| ApiError::not_found("device not found"))?;
                if prev == Some(DeviceStatus::Offline) {
                    self.fanout
                        .broadcast_device_status(
                            device.device_id.clone(),
                            DeviceStatus::Online,
                            Some(device.clone()),
                        )
                        .await;
                }
                Ok(device)
            }
            Some(_) => {
                // Tombstoned id re-announcing itself: start a fresh record.
                self.store.displace_deleted_device(&req.device_id)?;
                let device = Self::new_device(req, DeviceStatus::Online, &now);
                self.store.insert_device(&device)?;
                self.fanout
                    .broadcast_device_status(
                        device.device_id.clone(),
                        DeviceStatus::Online,
                        Some(device.clone()),
                    )
                    .await;
                Ok(device)
            }
            None => {
                let device = Self::new_device(req, DeviceStatus::Online, &now);
                self.store.insert_device(&device)?;
                tracing::info!(device = %device.device_id, "device auto-registered");
                self.fanout
                    .broadcast_device_status(
                        device.device_id.clone(),
                        DeviceStatus::Online,
                        Some(device.clone()),
                    )
                    .await;
                Ok(device)
            }
        }
    }

    /// Admin approval: `pending -> registered`, then a best-effort "go".
    pub fn approve(
        &self,
        device_id: &str,
        extra: Option<&UpdateDeviceRequest>,
    ) -> Result<Device, ApiError> {
        let device = self
            .store
            .get_device(device_id)?
            .ok_or_else(|| ApiError::not_found("device not found"))?;
        if device.is_registered {
            return Err(ApiError::conflict("device already registered"));
        }
        let now = now_iso();
        if let Some(extra) = extra {
            let merged = Self::merge_metadata(&device, extra);
            self.store.update_device_metadata(&merged, &now)?;
        }
        if !self.store.approve_device(device_id, &now)? {
            return Err(ApiError::conflict("device already registered"));
        }
        self.bridge.publish_best_effort(
            &command_topic(device_id),
            &serde_json::json!({ "command": "go", "timestamp": now }),
        );
        self.store
            .get_device(device_id)?
            .ok_or_else(|| ApiError::not_found("device not found"))
    }

    fn merge_metadata(device: &Device, req: &UpdateDeviceRequest) -> Device {
        let mut merged = device.clone();
        if let Some(name) = &req.name {
            merged.name = name.clone();
        }
        if let Some(device_type) = &req.device_type {
            merged.device_type = device_type.clone();
        }
        if let Some(firmware) = &req.firmware_version {
            merged.firmware_version = firmware.clone();
        }
        if let Some(mac) = &req.mac_address {
            merged.mac_address = mac.clone();
        }
        if let Some(ip) = &req.ip_address {
            merged.ip_address = ip.clone();
        }
        if let Some(sensors) = &req.sensors {
            merged.sensors = sensors.clone();
        }
        if let Some(location) = &req.location {
            merged.location = location.clone();
        }
        merged
    }

    pub fn update_metadata(
        &self,
        id: &str,
        req: &UpdateDeviceRequest,
    ) -> Result<Device, ApiError> {
        let device = self
            .store
            .get_device_by_any_id(id)?
            .ok_or_else(|| ApiError::not_found("device not found"))?;
        let merged = Self::merge_metadata(&device, req);
        self.store.update_device_metadata(&merged, &now_iso())?;
        self.store
            .get_device(&device.device_id)?
            .ok_or_else(|| ApiError::not_found("device not found"))
    }

    /// Presence reply: flips online and refreshes `last_seen`. Emits a
    /// status event when the device was offline.
    pub async fn heartbeat(&self, device_id: &str) -> Result<(), ApiError> {
        let prev = self.store.update_heartbeat(device_id, &now_iso())?;
        if prev == Some(DeviceStatus::Offline) {
            let device = self.store.get_device(device_id)?;
            self.fanout
                .broadcast_device_status(device_id.to_string(), DeviceStatus::Online, device)
                .await;
        }
        Ok(())
    }

    /// Data-path refresh: `last_seen` only, status untouched.
    pub fn touch_last_seen(&self, device_id: &str) -> Result<(), ApiError> {
        self.store.update_last_seen_only(device_id, &now_iso())?;
        Ok(())
    }

    /// Explicit status mutation (admin, or an offline status reply).
    pub async fn set_status(
        &self,
        device_id: &str,
        status: DeviceStatus,
    ) -> Result<Device, ApiError> {
        let prev = self
            .store
            .update_device_status(device_id, status, &now_iso())?
            .ok_or_else(|| ApiError::not_found("device not found"))?;
        let device = self
            .store
            .get_device(device_id)?
            .ok_or_else(|| ApiError::not_found("device not found"))?;
        if prev != status {
            self.fanout
                .broadcast_device_status(device_id.to_string(), status, Some(device.clone()))
                .await;
        }
        Ok(device)
    }

    /// Flip stale `online` devices to `offline`; one status event each.
    pub async fn sweep_offline(&self) -> Result<usize, ApiError> {
        self.sweep_offline_at(Utc::now()).await
    }

    pub async fn sweep_offline_at(&self, now: DateTime<Utc>) -> Result<usize, ApiError> {
        let cutoff = iso_from(now - Duration::seconds(self.offline_threshold_secs));
        let flipped = self.store.sweep_offline(&cutoff, &iso_from(now))?;
        let count = flipped.len();
        for mut device in flipped {
            device.status = DeviceStatus::Offline;
            let device_id = device.device_id.clone();
            tracing::info!(device = %device_id, "device went offline (sweep)");
            self.fanout
                .broadcast_device_status(device_id, DeviceStatus::Offline, Some(device))
                .await;
        }
        Ok(count)
    }

    /// Publish an operator command to the device's command topic.
    pub fn send_command(
        &self,
        device_id: &str,
        command: &str,
        payload: Option<&serde_json::Value>,
    ) -> Result<(), ApiError> {
        if command.trim().is_empty() {
            return Err(ApiError::invalid_fields(
                "command must not be empty",
                vec!["command".into()],
            ));
        }
        let device = self
            .store
            .get_device(device_id)?
            .ok_or_else(|| ApiError::not_found("device not found"))?;
        if !device.is_registered {
            return Err(ApiError::conflict("device is not registered"));
        }
        if device.status != DeviceStatus::Online {
            return Err(ApiError::conflict("device is offline"));
        }
        self.bridge.publish(
            &command_topic(device_id),
            &serde_json::json!({
                "command": command,
                "payload": payload.cloned().unwrap_or(serde_json::Value::Null),
                "timestamp": now_iso(),
            }),
        )
    }

    /// Solicit an immediate reading; convenience alias over `send_command`.
    pub fn send_now(&self, device_id: &str) -> Result<(), ApiError> {
        self.send_command(device_id, "send-now", None)
    }

    /// Tombstone the device and cascade to its readings and alerts, after a
    /// best-effort "deregister" to the device.
    pub async fn soft_delete(&self, id: &str, deleted_by: Option<&str>) -> Result<(), ApiError> {
        let device = self
            .store
            .get_device_by_any_id(id)?
            .ok_or_else(|| ApiError::not_found("device not found"))?;
        let now = Utc::now();
        self.bridge.publish_best_effort(
            &command_topic(&device.device_id),
            &serde_json::json!({ "command": "deregister", "timestamp": iso_from(now) }),
        );
        let purge_at = iso_from(now + Duration::days(self.recovery_window_days));
        if !self.store.soft_delete_device(
            &device.device_id,
            deleted_by,
            &iso_from(now),
            &purge_at,
        )? {
            return Err(ApiError::conflict("device already deleted"));
        }
        tracing::info!(device = %device.device_id, "device soft-deleted (cascade)");
        self.fanout
            .broadcast_device_status(device.device_id.clone(), DeviceStatus::Offline, None)
            .await;
        Ok(())
    }

    /// Undo a soft delete while the recovery window is open.
    pub fn recover(&self, id: &str) -> Result<Device, ApiError> {
        let device = self
            .store
            .get_device_any(id)?
            .ok_or_else(|| ApiError::not_found("device not found"))?;
        if !device.is_deleted {
            return Err(ApiError::conflict("device is not deleted"));
        }
        let now = Utc::now();
        let expired = device
            .scheduled_permanent_deletion_at
            .as_deref()
            .and_then(parse_iso)
            .map(|at| at <= now)
            .unwrap_or(true);
        if expired {
            return Err(ApiError::Forbidden(
                "recovery window has expired".to_string(),
            ));
        }
        let deleted_at = device.deleted_at.clone().unwrap_or_default();
        if !self
            .store
            .recover_device(&device.device_id, &deleted_at, &iso_from(now))?
        {
            return Err(ApiError::conflict("device is not deleted"));
        }
        self.bridge.publish_best_effort(
            &command_topic(&device.device_id),
            &serde_json::json!({ "command": "go", "timestamp": iso_from(now) }),
        );
        self.store
            .get_device(&device.device_id)?
            .ok_or_else(|| ApiError::not_found("device not found"))
    }

    pub fn get(&self, id: &str) -> Result<DeviceWithReading, ApiError> {
        let device = self
            .store
            .get_device_by_any_id(id)?
            .ok_or_else(|| ApiError::not_found("device not found"))?;
        self.enrich(device)
    }

    fn enrich(&self, device: Device) -> Result<DeviceWithReading, ApiError> {
        let latest_reading = self
            .store
            .latest_reading(&device.device_id)?
            .map(Into::into);
        let open_alerts = self.store.open_alert_count(&device.device_id)?;
        Ok(DeviceWithReading {
            device,
            latest_reading,
            open_alerts,
        })
    }

    pub fn list(
        &self,
        filter: &DeviceListFilter,
        page: i64,
        limit: i64,
    ) -> Result<(Vec<DeviceWithReading>, Pagination), ApiError> {
        let (devices, total) = self.store.list_devices(filter, page, limit)?;
        let enriched = devices
            .into_iter()
            .map(|d| self.enrich(d))
            .collect::<Result<Vec<_>, _>>()?;
        Ok((enriched, Pagination::new(page, limit, total)))
    }

    pub fn deleted(&self) -> Result<Vec<DeletedDevice>, ApiError> {
        let now = Utc::now();
        let rows = self.store.list_deleted_devices()?;
        Ok(rows
            .into_iter()
            .map(|device| {
                let remaining_days = device
                    .scheduled_permanent_deletion_at
                    .as_deref()
                    .and_then(parse_iso)
                    .map(|at| ((at - now).num_seconds().max(0) + 86_399) / 86_400)
                    .unwrap_or(0);
                DeletedDevice {
                    device,
                    remaining_days,
                }
            })
            .collect())
    }

    pub fn pending(&self) -> Result<Vec<Device>, ApiError> {
        Ok(self.store.list_pending_devices()?)
    }

    pub fn stats(&self) -> Result<DeviceStats, ApiError> {
        Ok(self.store.device_stats()?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::reading::Reading;

    fn registry() -> (DeviceRegistry, Arc<Store>) {
        let store = Arc::new(Store::open_in_memory().unwrap());
        let (bridge, _rx) = BridgeHandle::channel(
            16,
            0.0,
            std::time::Duration::from_secs(30),
        );
        // Keep the outbound queue alive for best-effort publishes.
        std::mem::forget(_rx);
        let registry = DeviceRegistry::new(
            Arc::clone(&store),
            Arc::new(Fanout::new()),
            bridge,
            300,
            30,
        );
        (registry, store)
    }

    fn request(device_id: &str) -> RegisterDeviceRequest {
        RegisterDeviceRequest {
            device_id: device_id.to_string(),
            name: format!("Sensor {device_id}"),
            device_type: "aqua-probe".to_string(),
            firmware_version: "1.2.0".to_string(),
            mac_address: "AA:BB:CC:DD:EE:FF".to_string(),
            ip_address: "10.0.0.7".to_string(),
            sensors: vec!["pH".into(), "turbidity".into(), "tds".into()],
            location: Default::default(),
        }
    }

    fn sample(device_id: &str, ts_ms: i64) -> Reading {
        Reading {
            id: uuid::Uuid::new_v4().to_string(),
            device_id: device_id.to_string(),
            timestamp_ms: ts_ms,
            ph: Some(7.0),
            turbidity: Some(1.0),
            tds: Some(200.0),
            ph_valid: true,
            turbidity_valid: true,
            tds_valid: true,
            is_deleted: false,
            created_at: now_iso(),
        }
    }

    #[test]
    fn register_then_approve_is_registered() {
        let (registry, _store) = registry();
        let device = registry.register(&request("D1")).unwrap();
        assert_eq!(device.status, DeviceStatus::Offline);
        assert_eq!(device.registration_status, RegistrationStatus::Pending);
        assert!(!device.is_registered);

        let approved = registry.approve("D1", None).unwrap();
        assert!(approved.is_registered);
        assert_eq!(approved.registration_status, RegistrationStatus::Registered);
        assert!(approved.registered_at.is_some());

        // Approval is terminal.
        let err = registry.approve("D1", None).unwrap_err();
        assert!(matches!(err, ApiError::Conflict(_)));
    }

    #[test]
    fn duplicate_register_conflicts() {
        let (registry, _store) = registry();
        registry.register(&request("D1")).unwrap();
        let err = registry.register(&request("D1")).unwrap_err();
        assert!(matches!(err, ApiError::Conflict(_)));
    }

    #[tokio::test]
    async fn auto_register_is_an_upsert() {
        let (registry, _store) = registry();
        let first = registry.auto_register(&request("D1")).await.unwrap();
        assert_eq!(first.status, DeviceStatus::Online);
        assert_eq!(first.registration_status, RegistrationStatus::Pending);

        let mut req = request("D1");
        req.firmware_version = "1.3.0".to_string();
        let second = registry.auto_register(&req).await.unwrap();
        assert_eq!(second.id, first.id);
        assert_eq!(second.firmware_version, "1.3.0");
        assert_eq!(second.status, DeviceStatus::Online);
    }

    #[tokio::test]
    async fn sweep_flips_stale_devices() {
        let (registry, store) = registry();
        registry.auto_register(&request("D2")).await.unwrap();
        // Fresh heartbeat: survives the sweep.
        registry.auto_register(&request("D3")).await.unwrap();
        let stale = iso_from(Utc::now() - Duration::minutes(10));
        store
            .lock()
            .execute(
                "UPDATE devices SET last_seen = ?1 WHERE device_id = 'D2'",
                rusqlite::params![stale],
            )
            .unwrap();

        let count = registry.sweep_offline().await.unwrap();
        assert_eq!(count, 1);
        let d2 = store.get_device("D2").unwrap().unwrap();
        assert_eq!(d2.status, DeviceStatus::Offline);
        let d3 = store.get_device("D3").unwrap().unwrap();
        assert_eq!(d3.status, DeviceStatus::Online);

        // Second sweep is a no-op.
        assert_eq!(registry.sweep_offline().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn send_command_enforces_state() {
        let (registry, store) = registry();
        let err = registry.send_command("nope", "go", None).unwrap_err();
        assert!(matches!(err, ApiError::NotFound(_)));

        registry.auto_register(&request("D1")).await.unwrap();
        let err = registry.send_command("D1", "go", None).unwrap_err();
        assert!(matches!(err, ApiError::Conflict(_))); // not registered

        registry.approve("D1", None).unwrap();
        registry.send_command("D1", "calibrate", None).unwrap();

        store
            .update_device_status("D1", DeviceStatus::Offline, &now_iso())
            .unwrap();
        let err = registry.send_command("D1", "go", None).unwrap_err();
        assert!(matches!(err, ApiError::Conflict(_))); // offline
    }

    #[tokio::test]
    async fn soft_delete_cascades_and_recover_restores() {
        let (registry, store) = registry();
        registry.auto_register(&request("D1")).await.unwrap();
        let ts = Utc::now().timestamp_millis();
        store.insert_reading(&sample("D1", ts)).unwrap();
        store.insert_reading(&sample("D1", ts + 1000)).unwrap();

        registry.soft_delete("D1", Some("admin1")).await.unwrap();
        assert!(store.get_device("D1").unwrap().is_none());
        let tomb = store.get_device_any("D1").unwrap().unwrap();
        assert!(tomb.is_deleted);
        assert!(tomb.scheduled_permanent_deletion_at.is_some());
        assert!(store.latest_reading("D1").unwrap().is_none());

        // Cascaded rows share the device's deleted_at.
        let device_deleted_at = tomb.deleted_at.clone().unwrap();
        let shared: i64 = store
            .lock()
            .query_row(
                "SELECT COUNT(*) FROM readings WHERE device_id = 'D1' \
                 AND is_deleted = 1 AND deleted_at = ?1",
                rusqlite::params![device_deleted_at],
                |row| row.get(0),
            )
            .unwrap();
        assert_eq!(shared, 2);

        let err = registry.soft_delete("D1", None).await.unwrap_err();
        assert!(matches!(err, ApiError::NotFound(_)));

        let recovered = registry.recover("D1").unwrap();
        assert!(!recovered.is_deleted);
        assert!(store.latest_reading("D1").unwrap().is_some());
        assert_eq!(
            store.count_readings(&Default::default()).unwrap(),
            2
        );
    }

    #[tokio::test]
    async fn recover_outside_window_is_forbidden() {
        let (registry, store) = registry();
        registry.auto_register(&request("D1")).await.unwrap();
        let past = iso_from(Utc::now() - Duration::days(31));
        let purge = iso_from(Utc::now() - Duration::days(1));
        store
            .soft_delete_device("D1", None, &past, &purge)
            .unwrap();
        let err = registry.recover("D1").unwrap_err();
        assert!(matches!(err, ApiError::Forbidden(_)));
    }

    #[tokio::test]
    async fn deleted_listing_reports_remaining_days() {
        let (registry, _store) = registry();
        registry.auto_register(&request("D1")).await.unwrap();
        registry.soft_delete("D1", None).await.unwrap();
        let deleted = registry.deleted().unwrap();
        assert_eq!(deleted.len(), 1);
        assert!(deleted[0].remaining_days >= 29 && deleted[0].remaining_days <= 30);
    }
}
