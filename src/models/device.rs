use serde::{Deserialize, Serialize};

use super::reading::ReadingResponse;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceStatus {
    Online,
    Offline,
}

impl DeviceStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Online => "online",
            Self::Offline => "offline",
        }
    }

    pub fn from_db(s: &str) -> Self {
        match s {
            "online" => Self::Online,
            _ => Self::Offline,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RegistrationStatus {
    Pending,
    Registered,
}

impl RegistrationStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Registered => "registered",
        }
    }

    pub fn from_db(s: &str) -> Self {
        match s {
            "registered" => Self::Registered,
            _ => Self::Pending,
        }
    }
}

/// One physical sensor node as persisted.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Device {
    pub id: String,
    pub device_id: String,
    pub name: String,
    #[serde(rename = "type")]
    pub device_type: String,
    pub firmware_version: String,
    pub mac_address: String,
    pub ip_address: String,
    /// Channel names the device exposes, e.g. `["pH", "turbidity", "tds"]`.
    pub sensors: Vec<String>,
    pub location: DeviceLocation,
    pub status: DeviceStatus,
    pub registration_status: RegistrationStatus,
    pub is_registered: bool,
    pub last_seen: Option<String>,
    pub registered_at: Option<String>,
    pub is_deleted: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub deleted_at: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub deleted_by: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub scheduled_permanent_deletion_at: Option<String>,
    pub created_at: String,
    pub updated_at: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DeviceLocation {
    #[serde(default)]
    pub building: String,
    #[serde(default)]
    pub floor: String,
    #[serde(default)]
    pub notes: String,
}

impl DeviceLocation {
    pub fn label(&self) -> String {
        match (self.building.is_empty(), self.floor.is_empty()) {
            (false, false) => format!("{} / {}", self.building, self.floor),
            (false, true) => self.building.clone(),
            (true, false) => self.floor.clone(),
            (true, true) => String::new(),
        }
    }
}

/// Device list row enriched with its latest reading and open-alert count.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceWithReading {
    #[serde(flatten)]
    pub device: Device,
    pub latest_reading: Option<ReadingResponse>,
    pub open_alerts: i64,
}

/// Soft-deleted device row with the remaining recovery window.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DeletedDevice {
    #[serde(flatten)]
    pub device: Device,
    pub remaining_days: i64,
}

/// Registration payload, from the HTTP surface or the broker's
/// registration topic.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct RegisterDeviceRequest {
    pub device_id: String,
    #[serde(default)]
    pub name: String,
    #[serde(rename = "type", default)]
    pub device_type: String,
    #[serde(default)]
    pub firmware_version: String,
    #[serde(default)]
    pub mac_address: String,
    #[serde(default)]
    pub ip_address: String,
    #[serde(default)]
    pub sensors: Vec<String>,
    #[serde(default)]
    pub location: DeviceLocation,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct UpdateDeviceRequest {
    pub name: Option<String>,
    #[serde(rename = "type")]
    pub device_type: Option<String>,
    pub firmware_version: Option<String>,
    pub mac_address: Option<String>,
    pub ip_address: Option<String>,
    pub sensors: Option<Vec<String>>,
    pub location: Option<DeviceLocation>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct UpdateDeviceStatusRequest {
    pub status: DeviceStatus,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DeviceCommandRequest {
    pub command: String,
    /// Either key is accepted on the wire.
    #[serde(default)]
    pub payload: Option<serde_json::Value>,
    #[serde(default)]
    pub data: Option<serde_json::Value>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceListFilter {
    pub status: Option<DeviceStatus>,
    pub registration_status: Option<RegistrationStatus>,
    pub is_registered: Option<bool>,
    pub search: Option<String>,
    pub page: Option<i64>,
    pub limit: Option<i64>,
}

/// Totals for `GET /devices/stats`.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceStats {
    pub total: i64,
    pub online: i64,
    pub offline: i64,
    pub registered: i64,
    pub pending: i64,
    pub deleted: i64,
}
