use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ReportType {
    WaterQuality,
    DeviceStatus,
    Compliance,
    AlertSummary,
}

impl ReportType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::WaterQuality => "water-quality",
            Self::DeviceStatus => "device-status",
            Self::Compliance => "compliance",
            Self::AlertSummary => "alert-summary",
        }
    }

    pub fn from_db(s: &str) -> Self {
        match s {
            "device-status" => Self::DeviceStatus,
            "compliance" => Self::Compliance,
            "alert-summary" => Self::AlertSummary,
            _ => Self::WaterQuality,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReportStatus {
    Generating,
    Completed,
    Failed,
}

impl ReportStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Generating => "generating",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }

    pub fn from_db(s: &str) -> Self {
        match s {
            "completed" => Self::Completed,
            "failed" => Self::Failed,
            _ => Self::Generating,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReportFormat {
    Pdf,
    Csv,
    Xlsx,
}

impl ReportFormat {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pdf => "pdf",
            Self::Csv => "csv",
            Self::Xlsx => "xlsx",
        }
    }

    pub fn from_db(s: &str) -> Self {
        match s {
            "pdf" => Self::Pdf,
            "xlsx" => Self::Xlsx,
            _ => Self::Csv,
        }
    }

    pub fn content_type(&self) -> &'static str {
        match self {
            Self::Pdf => "application/pdf",
            Self::Csv => "text/csv",
            Self::Xlsx => {
                "application/vnd.openxmlformats-officedocument.spreadsheetml.sheet"
            }
        }
    }
}

/// An asynchronously produced artifact bound to a user.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Report {
    pub id: String,
    #[serde(rename = "type")]
    pub report_type: ReportType,
    pub title: String,
    pub description: String,
    pub status: ReportStatus,
    pub format: ReportFormat,
    /// Opaque parameter map: device list, date range, flags.
    pub parameters: serde_json::Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub file: Option<ReportFile>,
    pub generated_by: String,
    pub generated_at: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    pub expires_at: String,
    pub created_at: String,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReportFile {
    pub handle: String,
    pub filename: String,
    pub size: i64,
    pub content_type: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct CreateReportRequest {
    #[serde(rename = "type")]
    pub report_type: ReportType,
    pub title: String,
    #[serde(default)]
    pub description: String,
    pub format: ReportFormat,
    #[serde(default = "default_parameters")]
    pub parameters: serde_json::Value,
}

fn default_parameters() -> serde_json::Value {
    serde_json::json!({})
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ReportListFilter {
    pub status: Option<ReportStatus>,
    #[serde(rename = "type")]
    pub report_type: Option<ReportType>,
    pub page: Option<i64>,
    pub limit: Option<i64>,
}

#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReportStatistics {
    pub total: i64,
    pub generating: i64,
    pub completed: i64,
    pub failed: i64,
    pub total_file_bytes: i64,
}
