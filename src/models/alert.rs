use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Parameter {
    #[serde(rename = "pH")]
    Ph,
    #[serde(rename = "turbidity")]
    Turbidity,
    #[serde(rename = "tds")]
    Tds,
}

impl Parameter {
    pub fn as_db(&self) -> &'static str {
        match self {
            Self::Ph => "ph",
            Self::Turbidity => "turbidity",
            Self::Tds => "tds",
        }
    }

    pub fn from_db(s: &str) -> Self {
        match s {
            "ph" => Self::Ph,
            "turbidity" => Self::Turbidity,
            _ => Self::Tds,
        }
    }

    /// Display name matching the wire casing.
    pub fn label(&self) -> &'static str {
        match self {
            Self::Ph => "pH",
            Self::Turbidity => "turbidity",
            Self::Tds => "tds",
        }
    }

    pub fn unit(&self) -> &'static str {
        match self {
            Self::Ph => "",
            Self::Turbidity => "NTU",
            Self::Tds => "ppm",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Advisory,
    Warning,
    Critical,
}

impl Severity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Advisory => "advisory",
            Self::Warning => "warning",
            Self::Critical => "critical",
        }
    }

    pub fn from_db(s: &str) -> Self {
        match s {
            "critical" => Self::Critical,
            "warning" => Self::Warning,
            _ => Self::Advisory,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AlertStatus {
    Unacknowledged,
    Acknowledged,
    Resolved,
}

impl AlertStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Unacknowledged => "unacknowledged",
            Self::Acknowledged => "acknowledged",
            Self::Resolved => "resolved",
        }
    }

    pub fn from_db(s: &str) -> Self {
        match s {
            "resolved" => Self::Resolved,
            "acknowledged" => Self::Acknowledged,
            _ => Self::Unacknowledged,
        }
    }
}

/// One open or historical incident for one parameter on one device.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Alert {
    pub id: String,
    pub device_id: String,
    pub parameter: Parameter,
    pub severity: Severity,
    /// Value of the first crossing.
    pub value: f64,
    /// The violated regulatory boundary.
    pub threshold: f64,
    /// Value of the most recent crossing merged into this alert.
    pub current_value: f64,
    pub message: String,
    pub status: AlertStatus,
    pub acknowledged: bool,
    pub acknowledged_at: Option<String>,
    pub acknowledged_by: Option<String>,
    pub resolved_at: Option<String>,
    pub resolved_by: Option<String>,
    pub resolution_notes: Option<String>,
    pub occurrence_count: i64,
    pub first_occurrence: String,
    pub last_occurrence: String,
    pub email_sent: bool,
    pub is_deleted: bool,
    pub created_at: String,
    pub updated_at: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AlertListFilter {
    pub device_id: Option<String>,
    pub severity: Option<Severity>,
    pub status: Option<AlertStatus>,
    pub parameter: Option<Parameter>,
    pub acknowledged: Option<bool>,
    pub start_date: Option<String>,
    pub end_date: Option<String>,
    pub page: Option<i64>,
    pub limit: Option<i64>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ResolveRequest {
    #[serde(default)]
    pub notes: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct ResolveAllRequest {
    #[serde(default)]
    pub notes: Option<String>,
    pub severity: Option<Severity>,
    pub parameter: Option<Parameter>,
    pub device_id: Option<String>,
}

/// Totals for `GET /alerts/statistics`, produced in one aggregation pass.
#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AlertStatistics {
    pub total: i64,
    pub by_severity: SeverityCounts,
    pub by_status: StatusCounts,
    pub by_parameter: ParameterCounts,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct SeverityCounts {
    pub advisory: i64,
    pub warning: i64,
    pub critical: i64,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct StatusCounts {
    pub unacknowledged: i64,
    pub acknowledged: i64,
    pub resolved: i64,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct ParameterCounts {
    #[serde(rename = "pH")]
    pub ph: i64,
    pub turbidity: i64,
    pub tds: i64,
}
