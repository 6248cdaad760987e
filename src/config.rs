use serde::Deserialize;
use std::path::Path;

/// Top-level config loaded from `hydrowatch.toml`.
#[derive(Debug, Clone, Deserialize, Default)]
pub struct HydroConfig {
    #[serde(default)]
    pub broker: BrokerConfig,
    #[serde(default)]
    pub thresholds: Thresholds,
    #[serde(default)]
    pub alerts: AlertConfig,
    #[serde(default)]
    pub devices: DeviceConfig,
    #[serde(default)]
    pub retention: RetentionConfig,
    #[serde(default)]
    pub reports: ReportConfig,
    #[serde(default)]
    pub notifications: NotificationConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct BrokerConfig {
    #[serde(default = "default_broker_host")]
    pub host: String,
    #[serde(default = "default_broker_port")]
    pub port: u16,
    #[serde(default = "default_client_id")]
    pub client_id: String,
    pub username: Option<String>,
    pub password: Option<String>,
    /// Bounded in-memory publish buffer.
    #[serde(default = "default_publish_buffer")]
    pub publish_buffer: usize,
    /// Ingest worker pool; a device id always hashes to the same worker.
    #[serde(default = "default_ingest_workers")]
    pub ingest_workers: usize,
    /// Per-message handling deadline in seconds.
    #[serde(default = "default_message_deadline")]
    pub message_deadline_secs: u64,
    /// Publish success ratio below which the circuit breaker opens.
    #[serde(default = "default_breaker_ratio")]
    pub breaker_min_success_ratio: f64,
    /// Seconds the breaker stays open before allowing a probe publish.
    #[serde(default = "default_breaker_cooldown")]
    pub breaker_cooldown_secs: u64,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            host: default_broker_host(),
            port: default_broker_port(),
            client_id: default_client_id(),
            username: None,
            password: None,
            publish_buffer: default_publish_buffer(),
            ingest_workers: default_ingest_workers(),
            message_deadline_secs: default_message_deadline(),
            breaker_min_success_ratio: default_breaker_ratio(),
            breaker_cooldown_secs: default_breaker_cooldown(),
        }
    }
}

fn default_broker_host() -> String {
    "127.0.0.1".to_string()
}

fn default_broker_port() -> u16 {
    1883
}

fn default_client_id() -> String {
    "hydrowatch-api".to_string()
}

fn default_publish_buffer() -> usize {
    512
}

fn default_ingest_workers() -> usize {
    8
}

fn default_message_deadline() -> u64 {
    10
}

fn default_breaker_ratio() -> f64 {
    0.5
}

fn default_breaker_cooldown() -> u64 {
    30
}

/// Regulatory thresholds. The warn band is the regulatory boundary recorded
/// on alerts; crossing the crit band escalates severity.
#[derive(Debug, Clone, Deserialize)]
pub struct Thresholds {
    #[serde(default)]
    pub ph: PhThresholds,
    #[serde(default = "default_turbidity")]
    pub turbidity: UpperThresholds,
    #[serde(default = "default_tds")]
    pub tds: UpperThresholds,
}

impl Default for Thresholds {
    fn default() -> Self {
        Self {
            ph: PhThresholds::default(),
            turbidity: default_turbidity(),
            tds: default_tds(),
        }
    }
}

fn default_turbidity() -> UpperThresholds {
    UpperThresholds {
        warn: 5.0,
        crit: 10.0,
        advisory: None,
    }
}

fn default_tds() -> UpperThresholds {
    UpperThresholds {
        warn: 500.0,
        crit: 1000.0,
        advisory: None,
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct PhThresholds {
    #[serde(default = "default_ph_warn_min")]
    pub warn_min: f64,
    #[serde(default = "default_ph_warn_max")]
    pub warn_max: f64,
    #[serde(default = "default_ph_crit_min")]
    pub crit_min: f64,
    #[serde(default = "default_ph_crit_max")]
    pub crit_max: f64,
    pub advisory_min: Option<f64>,
    pub advisory_max: Option<f64>,
}

impl Default for PhThresholds {
    fn default() -> Self {
        Self {
            warn_min: default_ph_warn_min(),
            warn_max: default_ph_warn_max(),
            crit_min: default_ph_crit_min(),
            crit_max: default_ph_crit_max(),
            advisory_min: None,
            advisory_max: None,
        }
    }
}

fn default_ph_warn_min() -> f64 {
    6.5
}

fn default_ph_warn_max() -> f64 {
    8.5
}

fn default_ph_crit_min() -> f64 {
    6.0
}

fn default_ph_crit_max() -> f64 {
    9.0
}

/// One-sided thresholds for channels that only alert high (turbidity, TDS).
#[derive(Debug, Clone, Deserialize, Default)]
pub struct UpperThresholds {
    pub warn: f64,
    pub crit: f64,
    pub advisory: Option<f64>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AlertConfig {
    /// Cooldown windows per severity, seconds. Critical shortest.
    #[serde(default = "default_cooldown_critical")]
    pub cooldown_critical_secs: i64,
    #[serde(default = "default_cooldown_warning")]
    pub cooldown_warning_secs: i64,
    #[serde(default = "default_cooldown_advisory")]
    pub cooldown_advisory_secs: i64,
}

impl Default for AlertConfig {
    fn default() -> Self {
        Self {
            cooldown_critical_secs: default_cooldown_critical(),
            cooldown_warning_secs: default_cooldown_warning(),
            cooldown_advisory_secs: default_cooldown_advisory(),
        }
    }
}

fn default_cooldown_critical() -> i64 {
    600
}

fn default_cooldown_warning() -> i64 {
    1800
}

fn default_cooldown_advisory() -> i64 {
    3600
}

#[derive(Debug, Clone, Deserialize)]
pub struct DeviceConfig {
    /// A device still `online` with `last_seen` older than this goes offline.
    #[serde(default = "default_offline_threshold")]
    pub offline_threshold_secs: i64,
    #[serde(default = "default_offline_sweep_interval")]
    pub offline_sweep_interval_secs: u64,
    /// Soft-deleted rows become permanently deletable after this many days.
    #[serde(default = "default_recovery_days")]
    pub recovery_window_days: i64,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            offline_threshold_secs: default_offline_threshold(),
            offline_sweep_interval_secs: default_offline_sweep_interval(),
            recovery_window_days: default_recovery_days(),
        }
    }
}

fn default_offline_threshold() -> i64 {
    300
}

fn default_offline_sweep_interval() -> u64 {
    60
}

fn default_recovery_days() -> i64 {
    30
}

#[derive(Debug, Clone, Deserialize)]
pub struct RetentionConfig {
    /// Readings are deleted this many days after their `created_at` clock.
    #[serde(default = "default_readings_days")]
    pub readings_days: i64,
    #[serde(default = "default_retention_interval")]
    pub sweep_interval_secs: u64,
    /// Tombstone purge cadence (soft-deleted rows past their window).
    #[serde(default = "default_purge_interval")]
    pub purge_interval_secs: u64,
}

impl Default for RetentionConfig {
    fn default() -> Self {
        Self {
            readings_days: default_readings_days(),
            sweep_interval_secs: default_retention_interval(),
            purge_interval_secs: default_purge_interval(),
        }
    }
}

fn default_readings_days() -> i64 {
    90
}

fn default_retention_interval() -> u64 {
    6 * 3600
}

fn default_purge_interval() -> u64 {
    3600
}

#[derive(Debug, Clone, Deserialize)]
pub struct ReportConfig {
    /// Root directory of the filesystem object store.
    #[serde(default = "default_report_dir")]
    pub dir: String,
    #[serde(default = "default_report_workers")]
    pub workers: usize,
    #[serde(default = "default_report_expiry")]
    pub expiry_days: i64,
    #[serde(default = "default_expiry_interval")]
    pub expiry_sweep_interval_secs: u64,
    /// External renderer endpoint for pdf/xlsx output. CSV renders locally.
    pub renderer_url: Option<String>,
    /// Cap on readings pulled into a single report bundle.
    #[serde(default = "default_report_readings_cap")]
    pub readings_cap: usize,
}

impl Default for ReportConfig {
    fn default() -> Self {
        Self {
            dir: default_report_dir(),
            workers: default_report_workers(),
            expiry_days: default_report_expiry(),
            expiry_sweep_interval_secs: default_expiry_interval(),
            renderer_url: None,
            readings_cap: default_report_readings_cap(),
        }
    }
}

fn default_report_dir() -> String {
    "./reports".to_string()
}

fn default_report_workers() -> usize {
    2
}

fn default_report_expiry() -> i64 {
    30
}

fn default_expiry_interval() -> u64 {
    3600
}

fn default_report_readings_cap() -> usize {
    50_000
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct NotificationConfig {
    /// Recipient for alert emails. SMTP transport itself comes from env.
    pub email_to: Option<String>,
    /// Optional webhook posted on every new alert.
    pub webhook_url: Option<String>,
}

impl HydroConfig {
    /// Load config from a TOML file. Returns defaults if the file doesn't exist.
    pub fn load(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        if !path.exists() {
            tracing::info!("config file not found at {}, using defaults", path.display());
            return Ok(Self::default());
        }
        let contents = std::fs::read_to_string(path)?;
        let config: HydroConfig = toml::from_str(&contents)?;
        tracing::info!("loaded config from {}", path.display());
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_cover_every_section() {
        let cfg = HydroConfig::default();
        assert_eq!(cfg.thresholds.ph.warn_min, 6.5);
        assert_eq!(cfg.thresholds.turbidity.crit, 10.0);
        assert_eq!(cfg.alerts.cooldown_critical_secs, 600);
        assert_eq!(cfg.devices.offline_threshold_secs, 300);
        assert_eq!(cfg.retention.readings_days, 90);
        assert_eq!(cfg.reports.expiry_days, 30);
    }

    #[test]
    fn partial_toml_falls_back_per_field() {
        let cfg: HydroConfig = toml::from_str(
            r#"
            [thresholds.ph]
            warn_min = 6.0

            [alerts]
            cooldown_critical_secs = 120
            "#,
        )
        .unwrap();
        assert_eq!(cfg.thresholds.ph.warn_min, 6.0);
        assert_eq!(cfg.thresholds.ph.warn_max, 8.5);
        assert_eq!(cfg.alerts.cooldown_critical_secs, 120);
        assert_eq!(cfg.alerts.cooldown_warning_secs, 1800);
        assert_eq!(cfg.broker.port, 1883);
    }
}
