//! Best-effort alert notifications: email over SMTP and an optional
//! webhook. Jobs are queued fire-and-forget; failures are logged and
//! reflected in the alert's `email_sent` flag, never propagated.

use std::sync::Arc;

use lettre::message::header::ContentType;
use lettre::transport::smtp::authentication::Credentials;
use lettre::{AsyncSmtpTransport, AsyncTransport, Message, Tokio1Executor};
use tokio::sync::mpsc;

use crate::config::NotificationConfig;
use crate::models::alert::Alert;
use crate::store::Store;

#[derive(Debug, Clone)]
pub struct SmtpConfig {
    pub host: Option<String>,
    pub port: u16,
    pub user: Option<String>,
    pub pass: Option<String>,
    pub from: String,
}

impl SmtpConfig {
    pub fn from_env() -> Self {
        Self {
            host: std::env::var("HYDROWATCH_SMTP_HOST").ok(),
            port: std::env::var("HYDROWATCH_SMTP_PORT")
                .ok()
                .and_then(|p| p.parse().ok())
                .unwrap_or(587),
            user: std::env::var("HYDROWATCH_SMTP_USER").ok(),
            pass: std::env::var("HYDROWATCH_SMTP_PASS").ok(),
            from: std::env::var("HYDROWATCH_SMTP_FROM")
                .unwrap_or_else(|_| "hydrowatch@localhost".to_string()),
        }
    }
}

fn build_smtp_transport(cfg: &SmtpConfig) -> Option<AsyncSmtpTransport<Tokio1Executor>> {
    let host = cfg.host.as_deref()?;
    let mut builder = AsyncSmtpTransport::<Tokio1Executor>::relay(host).ok()?;
    builder = builder.port(cfg.port);
    if let (Some(user), Some(pass)) = (&cfg.user, &cfg.pass) {
        builder = builder.credentials(Credentials::new(user.clone(), pass.clone()));
    }
    Some(builder.build())
}

/// Handle for enqueueing notification jobs. Never blocks the caller.
#[derive(Clone)]
pub struct Notifier {
    tx: mpsc::UnboundedSender<Alert>,
}

impl Notifier {
    pub fn notify(&self, alert: Alert) {
        let _ = self.tx.send(alert);
    }

    /// A notifier whose jobs go nowhere; used by tests.
    pub fn disabled() -> Self {
        let (tx, _rx) = mpsc::unbounded_channel();
        Self { tx }
    }
}

/// Spawn the background notification worker and return the handle.
pub fn spawn(store: Arc<Store>, smtp: SmtpConfig, cfg: NotificationConfig) -> Notifier {
    let (tx, rx) = mpsc::unbounded_channel();
    tokio::spawn(notify_worker(rx, store, smtp, cfg));
    Notifier { tx }
}

async fn notify_worker(
    mut rx: mpsc::UnboundedReceiver<Alert>,
    store: Arc<Store>,
    smtp: SmtpConfig,
    cfg: NotificationConfig,
) {
    let http_client = reqwest::Client::new();
    let transport = build_smtp_transport(&smtp);
    if transport.is_some() {
        tracing::info!("notifier: SMTP configured for email notifications");
    }
    while let Some(alert) = rx.recv().await {
        let subject = format!(
            "[HydroWatch] {} alert: {} on {}",
            alert.severity.as_str(),
            alert.parameter.label(),
            alert.device_id,
        );
        let body = format!(
            "{}\n\nvalue: {}{unit}\nthreshold: {}{unit}\noccurred: {}",
            alert.message,
            alert.value,
            alert.threshold,
            alert.first_occurrence,
            unit = alert.parameter.unit(),
        );

        if let (Some(transport), Some(to_addr)) = (&transport, cfg.email_to.as_deref()) {
            let sent = send_email(transport, &smtp.from, to_addr, &subject, &body).await;
            if let Err(e) = store.mark_email_sent(&alert.id, sent) {
                tracing::warn!(alert = %alert.id, "failed to record email_sent: {e}");
            }
        }

        if let Some(url) = cfg.webhook_url.as_deref() {
            let payload = serde_json::json!({
                "alertId": alert.id,
                "deviceId": alert.device_id,
                "parameter": alert.parameter.label(),
                "severity": alert.severity.as_str(),
                "value": alert.value,
                "threshold": alert.threshold,
                "message": alert.message,
            });
            if let Err(e) = http_client.post(url).json(&payload).send().await {
                tracing::warn!(alert = %alert.id, "webhook notification failed: {e}");
            }
        }
    }
}

async fn send_email(
    transport: &AsyncSmtpTransport<Tokio1Executor>,
    from: &str,
    to: &str,
    subject: &str,
    body: &str,
) -> bool {
    let Ok(from) = from.parse() else {
        tracing::warn!("notifier: bad from address {from}");
        return false;
    };
    let Ok(to_addr) = to.parse() else {
        tracing::warn!("notifier: bad recipient address {to}");
        return false;
    };
    let email = match Message::builder()
        .from(from)
        .to(to_addr)
        .subject(subject)
        .header(ContentType::TEXT_PLAIN)
        .body(body.to_string())
    {
        Ok(email) => email,
        Err(e) => {
            tracing::warn!("notifier: failed to build email: {e}");
            return false;
        }
    };
    match transport.send(email).await {
        Ok(_) => true,
        Err(e) => {
            tracing::warn!("notifier: email to {to} failed: {e}");
            false
        }
    }
}
