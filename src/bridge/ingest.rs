//! Broker session and inbound message handling.

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::Duration;

use rand::Rng;
use rumqttc::{AsyncClient, Event, LastWill, MqttOptions, Packet, QoS};
use tokio::sync::mpsc;

use super::{
    BridgeHandle, OutboundMessage, TOPIC_DISCOVERY_REQUEST, TOPIC_REGISTRATION, TOPIC_SENSORDATA,
    TOPIC_STATUS,
};
use crate::alert_engine::AlertEngine;
use crate::config::BrokerConfig;
use crate::models::device::{DeviceStatus, RegisterDeviceRequest};
use crate::models::reading::{IncomingReading, Reading};
use crate::realtime::Fanout;
use crate::registry::DeviceRegistry;
use crate::store::{Store, now_iso};

/// Queue depth per ingest worker before backpressure kicks in.
const WORKER_QUEUE_DEPTH: usize = 128;

pub struct BridgeDeps {
    pub store: Arc<Store>,
    pub registry: Arc<DeviceRegistry>,
    pub alerts: Arc<AlertEngine>,
    pub fanout: Arc<Fanout>,
}

enum Job {
    SensorData { device_id: String, payload: Vec<u8> },
    Registration { payload: Vec<u8> },
    Status { device_id: String, payload: Vec<u8> },
}

/// Spawn the publisher, ingest workers, and broker event loop.
pub fn spawn_bridge(
    cfg: BrokerConfig,
    handle: BridgeHandle,
    outbound_rx: mpsc::Receiver<OutboundMessage>,
    deps: BridgeDeps,
) {
    let mut options = MqttOptions::new(cfg.client_id.clone(), cfg.host.clone(), cfg.port);
    options.set_keep_alive(Duration::from_secs(30));
    options.set_clean_session(false);
    options.set_last_will(LastWill::new(
        "device/bridge/status",
        b"offline".to_vec(),
        QoS::AtLeastOnce,
        false,
    ));
    if let (Some(user), Some(pass)) = (cfg.username.clone(), cfg.password.clone()) {
        options.set_credentials(user, pass);
        tracing::info!("broker: using password authentication");
    }

    let (client, mut eventloop) = AsyncClient::new(options, 20);

    // Single-writer publisher draining the bounded outbound queue.
    {
        let client = client.clone();
        let handle = handle.clone();
        let mut rx = outbound_rx;
        tokio::spawn(async move {
            while let Some(msg) = rx.recv().await {
                match client
                    .publish(msg.topic.clone(), QoS::AtLeastOnce, false, msg.payload)
                    .await
                {
                    Ok(()) => {
                        handle.counters.published.fetch_add(1, Ordering::Relaxed);
                        handle.breaker.record(true);
                    }
                    Err(e) => {
                        tracing::warn!(topic = %msg.topic, "publish failed: {e}");
                        handle.counters.failed.fetch_add(1, Ordering::Relaxed);
                        handle.breaker.record(false);
                    }
                }
                if rx.is_empty() {
                    handle.counters.flushes.fetch_add(1, Ordering::Relaxed);
                }
            }
        });
    }

    // Ingest worker pool; device id hashes pin a device to one worker.
    let workers: Vec<mpsc::Sender<Job>> = (0..cfg.ingest_workers.max(1))
        .map(|worker| {
            let (tx, mut rx) = mpsc::channel::<Job>(WORKER_QUEUE_DEPTH);
            let deps = BridgeDeps {
                store: Arc::clone(&deps.store),
                registry: Arc::clone(&deps.registry),
                alerts: Arc::clone(&deps.alerts),
                fanout: Arc::clone(&deps.fanout),
            };
            let handle = handle.clone();
            let deadline = Duration::from_secs(cfg.message_deadline_secs);
            tokio::spawn(async move {
                while let Some(job) = rx.recv().await {
                    match tokio::time::timeout(deadline, handle_job(&deps, job)).await {
                        Ok(Ok(())) => {}
                        Ok(Err(e)) => {
                            tracing::warn!(worker, "message handling failed: {e:#}");
                            handle.counters.failed.fetch_add(1, Ordering::Relaxed);
                        }
                        Err(_) => {
                            tracing::warn!(worker, "message handling deadline exceeded");
                            handle.counters.failed.fetch_add(1, Ordering::Relaxed);
                        }
                    }
                }
            });
            tx
        })
        .collect();

    // Broker event loop: route publishes, re-subscribe on every reconnect.
    tokio::spawn(async move {
        loop {
            match eventloop.poll().await {
                Ok(Event::Incoming(Packet::ConnAck(_))) => {
                    handle.counters.connected.store(true, Ordering::Relaxed);
                    tracing::info!("broker connected");
                    for topic in [TOPIC_REGISTRATION, TOPIC_SENSORDATA, TOPIC_STATUS] {
                        if let Err(e) = client.subscribe(topic, QoS::AtLeastOnce).await {
                            tracing::error!(topic, "subscribe failed: {e}");
                        }
                    }
                    handle.publish_best_effort(
                        TOPIC_DISCOVERY_REQUEST,
                        &serde_json::json!({ "requestedAt": now_iso() }),
                    );
                }
                Ok(Event::Incoming(Packet::Publish(publish))) => {
                    handle.counters.received.fetch_add(1, Ordering::Relaxed);
                    route(&handle, &workers, &publish.topic, publish.payload.to_vec());
                }
                Ok(_) => {}
                Err(e) => {
                    if handle.counters.connected.swap(false, Ordering::Relaxed) {
                        tracing::warn!("broker connection lost: {e}");
                    }
                    // Jittered backoff before the next reconnect attempt.
                    let jitter_ms = rand::rng().random_range(0..2_000);
                    tokio::time::sleep(Duration::from_millis(1_000 + jitter_ms)).await;
                }
            }
        }
    });
}

/// Route one inbound publish to its worker. Heartbeat/status traffic is the
/// first to drop under backpressure; sensor data counts as failed instead.
fn route(handle: &BridgeHandle, workers: &[mpsc::Sender<Job>], topic: &str, payload: Vec<u8>) {
    let segments: Vec<&str> = topic.split('/').collect();
    let job = match segments.as_slice() {
        ["device", "sensordata", device_id] => Job::SensorData {
            device_id: (*device_id).to_string(),
            payload,
        },
        ["device", "registration", _] => Job::Registration { payload },
        ["device", "status", device_id] => Job::Status {
            device_id: (*device_id).to_string(),
            payload,
        },
        _ => {
            tracing::debug!(topic, "ignoring unknown topic");
            return;
        }
    };

    let key = match &job {
        Job::SensorData { device_id, .. } | Job::Status { device_id, .. } => device_id.clone(),
        Job::Registration { payload } => serde_json::from_slice::<serde_json::Value>(payload)
            .ok()
            .and_then(|v| {
                v.get("deviceId")
                    .and_then(|d| d.as_str().map(str::to_string))
            })
            .unwrap_or_default(),
    };
    let mut hasher = DefaultHasher::new();
    key.hash(&mut hasher);
    let worker = &workers[(hasher.finish() as usize) % workers.len()];

    let is_status = matches!(job, Job::Status { .. });
    if let Err(mpsc::error::TrySendError::Full(_)) = worker.try_send(job) {
        if is_status {
            // Duplicate heartbeats are the lowest-priority traffic.
            tracing::debug!("ingest queue full, dropping status message");
        } else {
            tracing::warn!("ingest queue full, dropping message");
            handle.counters.failed.fetch_add(1, Ordering::Relaxed);
        }
    }
}

async fn handle_job(deps: &BridgeDeps, job: Job) -> anyhow::Result<()> {
    match job {
        Job::SensorData { device_id, payload } => {
            let incoming: IncomingReading = serde_json::from_slice(&payload)
                .map_err(|e| anyhow::anyhow!("malformed sensor payload: {e}"))?;
            let reading = build_reading(&device_id, incoming)?;

            deps.store.insert_reading(&reading)?;
            if let Err(e) = deps.registry.touch_last_seen(&device_id) {
                tracing::warn!(device = %device_id, "last_seen update failed: {e}");
            }
            let (name, location) = match deps.store.get_device(&device_id)? {
                Some(d) => (d.name, d.location.label()),
                None => (device_id.clone(), String::new()),
            };
            deps.alerts
                .evaluate(&device_id, &name, &location, &reading)
                .await?;
            deps.fanout.broadcast_reading(reading.into()).await;
            Ok(())
        }
        Job::Registration { payload } => {
            let descriptor: RegisterDeviceRequest = serde_json::from_slice(&payload)
                .map_err(|e| anyhow::anyhow!("malformed registration payload: {e}"))?;
            let device = deps.registry.auto_register(&descriptor).await?;
            deps.registry.heartbeat(&device.device_id).await?;
            Ok(())
        }
        Job::Status { device_id, payload } => {
            let status: serde_json::Value = serde_json::from_slice(&payload)
                .map_err(|e| anyhow::anyhow!("malformed status payload: {e}"))?;
            match status.get("status").and_then(|s| s.as_str()) {
                Some("online") => deps.registry.heartbeat(&device_id).await?,
                Some(_) => {
                    if let Err(e) = deps
                        .registry
                        .set_status(&device_id, DeviceStatus::Offline)
                        .await
                    {
                        tracing::debug!(device = %device_id, "status update skipped: {e}");
                    }
                }
                None => anyhow::bail!("status payload missing status field"),
            }
            Ok(())
        }
    }
}

/// Assemble a persistable reading from the wire payload. Values must be
/// finite; a missing `_valid` flag defaults to the value's presence.
pub fn build_reading(device_id: &str, incoming: IncomingReading) -> anyhow::Result<Reading> {
    if device_id.trim().is_empty() {
        anyhow::bail!("deviceId must not be empty");
    }
    for (label, value) in [
        ("pH", incoming.ph),
        ("turbidity", incoming.turbidity),
        ("tds", incoming.tds),
    ] {
        if let Some(v) = value
            && !v.is_finite()
        {
            anyhow::bail!("{label} must be a finite number");
        }
    }
    Ok(Reading {
        id: uuid::Uuid::new_v4().to_string(),
        device_id: device_id.to_string(),
        timestamp_ms: incoming
            .timestamp
            .unwrap_or_else(|| chrono::Utc::now().timestamp_millis()),
        ph: incoming.ph,
        turbidity: incoming.turbidity,
        tds: incoming.tds,
        ph_valid: incoming.ph_valid.unwrap_or(incoming.ph.is_some()),
        turbidity_valid: incoming
            .turbidity_valid
            .unwrap_or(incoming.turbidity.is_some()),
        tds_valid: incoming.tds_valid.unwrap_or(incoming.tds.is_some()),
        is_deleted: false,
        created_at: now_iso(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wire_payload_parses_with_partial_channels() {
        let payload = br#"{"pH": 7.1, "pH_valid": true, "timestamp": 1764583200000}"#;
        let incoming: IncomingReading = serde_json::from_slice(payload).unwrap();
        let reading = build_reading("D1", incoming).unwrap();
        assert_eq!(reading.ph, Some(7.1));
        assert!(reading.ph_valid);
        assert!(reading.turbidity.is_none());
        assert!(!reading.turbidity_valid);
        assert_eq!(reading.timestamp_ms, 1_764_583_200_000);
    }

    #[test]
    fn valid_flag_defaults_to_presence() {
        let incoming = IncomingReading {
            ph: Some(6.8),
            turbidity: Some(2.0),
            turbidity_valid: Some(false),
            ..Default::default()
        };
        let reading = build_reading("D1", incoming).unwrap();
        assert!(reading.ph_valid);
        assert!(!reading.turbidity_valid);
        assert!(!reading.tds_valid);
    }

    #[test]
    fn non_finite_values_are_rejected() {
        let incoming = IncomingReading {
            ph: Some(f64::NAN),
            ..Default::default()
        };
        assert!(build_reading("D1", incoming).is_err());
        assert!(build_reading("", IncomingReading::default()).is_err());
    }
}
