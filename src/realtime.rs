//! Single-process fanout pushing reading, alert, and device-status deltas
//! to connected UI sessions.
//!
//! Each session owns a bounded queue; a session that cannot drain it is
//! dropped rather than blocking the broadcaster. No replay on reconnect —
//! clients reconcile through the query API.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::{RwLock, mpsc};

use crate::models::alert::Alert;
use crate::models::device::{Device, DeviceStatus};
use crate::models::reading::ReadingResponse;

/// Per-session queue depth before the session is disconnected.
const SESSION_QUEUE_DEPTH: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Topic {
    Readings,
    Alerts,
    DeviceStatus,
}

impl Topic {
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim() {
            "readings" => Some(Self::Readings),
            "alerts" => Some(Self::Alerts),
            "deviceStatus" | "device-status" => Some(Self::DeviceStatus),
            _ => None,
        }
    }
}

/// Event frames pushed to sessions as `{type, payload}`.
#[derive(Debug, Clone, serde::Serialize)]
#[serde(tag = "type", content = "payload")]
pub enum Frame {
    #[serde(rename = "sensor:data")]
    SensorData(ReadingResponse),
    #[serde(rename = "alert:new")]
    AlertNew(Alert),
    #[serde(rename = "alert:updated")]
    AlertUpdated(Alert),
    #[serde(rename = "alert:resolved")]
    AlertResolved {
        #[serde(rename = "deviceId")]
        device_id: String,
        #[serde(rename = "alertId")]
        alert_id: String,
    },
    #[serde(rename = "device:status")]
    DeviceStatusChanged {
        #[serde(rename = "deviceId")]
        device_id: String,
        status: DeviceStatus,
        device: Option<Device>,
    },
}

impl Frame {
    fn topic(&self) -> Topic {
        match self {
            Self::SensorData(_) => Topic::Readings,
            Self::AlertNew(_) | Self::AlertUpdated(_) | Self::AlertResolved { .. } => Topic::Alerts,
            Self::DeviceStatusChanged { .. } => Topic::DeviceStatus,
        }
    }
}

struct Session {
    topics: HashSet<Topic>,
    tx: mpsc::Sender<Frame>,
}

/// Fanout hub. Membership behind an `RwLock`; sends never block — a full
/// queue marks the session for removal.
#[derive(Default)]
pub struct Fanout {
    sessions: RwLock<HashMap<u64, Session>>,
    next_id: AtomicU64,
}

impl Fanout {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a session with a fixed topic set; subscriptions do not
    /// change after setup. Returns the session id and its frame stream.
    pub async fn subscribe(&self, topics: HashSet<Topic>) -> (u64, mpsc::Receiver<Frame>) {
        let (tx, rx) = mpsc::channel(SESSION_QUEUE_DEPTH);
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.sessions
            .write()
            .await
            .insert(id, Session { topics, tx });
        (id, rx)
    }

    pub async fn unsubscribe(&self, id: u64) {
        self.sessions.write().await.remove(&id);
    }

    pub async fn session_count(&self) -> usize {
        self.sessions.read().await.len()
    }

    async fn broadcast(&self, frame: Frame) {
        let topic = frame.topic();
        let mut dropped: Vec<u64> = Vec::new();
        {
            let sessions = self.sessions.read().await;
            for (id, session) in sessions.iter() {
                if !session.topics.contains(&topic) {
                    continue;
                }
                match session.tx.try_send(frame.clone()) {
                    Ok(()) => {}
                    Err(mpsc::error::TrySendError::Full(_))
                    | Err(mpsc::error::TrySendError::Closed(_)) => dropped.push(*id),
                }
            }
        }
        if !dropped.is_empty() {
            let mut sessions = self.sessions.write().await;
            for id in dropped {
                if sessions.remove(&id).is_some() {
                    tracing::warn!(session = id, "realtime session dropped (queue full)");
                }
            }
        }
    }

    pub async fn broadcast_reading(&self, reading: ReadingResponse) {
        self.broadcast(Frame::SensorData(reading)).await;
    }

    pub async fn broadcast_alert_created(&self, alert: Alert) {
        self.broadcast(Frame::AlertNew(alert)).await;
    }

    pub async fn broadcast_alert_updated(&self, alert: Alert) {
        self.broadcast(Frame::AlertUpdated(alert)).await;
    }

    pub async fn broadcast_alert_resolved(&self, device_id: String, alert_id: String) {
        self.broadcast(Frame::AlertResolved {
            device_id,
            alert_id,
        })
        .await;
    }

    pub async fn broadcast_device_status(
        &self,
        device_id: String,
        status: DeviceStatus,
        device: Option<Device>,
    ) {
        self.broadcast(Frame::DeviceStatusChanged {
            device_id,
            status,
            device,
        })
        .await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn reading_frame(device: &str) -> ReadingResponse {
        ReadingResponse {
            id: uuid::Uuid::new_v4().to_string(),
            device_id: device.to_string(),
            timestamp: "2026-03-01T10:00:00.000Z".to_string(),
            ph: Some(7.0),
            turbidity: Some(1.0),
            tds: Some(200.0),
            ph_valid: true,
            turbidity_valid: true,
            tds_valid: true,
        }
    }

    #[tokio::test]
    async fn delivers_only_subscribed_topics() {
        let fanout = Fanout::new();
        let (_, mut rx) = fanout
            .subscribe(HashSet::from([Topic::DeviceStatus]))
            .await;
        fanout.broadcast_reading(reading_frame("D1")).await;
        fanout
            .broadcast_device_status("D1".into(), DeviceStatus::Offline, None)
            .await;
        let frame = rx.recv().await.unwrap();
        assert!(matches!(frame, Frame::DeviceStatusChanged { .. }));
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn per_session_order_is_broadcast_order() {
        let fanout = Fanout::new();
        let (_, mut rx) = fanout.subscribe(HashSet::from([Topic::Readings])).await;
        for i in 0..5 {
            let mut r = reading_frame("D1");
            r.tds = Some(i as f64);
            fanout.broadcast_reading(r).await;
        }
        for i in 0..5 {
            match rx.recv().await.unwrap() {
                Frame::SensorData(r) => assert_eq!(r.tds, Some(i as f64)),
                other => panic!("unexpected frame {other:?}"),
            }
        }
    }

    #[tokio::test]
    async fn slow_session_is_dropped_not_blocked() {
        let fanout = Fanout::new();
        let (_, mut rx_kept) = fanout.subscribe(HashSet::from([Topic::Readings])).await;
        let (_, rx_slow) = fanout.subscribe(HashSet::from([Topic::Readings])).await;
        // The healthy session drains; the slow one never does.
        for _ in 0..(SESSION_QUEUE_DEPTH + 1) {
            fanout.broadcast_reading(reading_frame("D1")).await;
            let _ = rx_kept.recv().await;
        }
        assert_eq!(fanout.session_count().await, 1);
        drop(rx_slow);
    }

    #[tokio::test]
    async fn frame_wire_shape() {
        let frame = Frame::AlertResolved {
            device_id: "D1".into(),
            alert_id: "A1".into(),
        };
        let v = serde_json::to_value(&frame).unwrap();
        assert_eq!(v["type"], "alert:resolved");
        assert_eq!(v["payload"]["deviceId"], "D1");
    }
}
