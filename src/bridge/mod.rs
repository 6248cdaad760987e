//! MQTT bridge: session maintenance, inbound routing, outbound publishing.
//!
//! Inbound messages are routed by topic family to a worker pool; a device id
//! always hashes to the same worker, so one device's stream is handled
//! serially while devices proceed in parallel. Outbound publishes flow
//! through a bounded queue owned by a single publisher task, guarded by a
//! circuit breaker over the trailing publish outcomes.

mod ingest;

pub use ingest::{BridgeDeps, build_reading, spawn_bridge};

use std::collections::VecDeque;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::mpsc;

use crate::error::ApiError;

pub const TOPIC_REGISTRATION: &str = "device/registration/+";
pub const TOPIC_SENSORDATA: &str = "device/sensordata/+";
pub const TOPIC_STATUS: &str = "device/status/+";
pub const TOPIC_DISCOVERY_REQUEST: &str = "device/discovery/request";

pub fn command_topic(device_id: &str) -> String {
    format!("device/command/{device_id}")
}

/// Counters surfaced by `/health`.
#[derive(Default)]
pub struct BridgeCounters {
    pub received: AtomicU64,
    pub published: AtomicU64,
    pub failed: AtomicU64,
    pub flushes: AtomicU64,
    pub connected: AtomicBool,
}

#[derive(Debug, Clone, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CountersSnapshot {
    pub received: u64,
    pub published: u64,
    pub failed: u64,
    pub flushes: u64,
    pub circuit_breaker_open: bool,
    pub connected: bool,
}

/// Latch over the trailing publish window. While open, publishes fail fast;
/// after the cooldown one probe publish is let through (half-open).
pub struct CircuitBreaker {
    inner: Mutex<BreakerInner>,
    window: usize,
    min_samples: usize,
    min_success_ratio: f64,
    cooldown: Duration,
}

struct BreakerInner {
    outcomes: VecDeque<bool>,
    opened_at: Option<Instant>,
}

impl CircuitBreaker {
    pub fn new(min_success_ratio: f64, cooldown: Duration) -> Self {
        Self {
            inner: Mutex::new(BreakerInner {
                outcomes: VecDeque::new(),
                opened_at: None,
            }),
            window: 20,
            min_samples: 5,
            min_success_ratio,
            cooldown,
        }
    }

    pub fn record(&self, ok: bool) {
        let mut inner = match self.inner.lock() {
            Ok(g) => g,
            Err(p) => p.into_inner(),
        };
        if ok && inner.opened_at.is_some() {
            // Probe succeeded; close and start a fresh window.
            inner.opened_at = None;
            inner.outcomes.clear();
        }
        inner.outcomes.push_back(ok);
        while inner.outcomes.len() > self.window {
            inner.outcomes.pop_front();
        }
        if inner.opened_at.is_none() && inner.outcomes.len() >= self.min_samples {
            let successes = inner.outcomes.iter().filter(|o| **o).count();
            let ratio = successes as f64 / inner.outcomes.len() as f64;
            if ratio < self.min_success_ratio {
                inner.opened_at = Some(Instant::now());
                tracing::warn!(ratio, "broker circuit breaker opened");
            }
        }
    }

    /// True while open and still inside the cooldown; past the cooldown the
    /// breaker half-opens and lets publishes probe the broker.
    pub fn is_open(&self) -> bool {
        let inner = match self.inner.lock() {
            Ok(g) => g,
            Err(p) => p.into_inner(),
        };
        match inner.opened_at {
            Some(at) => at.elapsed() < self.cooldown,
            None => false,
        }
    }

    fn is_latched(&self) -> bool {
        let inner = match self.inner.lock() {
            Ok(g) => g,
            Err(p) => p.into_inner(),
        };
        inner.opened_at.is_some()
    }
}

pub struct OutboundMessage {
    pub topic: String,
    pub payload: Vec<u8>,
}

/// Cloneable handle for outbound publishing and counter snapshots.
#[derive(Clone)]
pub struct BridgeHandle {
    tx: mpsc::Sender<OutboundMessage>,
    pub counters: Arc<BridgeCounters>,
    pub breaker: Arc<CircuitBreaker>,
}

impl BridgeHandle {
    /// Build the handle and the queue consumed by the publisher task.
    pub fn channel(
        buffer: usize,
        min_success_ratio: f64,
        cooldown: Duration,
    ) -> (Self, mpsc::Receiver<OutboundMessage>) {
        let (tx, rx) = mpsc::channel(buffer);
        let handle = Self {
            tx,
            counters: Arc::new(BridgeCounters::default()),
            breaker: Arc::new(CircuitBreaker::new(min_success_ratio, cooldown)),
        };
        (handle, rx)
    }

    /// Enqueue a publish. Fails fast while the circuit is open or the
    /// buffer is full; actual delivery is the publisher task's job.
    pub fn publish(&self, topic: &str, payload: &serde_json::Value) -> Result<(), ApiError> {
        if self.breaker.is_open() {
            return Err(ApiError::Unavailable("broker circuit open".to_string()));
        }
        let body = serde_json::to_vec(payload)
            .map_err(|e| ApiError::Internal(anyhow::anyhow!("encode publish payload: {e}")))?;
        let msg = OutboundMessage {
            topic: topic.to_string(),
            payload: body,
        };
        match self.tx.try_send(msg) {
            Ok(()) => Ok(()),
            Err(_) => {
                self.counters.failed.fetch_add(1, Ordering::Relaxed);
                self.breaker.record(false);
                Err(ApiError::Unavailable("publish buffer full".to_string()))
            }
        }
    }

    /// Best-effort variant: failure is logged, not returned.
    pub fn publish_best_effort(&self, topic: &str, payload: &serde_json::Value) {
        if let Err(e) = self.publish(topic, payload) {
            tracing::warn!(topic, "command publish dropped: {e}");
        }
    }

    pub fn snapshot(&self) -> CountersSnapshot {
        CountersSnapshot {
            received: self.counters.received.load(Ordering::Relaxed),
            published: self.counters.published.load(Ordering::Relaxed),
            failed: self.counters.failed.load(Ordering::Relaxed),
            flushes: self.counters.flushes.load(Ordering::Relaxed),
            circuit_breaker_open: self.breaker.is_latched(),
            connected: self.counters.connected.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn breaker_opens_below_ratio_and_half_opens() {
        let breaker = CircuitBreaker::new(0.5, Duration::from_millis(10));
        for _ in 0..5 {
            breaker.record(false);
        }
        assert!(breaker.is_open());
        std::thread::sleep(Duration::from_millis(15));
        // Cooldown elapsed: half-open, publishes may probe.
        assert!(!breaker.is_open());
        assert!(breaker.is_latched());
        breaker.record(true);
        assert!(!breaker.is_latched());
    }

    #[test]
    fn breaker_stays_closed_on_mixed_success() {
        let breaker = CircuitBreaker::new(0.5, Duration::from_secs(30));
        for i in 0..20 {
            breaker.record(i % 3 != 0); // ~66% success
        }
        assert!(!breaker.is_open());
    }

    #[tokio::test]
    async fn publish_fails_fast_when_open() {
        let (handle, _rx) = BridgeHandle::channel(4, 0.5, Duration::from_secs(30));
        for _ in 0..5 {
            handle.breaker.record(false);
        }
        let err = handle
            .publish("device/command/D1", &serde_json::json!({"command": "go"}))
            .unwrap_err();
        assert!(matches!(err, ApiError::Unavailable(_)));
    }

    #[tokio::test]
    async fn full_buffer_counts_failed() {
        let (handle, rx) = BridgeHandle::channel(1, 0.0, Duration::from_secs(30));
        let payload = serde_json::json!({"command": "go"});
        handle.publish("t", &payload).unwrap();
        let err = handle.publish("t", &payload).unwrap_err();
        assert!(matches!(err, ApiError::Unavailable(_)));
        assert_eq!(handle.snapshot().failed, 1);
        drop(rx);
    }
}
