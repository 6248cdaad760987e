use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::Json;
use axum::extract::State;
use serde_json::{Value, json};
use tokio::sync::Mutex;

use crate::AppState;

const CACHE_TTL: Duration = Duration::from_secs(5);

/// Cached `/health` snapshot; probes run at most once per TTL.
#[derive(Clone, Default)]
pub struct HealthCache(Arc<Mutex<Option<(Instant, Value)>>>);

pub async fn health(State(state): State<AppState>) -> Json<Value> {
    let mut cache = state.health.0.lock().await;
    if let Some((at, value)) = cache.as_ref()
        && at.elapsed() < CACHE_TTL
    {
        return Json(value.clone());
    }
    let snapshot = compute(&state);
    *cache = Some((Instant::now(), snapshot.clone()));
    Json(snapshot)
}

fn compute(state: &AppState) -> Value {
    let database_ok = state.store.ping();
    let broker = state.bridge.snapshot();
    let overall = if database_ok && broker.connected {
        "ok"
    } else if database_ok {
        "degraded"
    } else {
        "unhealthy"
    };
    json!({
        "overallStatus": overall,
        "cpu": cpu_snapshot(),
        "memory": memory_snapshot(),
        "storage": { "databaseBytes": state.store.storage_bytes() },
        "database": { "ok": database_ok },
        "broker": broker,
    })
}

fn cpu_snapshot() -> Value {
    let loadavg = std::fs::read_to_string("/proc/loadavg")
        .ok()
        .and_then(|s| {
            s.split_whitespace()
                .next()
                .and_then(|f| f.parse::<f64>().ok())
        });
    json!({ "load1": loadavg })
}

fn memory_snapshot() -> Value {
    let meminfo = std::fs::read_to_string("/proc/meminfo").unwrap_or_default();
    let field = |name: &str| {
        meminfo
            .lines()
            .find(|l| l.starts_with(name))
            .and_then(|l| l.split_whitespace().nth(1))
            .and_then(|kb| kb.parse::<u64>().ok())
            .map(|kb| kb * 1024)
    };
    json!({
        "totalBytes": field("MemTotal:"),
        "availableBytes": field("MemAvailable:"),
    })
}
