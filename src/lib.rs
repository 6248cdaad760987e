pub mod aggregate;
pub mod alert_engine;
pub mod auth;
pub mod bridge;
pub mod config;
pub mod error;
pub mod handlers;
pub mod models;
pub mod notifier;
pub mod object_store;
pub mod realtime;
pub mod registry;
pub mod render;
pub mod report_builder;
pub mod scheduler;
pub mod store;

use std::sync::Arc;

use alert_engine::AlertEngine;
use bridge::BridgeHandle;
use config::HydroConfig;
use handlers::health::HealthCache;
use realtime::Fanout;
use registry::DeviceRegistry;
use report_builder::ReportBuilder;
use store::Store;

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<HydroConfig>,
    pub store: Arc<Store>,
    pub registry: Arc<DeviceRegistry>,
    pub alerts: Arc<AlertEngine>,
    pub fanout: Arc<Fanout>,
    pub bridge: BridgeHandle,
    pub reports: Arc<ReportBuilder>,
    pub health: HealthCache,
}
