use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::{Router, routing::delete, routing::get, routing::patch, routing::post};
use tower_http::compression::CompressionLayer;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing_subscriber::EnvFilter;

use hydrowatch_api::alert_engine::AlertEngine;
use hydrowatch_api::bridge::{self, BridgeHandle};
use hydrowatch_api::config::HydroConfig;
use hydrowatch_api::handlers;
use hydrowatch_api::notifier::{self, SmtpConfig};
use hydrowatch_api::object_store::FsObjectStore;
use hydrowatch_api::realtime::Fanout;
use hydrowatch_api::registry::DeviceRegistry;
use hydrowatch_api::render::RendererStack;
use hydrowatch_api::report_builder::ReportBuilder;
use hydrowatch_api::scheduler::Scheduler;
use hydrowatch_api::store::{Store, iso_from, now_iso};
use hydrowatch_api::AppState;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| {
            EnvFilter::new("hydrowatch_api=debug,tower_http=debug")
        }))
        .init();

    let config_path =
        std::env::var("HYDROWATCH_CONFIG").unwrap_or_else(|_| "./hydrowatch.toml".to_string());
    let config = Arc::new(HydroConfig::load(&config_path)?);

    let db_path =
        std::env::var("HYDROWATCH_DB").unwrap_or_else(|_| "./hydrowatch.db".to_string());
    let store = Arc::new(Store::open(&db_path)?);
    tracing::info!("store opened at {db_path}");

    let fanout = Arc::new(Fanout::new());

    // Outbound broker handle first; the registry publishes through it.
    let (bridge_handle, outbound_rx) = BridgeHandle::channel(
        config.broker.publish_buffer,
        config.broker.breaker_min_success_ratio,
        Duration::from_secs(config.broker.breaker_cooldown_secs),
    );

    let registry = Arc::new(DeviceRegistry::new(
        Arc::clone(&store),
        Arc::clone(&fanout),
        bridge_handle.clone(),
        config.devices.offline_threshold_secs,
        config.devices.recovery_window_days,
    ));

    let notifier = notifier::spawn(
        Arc::clone(&store),
        SmtpConfig::from_env(),
        config.notifications.clone(),
    );

    let alerts = Arc::new(AlertEngine::new(
        Arc::clone(&store),
        Arc::clone(&fanout),
        notifier,
        config.thresholds.clone(),
        config.alerts.clone(),
        config.devices.recovery_window_days,
    ));

    bridge::spawn_bridge(
        config.broker.clone(),
        bridge_handle.clone(),
        outbound_rx,
        bridge::BridgeDeps {
            store: Arc::clone(&store),
            registry: Arc::clone(&registry),
            alerts: Arc::clone(&alerts),
            fanout: Arc::clone(&fanout),
        },
    );

    let reports = ReportBuilder::spawn(
        Arc::clone(&store),
        Arc::new(RendererStack::new(config.reports.renderer_url.clone())),
        Arc::new(FsObjectStore::new(&config.reports.dir)?),
        config.thresholds.clone(),
        &config.reports,
    );

    // Periodic jobs: offline sweep, retention, tombstone purge, report expiry.
    let mut scheduler = Scheduler::new();
    {
        let registry = Arc::clone(&registry);
        scheduler.register(
            "offline-sweep",
            Duration::from_secs(15),
            Duration::from_secs(config.devices.offline_sweep_interval_secs),
            move || {
                let registry = Arc::clone(&registry);
                Box::pin(async move { Ok(registry.sweep_offline().await?) })
            },
        );
    }
    {
        let store = Arc::clone(&store);
        let retain_days = config.retention.readings_days;
        scheduler.register(
            "reading-retention",
            Duration::from_secs(60),
            Duration::from_secs(config.retention.sweep_interval_secs),
            move || {
                let store = Arc::clone(&store);
                Box::pin(async move {
                    let cutoff = iso_from(chrono::Utc::now() - chrono::Duration::days(retain_days));
                    store.delete_readings_before(&cutoff)
                })
            },
        );
    }
    {
        let store = Arc::clone(&store);
        scheduler.register(
            "tombstone-purge",
            Duration::from_secs(120),
            Duration::from_secs(config.retention.purge_interval_secs),
            move || {
                let store = Arc::clone(&store);
                Box::pin(async move {
                    let now = now_iso();
                    let mut purged = store.purge_deleted_readings(&now)?;
                    purged += store.purge_deleted_alerts(&now)?;
                    purged += store.purge_deleted_devices(&now)?;
                    Ok(purged)
                })
            },
        );
    }
    {
        let reports = Arc::clone(&reports);
        scheduler.register(
            "report-expiry",
            Duration::from_secs(90),
            Duration::from_secs(config.reports.expiry_sweep_interval_secs),
            move || {
                let reports = Arc::clone(&reports);
                Box::pin(async move { reports.sweep_expired().await })
            },
        );
    }
    scheduler.spawn_all();

    let state = AppState {
        config: Arc::clone(&config),
        store,
        registry,
        alerts,
        fanout,
        bridge: bridge_handle,
        reports,
        health: Default::default(),
    };

    let app = Router::new()
        // Devices
        .route(
            "/api/v1/devices",
            get(handlers::devices::list_devices),
        )
        .route("/api/v1/devices/register", post(handlers::devices::register_device))
        .route("/api/v1/devices/deleted", get(handlers::devices::deleted_devices))
        .route("/api/v1/devices/stats", get(handlers::devices::device_stats))
        .route("/api/v1/devices/pending", get(handlers::devices::pending_devices))
        .route("/api/v1/devices/check-offline", post(handlers::devices::check_offline))
        .route(
            "/api/v1/devices/{id}",
            get(handlers::devices::get_device)
                .patch(handlers::devices::update_device)
                .delete(handlers::devices::delete_device),
        )
        .route(
            "/api/v1/devices/{id}/approve",
            patch(handlers::devices::approve_device),
        )
        .route(
            "/api/v1/devices/{id}/status",
            patch(handlers::devices::update_device_status),
        )
        .route(
            "/api/v1/devices/{id}/command",
            post(handlers::devices::send_command),
        )
        .route(
            "/api/v1/devices/{id}/send-now",
            post(handlers::devices::send_now),
        )
        .route(
            "/api/v1/devices/{id}/recover",
            post(handlers::devices::recover_device),
        )
        // Alerts
        .route("/api/v1/alerts", get(handlers::alerts::list_alerts))
        .route("/api/v1/alerts/statistics", get(handlers::alerts::alert_statistics))
        .route(
            "/api/v1/alerts/unacknowledged/count",
            get(handlers::alerts::unacknowledged_count),
        )
        .route(
            "/api/v1/alerts/device/{id}",
            get(handlers::alerts::device_alerts),
        )
        .route("/api/v1/alerts/resolve-all", patch(handlers::alerts::resolve_all))
        .route(
            "/api/v1/alerts/{id}/acknowledge",
            patch(handlers::alerts::acknowledge_alert),
        )
        .route(
            "/api/v1/alerts/{id}/resolve",
            patch(handlers::alerts::resolve_alert),
        )
        .route("/api/v1/alerts/{id}", delete(handlers::alerts::delete_alert))
        // Sensor readings
        .route(
            "/api/v1/sensor-readings",
            get(handlers::readings::list_readings).post(handlers::readings::create_reading),
        )
        .route(
            "/api/v1/sensor-readings/statistics",
            get(handlers::readings::reading_statistics),
        )
        .route(
            "/api/v1/sensor-readings/aggregated",
            get(handlers::readings::aggregated_readings),
        )
        .route(
            "/api/v1/sensor-readings/count",
            get(handlers::readings::count_readings),
        )
        .route(
            "/api/v1/sensor-readings/bulk",
            post(handlers::readings::bulk_create_readings),
        )
        .route(
            "/api/v1/sensor-readings/old",
            delete(handlers::readings::delete_old_readings),
        )
        // Reports
        .route(
            "/api/v1/reports",
            get(handlers::reports::list_reports).post(handlers::reports::create_report),
        )
        .route(
            "/api/v1/reports/expired",
            delete(handlers::reports::delete_expired_reports),
        )
        .route(
            "/api/v1/reports/statistics",
            get(handlers::reports::report_statistics),
        )
        .route(
            "/api/v1/reports/{id}",
            get(handlers::reports::get_report).delete(handlers::reports::delete_report),
        )
        .route(
            "/api/v1/reports/{id}/download",
            get(handlers::reports::download_report),
        )
        // Analytics
        .route("/api/v1/analytics/summary", get(handlers::analytics::summary))
        .route("/api/v1/analytics/trends", get(handlers::analytics::trends))
        .route(
            "/api/v1/analytics/parameters",
            get(handlers::analytics::parameters),
        )
        // Realtime push
        .route("/api/v1/ws", get(handlers::ws::ws_handler))
        // Health
        .route("/health", get(handlers::health::health))
        .layer(CorsLayer::permissive())
        .layer(CompressionLayer::new())
        .layer(TraceLayer::new_for_http())
        .with_state(state);

    let port: u16 = std::env::var("HYDROWATCH_PORT")
        .ok()
        .and_then(|p| p.parse().ok())
        .unwrap_or(8080);
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    tracing::info!("hydrowatch-api listening on {addr}");

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            tracing::info!("shutdown signal received");
        })
        .await?;

    Ok(())
}
