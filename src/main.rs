//! Beacon presence - BLE fingerprint tracking for one room receiver
//!
//! Advertisements arrive on a TCP intake, feed the fingerprint collection, and
//! lifecycle events leave through a bounded channel that is logged as JSON.
//!
//! Module structure:
//! - `domain/` - Core types (MacAddress, Advertisement, DeviceConfig)
//! - `io/` - External interfaces (advert intake, MQTT control, event channel)
//! - `services/` - Filtering, identity matching and the fingerprint collection
//! - `infra/` - Infrastructure (Config, Metrics)

use beacon_presence::infra::{Config, Metrics};
use beacon_presence::io::{create_event_channel, start_advert_listener, start_mqtt_control, AdvertListenerConfig};
use beacon_presence::services::FingerprintCollection;
use beacon_presence::services::Tunables;
use clap::Parser;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};
use tracing_subscriber::fmt::time::UtcTime;
use tracing_subscriber::EnvFilter;

/// Beacon presence - BLE presence detection for a single receiver
#[derive(Parser, Debug)]
#[command(name = "beacon-presence", version, about)]
struct Args {
    /// Path to TOML configuration file (falls back to CONFIG_FILE, then config/dev.toml)
    #[arg(short, long)]
    config: Option<String>,

    /// Emit logs as JSON lines
    #[arg(long)]
    json: bool,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    // RUST_LOG overrides; default INFO
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_timer(UtcTime::rfc_3339())
        .with_target(false);
    if args.json {
        builder.json().init();
    } else {
        builder.init();
    }

    info!(version = env!("CARGO_PKG_VERSION"), git = env!("GIT_HASH"), "beacon-presence starting");

    let config_path = args.config.clone().unwrap_or_else(|| Config::resolve_config_path(&[]));
    let config = Config::load_from_path(&config_path);

    info!(
        config_file = %config.config_file(),
        room = %config.room(),
        mqtt_enabled = %config.mqtt_enabled(),
        mqtt_host = %config.mqtt_host(),
        mqtt_port = %config.mqtt_port(),
        mqtt_prefix = %config.mqtt_prefix(),
        listener_port = %config.listener_port(),
        devices = config.devices().len(),
        "config_loaded"
    );

    let tunables = match config.tunables() {
        Ok(tunables) => tunables,
        Err(e) => {
            warn!(error = %e, "tracking_config_invalid: using defaults");
            Tunables::default()
        }
    };

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let metrics = Arc::new(Metrics::new());

    // Lifecycle events leave the registry lock through a bounded channel
    let (event_sender, mut event_rx) = create_event_channel(config.listener_queue_size());
    let event_sender = event_sender.with_metrics(metrics.clone());

    let collection = Arc::new(
        FingerprintCollection::new(tunables)
            .with_metrics(metrics.clone())
            .with_listener(Arc::new(event_sender))
            .with_devices(config.devices().iter().cloned()),
    );

    // Advertisement intake
    let (advert_tx, mut advert_rx) = mpsc::channel(config.listener_queue_size());
    let listener_config = AdvertListenerConfig {
        bind_address: config.listener_bind_address().to_string(),
        port: config.listener_port(),
        enabled: config.listener_enabled(),
    };
    let listener_metrics = metrics.clone();
    let listener_shutdown = shutdown_rx.clone();
    tokio::spawn(async move {
        if let Err(e) = start_advert_listener(listener_config, advert_tx, listener_metrics, listener_shutdown).await {
            tracing::error!(error = %e, "Advert listener error");
        }
    });

    let intake_collection = collection.clone();
    tokio::spawn(async move {
        while let Some(advert) = advert_rx.recv().await {
            intake_collection.seen(&advert);
        }
        debug!("advert_intake_closed");
    });

    // MQTT control surface
    if config.mqtt_enabled() {
        let mqtt_config = config.clone();
        let mqtt_collection = collection.clone();
        let mqtt_shutdown = shutdown_rx.clone();
        tokio::spawn(async move {
            if let Err(e) = start_mqtt_control(&mqtt_config, mqtt_collection, mqtt_shutdown).await {
                tracing::error!(error = %e, "MQTT control error");
            }
        });
    } else {
        info!("mqtt_control_disabled");
    }

    // Housekeeping sweep
    let cleanup_collection = collection.clone();
    let cleanup_ms = config.cleanup_ms();
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(Duration::from_millis(cleanup_ms));
        loop {
            interval.tick().await;
            cleanup_collection.cleanup_old_fingerprints();
        }
    });

    // Fingerprint snapshot report
    let report_collection = collection.clone();
    let report_secs = config.report_secs();
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(Duration::from_secs(report_secs));
        loop {
            interval.tick().await;
            for fingerprint in report_collection.get_copy() {
                let report = serde_json::to_string(&fingerprint.report()).unwrap_or_default();
                info!(report = %report, "fingerprint_report");
            }
        }
    });

    // Metrics reporter
    let metrics_collection = collection.clone();
    let metrics_secs = config.metrics_secs();
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(Duration::from_secs(metrics_secs));
        loop {
            interval.tick().await;
            let summary = metrics_collection
                .metrics()
                .report(metrics_collection.len(), metrics_collection.counted().len());
            summary.log();
        }
    });

    // Handle shutdown on Ctrl+C
    let shutdown_signal = shutdown_tx;
    tokio::spawn(async move {
        tokio::signal::ctrl_c().await.ok();
        info!("shutdown_signal_received");
        let _ = shutdown_signal.send(true);
    });

    // Drain lifecycle events until shutdown
    let mut shutdown = shutdown_rx;
    loop {
        tokio::select! {
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    break;
                }
            }
            event = event_rx.recv() => {
                match event {
                    Some(event) => info!(event = %event.to_json(), "presence_event"),
                    None => break,
                }
            }
        }
    }

    info!(fingerprints = collection.len(), "beacon-presence shutdown complete");
    Ok(())
}
