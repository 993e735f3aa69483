//! zone-sentinel - zone-locked session tracking and evidence arbitration
//!
//! Consumes per-frame detections, keeps one occupancy session per entity
//! inside a polygon zone, collects recognition evidence asynchronously and
//! emits one finalized record per episode, plus crowd and dwell alerts.
//!
//! Module structure:
//! - `domain/` - Core types (Frame, Zone, Evidence, records)
//! - `io/` - External interfaces (frame source, recognizer, egress, Prometheus)
//! - `services/` - Business logic (engine, session table, arbitration, workers)
//! - `infra/` - Infrastructure (Config, Metrics)

use clap::Parser;
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tracing::{info, warn};
use tracing_subscriber::fmt::time::UtcTime;
use tracing_subscriber::EnvFilter;
use zone_sentinel::infra::{Config, Metrics};
use zone_sentinel::io::{create_egress_channel, FrameSource, HttpRecognizer, Publisher};
use zone_sentinel::services::{RecognitionPool, Recognizer, TextRules, ZoneEngine};

/// zone-sentinel - zone occupancy sessions with best-of recognition evidence
#[derive(Parser, Debug)]
#[command(name = "zone-sentinel", version, about)]
struct Args {
    /// Path to TOML configuration file
    #[arg(short, long, default_value = "config/dev.toml")]
    config: String,

    /// Frame source (JSON lines file, or "-" for stdin); overrides config
    #[arg(short, long)]
    source: Option<String>,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize structured logging with configurable level via RUST_LOG env var
    // Default: INFO, use RUST_LOG=debug for per-tick detail
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_timer(UtcTime::rfc_3339())
        .with_target(false)
        .init();

    info!(version = %env!("CARGO_PKG_VERSION"), git_hash = %env!("GIT_HASH"), "zone-sentinel starting");

    let args = Args::parse();

    let mut config = Config::load_from_path(&args.config);
    if let Some(ref source) = args.source {
        config = config.with_source_path(source);
    }

    // A degenerate zone prevents startup
    let zone = config.build_zone()?;

    info!(
        config_file = %config.config_file(),
        site = %config.site_id(),
        camera = %config.camera_name(),
        zone = %zone.name(),
        vertices = %zone.vertices().len(),
        source = %config.source_path(),
        absence_timeout_ticks = %config.absence_timeout_ticks(),
        max_age_secs = %config.max_age().as_secs(),
        recognition = %config.recognition_enabled(),
        window = %config.window_enabled(),
        dwell_alert_secs = ?config.dwell_alert().map(|d| d.as_secs()),
        egress_file = %config.egress_file(),
        prometheus_port = %config.prometheus_port(),
        "config_loaded"
    );

    // Create shutdown signal
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let metrics = Arc::new(Metrics::new());

    // Start Prometheus metrics HTTP server (if port > 0)
    let prometheus_port = config.prometheus_port();
    if prometheus_port > 0 {
        let prom_metrics = metrics.clone();
        let prom_site = config.site_id().to_string();
        let prom_shutdown = shutdown_rx.clone();
        tokio::spawn(async move {
            if let Err(e) = zone_sentinel::io::prometheus::start_metrics_server(
                prometheus_port,
                prom_metrics,
                prom_site,
                prom_shutdown,
            )
            .await
            {
                tracing::error!(error = %e, "Prometheus metrics server error");
            }
        });
    }

    // Start metrics reporter
    let metrics_clone = metrics.clone();
    let metrics_interval = config.metrics_interval_secs();
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(std::time::Duration::from_secs(metrics_interval));
        // First tick completes immediately
        interval.tick().await;
        loop {
            interval.tick().await;
            metrics_clone.report().log();
        }
    });

    // Egress channel and publisher; the publisher drains until the engine drops its sender
    let (egress_sender, egress_rx) = create_egress_channel(config.egress_channel_capacity());
    let publisher = Publisher::new(&config, egress_rx, metrics.clone());
    let publisher_handle = tokio::spawn(publisher.run());

    // Recognition worker pool (optional)
    let mut pool = None;
    let mut queues = None;
    if config.recognition_enabled() {
        match config.recognition_endpoint() {
            Some(endpoint) => {
                let recognizer: Arc<dyn Recognizer> = Arc::new(HttpRecognizer::new(
                    endpoint,
                    config.recognition_request_timeout(),
                )?);
                let (p, q) = RecognitionPool::start(
                    config.recognition_workers(),
                    config.recognition_queue_capacity(),
                    recognizer,
                    TextRules::from_config(&config),
                    metrics.clone(),
                );
                pool = Some(p);
                queues = Some(q);
            }
            None => warn!("recognition_enabled_without_endpoint"),
        }
    }

    // Frame source (bounded channel for backpressure)
    let (frame_tx, frame_rx) = mpsc::channel(config.source_channel_capacity());
    let source = FrameSource::from_config(&config, metrics.clone());
    let source_shutdown = shutdown_rx.clone();
    tokio::spawn(async move {
        source.run(frame_tx, source_shutdown).await;
    });

    // Handle shutdown on Ctrl+C
    let shutdown_signal = shutdown_tx;
    tokio::spawn(async move {
        tokio::signal::ctrl_c().await.ok();
        info!("shutdown_signal_received");
        let _ = shutdown_signal.send(true);
    });

    let stop_timeout = config.recognition_stop_timeout();
    let engine = ZoneEngine::new(config, zone, metrics.clone(), queues, Some(egress_sender));

    // Run engine - consumes frames until the source closes, then flushes open sessions
    engine.run(frame_rx).await;

    if let Some(pool) = pool {
        pool.stop(stop_timeout).await;
    }
    if let Err(e) = publisher_handle.await {
        warn!(error = %e, "publisher_join_failed");
    }

    metrics.report().log();
    info!("zone-sentinel shutdown complete");
    Ok(())
}
