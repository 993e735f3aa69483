//! Prometheus metrics HTTP endpoint
//!
//! Exposes engine metrics in Prometheus text format at /metrics, plus a
//! /health probe. Uses hyper for the HTTP server.

use crate::infra::metrics::{
    Metrics, MetricsSummary, METRICS_BUCKET_BOUNDS, METRICS_NUM_BUCKETS,
    METRICS_RECOGNITION_BOUNDS_MS,
};
use bytes::Bytes;
use http_body_util::Full;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use std::convert::Infallible;
use std::fmt::Write;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{error, info};

/// Prometheus metric type
enum MetricType {
    Counter,
    Gauge,
}

impl MetricType {
    fn as_str(&self) -> &'static str {
        match self {
            MetricType::Counter => "counter",
            MetricType::Gauge => "gauge",
        }
    }
}

/// Write a simple metric (counter or gauge) with site label
fn write_metric(
    output: &mut String,
    name: &str,
    help: &str,
    typ: MetricType,
    site: &str,
    val: u64,
) {
    let _ = writeln!(output, "# HELP {name} {help}");
    let _ = writeln!(output, "# TYPE {name} {}", typ.as_str());
    let _ = writeln!(output, "{name}{{site=\"{site}\"}} {val}");
}

/// Write a histogram metric with buckets, sum, and count
fn write_histogram(
    output: &mut String,
    name: &str,
    help: &str,
    site: &str,
    buckets: &[u64; METRICS_NUM_BUCKETS],
    bounds: &[u64; 10],
    avg: u64,
) {
    let _ = writeln!(output, "# HELP {name} {help}");
    let _ = writeln!(output, "# TYPE {name} histogram");

    let mut cumulative = 0u64;
    for (i, &bound) in bounds.iter().enumerate() {
        cumulative += buckets[i];
        let _ = writeln!(output, "{name}_bucket{{site=\"{site}\",le=\"{bound}\"}} {cumulative}");
    }
    cumulative += buckets[METRICS_NUM_BUCKETS - 1];
    let _ = writeln!(output, "{name}_bucket{{site=\"{site}\",le=\"+Inf\"}} {cumulative}");

    let count: u64 = buckets.iter().sum();
    let sum = avg * count;
    let _ = writeln!(output, "{name}_sum{{site=\"{site}\"}} {sum}");
    let _ = writeln!(output, "{name}_count{{site=\"{site}\"}} {count}");
}

/// Format metrics in Prometheus text exposition format
fn format_prometheus_metrics(metrics: &Metrics, site_id: &str) -> String {
    let summary = metrics.report();
    let mut output = String::with_capacity(4096);

    write_tick_metrics(&mut output, site_id, &summary);
    write_session_metrics(&mut output, site_id, &summary);
    write_recognition_metrics(&mut output, site_id, &summary);
    write_egress_metrics(&mut output, site_id, &summary);

    output
}

fn write_tick_metrics(output: &mut String, site: &str, summary: &MetricsSummary) {
    write_metric(
        output,
        "zone_sentinel_frames_total",
        "Total frames processed",
        MetricType::Counter,
        site,
        summary.frames_total,
    );
    write_metric(
        output,
        "zone_sentinel_frames_malformed_total",
        "Frame lines skipped as malformed",
        MetricType::Counter,
        site,
        summary.frames_malformed_total,
    );
    write_metric(
        output,
        "zone_sentinel_source_reconnects_total",
        "Frame source reconnect attempts",
        MetricType::Counter,
        site,
        summary.source_reconnects_total,
    );
    write_histogram(
        output,
        "zone_sentinel_tick_latency_us",
        "Tick processing latency in microseconds",
        site,
        &summary.tick_buckets,
        &METRICS_BUCKET_BOUNDS,
        summary.avg_tick_latency_us,
    );
}

fn write_session_metrics(output: &mut String, site: &str, summary: &MetricsSummary) {
    write_metric(
        output,
        "zone_sentinel_active_sessions",
        "Open occupancy sessions",
        MetricType::Gauge,
        site,
        summary.active_sessions,
    );
    write_metric(
        output,
        "zone_sentinel_tracked_entities",
        "Entities in short-lived track memory",
        MetricType::Gauge,
        site,
        summary.tracked_entities,
    );
    write_metric(
        output,
        "zone_sentinel_sessions_started_total",
        "Sessions opened",
        MetricType::Counter,
        site,
        summary.sessions_started_total,
    );
    write_metric(
        output,
        "zone_sentinel_sessions_finalized_total",
        "Sessions finalized",
        MetricType::Counter,
        site,
        summary.sessions_finalized_total,
    );
    write_metric(
        output,
        "zone_sentinel_sessions_expired_total",
        "Sessions finalized by max age",
        MetricType::Counter,
        site,
        summary.sessions_expired_total,
    );
    write_metric(
        output,
        "zone_sentinel_window_alerts_total",
        "Crowd window alerts",
        MetricType::Counter,
        site,
        summary.window_alerts_total,
    );
    write_metric(
        output,
        "zone_sentinel_dwell_alerts_total",
        "Dwell alerts",
        MetricType::Counter,
        site,
        summary.dwell_alerts_total,
    );
}

fn write_recognition_metrics(output: &mut String, site: &str, summary: &MetricsSummary) {
    write_metric(
        output,
        "zone_sentinel_recognition_submitted_total",
        "Recognition jobs submitted",
        MetricType::Counter,
        site,
        summary.recognition_submitted_total,
    );
    write_metric(
        output,
        "zone_sentinel_recognition_dropped_total",
        "Recognition jobs dropped (queue full)",
        MetricType::Counter,
        site,
        summary.recognition_dropped_total,
    );
    write_metric(
        output,
        "zone_sentinel_recognition_failed_total",
        "Recognizer calls that failed",
        MetricType::Counter,
        site,
        summary.recognition_failed_total,
    );
    write_metric(
        output,
        "zone_sentinel_recognition_stale_total",
        "Recognition results discarded for ended sessions",
        MetricType::Counter,
        site,
        summary.recognition_stale_total,
    );
    write_metric(
        output,
        "zone_sentinel_evidence_updates_total",
        "Best evidence replacements",
        MetricType::Counter,
        site,
        summary.evidence_updates_total,
    );
    write_histogram(
        output,
        "zone_sentinel_recognition_latency_ms",
        "Recognition enqueue-to-result latency in milliseconds",
        site,
        &summary.recognition_buckets,
        &METRICS_RECOGNITION_BOUNDS_MS,
        summary.recognition_avg_ms,
    );
}

fn write_egress_metrics(output: &mut String, site: &str, summary: &MetricsSummary) {
    write_metric(
        output,
        "zone_sentinel_egress_written_total",
        "Egress lines written",
        MetricType::Counter,
        site,
        summary.egress_written_total,
    );
    write_metric(
        output,
        "zone_sentinel_egress_failed_total",
        "Egress writes or posts that failed",
        MetricType::Counter,
        site,
        summary.egress_failed_total,
    );
    write_metric(
        output,
        "zone_sentinel_egress_dropped_total",
        "Egress messages dropped (channel full)",
        MetricType::Counter,
        site,
        summary.egress_dropped_total,
    );
}

/// Handle HTTP requests
async fn handle_request(
    req: Request<hyper::body::Incoming>,
    metrics: Arc<Metrics>,
    site_id: Arc<String>,
) -> Result<Response<Full<Bytes>>, Infallible> {
    match (req.method(), req.uri().path()) {
        (&Method::GET, "/metrics") => {
            let body = format_prometheus_metrics(&metrics, &site_id);
            Ok(Response::builder()
                .status(StatusCode::OK)
                .header("Content-Type", "text/plain; version=0.0.4; charset=utf-8")
                .body(Full::new(Bytes::from(body)))
                .expect("static response should not fail"))
        }
        (&Method::GET, "/health") => Ok(Response::builder()
            .status(StatusCode::OK)
            .body(Full::new(Bytes::from("ok")))
            .expect("static response should not fail")),
        _ => Ok(Response::builder()
            .status(StatusCode::NOT_FOUND)
            .body(Full::new(Bytes::from("Not Found")))
            .expect("static response should not fail")),
    }
}

/// Start the Prometheus metrics HTTP server
pub async fn start_metrics_server(
    port: u16,
    metrics: Arc<Metrics>,
    site_id: String,
    mut shutdown: watch::Receiver<bool>,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = TcpListener::bind(addr).await?;
    let site_id = Arc::new(site_id);

    info!(port = %port, site = %site_id, "prometheus_metrics_server_started");

    loop {
        tokio::select! {
            result = listener.accept() => {
                match result {
                    Ok((stream, _addr)) => {
                        let io = TokioIo::new(stream);
                        let metrics = metrics.clone();
                        let site_id = site_id.clone();

                        tokio::spawn(async move {
                            let service = service_fn(move |req| {
                                let metrics = metrics.clone();
                                let site_id = site_id.clone();
                                async move { handle_request(req, metrics, site_id).await }
                            });

                            if let Err(e) = http1::Builder::new()
                                .serve_connection(io, service)
                                .await
                            {
                                error!(error = %e, "prometheus_http_error");
                            }
                        });
                    }
                    Err(e) => {
                        error!(error = %e, "prometheus_accept_error");
                    }
                }
            }
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    info!("prometheus_metrics_server_shutdown");
                    return Ok(());
                }
            }
        }
    }
}
