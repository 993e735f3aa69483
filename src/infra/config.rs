//! Configuration loading from TOML files
//!
//! Config file is selected via `--config <path>` (default: config/dev.toml).
//! Every section is optional; missing keys fall back to the defaults below.

use crate::domain::zone::Zone;
use anyhow::Context;
use serde::Deserialize;
use std::fs;
use std::path::Path;
use std::time::Duration;

/// Which point of the bounding box is tested against the zone
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum AnchorPoint {
    #[default]
    Center,
    BottomCenter,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SiteConfig {
    /// Unique site identifier, included in egress payloads
    #[serde(default = "default_site_id")]
    pub id: String,
    #[serde(default = "default_camera_name")]
    pub camera_name: String,
    #[serde(default)]
    pub location_id: Option<String>,
}

fn default_site_id() -> String {
    "zone-sentinel".to_string()
}

fn default_camera_name() -> String {
    "camera-1".to_string()
}

impl Default for SiteConfig {
    fn default() -> Self {
        Self { id: default_site_id(), camera_name: default_camera_name(), location_id: None }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ZoneConfig {
    #[serde(default = "default_zone_name")]
    pub name: String,
    /// Inline polygon vertices in pixel coordinates
    #[serde(default = "default_zone_points")]
    pub points: Vec<[f64; 2]>,
    /// JSON polygon file (`{"polygon": [[x, y], ...]}`); wins over `points` when present
    #[serde(default)]
    pub file: Option<String>,
}

fn default_zone_name() -> String {
    "Zone-1".to_string()
}

fn default_zone_points() -> Vec<[f64; 2]> {
    vec![[584.0, 63.0], [621.0, 58.0], [638.0, 237.0], [557.0, 249.0], [552.0, 85.0], [586.0, 67.0]]
}

impl Default for ZoneConfig {
    fn default() -> Self {
        Self { name: default_zone_name(), points: default_zone_points(), file: None }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct DetectionConfig {
    /// Accepted detection classes (empty accepts all)
    #[serde(default)]
    pub classes: Vec<String>,
    #[serde(default = "default_detection_min_confidence")]
    pub min_confidence: f64,
    #[serde(default)]
    pub anchor: AnchorPoint,
}

fn default_detection_min_confidence() -> f64 {
    0.35
}

impl Default for DetectionConfig {
    fn default() -> Self {
        Self {
            classes: Vec::new(),
            min_confidence: default_detection_min_confidence(),
            anchor: AnchorPoint::Center,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct SessionConfig {
    /// Consecutive ticks not observed in zone before a session ends
    #[serde(default = "default_absence_timeout_ticks")]
    pub absence_timeout_ticks: u32,
    /// Entities not observed for this long are forgotten
    #[serde(default = "default_max_age_secs")]
    pub max_age_secs: u64,
    /// Evidence candidates kept per session
    #[serde(default = "default_max_candidates")]
    pub max_candidates: usize,
    /// Emit a dwell alert once a stay reaches this many seconds
    #[serde(default)]
    pub dwell_alert_secs: Option<u64>,
    #[serde(default = "default_dwell_high_severity_secs")]
    pub dwell_high_severity_secs: u64,
}

fn default_absence_timeout_ticks() -> u32 {
    12
}

fn default_max_age_secs() -> u64 {
    120
}

fn default_max_candidates() -> usize {
    3
}

fn default_dwell_high_severity_secs() -> u64 {
    60
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            absence_timeout_ticks: default_absence_timeout_ticks(),
            max_age_secs: default_max_age_secs(),
            max_candidates: default_max_candidates(),
            dwell_alert_secs: None,
            dwell_high_severity_secs: default_dwell_high_severity_secs(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct RecognitionConfig {
    #[serde(default)]
    pub enabled: bool,
    /// Recognizer HTTP endpoint
    #[serde(default)]
    pub endpoint: Option<String>,
    #[serde(default = "default_recognition_workers")]
    pub workers: usize,
    #[serde(default = "default_recognition_queue_capacity")]
    pub queue_capacity: usize,
    /// Minimum spacing between submissions for one entity
    #[serde(default = "default_recognition_cooldown_secs")]
    pub cooldown_secs: f64,
    /// A job without result for this long no longer blocks resubmission
    #[serde(default = "default_recognition_inflight_timeout_secs")]
    pub inflight_timeout_secs: f64,
    #[serde(default = "default_recognition_max_results_per_tick")]
    pub max_results_per_tick: usize,
    #[serde(default = "default_recognition_min_confidence")]
    pub min_confidence: f64,
    #[serde(default = "default_recognition_min_text_len")]
    pub min_text_len: usize,
    #[serde(default = "default_recognition_max_text_len")]
    pub max_text_len: usize,
    #[serde(default = "default_recognition_request_timeout_ms")]
    pub request_timeout_ms: u64,
    #[serde(default = "default_recognition_stop_timeout_ms")]
    pub stop_timeout_ms: u64,
}

fn default_recognition_workers() -> usize {
    2
}

fn default_recognition_queue_capacity() -> usize {
    2048
}

fn default_recognition_cooldown_secs() -> f64 {
    0.2
}

fn default_recognition_inflight_timeout_secs() -> f64 {
    5.0
}

fn default_recognition_max_results_per_tick() -> usize {
    300
}

fn default_recognition_min_confidence() -> f64 {
    0.3
}

fn default_recognition_min_text_len() -> usize {
    6
}

fn default_recognition_max_text_len() -> usize {
    12
}

fn default_recognition_request_timeout_ms() -> u64 {
    5000
}

fn default_recognition_stop_timeout_ms() -> u64 {
    1000
}

impl Default for RecognitionConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            endpoint: None,
            workers: default_recognition_workers(),
            queue_capacity: default_recognition_queue_capacity(),
            cooldown_secs: default_recognition_cooldown_secs(),
            inflight_timeout_secs: default_recognition_inflight_timeout_secs(),
            max_results_per_tick: default_recognition_max_results_per_tick(),
            min_confidence: default_recognition_min_confidence(),
            min_text_len: default_recognition_min_text_len(),
            max_text_len: default_recognition_max_text_len(),
            request_timeout_ms: default_recognition_request_timeout_ms(),
            stop_timeout_ms: default_recognition_stop_timeout_ms(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct WindowConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_window_secs")]
    pub window_secs: u64,
    #[serde(default = "default_window_secs")]
    pub eval_period_secs: u64,
    /// Alert when distinct entries exceed this count
    #[serde(default = "default_window_threshold")]
    pub threshold: usize,
    #[serde(default = "default_window_secs")]
    pub cooldown_secs: u64,
}

fn default_window_secs() -> u64 {
    15 * 60
}

fn default_window_threshold() -> usize {
    10
}

impl Default for WindowConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            window_secs: default_window_secs(),
            eval_period_secs: default_window_secs(),
            threshold: default_window_threshold(),
            cooldown_secs: default_window_secs(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct EgressConfig {
    /// File path for session egress (JSONL format)
    #[serde(default = "default_egress_file")]
    pub file: String,
    /// Optional HTTP endpoint receiving each record once
    #[serde(default)]
    pub http_url: Option<String>,
    #[serde(default = "default_egress_http_timeout_ms")]
    pub http_timeout_ms: u64,
    /// Embed referenced images as base64 in outbound payloads
    #[serde(default)]
    pub embed_images: bool,
    #[serde(default = "default_egress_channel_capacity")]
    pub channel_capacity: usize,
}

fn default_egress_file() -> String {
    "sessions.jsonl".to_string()
}

fn default_egress_http_timeout_ms() -> u64 {
    15000
}

fn default_egress_channel_capacity() -> usize {
    1000
}

impl Default for EgressConfig {
    fn default() -> Self {
        Self {
            file: default_egress_file(),
            http_url: None,
            http_timeout_ms: default_egress_http_timeout_ms(),
            embed_images: false,
            channel_capacity: default_egress_channel_capacity(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct SourceConfig {
    /// JSONL frame file, or "-" for stdin
    #[serde(default = "default_source_path")]
    pub path: String,
    #[serde(default = "default_source_channel_capacity")]
    pub channel_capacity: usize,
    #[serde(default = "default_source_reconnect_attempts")]
    pub reconnect_attempts: u32,
    #[serde(default = "default_source_reconnect_backoff_ms")]
    pub reconnect_backoff_ms: u64,
}

fn default_source_path() -> String {
    "-".to_string()
}

fn default_source_channel_capacity() -> usize {
    256
}

fn default_source_reconnect_attempts() -> u32 {
    10
}

fn default_source_reconnect_backoff_ms() -> u64 {
    5000
}

impl Default for SourceConfig {
    fn default() -> Self {
        Self {
            path: default_source_path(),
            channel_capacity: default_source_channel_capacity(),
            reconnect_attempts: default_source_reconnect_attempts(),
            reconnect_backoff_ms: default_source_reconnect_backoff_ms(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct MetricsConfig {
    #[serde(default = "default_metrics_interval_secs")]
    pub interval_secs: u64,
    /// Prometheus metrics HTTP port (0 to disable)
    #[serde(default)]
    pub prometheus_port: u16,
}

fn default_metrics_interval_secs() -> u64 {
    10
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self { interval_secs: default_metrics_interval_secs(), prometheus_port: 0 }
    }
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct TomlConfig {
    #[serde(default)]
    pub site: SiteConfig,
    #[serde(default)]
    pub zone: ZoneConfig,
    #[serde(default)]
    pub detection: DetectionConfig,
    #[serde(default)]
    pub session: SessionConfig,
    #[serde(default)]
    pub recognition: RecognitionConfig,
    #[serde(default)]
    pub window: WindowConfig,
    #[serde(default)]
    pub egress: EgressConfig,
    #[serde(default)]
    pub source: SourceConfig,
    #[serde(default)]
    pub metrics: MetricsConfig,
}

/// Upper bound for fractional-second settings (one day)
const MAX_FRACTIONAL_SECS: f64 = 86_400.0;

/// Clamp a fractional-second setting into `[0, MAX_FRACTIONAL_SECS]`; NaN becomes 0
fn clamp_secs(secs: f64) -> f64 {
    if secs.is_nan() {
        0.0
    } else {
        secs.clamp(0.0, MAX_FRACTIONAL_SECS)
    }
}

/// Main configuration struct used throughout the application
#[derive(Debug, Clone)]
pub struct Config {
    site_id: String,
    camera_name: String,
    location_id: Option<String>,
    zone_name: String,
    zone_points: Vec<[f64; 2]>,
    zone_file: Option<String>,
    detection_classes: Vec<String>,
    detection_min_confidence: f64,
    anchor: AnchorPoint,
    absence_timeout_ticks: u32,
    max_age_secs: u64,
    max_candidates: usize,
    dwell_alert_secs: Option<u64>,
    dwell_high_severity_secs: u64,
    recognition_enabled: bool,
    recognition_endpoint: Option<String>,
    recognition_workers: usize,
    recognition_queue_capacity: usize,
    recognition_cooldown_secs: f64,
    recognition_inflight_timeout_secs: f64,
    recognition_max_results_per_tick: usize,
    recognition_min_confidence: f64,
    recognition_min_text_len: usize,
    recognition_max_text_len: usize,
    recognition_request_timeout_ms: u64,
    recognition_stop_timeout_ms: u64,
    window_enabled: bool,
    window_secs: u64,
    window_eval_period_secs: u64,
    window_threshold: usize,
    window_cooldown_secs: u64,
    egress_file: String,
    egress_http_url: Option<String>,
    egress_http_timeout_ms: u64,
    egress_embed_images: bool,
    egress_channel_capacity: usize,
    source_path: String,
    source_channel_capacity: usize,
    source_reconnect_attempts: u32,
    source_reconnect_backoff_ms: u64,
    metrics_interval_secs: u64,
    prometheus_port: u16,
    config_file: String,
}

impl Default for Config {
    fn default() -> Self {
        Self::from_toml(TomlConfig::default(), "default".to_string())
    }
}

impl Config {
    fn from_toml(toml_config: TomlConfig, config_file: String) -> Self {
        let TomlConfig { site, zone, detection, session, recognition, window, egress, source, metrics } =
            toml_config;

        Self {
            site_id: site.id,
            camera_name: site.camera_name,
            location_id: site.location_id,
            zone_name: zone.name,
            zone_points: zone.points,
            zone_file: zone.file,
            detection_classes: detection.classes,
            detection_min_confidence: detection.min_confidence,
            anchor: detection.anchor,
            absence_timeout_ticks: session.absence_timeout_ticks.max(1),
            max_age_secs: session.max_age_secs,
            max_candidates: session.max_candidates.max(1),
            dwell_alert_secs: session.dwell_alert_secs,
            dwell_high_severity_secs: session.dwell_high_severity_secs,
            recognition_enabled: recognition.enabled,
            recognition_endpoint: recognition.endpoint,
            recognition_workers: recognition.workers.max(1),
            recognition_queue_capacity: recognition.queue_capacity.max(1),
            recognition_cooldown_secs: clamp_secs(recognition.cooldown_secs),
            recognition_inflight_timeout_secs: clamp_secs(recognition.inflight_timeout_secs),
            recognition_max_results_per_tick: recognition.max_results_per_tick.max(1),
            recognition_min_confidence: recognition.min_confidence,
            recognition_min_text_len: recognition.min_text_len,
            recognition_max_text_len: recognition.max_text_len,
            recognition_request_timeout_ms: recognition.request_timeout_ms,
            recognition_stop_timeout_ms: recognition.stop_timeout_ms,
            window_enabled: window.enabled,
            window_secs: window.window_secs,
            window_eval_period_secs: window.eval_period_secs,
            window_threshold: window.threshold,
            window_cooldown_secs: window.cooldown_secs,
            egress_file: egress.file,
            egress_http_url: egress.http_url,
            egress_http_timeout_ms: egress.http_timeout_ms,
            egress_embed_images: egress.embed_images,
            egress_channel_capacity: egress.channel_capacity.max(1),
            source_path: source.path,
            source_channel_capacity: source.channel_capacity.max(1),
            source_reconnect_attempts: source.reconnect_attempts,
            source_reconnect_backoff_ms: source.reconnect_backoff_ms,
            metrics_interval_secs: metrics.interval_secs.max(1),
            prometheus_port: metrics.prometheus_port,
            config_file,
        }
    }

    /// Load configuration from a TOML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;

        let toml_config: TomlConfig = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file {}", path.display()))?;

        Ok(Self::from_toml(toml_config, path.display().to_string()))
    }

    /// Load configuration - tries TOML file first, falls back to defaults
    pub fn load_from_path(path: &str) -> Self {
        match Self::from_file(path) {
            Ok(config) => config,
            Err(e) => {
                tracing::warn!(error = %e, "config_load_failed_using_defaults");
                Self::default()
            }
        }
    }

    /// Build the configured zone; a degenerate polygon is a fatal error
    pub fn build_zone(&self) -> anyhow::Result<Zone> {
        if let Some(file) = &self.zone_file {
            if Path::new(file).exists() {
                return Zone::from_json_file(&self.zone_name, file);
            }
            tracing::warn!(file = %file, "zone_file_missing_using_points");
        }
        Zone::from_points(&self.zone_name, &self.zone_points)
            .with_context(|| format!("Invalid zone {} in {}", self.zone_name, self.config_file))
    }

    /// Whether a detection class passes the class filter
    pub fn accepts_class(&self, class: Option<&str>) -> bool {
        if self.detection_classes.is_empty() {
            return true;
        }
        class.is_some_and(|c| self.detection_classes.iter().any(|allowed| allowed == c))
    }

    // Getters for all config fields
    pub fn site_id(&self) -> &str {
        &self.site_id
    }

    pub fn camera_name(&self) -> &str {
        &self.camera_name
    }

    pub fn location_id(&self) -> Option<&str> {
        self.location_id.as_deref()
    }

    pub fn zone_name(&self) -> &str {
        &self.zone_name
    }

    pub fn zone_file(&self) -> Option<&str> {
        self.zone_file.as_deref()
    }

    pub fn detection_classes(&self) -> &[String] {
        &self.detection_classes
    }

    pub fn detection_min_confidence(&self) -> f64 {
        self.detection_min_confidence
    }

    pub fn anchor(&self) -> AnchorPoint {
        self.anchor
    }

    pub fn absence_timeout_ticks(&self) -> u32 {
        self.absence_timeout_ticks
    }

    pub fn max_age(&self) -> Duration {
        Duration::from_secs(self.max_age_secs)
    }

    pub fn max_candidates(&self) -> usize {
        self.max_candidates
    }

    pub fn dwell_alert(&self) -> Option<Duration> {
        self.dwell_alert_secs.map(Duration::from_secs)
    }

    pub fn dwell_high_severity(&self) -> Duration {
        Duration::from_secs(self.dwell_high_severity_secs)
    }

    pub fn recognition_enabled(&self) -> bool {
        self.recognition_enabled
    }

    pub fn recognition_endpoint(&self) -> Option<&str> {
        self.recognition_endpoint.as_deref()
    }

    pub fn recognition_workers(&self) -> usize {
        self.recognition_workers
    }

    pub fn recognition_queue_capacity(&self) -> usize {
        self.recognition_queue_capacity
    }

    pub fn recognition_cooldown(&self) -> Duration {
        Duration::from_secs_f64(self.recognition_cooldown_secs)
    }

    pub fn recognition_inflight_timeout(&self) -> Duration {
        Duration::from_secs_f64(self.recognition_inflight_timeout_secs)
    }

    pub fn recognition_max_results_per_tick(&self) -> usize {
        self.recognition_max_results_per_tick
    }

    pub fn recognition_min_confidence(&self) -> f64 {
        self.recognition_min_confidence
    }

    pub fn recognition_min_text_len(&self) -> usize {
        self.recognition_min_text_len
    }

    pub fn recognition_max_text_len(&self) -> usize {
        self.recognition_max_text_len
    }

    pub fn recognition_request_timeout(&self) -> Duration {
        Duration::from_millis(self.recognition_request_timeout_ms)
    }

    pub fn recognition_stop_timeout(&self) -> Duration {
        Duration::from_millis(self.recognition_stop_timeout_ms)
    }

    pub fn window_enabled(&self) -> bool {
        self.window_enabled
    }

    pub fn window(&self) -> Duration {
        Duration::from_secs(self.window_secs)
    }

    pub fn window_eval_period(&self) -> Duration {
        Duration::from_secs(self.window_eval_period_secs)
    }

    pub fn window_threshold(&self) -> usize {
        self.window_threshold
    }

    pub fn window_cooldown(&self) -> Duration {
        Duration::from_secs(self.window_cooldown_secs)
    }

    pub fn egress_file(&self) -> &str {
        &self.egress_file
    }

    pub fn egress_http_url(&self) -> Option<&str> {
        self.egress_http_url.as_deref()
    }

    pub fn egress_http_timeout(&self) -> Duration {
        Duration::from_millis(self.egress_http_timeout_ms)
    }

    pub fn egress_embed_images(&self) -> bool {
        self.egress_embed_images
    }

    pub fn egress_channel_capacity(&self) -> usize {
        self.egress_channel_capacity
    }

    pub fn source_path(&self) -> &str {
        &self.source_path
    }

    pub fn source_channel_capacity(&self) -> usize {
        self.source_channel_capacity
    }

    pub fn source_reconnect_attempts(&self) -> u32 {
        self.source_reconnect_attempts
    }

    pub fn source_reconnect_backoff(&self) -> Duration {
        Duration::from_millis(self.source_reconnect_backoff_ms)
    }

    pub fn metrics_interval_secs(&self) -> u64 {
        self.metrics_interval_secs
    }

    pub fn prometheus_port(&self) -> u16 {
        self.prometheus_port
    }

    pub fn config_file(&self) -> &str {
        &self.config_file
    }

    /// Override the frame source path (CLI flag)
    pub fn with_source_path(mut self, path: &str) -> Self {
        self.source_path = path.to_string();
        self
    }

    /// Builder method for tests to set the absence timeout
    #[cfg(test)]
    pub fn with_absence_timeout_ticks(mut self, ticks: u32) -> Self {
        self.absence_timeout_ticks = ticks.max(1);
        self
    }

    /// Builder method for tests to set max age
    #[cfg(test)]
    pub fn with_max_age_secs(mut self, secs: u64) -> Self {
        self.max_age_secs = secs;
        self
    }

    /// Builder method for tests to enable dwell alerts
    #[cfg(test)]
    pub fn with_dwell_alert_secs(mut self, secs: u64) -> Self {
        self.dwell_alert_secs = Some(secs);
        self
    }

    /// Builder method for tests to enable the window aggregator
    #[cfg(test)]
    pub fn with_window(mut self, window_secs: u64, threshold: usize, cooldown_secs: u64) -> Self {
        self.window_enabled = true;
        self.window_secs = window_secs;
        self.window_eval_period_secs = window_secs;
        self.window_threshold = threshold;
        self.window_cooldown_secs = cooldown_secs;
        self
    }

    /// Builder method for tests to set the class filter
    #[cfg(test)]
    pub fn with_detection_classes(mut self, classes: &[&str]) -> Self {
        self.detection_classes = classes.iter().map(|c| c.to_string()).collect();
        self
    }

    /// Builder method for tests to set the recognition cooldown
    #[cfg(test)]
    pub fn with_recognition_cooldown_secs(mut self, secs: f64) -> Self {
        self.recognition_cooldown_secs = secs;
        self
    }
}
