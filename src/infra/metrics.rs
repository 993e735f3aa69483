//! Lock-free metrics collection and periodic reporting
//!
//! Uses atomics for hot-path operations to avoid mutex contention.
//! All counter updates are lock-free; reporting is the only operation
//! that needs synchronization (via atomic swap).
//!
//! NOTE: All atomics use Relaxed ordering intentionally. These are statistical
//! counters only. Do NOT use these atomics for coordination or logic decisions.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;
use tracing::info;

/// Prometheus-style exponential bucket boundaries (microseconds)
/// Buckets: ≤100, ≤200, ≤400, ≤800, ≤1600, ≤3200, ≤6400, ≤12800, ≤25600, ≤51200, >51200
const BUCKET_BOUNDS: [u64; 10] = [100, 200, 400, 800, 1600, 3200, 6400, 12800, 25600, 51200];
const NUM_BUCKETS: usize = 11;

/// Recognition round-trip bucket boundaries (milliseconds)
/// Buckets: ≤10, ≤20, ≤40, ≤80, ≤160, ≤320, ≤640, ≤1280, ≤2560, ≤5120, >5120 ms
const RECOGNITION_BOUNDS_MS: [u64; 10] = [10, 20, 40, 80, 160, 320, 640, 1280, 2560, 5120];

/// Compute bucket index for a latency value using binary search
#[inline]
fn bucket_index(latency_us: u64) -> usize {
    BUCKET_BOUNDS.partition_point(|&bound| bound < latency_us)
}

#[inline]
fn recognition_bucket_index(latency_ms: u64) -> usize {
    RECOGNITION_BOUNDS_MS.partition_point(|&bound| bound < latency_ms)
}

/// Update an atomic max value using compare-and-swap loop
#[inline]
fn update_atomic_max(atomic_max: &AtomicU64, new_value: u64) {
    let mut current_max = atomic_max.load(Ordering::Relaxed);
    while new_value > current_max {
        match atomic_max.compare_exchange_weak(
            current_max,
            new_value,
            Ordering::Relaxed,
            Ordering::Relaxed,
        ) {
            Ok(_) => break,
            Err(actual) => current_max = actual,
        }
    }
}

/// Swap all buckets to zero and return their values
#[inline]
fn swap_buckets(buckets: &[AtomicU64; NUM_BUCKETS]) -> [u64; NUM_BUCKETS] {
    let mut result = [0u64; NUM_BUCKETS];
    for (i, bucket) in buckets.iter().enumerate() {
        result[i] = bucket.swap(0, Ordering::Relaxed);
    }
    result
}

/// Compute percentile from histogram buckets
/// Returns the upper bound of the bucket containing the percentile
fn percentile_from_buckets(
    buckets: &[u64; NUM_BUCKETS],
    bounds: &[u64; 10],
    percentile: f64,
) -> u64 {
    let total: u64 = buckets.iter().sum();
    if total == 0 {
        return 0;
    }

    let target = (total as f64 * percentile) as u64;
    let mut cumulative = 0u64;

    for (i, &count) in buckets.iter().enumerate() {
        cumulative += count;
        if cumulative >= target {
            // Overflow bucket reports 2x the last bound
            return bounds.get(i).copied().unwrap_or(bounds[9] * 2);
        }
    }
    bounds[9] * 2
}

/// Lock-free metrics collector
///
/// All recording operations are lock-free using atomics.
/// The `report()` method atomically swaps counters to get a consistent snapshot.
pub struct Metrics {
    /// Total frames processed (monotonic)
    frames_total: AtomicU64,
    /// Frames since last report (reset on report)
    frames_since_report: AtomicU64,
    /// Sum of tick latencies in microseconds (reset on report)
    tick_latency_sum_us: AtomicU64,
    /// Max tick latency in microseconds (reset on report)
    tick_latency_max_us: AtomicU64,
    /// Tick latency histogram buckets (reset on report)
    tick_latency_buckets: [AtomicU64; NUM_BUCKETS],
    /// Frame lines that failed to parse (monotonic)
    frames_malformed_total: AtomicU64,
    /// Frame source reopen attempts (monotonic)
    source_reconnects_total: AtomicU64,
    sessions_started_total: AtomicU64,
    sessions_finalized_total: AtomicU64,
    /// Sessions finalized because they were pruned by max age
    sessions_expired_total: AtomicU64,
    recognition_submitted_total: AtomicU64,
    /// Submissions rejected because the job queue was full
    recognition_dropped_total: AtomicU64,
    /// Recognizer calls that returned an error
    recognition_failed_total: AtomicU64,
    recognition_results_total: AtomicU64,
    /// Results discarded because their session had already ended
    recognition_stale_total: AtomicU64,
    /// Recognition round-trip histogram (ms, reset on report)
    recognition_latency_buckets: [AtomicU64; NUM_BUCKETS],
    recognition_latency_sum_ms: AtomicU64,
    evidence_updates_total: AtomicU64,
    window_alerts_total: AtomicU64,
    dwell_alerts_total: AtomicU64,
    egress_written_total: AtomicU64,
    egress_failed_total: AtomicU64,
    /// Egress messages dropped due to channel full
    egress_dropped_total: AtomicU64,
    /// Open sessions (gauge, set by the engine)
    active_sessions: AtomicU64,
    /// Entities in short-lived track memory (gauge, set by the engine)
    tracked_entities: AtomicU64,
    /// Last report time (only accessed from reporter)
    last_report_time: parking_lot::Mutex<Instant>,
}

impl Metrics {
    pub fn new() -> Self {
        Self {
            frames_total: AtomicU64::new(0),
            frames_since_report: AtomicU64::new(0),
            tick_latency_sum_us: AtomicU64::new(0),
            tick_latency_max_us: AtomicU64::new(0),
            tick_latency_buckets: std::array::from_fn(|_| AtomicU64::new(0)),
            frames_malformed_total: AtomicU64::new(0),
            source_reconnects_total: AtomicU64::new(0),
            sessions_started_total: AtomicU64::new(0),
            sessions_finalized_total: AtomicU64::new(0),
            sessions_expired_total: AtomicU64::new(0),
            recognition_submitted_total: AtomicU64::new(0),
            recognition_dropped_total: AtomicU64::new(0),
            recognition_failed_total: AtomicU64::new(0),
            recognition_results_total: AtomicU64::new(0),
            recognition_stale_total: AtomicU64::new(0),
            recognition_latency_buckets: std::array::from_fn(|_| AtomicU64::new(0)),
            recognition_latency_sum_ms: AtomicU64::new(0),
            evidence_updates_total: AtomicU64::new(0),
            window_alerts_total: AtomicU64::new(0),
            dwell_alerts_total: AtomicU64::new(0),
            egress_written_total: AtomicU64::new(0),
            egress_failed_total: AtomicU64::new(0),
            egress_dropped_total: AtomicU64::new(0),
            active_sessions: AtomicU64::new(0),
            tracked_entities: AtomicU64::new(0),
            last_report_time: parking_lot::Mutex::new(Instant::now()),
        }
    }

    /// Record a frame tick was processed with given latency (lock-free)
    #[inline]
    pub fn record_tick(&self, latency_us: u64) {
        self.frames_total.fetch_add(1, Ordering::Relaxed);
        self.frames_since_report.fetch_add(1, Ordering::Relaxed);
        self.tick_latency_sum_us.fetch_add(latency_us, Ordering::Relaxed);
        self.tick_latency_buckets[bucket_index(latency_us)].fetch_add(1, Ordering::Relaxed);
        update_atomic_max(&self.tick_latency_max_us, latency_us);
    }

    #[inline]
    pub fn record_frame_malformed(&self) {
        self.frames_malformed_total.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_source_reconnect(&self) {
        self.source_reconnects_total.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_session_started(&self) {
        self.sessions_started_total.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_session_finalized(&self) {
        self.sessions_finalized_total.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_session_expired(&self) {
        self.sessions_expired_total.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_recognition_submitted(&self) {
        self.recognition_submitted_total.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_recognition_dropped(&self) {
        self.recognition_dropped_total.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_recognition_failed(&self) {
        self.recognition_failed_total.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a recognition result with its enqueue-to-result latency
    #[inline]
    pub fn record_recognition_result(&self, latency_ms: u64) {
        self.recognition_results_total.fetch_add(1, Ordering::Relaxed);
        self.recognition_latency_buckets[recognition_bucket_index(latency_ms)]
            .fetch_add(1, Ordering::Relaxed);
        self.recognition_latency_sum_ms.fetch_add(latency_ms, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_recognition_stale(&self) {
        self.recognition_stale_total.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_evidence_update(&self) {
        self.evidence_updates_total.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_window_alert(&self) {
        self.window_alerts_total.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_dwell_alert(&self) {
        self.dwell_alerts_total.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_egress_written(&self) {
        self.egress_written_total.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_egress_failed(&self) {
        self.egress_failed_total.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_egress_dropped(&self) {
        self.egress_dropped_total.fetch_add(1, Ordering::Relaxed);
    }

    /// Set open session and tracked entity gauges (called by the engine)
    #[inline]
    pub fn set_table_sizes(&self, active_sessions: usize, tracked_entities: usize) {
        self.active_sessions.store(active_sessions as u64, Ordering::Relaxed);
        self.tracked_entities.store(tracked_entities as u64, Ordering::Relaxed);
    }

    #[inline]
    pub fn frames_total(&self) -> u64 {
        self.frames_total.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn sessions_finalized_total(&self) -> u64 {
        self.sessions_finalized_total.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn recognition_dropped_total(&self) -> u64 {
        self.recognition_dropped_total.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn recognition_stale_total(&self) -> u64 {
        self.recognition_stale_total.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn egress_dropped_total(&self) -> u64 {
        self.egress_dropped_total.load(Ordering::Relaxed)
    }

    /// Calculate and return metrics summary, then reset periodic counters
    ///
    /// This is the only method that resets counters. It uses atomic swap
    /// to get a consistent snapshot while allowing concurrent updates.
    pub fn report(&self) -> MetricsSummary {
        let frames_count = self.frames_since_report.swap(0, Ordering::Relaxed);
        let latency_sum = self.tick_latency_sum_us.swap(0, Ordering::Relaxed);
        let max_latency = self.tick_latency_max_us.swap(0, Ordering::Relaxed);
        let tick_buckets = swap_buckets(&self.tick_latency_buckets);

        let recognition_buckets = swap_buckets(&self.recognition_latency_buckets);
        let recognition_sum = self.recognition_latency_sum_ms.swap(0, Ordering::Relaxed);
        let recognition_count: u64 = recognition_buckets.iter().sum();

        let elapsed = {
            let mut last = self.last_report_time.lock();
            let elapsed = last.elapsed();
            *last = Instant::now();
            elapsed
        };

        let frames_per_sec = if elapsed.as_secs_f64() > 0.0 {
            frames_count as f64 / elapsed.as_secs_f64()
        } else {
            0.0
        };

        let avg_latency = if frames_count > 0 { latency_sum / frames_count } else { 0 };
        let recognition_avg_ms =
            if recognition_count > 0 { recognition_sum / recognition_count } else { 0 };

        MetricsSummary {
            frames_total: self.frames_total.load(Ordering::Relaxed),
            frames_per_sec,
            avg_tick_latency_us: avg_latency,
            max_tick_latency_us: max_latency,
            tick_buckets,
            tick_p50_us: percentile_from_buckets(&tick_buckets, &BUCKET_BOUNDS, 0.50),
            tick_p99_us: percentile_from_buckets(&tick_buckets, &BUCKET_BOUNDS, 0.99),
            frames_malformed_total: self.frames_malformed_total.load(Ordering::Relaxed),
            source_reconnects_total: self.source_reconnects_total.load(Ordering::Relaxed),
            sessions_started_total: self.sessions_started_total.load(Ordering::Relaxed),
            sessions_finalized_total: self.sessions_finalized_total.load(Ordering::Relaxed),
            sessions_expired_total: self.sessions_expired_total.load(Ordering::Relaxed),
            recognition_submitted_total: self.recognition_submitted_total.load(Ordering::Relaxed),
            recognition_dropped_total: self.recognition_dropped_total.load(Ordering::Relaxed),
            recognition_failed_total: self.recognition_failed_total.load(Ordering::Relaxed),
            recognition_results_total: self.recognition_results_total.load(Ordering::Relaxed),
            recognition_stale_total: self.recognition_stale_total.load(Ordering::Relaxed),
            recognition_buckets,
            recognition_avg_ms,
            recognition_p99_ms: percentile_from_buckets(
                &recognition_buckets,
                &RECOGNITION_BOUNDS_MS,
                0.99,
            ),
            evidence_updates_total: self.evidence_updates_total.load(Ordering::Relaxed),
            window_alerts_total: self.window_alerts_total.load(Ordering::Relaxed),
            dwell_alerts_total: self.dwell_alerts_total.load(Ordering::Relaxed),
            egress_written_total: self.egress_written_total.load(Ordering::Relaxed),
            egress_failed_total: self.egress_failed_total.load(Ordering::Relaxed),
            egress_dropped_total: self.egress_dropped_total.load(Ordering::Relaxed),
            active_sessions: self.active_sessions.load(Ordering::Relaxed),
            tracked_entities: self.tracked_entities.load(Ordering::Relaxed),
        }
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

/// Number of histogram buckets (exported for Prometheus formatting)
pub const METRICS_NUM_BUCKETS: usize = NUM_BUCKETS;

/// Exported bucket bounds for Prometheus formatting
pub const METRICS_BUCKET_BOUNDS: [u64; 10] = BUCKET_BOUNDS;
pub const METRICS_RECOGNITION_BOUNDS_MS: [u64; 10] = RECOGNITION_BOUNDS_MS;

#[derive(Debug)]
pub struct MetricsSummary {
    pub frames_total: u64,
    pub frames_per_sec: f64,
    pub avg_tick_latency_us: u64,
    pub max_tick_latency_us: u64,
    /// Tick latency histogram buckets (µs)
    pub tick_buckets: [u64; NUM_BUCKETS],
    pub tick_p50_us: u64,
    pub tick_p99_us: u64,
    pub frames_malformed_total: u64,
    pub source_reconnects_total: u64,
    pub sessions_started_total: u64,
    pub sessions_finalized_total: u64,
    pub sessions_expired_total: u64,
    pub recognition_submitted_total: u64,
    pub recognition_dropped_total: u64,
    pub recognition_failed_total: u64,
    pub recognition_results_total: u64,
    pub recognition_stale_total: u64,
    /// Recognition round-trip histogram buckets (ms)
    pub recognition_buckets: [u64; NUM_BUCKETS],
    pub recognition_avg_ms: u64,
    pub recognition_p99_ms: u64,
    pub evidence_updates_total: u64,
    pub window_alerts_total: u64,
    pub dwell_alerts_total: u64,
    pub egress_written_total: u64,
    pub egress_failed_total: u64,
    pub egress_dropped_total: u64,
    pub active_sessions: u64,
    pub tracked_entities: u64,
}

impl MetricsSummary {
    pub fn log(&self) {
        info!(
            frames_total = %self.frames_total,
            frames_per_sec = format!("{:.1}", self.frames_per_sec),
            avg_tick_us = %self.avg_tick_latency_us,
            max_tick_us = %self.max_tick_latency_us,
            p99_tick_us = %self.tick_p99_us,
            active_sessions = %self.active_sessions,
            tracked_entities = %self.tracked_entities,
            sessions_finalized = %self.sessions_finalized_total,
            recog_submitted = %self.recognition_submitted_total,
            recog_dropped = %self.recognition_dropped_total,
            recog_p99_ms = %self.recognition_p99_ms,
            egress_dropped = %self.egress_dropped_total,
            "metrics"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_new() {
        let metrics = Metrics::new();
        assert_eq!(metrics.frames_total(), 0);
        assert_eq!(metrics.sessions_finalized_total(), 0);
    }

    #[test]
    fn test_record_tick() {
        let metrics = Metrics::new();

        metrics.record_tick(100);
        assert_eq!(metrics.frames_total(), 1);
        assert_eq!(metrics.tick_latency_sum_us.load(Ordering::Relaxed), 100);

        metrics.record_tick(200);
        assert_eq!(metrics.frames_total(), 2);
        assert_eq!(metrics.tick_latency_sum_us.load(Ordering::Relaxed), 300);
    }

    #[test]
    fn test_report() {
        let metrics = Metrics::new();

        metrics.record_tick(100);
        metrics.record_tick(200);
        metrics.record_tick(300);
        metrics.record_session_started();
        metrics.record_session_finalized();
        metrics.set_table_sizes(4, 9);

        let summary = metrics.report();

        assert_eq!(summary.frames_total, 3);
        assert_eq!(summary.avg_tick_latency_us, 200); // (100+200+300)/3
        assert_eq!(summary.max_tick_latency_us, 300);
        assert_eq!(summary.sessions_started_total, 1);
        assert_eq!(summary.sessions_finalized_total, 1);
        assert_eq!(summary.active_sessions, 4);
        assert_eq!(summary.tracked_entities, 9);

        // Periodic counters should be reset
        assert_eq!(metrics.frames_since_report.load(Ordering::Relaxed), 0);
        assert_eq!(metrics.tick_latency_sum_us.load(Ordering::Relaxed), 0);
        assert_eq!(metrics.tick_latency_max_us.load(Ordering::Relaxed), 0);

        // Monotonic counters survive
        assert_eq!(metrics.frames_total(), 3);
    }

    #[test]
    fn test_report_empty() {
        let metrics = Metrics::new();
        let summary = metrics.report();

        assert_eq!(summary.frames_total, 0);
        assert_eq!(summary.avg_tick_latency_us, 0);
        assert_eq!(summary.tick_p99_us, 0);
        assert_eq!(summary.recognition_avg_ms, 0);
    }

    #[test]
    fn test_concurrent_updates() {
        use std::sync::Arc;
        use std::thread;

        let metrics = Arc::new(Metrics::new());
        let mut handles = vec![];

        for _ in 0..10 {
            let m = metrics.clone();
            handles.push(thread::spawn(move || {
                for i in 0..1000 {
                    m.record_tick(i as u64);
                    m.record_recognition_dropped();
                }
            }));
        }

        for h in handles {
            h.join().unwrap();
        }

        assert_eq!(metrics.frames_total(), 10_000);
        assert_eq!(metrics.recognition_dropped_total(), 10_000);
    }

    #[test]
    fn test_bucket_index() {
        assert_eq!(bucket_index(0), 0);
        assert_eq!(bucket_index(100), 0);
        assert_eq!(bucket_index(101), 1);
        assert_eq!(bucket_index(51200), 9);
        assert_eq!(bucket_index(51201), 10); // overflow
        assert_eq!(recognition_bucket_index(10), 0);
        assert_eq!(recognition_bucket_index(300), 5);
        assert_eq!(recognition_bucket_index(9000), 10);
    }

    #[test]
    fn test_recognition_latency_percentile() {
        let metrics = Metrics::new();

        for _ in 0..100 {
            metrics.record_recognition_result(150); // bucket ≤160
        }

        let summary = metrics.report();
        assert_eq!(summary.recognition_results_total, 100);
        assert_eq!(summary.recognition_avg_ms, 150);
        assert_eq!(summary.recognition_p99_ms, 160);
        assert_eq!(summary.recognition_buckets[4], 100);
    }
}
