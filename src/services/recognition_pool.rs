//! Recognition worker pool - runs text recognition off the tick loop
//!
//! The tick loop talks to the pool only through two bounded queues:
//! - jobs in via `RecognitionQueues::submit` (non-blocking, false when full)
//! - results out via `RecognitionQueues::drain` (non-blocking, bounded per call)
//!
//! N long-lived workers share the job queue. There is no retry: a failed or
//! empty recognition still produces a result with no text so the session's
//! in-flight flag gets cleared.

use crate::domain::evidence::TextCandidate;
use crate::domain::types::{EntityId, ImageRef, SessionId, Timestamp};
use crate::infra::config::Config;
use crate::infra::metrics::Metrics;
use async_trait::async_trait;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// External text recognizer: image in, zero or more candidates out
#[async_trait]
pub trait Recognizer: Send + Sync {
    async fn recognize(&self, image: &ImageRef) -> anyhow::Result<Vec<TextCandidate>>;
}

/// A recognition request for one session
#[derive(Debug, Clone)]
pub struct RecognitionJob {
    pub entity_id: EntityId,
    pub session_id: SessionId,
    pub image: ImageRef,
    /// Frame time the crop was taken at
    pub observed_at: Timestamp,
    pub detection_confidence: f64,
    /// When the job was enqueued (for latency measurement)
    pub enqueued_at: Instant,
}

/// Post-processed recognizer output for one job
#[derive(Debug, Clone)]
pub struct RecognitionResult {
    pub entity_id: EntityId,
    pub session_id: SessionId,
    pub observed_at: Timestamp,
    pub detection_confidence: f64,
    pub image: ImageRef,
    pub text: Option<String>,
    pub confidence: f64,
    pub valid: bool,
    /// Enqueue to completion
    pub latency: Duration,
}

/// Text post-processing rules applied by workers
#[derive(Debug, Clone, Copy)]
pub struct TextRules {
    pub min_confidence: f64,
    pub min_len: usize,
    pub max_len: usize,
}

impl TextRules {
    pub fn from_config(config: &Config) -> Self {
        Self {
            min_confidence: config.recognition_min_confidence(),
            min_len: config.recognition_min_text_len(),
            max_len: config.recognition_max_text_len(),
        }
    }

    /// Uppercase, ASCII alphanumerics only
    pub fn normalize(text: &str) -> String {
        text.chars().filter(char::is_ascii_alphanumeric).map(|c| c.to_ascii_uppercase()).collect()
    }

    /// Highest-confidence non-empty candidate after normalization
    ///
    /// Returns `(None, 0.0)` when nothing usable remains or the best is below
    /// the minimum confidence.
    pub fn best(&self, candidates: &[TextCandidate]) -> (Option<String>, f64) {
        let best = candidates
            .iter()
            .map(|c| (Self::normalize(&c.text), c.confidence))
            .filter(|(text, _)| !text.is_empty())
            .max_by(|a, b| a.1.total_cmp(&b.1));

        match best {
            Some((text, conf)) if conf >= self.min_confidence => (Some(text), conf),
            _ => (None, 0.0),
        }
    }

    pub fn is_valid(&self, text: &str) -> bool {
        (self.min_len..=self.max_len).contains(&text.len())
    }
}

/// Tick-loop side of the pool
pub struct RecognitionQueues {
    job_tx: mpsc::Sender<RecognitionJob>,
    result_rx: mpsc::Receiver<RecognitionResult>,
    metrics: Arc<Metrics>,
}

impl RecognitionQueues {
    /// Queues over caller-owned channels, for driving the engine without workers
    #[cfg(test)]
    pub(crate) fn from_channels(
        job_tx: mpsc::Sender<RecognitionJob>,
        result_rx: mpsc::Receiver<RecognitionResult>,
        metrics: Arc<Metrics>,
    ) -> Self {
        Self { job_tx, result_rx, metrics }
    }

    /// Enqueue a job without blocking; false if the queue is full or closed
    pub fn submit(&self, job: RecognitionJob) -> bool {
        let entity_id = job.entity_id;
        match self.job_tx.try_send(job) {
            Ok(()) => {
                self.metrics.record_recognition_submitted();
                true
            }
            Err(mpsc::error::TrySendError::Full(_)) => {
                self.metrics.record_recognition_dropped();
                warn!(entity_id = %entity_id, "recognition_queue_full");
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                self.metrics.record_recognition_dropped();
                debug!(entity_id = %entity_id, "recognition_queue_closed");
                false
            }
        }
    }

    /// Take up to `max_items` completed results without blocking
    pub fn drain(&mut self, max_items: usize) -> Vec<RecognitionResult> {
        let mut out = Vec::new();
        while out.len() < max_items {
            match self.result_rx.try_recv() {
                Ok(result) => out.push(result),
                Err(_) => break,
            }
        }
        out
    }
}

/// Worker side of the pool
pub struct RecognitionPool {
    shutdown_tx: watch::Sender<bool>,
    handles: Vec<JoinHandle<()>>,
}

impl RecognitionPool {
    /// Spawn `workers` tasks sharing one job queue of `capacity`
    pub fn start(
        workers: usize,
        capacity: usize,
        recognizer: Arc<dyn Recognizer>,
        rules: TextRules,
        metrics: Arc<Metrics>,
    ) -> (Self, RecognitionQueues) {
        let (job_tx, job_rx) = mpsc::channel(capacity.max(1));
        let (result_tx, result_rx) = mpsc::channel(capacity.max(1));
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let job_rx = Arc::new(Mutex::new(job_rx));

        let handles = (0..workers.max(1))
            .map(|idx| {
                let worker = Worker {
                    idx,
                    jobs: job_rx.clone(),
                    results: result_tx.clone(),
                    recognizer: recognizer.clone(),
                    rules,
                    metrics: metrics.clone(),
                    shutdown: shutdown_rx.clone(),
                };
                tokio::spawn(worker.run())
            })
            .collect::<Vec<_>>();

        info!(workers = %handles.len(), capacity = %capacity, "recognition_pool_started");

        let pool = Self { shutdown_tx, handles };
        let queues = RecognitionQueues { job_tx, result_rx, metrics };
        (pool, queues)
    }

    /// Signal shutdown and wait up to `timeout` for workers to finish their
    /// current job. Returns the number of workers abandoned.
    pub async fn stop(self, timeout: Duration) -> usize {
        let _ = self.shutdown_tx.send(true);
        let deadline = tokio::time::Instant::now() + timeout;

        let mut abandoned = 0;
        for mut handle in self.handles {
            if tokio::time::timeout_at(deadline, &mut handle).await.is_err() {
                handle.abort();
                abandoned += 1;
            }
        }

        if abandoned > 0 {
            warn!(abandoned = %abandoned, "recognition_workers_abandoned");
        } else {
            info!("recognition_pool_stopped");
        }
        abandoned
    }
}

struct Worker {
    idx: usize,
    jobs: Arc<Mutex<mpsc::Receiver<RecognitionJob>>>,
    results: mpsc::Sender<RecognitionResult>,
    recognizer: Arc<dyn Recognizer>,
    rules: TextRules,
    metrics: Arc<Metrics>,
    shutdown: watch::Receiver<bool>,
}

impl Worker {
    async fn run(mut self) {
        debug!(worker = %self.idx, "recognition_worker_started");

        loop {
            if *self.shutdown.borrow() {
                break;
            }
            let jobs = &self.jobs;
            let shutdown = &mut self.shutdown;
            let job = tokio::select! {
                biased;
                _ = shutdown.changed() => None,
                job = async { jobs.lock().await.recv().await } => job,
            };
            let Some(job) = job else { break };

            let result = self.process(job).await;
            if self.results.send(result).await.is_err() {
                break;
            }
        }

        debug!(worker = %self.idx, "recognition_worker_stopped");
    }

    async fn process(&self, job: RecognitionJob) -> RecognitionResult {
        let (text, confidence) = match self.recognizer.recognize(&job.image).await {
            Ok(candidates) => self.rules.best(&candidates),
            Err(e) => {
                self.metrics.record_recognition_failed();
                warn!(
                    entity_id = %job.entity_id,
                    image = %job.image,
                    error = %e,
                    "recognition_failed"
                );
                (None, 0.0)
            }
        };
        let valid = text.as_deref().is_some_and(|t| self.rules.is_valid(t));
        let latency = job.enqueued_at.elapsed();
        self.metrics.record_recognition_result(latency.as_millis() as u64);

        debug!(
            worker = %self.idx,
            entity_id = %job.entity_id,
            text = %text.as_deref().unwrap_or("-"),
            confidence = format!("{:.2}", confidence),
            valid = %valid,
            latency_ms = %latency.as_millis(),
            "recognition_completed"
        );

        RecognitionResult {
            entity_id: job.entity_id,
            session_id: job.session_id,
            observed_at: job.observed_at,
            detection_confidence: job.detection_confidence,
            image: job.image,
            text,
            confidence,
            valid,
            latency,
        }
    }
}
