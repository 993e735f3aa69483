//! Integration tests for the recognition worker pool

use async_trait::async_trait;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use zone_sentinel::domain::{EntityId, ImageRef, SessionId, TextCandidate, Timestamp};
use zone_sentinel::infra::Metrics;
use zone_sentinel::services::{
    RecognitionJob, RecognitionPool, RecognitionQueues, RecognitionResult, Recognizer, TextRules,
};

struct MockRecognizer {
    delay: Duration,
    calls: AtomicUsize,
}

impl MockRecognizer {
    fn new(delay: Duration) -> Arc<Self> {
        Arc::new(Self { delay, calls: AtomicUsize::new(0) })
    }
}

#[async_trait]
impl Recognizer for MockRecognizer {
    async fn recognize(&self, image: &ImageRef) -> anyhow::Result<Vec<TextCandidate>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        tokio::time::sleep(self.delay).await;
        match image.as_str() {
            "broken.jpg" => anyhow::bail!("recognizer unavailable"),
            "blurry.jpg" => Ok(vec![TextCandidate::new("KA0", 0.1)]),
            "short.jpg" => Ok(vec![TextCandidate::new("ab-12", 0.8)]),
            _ => Ok(vec![TextCandidate::new("mh12 de 1433", 0.87)]),
        }
    }
}

fn rules() -> TextRules {
    TextRules { min_confidence: 0.3, min_len: 6, max_len: 12 }
}

fn job(id: i64, image: &str) -> RecognitionJob {
    RecognitionJob {
        entity_id: EntityId(id),
        session_id: SessionId::new(),
        image: ImageRef(image.to_string()),
        observed_at: Timestamp::from_secs(id as u64),
        detection_confidence: 0.8,
        enqueued_at: Instant::now(),
    }
}

async fn collect(queues: &mut RecognitionQueues, n: usize) -> Vec<RecognitionResult> {
    let mut out = Vec::new();
    for _ in 0..200 {
        out.extend(queues.drain(n - out.len()));
        if out.len() >= n {
            break;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    out
}

#[tokio::test]
async fn test_round_trip() {
    let metrics = Arc::new(Metrics::new());
    let (pool, mut queues) =
        RecognitionPool::start(2, 16, MockRecognizer::new(Duration::ZERO), rules(), metrics.clone());

    let submitted = job(1, "crops/1.jpg");
    let session_id = submitted.session_id;
    assert!(queues.submit(submitted));

    let results = collect(&mut queues, 1).await;
    assert_eq!(results.len(), 1);
    let result = &results[0];
    assert_eq!(result.entity_id, EntityId(1));
    assert_eq!(result.session_id, session_id);
    assert_eq!(result.text.as_deref(), Some("MH12DE1433"));
    assert!((result.confidence - 0.87).abs() < 1e-9);
    assert!(result.valid);
    assert_eq!(result.image.as_str(), "crops/1.jpg");
    assert_eq!(result.detection_confidence, 0.8);

    assert_eq!(pool.stop(Duration::from_secs(1)).await, 0);
}

#[tokio::test]
async fn test_error_and_low_confidence_yield_no_text() {
    let metrics = Arc::new(Metrics::new());
    let (pool, mut queues) =
        RecognitionPool::start(1, 16, MockRecognizer::new(Duration::ZERO), rules(), metrics.clone());

    assert!(queues.submit(job(1, "broken.jpg")));
    assert!(queues.submit(job(2, "blurry.jpg")));
    assert!(queues.submit(job(3, "short.jpg")));

    let mut results = collect(&mut queues, 3).await;
    results.sort_by_key(|r| r.entity_id);
    assert_eq!(results.len(), 3);

    assert!(results[0].text.is_none());
    assert_eq!(results[0].confidence, 0.0);
    assert!(results[1].text.is_none());
    // Recognized but outside the length rule
    assert_eq!(results[2].text.as_deref(), Some("AB12"));
    assert!(!results[2].valid);

    assert_eq!(metrics.report().recognition_failed_total, 1);
    assert_eq!(metrics.report().recognition_results_total, 3);

    pool.stop(Duration::from_secs(1)).await;
}

#[tokio::test]
async fn test_full_queue_rejects_submit() {
    let metrics = Arc::new(Metrics::new());
    let recognizer = MockRecognizer::new(Duration::from_secs(5));
    let (pool, queues) = RecognitionPool::start(1, 1, recognizer.clone(), rules(), metrics.clone());

    // First job is picked up by the single worker, second fills the queue
    assert!(queues.submit(job(1, "a.jpg")));
    for _ in 0..200 {
        if recognizer.calls.load(Ordering::SeqCst) > 0 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    assert!(queues.submit(job(2, "b.jpg")));
    assert!(!queues.submit(job(3, "c.jpg")));

    assert_eq!(metrics.recognition_dropped_total(), 1);
    assert_eq!(metrics.report().recognition_submitted_total, 2);

    pool.stop(Duration::from_millis(50)).await;
}

#[tokio::test]
async fn test_stop_abandons_slow_worker() {
    let metrics = Arc::new(Metrics::new());
    let recognizer = MockRecognizer::new(Duration::from_secs(30));
    let (pool, queues) = RecognitionPool::start(2, 4, recognizer.clone(), rules(), metrics);

    assert!(queues.submit(job(1, "slow.jpg")));
    for _ in 0..200 {
        if recognizer.calls.load(Ordering::SeqCst) > 0 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }

    let started = Instant::now();
    let abandoned = pool.stop(Duration::from_millis(100)).await;
    assert_eq!(abandoned, 1);
    assert!(started.elapsed() < Duration::from_secs(5));
}

#[tokio::test]
async fn test_submit_after_stop_is_dropped() {
    let metrics = Arc::new(Metrics::new());
    let (pool, queues) =
        RecognitionPool::start(1, 4, MockRecognizer::new(Duration::ZERO), rules(), metrics.clone());
    pool.stop(Duration::from_secs(1)).await;

    assert!(!queues.submit(job(1, "late.jpg")));
    assert_eq!(metrics.recognition_dropped_total(), 1);
}
