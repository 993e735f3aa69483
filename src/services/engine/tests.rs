//! Tests for the ZoneEngine

use super::*;
use crate::domain::record::{EndReason, Severity};
use crate::domain::types::{BBox, Detection, EntityId, ImageRef, SessionId};
use crate::io::egress_channel::{create_egress_channel, EgressMessage};
use crate::services::recognition_pool::{RecognitionJob, RecognitionQueues, RecognitionResult};
use std::time::Duration;

/// Test harness that keeps the far ends of the recognition queues alive
struct TestEngine {
    engine: ZoneEngine,
    job_rx: mpsc::Receiver<RecognitionJob>,
    result_tx: mpsc::Sender<RecognitionResult>,
}

impl std::ops::Deref for TestEngine {
    type Target = ZoneEngine;
    fn deref(&self) -> &Self::Target {
        &self.engine
    }
}

impl std::ops::DerefMut for TestEngine {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.engine
    }
}

fn unit_square() -> Zone {
    Zone::from_points("Zone-1", &[[0.0, 0.0], [10.0, 0.0], [10.0, 10.0], [0.0, 10.0]]).unwrap()
}

fn create_test_engine(config: Config) -> ZoneEngine {
    ZoneEngine::new(config, unit_square(), Arc::new(Metrics::new()), None, None)
}

fn create_test_engine_with_recognition(config: Config) -> TestEngine {
    let metrics = Arc::new(Metrics::new());
    let (job_tx, job_rx) = mpsc::channel(16);
    let (result_tx, result_rx) = mpsc::channel(16);
    let queues = RecognitionQueues::from_channels(job_tx, result_rx, metrics.clone());
    let engine = ZoneEngine::new(config, unit_square(), metrics, Some(queues), None);
    TestEngine { engine, job_rx, result_tx }
}

fn det(id: i64, x: f64, y: f64) -> Detection {
    Detection {
        entity_id: EntityId(id),
        bbox: BBox { x1: x - 1.0, y1: y - 1.0, x2: x + 1.0, y2: y + 1.0 },
        confidence: 0.9,
        class: Some("car".to_string()),
        crop: Some(ImageRef(format!("crops/{id}.jpg"))),
    }
}

fn frame(secs: u64, detections: Vec<Detection>) -> Frame {
    Frame::new(Timestamp::from_secs(secs), detections)
}

fn result_for(job: &RecognitionJob, text: Option<&str>, confidence: f64) -> RecognitionResult {
    RecognitionResult {
        entity_id: job.entity_id,
        session_id: job.session_id,
        observed_at: job.observed_at,
        detection_confidence: job.detection_confidence,
        image: job.image.clone(),
        text: text.map(str::to_string),
        confidence,
        valid: text.is_some_and(|t| t.len() >= 6),
        latency: Duration::from_millis(20),
    }
}

#[test]
fn test_unit_square_scenario() {
    let mut engine = create_test_engine(Config::default().with_absence_timeout_ticks(5));

    for s in 0..30 {
        let report = engine.tick(&frame(s, vec![det(1, 5.0, 5.0)]));
        assert!(report.finalized.is_empty());
    }
    for s in 30..34 {
        let report = engine.tick(&frame(s, vec![]));
        assert!(report.finalized.is_empty(), "finalized early at t={s}");
    }

    let report = engine.tick(&frame(34, vec![]));
    assert_eq!(report.finalized.len(), 1);
    let record = &report.finalized[0];
    assert_eq!(record.entity_id, EntityId(1));
    assert_eq!(record.duration_secs, 29.0);
    assert_eq!(record.entry_time, Timestamp::from_secs(0));
    assert_eq!(record.exit_time, Timestamp::from_secs(29));
    assert_eq!(record.end_reason, EndReason::Absent);
    assert_eq!(record.zone, "Zone-1");
    assert_eq!(engine.active_sessions(), 0);
    assert_eq!(engine.metrics.sessions_finalized_total(), 1);
}

#[test]
fn test_never_inside_no_record() {
    let mut engine = create_test_engine(Config::default().with_absence_timeout_ticks(2));
    for s in 0..10 {
        let report = engine.tick(&frame(s, vec![det(1, 50.0, 50.0)]));
        assert!(report.is_empty());
    }
    for s in 10..20 {
        assert!(engine.tick(&frame(s, vec![])).is_empty());
    }
    assert!(engine.flush().finalized.is_empty());
}

#[test]
fn test_outside_detections_count_as_absence() {
    let mut engine = create_test_engine(Config::default().with_absence_timeout_ticks(3));
    engine.tick(&frame(0, vec![det(1, 5.0, 5.0)]));
    engine.tick(&frame(1, vec![det(1, 50.0, 5.0)]));
    engine.tick(&frame(2, vec![det(1, 50.0, 5.0)]));

    let report = engine.tick(&frame(3, vec![det(1, 50.0, 5.0)]));
    assert_eq!(report.finalized.len(), 1);
    assert_eq!(report.finalized[0].duration_secs, 0.0);
}

#[test]
fn test_reentry_below_threshold_same_episode() {
    let mut engine = create_test_engine(Config::default().with_absence_timeout_ticks(5));
    engine.tick(&frame(0, vec![det(1, 5.0, 5.0)]));
    let session_id = engine.table.get(EntityId(1)).unwrap().session_id;

    for s in 1..5 {
        assert!(engine.tick(&frame(s, vec![])).finalized.is_empty());
    }
    engine.tick(&frame(5, vec![det(1, 5.0, 5.0)]));

    let session = engine.table.get(EntityId(1)).unwrap();
    assert_eq!(session.session_id, session_id);
    assert_eq!(session.zone_enter_time, Some(Timestamp::from_secs(0)));
    assert_eq!(session.outside_run_count, 0);
}

#[test]
fn test_return_after_finalize_is_new_session() {
    let mut engine = create_test_engine(Config::default().with_absence_timeout_ticks(1));
    engine.tick(&frame(0, vec![det(1, 5.0, 5.0)]));
    let first = engine.tick(&frame(1, vec![])).finalized;
    assert_eq!(first.len(), 1);

    engine.tick(&frame(2, vec![det(1, 5.0, 5.0)]));
    let second = engine.table.get(EntityId(1)).unwrap();
    assert_ne!(second.session_id, first[0].session_id);
    assert_eq!(second.zone_enter_time, Some(Timestamp::from_secs(2)));
}

#[test]
fn test_filters_class_and_confidence() {
    let mut engine = create_test_engine(Config::default().with_detection_classes(&["car"]));

    let mut person = det(1, 5.0, 5.0);
    person.class = Some("person".to_string());
    let mut faint = det(2, 5.0, 5.0);
    faint.confidence = 0.1;
    engine.tick(&frame(0, vec![person, faint, det(3, 5.0, 5.0)]));

    assert!(engine.table.get(EntityId(1)).is_none());
    assert!(engine.table.get(EntityId(2)).is_none());
    assert!(engine.table.get(EntityId(3)).is_some());
}

#[test]
fn test_duplicate_entity_uses_highest_confidence() {
    let mut engine = create_test_engine(Config::default());
    let mut outside = det(1, 50.0, 50.0);
    outside.confidence = 0.95;
    let inside = det(1, 5.0, 5.0);

    engine.tick(&frame(0, vec![inside, outside]));
    assert!(engine.table.get(EntityId(1)).is_none());
}

#[test]
fn test_expired_session_finalized() {
    let mut engine = create_test_engine(
        Config::default().with_absence_timeout_ticks(1000).with_max_age_secs(60),
    );
    engine.tick(&frame(0, vec![det(1, 5.0, 5.0)]));
    engine.tick(&frame(10, vec![det(1, 5.0, 5.0)]));

    // Stream gap
    let report = engine.tick(&frame(200, vec![]));
    assert_eq!(report.finalized.len(), 1);
    assert_eq!(report.finalized[0].end_reason, EndReason::Expired);
    assert_eq!(report.finalized[0].duration_secs, 10.0);
    assert_eq!(engine.table.tracked_len(), 0);
}

#[test]
fn test_flush_finalizes_open_sessions() {
    let mut engine = create_test_engine(Config::default());
    engine.tick(&frame(0, vec![det(1, 5.0, 5.0), det(2, 6.0, 6.0), det(3, 50.0, 50.0)]));

    let report = engine.flush();
    assert_eq!(report.finalized.len(), 2);
    assert!(report.finalized.iter().all(|r| r.end_reason == EndReason::Shutdown));
    assert_eq!(engine.active_sessions(), 0);
}

#[test]
fn test_clock_never_moves_backwards() {
    let mut engine = create_test_engine(Config::default().with_absence_timeout_ticks(5));
    engine.tick(&frame(10, vec![det(1, 5.0, 5.0)]));
    engine.tick(&frame(5, vec![det(1, 5.0, 5.0)]));

    let session = engine.table.get(EntityId(1)).unwrap();
    assert_eq!(session.last_seen_time, Timestamp::from_secs(10));
}

#[test]
fn test_recognition_submit_and_apply() {
    let mut t = create_test_engine_with_recognition(Config::default());
    t.tick(&frame(0, vec![det(1, 5.0, 5.0)]));

    let job = t.job_rx.try_recv().unwrap();
    assert_eq!(job.entity_id, EntityId(1));
    assert_eq!(job.image, ImageRef("crops/1.jpg".to_string()));
    assert!(t.table.get(EntityId(1)).unwrap().recognition_in_flight);

    t.result_tx.try_send(result_for(&job, Some("KA01AB1234"), 0.8)).unwrap();
    let report = t.tick(&frame(1, vec![det(1, 5.0, 5.0)]));

    assert_eq!(report.evidence_updates.len(), 1);
    assert_eq!(report.evidence_updates[0].text.as_deref(), Some("KA01AB1234"));
    let session = t.table.get(EntityId(1)).unwrap();
    assert_eq!(session.best_evidence.as_ref().unwrap().confidence, 0.8);

    // Result applied, cooldown elapsed: a new job goes out on the same tick
    assert!(t.job_rx.try_recv().is_ok());
}

#[test]
fn test_record_carries_best_evidence() {
    let mut t = create_test_engine_with_recognition(
        Config::default().with_absence_timeout_ticks(1).with_recognition_cooldown_secs(0.0),
    );
    t.tick(&frame(0, vec![det(1, 5.0, 5.0)]));
    let first = t.job_rx.try_recv().unwrap();
    t.result_tx.try_send(result_for(&first, Some("KA01AB1234"), 0.7)).unwrap();

    t.tick(&frame(1, vec![det(1, 5.0, 5.0)]));
    let second = t.job_rx.try_recv().unwrap();
    t.result_tx.try_send(result_for(&second, Some("KA01AB1284"), 0.5)).unwrap();

    t.tick(&frame(2, vec![det(1, 5.0, 5.0)]));
    let report = t.tick(&frame(3, vec![]));

    let record = &report.finalized[0];
    assert_eq!(record.best_evidence_text.as_deref(), Some("KA01AB1234"));
    assert_eq!(record.best_confidence, 0.7);
    assert!(record.evidence_valid);
    assert_eq!(record.alternates.len(), 1);
}

#[test]
fn test_stale_result_discarded() {
    let mut t = create_test_engine_with_recognition(Config::default());
    t.tick(&frame(0, vec![det(1, 5.0, 5.0)]));
    let job = t.job_rx.try_recv().unwrap();

    let mut stale = result_for(&job, Some("KA01AB1234"), 0.9);
    stale.session_id = SessionId::new();
    t.result_tx.try_send(stale).unwrap();

    let report = t.tick(&frame(1, vec![det(1, 5.0, 5.0)]));
    assert!(report.evidence_updates.is_empty());
    assert!(t.table.get(EntityId(1)).unwrap().best_evidence.is_none());
    assert_eq!(t.metrics.recognition_stale_total(), 1);
}

#[test]
fn test_no_results_leaves_evidence_unchanged() {
    let mut t = create_test_engine_with_recognition(Config::default());
    t.tick(&frame(0, vec![det(1, 5.0, 5.0)]));
    let job = t.job_rx.try_recv().unwrap();
    t.result_tx.try_send(result_for(&job, Some("KA01AB1234"), 0.8)).unwrap();
    t.tick(&frame(1, vec![det(1, 5.0, 5.0)]));
    let before = t.table.get(EntityId(1)).unwrap().best_evidence.clone();

    for s in 2..6 {
        let report = t.tick(&frame(s, vec![det(1, 5.0, 5.0)]));
        assert!(report.evidence_updates.is_empty());
    }
    assert_eq!(t.table.get(EntityId(1)).unwrap().best_evidence, before);
}

#[test]
fn test_failed_recognition_clears_inflight() {
    let mut t = create_test_engine_with_recognition(Config::default());
    t.tick(&frame(0, vec![det(1, 5.0, 5.0)]));
    let job = t.job_rx.try_recv().unwrap();
    t.result_tx.try_send(result_for(&job, None, 0.0)).unwrap();

    let report = t.tick(&frame(1, vec![det(1, 5.0, 5.0)]));
    assert!(report.evidence_updates.is_empty());
    assert!(t.table.get(EntityId(1)).unwrap().best_evidence.is_none());
    // Resubmitted on the same tick once the failed result cleared the flag
    assert!(t.job_rx.try_recv().is_ok());
}

#[test]
fn test_inflight_blocks_until_timeout() {
    let mut t = create_test_engine_with_recognition(Config::default());
    t.tick(&frame(0, vec![det(1, 5.0, 5.0)]));
    assert!(t.job_rx.try_recv().is_ok());

    // No result arrives; default in-flight timeout is 5s
    for s in 1..5 {
        t.tick(&frame(s, vec![det(1, 5.0, 5.0)]));
        assert!(t.job_rx.try_recv().is_err(), "resubmitted while in flight at t={s}");
    }
    t.tick(&frame(5, vec![det(1, 5.0, 5.0)]));
    assert!(t.job_rx.try_recv().is_ok());
}

#[test]
fn test_cooldown_limits_submissions() {
    let mut t = create_test_engine_with_recognition(
        Config::default().with_recognition_cooldown_secs(2.0),
    );
    let mut submitted = 0;
    for s in 0..6 {
        t.tick(&frame(s, vec![det(1, 5.0, 5.0)]));
        while let Ok(job) = t.job_rx.try_recv() {
            submitted += 1;
            t.result_tx.try_send(result_for(&job, None, 0.0)).unwrap();
        }
    }
    // t = 0, 2, 4
    assert_eq!(submitted, 3);
}

#[test]
fn test_no_submission_when_outside_or_without_crop() {
    let mut t = create_test_engine_with_recognition(Config::default());
    let mut no_crop = det(1, 5.0, 5.0);
    no_crop.crop = None;
    t.tick(&frame(0, vec![no_crop, det(2, 50.0, 50.0)]));
    assert!(t.job_rx.try_recv().is_err());
}

#[test]
fn test_dwell_alert_once_per_stay() {
    let mut engine = create_test_engine(Config::default().with_dwell_alert_secs(10));
    let mut alerts = Vec::new();
    for s in 0..80 {
        alerts.extend(engine.tick(&frame(s, vec![det(1, 5.0, 5.0)])).dwell_alerts);
    }
    assert_eq!(alerts.len(), 1);
    assert_eq!(alerts[0].dwell_secs, 10);
    assert_eq!(alerts[0].severity, Severity::Medium);
}

#[test]
fn test_no_dwell_alert_while_absent() {
    let mut engine = create_test_engine(
        Config::default().with_dwell_alert_secs(10).with_absence_timeout_ticks(12),
    );
    let mut alerts = Vec::new();
    for s in 0..=5 {
        alerts.extend(engine.tick(&frame(s, vec![det(1, 5.0, 5.0)])).dwell_alerts);
    }
    // Gone from t=6; the session is still open in its absence countdown
    for s in 6..=11 {
        alerts.extend(engine.tick(&frame(s, vec![])).dwell_alerts);
    }
    assert_eq!(engine.active_sessions(), 1);

    // Detected outside the zone does not accrue dwell either
    alerts.extend(engine.tick(&frame(12, vec![det(1, 50.0, 50.0)])).dwell_alerts);
    assert!(alerts.is_empty());

    // Back inside the same episode, dwell counts from the original entry
    let report = engine.tick(&frame(13, vec![det(1, 5.0, 5.0)]));
    assert_eq!(report.dwell_alerts.len(), 1);
    assert_eq!(report.dwell_alerts[0].dwell_secs, 13);
}

#[test]
fn test_dwell_alert_high_severity() {
    let mut engine = create_test_engine(Config::default().with_dwell_alert_secs(90));
    let mut alerts = Vec::new();
    for s in 0..100 {
        alerts.extend(engine.tick(&frame(s, vec![det(1, 5.0, 5.0)])).dwell_alerts);
    }
    assert_eq!(alerts.len(), 1);
    assert_eq!(alerts[0].severity, Severity::High);
}

#[test]
fn test_window_alert_through_engine() {
    let mut engine = create_test_engine(
        Config::default().with_absence_timeout_ticks(1000).with_window(900, 10, 900),
    );
    engine.tick(&frame(0, vec![]));

    let entries: [(u64, std::ops::Range<i64>); 3] = [(0, 0..4), (300, 4..8), (600, 8..11)];
    for (t, ids) in entries {
        let dets = ids.map(|id| det(id, 5.0, 5.0)).collect();
        assert!(engine.tick(&frame(t, dets)).window_alerts.is_empty());
    }

    let report = engine.tick(&frame(900, vec![]));
    assert_eq!(report.window_alerts.len(), 1);
    assert_eq!(report.window_alerts[0].count, 11);
}

#[tokio::test]
async fn test_run_emits_and_flushes() {
    let (sender, mut egress_rx) = create_egress_channel(64);
    let engine = ZoneEngine::new(
        Config::default().with_absence_timeout_ticks(2),
        unit_square(),
        Arc::new(Metrics::new()),
        None,
        Some(sender),
    );
    let (frame_tx, frame_rx) = mpsc::channel(16);

    frame_tx.send(frame(0, vec![det(1, 5.0, 5.0), det(2, 5.0, 5.0)])).await.unwrap();
    frame_tx.send(frame(1, vec![det(2, 5.0, 5.0)])).await.unwrap();
    frame_tx.send(frame(2, vec![det(2, 5.0, 5.0)])).await.unwrap();
    drop(frame_tx);

    engine.run(frame_rx).await;

    let mut reasons = Vec::new();
    while let Ok(msg) = egress_rx.try_recv() {
        if let EgressMessage::Record(record) = msg {
            reasons.push((record.entity_id, record.end_reason));
        }
    }
    assert_eq!(
        reasons,
        vec![(EntityId(1), EndReason::Absent), (EntityId(2), EndReason::Shutdown)]
    );
}

#[tokio::test]
async fn test_run_flush_waits_for_slow_publisher() {
    let (sender, mut egress_rx) = create_egress_channel(2);
    let engine =
        ZoneEngine::new(Config::default(), unit_square(), Arc::new(Metrics::new()), None, Some(sender));
    let (frame_tx, frame_rx) = mpsc::channel(16);

    // Four sessions still open when input ends, channel holds two
    let dets = (1..=4).map(|id| det(id, 5.0, 5.0)).collect();
    frame_tx.send(frame(0, dets)).await.unwrap();
    drop(frame_tx);

    let consumer = tokio::spawn(async move {
        let mut records = Vec::new();
        while let Some(msg) = egress_rx.recv().await {
            tokio::time::sleep(Duration::from_millis(5)).await;
            if let EgressMessage::Record(record) = msg {
                records.push(record.entity_id);
            }
        }
        records
    });

    engine.run(frame_rx).await;

    let mut records = consumer.await.unwrap();
    records.sort();
    assert_eq!(records, vec![EntityId(1), EntityId(2), EntityId(3), EntityId(4)]);
}
