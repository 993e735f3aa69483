//! Tick stages for the ZoneEngine
//!
//! Each stage updates session state and appends outputs to the tick report.

use super::{TickReport, ZoneEngine};
use crate::domain::evidence::Evidence;
use crate::domain::record::{DwellAlert, EndReason, EvidenceUpdate, Severity};
use crate::domain::types::{Detection, EntityId, Frame, Point, Timestamp};
use crate::infra::config::AnchorPoint;
use crate::services::recognition_pool::RecognitionJob;
use crate::services::session_table::{EntitySession, SessionTransition};
use chrono::{DateTime, Utc};
use rustc_hash::{FxHashMap, FxHashSet};
use std::time::Instant;
use tracing::{debug, info, warn};

impl ZoneEngine {
    /// Finalize a session removed from the table
    fn finalize(
        &self,
        mut session: Box<EntitySession>,
        reason: EndReason,
        wall: DateTime<Utc>,
        report: &mut TickReport,
    ) {
        if let Some(record) = self.lifecycle.finalize(&mut session, reason, wall) {
            self.metrics.record_session_finalized();
            if reason == EndReason::Expired {
                self.metrics.record_session_expired();
            }
            report.finalized.push(record);
        }
    }

    /// Drop sessions and track memory not observed within max age
    pub(crate) fn expire_sessions(
        &mut self,
        now: Timestamp,
        wall: DateTime<Utc>,
        report: &mut TickReport,
    ) {
        for session in self.table.prune(now, self.config.max_age()) {
            debug!(
                entity_id = %session.entity_id,
                session_id = %session.session_id,
                last_observed = %session.last_observed_time,
                "session_expired"
            );
            self.finalize(session, EndReason::Expired, wall, report);
        }
    }

    /// Apply completed recognition results to their sessions
    ///
    /// A result whose session has ended (or been replaced by a new episode of
    /// the same entity) is stale and discarded.
    pub(crate) fn apply_recognition_results(&mut self, wall: DateTime<Utc>, report: &mut TickReport) {
        let max = self.config.recognition_max_results_per_tick();
        let Some(queues) = self.recognition.as_mut() else {
            return;
        };
        let results = queues.drain(max);

        for result in results {
            let session = match self.table.get_mut(result.entity_id) {
                Some(s) if s.session_id == result.session_id => s,
                _ => {
                    self.metrics.record_recognition_stale();
                    debug!(
                        entity_id = %result.entity_id,
                        session_id = %result.session_id,
                        "recognition_result_stale"
                    );
                    continue;
                }
            };
            session.recognition_in_flight = false;

            let candidate = Evidence {
                text: result.text,
                confidence: result.confidence,
                valid: result.valid,
                source_image_ref: Some(result.image),
                observed_at: result.observed_at,
                detection_confidence: result.detection_confidence,
            };
            if !self.arbitrator.consider(session, candidate, wall) {
                continue;
            }

            self.metrics.record_evidence_update();
            let Some(best) = session.best_evidence.as_ref() else {
                continue;
            };
            info!(
                entity_id = %session.entity_id,
                session_id = %session.session_id,
                text = %best.text.as_deref().unwrap_or("-"),
                confidence = format!("{:.2}", best.confidence),
                valid = %best.valid,
                "evidence_updated"
            );
            report.evidence_updates.push(EvidenceUpdate {
                session_id: session.session_id,
                entity_id: session.entity_id,
                text: best.text.clone(),
                confidence: best.confidence,
                image_ref: best.source_image_ref.clone(),
            });
        }
    }

    fn anchor(&self, detection: &Detection) -> Point {
        match self.config.anchor() {
            AnchorPoint::Center => detection.bbox.center(),
            AnchorPoint::BottomCenter => detection.bbox.bottom_center(),
        }
    }

    /// Keep detections that pass the class and confidence filters, one per
    /// entity (highest confidence), ordered by entity id
    fn select_detections<'a>(&self, frame: &'a Frame) -> Vec<&'a Detection> {
        let min_conf = self.config.detection_min_confidence();
        let mut best: FxHashMap<EntityId, &Detection> = FxHashMap::default();

        for det in &frame.detections {
            if det.confidence < min_conf || !self.config.accepts_class(det.class.as_deref()) {
                continue;
            }
            let b = &det.bbox;
            if ![b.x1, b.y1, b.x2, b.y2].iter().all(|v| v.is_finite()) {
                warn!(entity_id = %det.entity_id, "detection_bbox_invalid");
                continue;
            }
            best.entry(det.entity_id)
                .and_modify(|cur| {
                    if det.confidence > cur.confidence {
                        *cur = det;
                    }
                })
                .or_insert(det);
        }

        let mut selected: Vec<&Detection> = best.into_values().collect();
        selected.sort_by_key(|d| d.entity_id);
        selected
    }

    /// Classify detections against the zone and feed the session table
    ///
    /// Returns the set of entities detected this tick (inside or outside).
    pub(crate) fn observe_detections(
        &mut self,
        frame: &Frame,
        now: Timestamp,
        wall: DateTime<Utc>,
        report: &mut TickReport,
    ) -> FxHashSet<EntityId> {
        let mut seen = FxHashSet::default();

        for det in self.select_detections(frame) {
            let in_zone = self.zone.contains(self.anchor(det));
            seen.insert(det.entity_id);

            let transition = self.table.observe(det.entity_id, in_zone, now, wall);
            if transition.entered_zone() {
                if let Some(window) = self.window.as_mut() {
                    window.record_entry(now, det.entity_id);
                }
            }

            match transition {
                SessionTransition::Started { .. } => {
                    self.metrics.record_session_started();
                    if let Some(session) = self.table.get(det.entity_id) {
                        info!(
                            entity_id = %det.entity_id,
                            session_id = %session.session_id,
                            zone = %self.zone.name(),
                            t = %now,
                            "session_started"
                        );
                    }
                }
                SessionTransition::EndedAbsent(session) => {
                    self.finalize(session, EndReason::Absent, wall, report);
                    continue;
                }
                SessionTransition::Continued { .. }
                | SessionTransition::Absent { .. }
                | SessionTransition::Idle => {}
            }

            if !in_zone {
                continue;
            }
            if let Some(session) = self.table.get_mut(det.entity_id) {
                if det.confidence > session.peak_detection_confidence {
                    session.peak_detection_confidence = det.confidence;
                }
                if let Some(crop) = &det.crop {
                    session.last_crop = Some(crop.clone());
                }
            }
        }

        seen
    }

    /// Count open sessions whose entity was not detected at all this tick
    pub(crate) fn sweep_unseen(
        &mut self,
        seen: &FxHashSet<EntityId>,
        wall: DateTime<Utc>,
        report: &mut TickReport,
    ) {
        for session in self.table.sweep_unseen(seen) {
            self.finalize(session, EndReason::Absent, wall, report);
        }
    }

    /// Submit recognition jobs for in-zone sessions with a fresh crop
    ///
    /// A session submits at most once per cooldown, and not while a job is in
    /// flight unless the in-flight timeout has elapsed. A full queue skips the
    /// submission; it is retried after the cooldown.
    pub(crate) fn submit_recognition(&mut self, now: Timestamp) {
        let Some(queues) = self.recognition.as_ref() else {
            return;
        };
        let cooldown = self.config.recognition_cooldown();
        let inflight_timeout = self.config.recognition_inflight_timeout();

        for session in self.table.sessions_mut() {
            if !session.in_zone || session.last_seen_time != now {
                continue;
            }
            let Some(crop) = session.last_crop.clone() else {
                continue;
            };

            if let Some(last) = session.last_recognition_at {
                let elapsed = now.duration_since(last);
                if session.recognition_in_flight {
                    if elapsed < inflight_timeout {
                        continue;
                    }
                    warn!(
                        entity_id = %session.entity_id,
                        session_id = %session.session_id,
                        "recognition_inflight_timeout"
                    );
                    session.recognition_in_flight = false;
                }
                if elapsed < cooldown {
                    continue;
                }
            }

            let job = RecognitionJob {
                entity_id: session.entity_id,
                session_id: session.session_id,
                image: crop,
                observed_at: now,
                detection_confidence: session.peak_detection_confidence,
                enqueued_at: Instant::now(),
            };
            session.last_recognition_at = Some(now);
            if queues.submit(job) {
                session.recognition_in_flight = true;
            }
        }
    }

    /// Emit one dwell alert per stay once dwell reaches the threshold
    ///
    /// Dwell is measured only while the entity is seen in the zone; an absence
    /// countdown does not accrue loitering time.
    pub(crate) fn check_dwell(&mut self, now: Timestamp, frame: &Frame, report: &mut TickReport) {
        let Some(threshold) = self.config.dwell_alert() else {
            return;
        };
        let high = self.config.dwell_high_severity();

        for session in self.table.sessions_mut() {
            // Only entities observed inside the zone this tick are loitering
            if session.dwell_alerted || !session.in_zone || session.last_seen_time != now {
                continue;
            }
            let dwell = session.dwell(now);
            if dwell < threshold {
                continue;
            }
            session.dwell_alerted = true;

            let severity = if dwell > high { Severity::High } else { Severity::Medium };
            info!(
                entity_id = %session.entity_id,
                session_id = %session.session_id,
                dwell_secs = %dwell.as_secs(),
                severity = ?severity,
                "dwell_alert"
            );
            self.metrics.record_dwell_alert();
            report.dwell_alerts.push(DwellAlert {
                session_id: session.session_id,
                entity_id: session.entity_id,
                zone: self.zone.name().to_string(),
                dwell_secs: dwell.as_secs(),
                entered_at: session.entry_wall_time,
                severity,
                snapshot: frame.snapshot.clone().or_else(|| session.last_crop.clone()),
            });
        }
    }

    pub(crate) fn evaluate_window(&mut self, now: Timestamp, frame: &Frame, report: &mut TickReport) {
        let Some(window) = self.window.as_mut() else {
            return;
        };
        if let Some(alert) = window.maybe_evaluate(now, frame.snapshot.as_ref()) {
            self.metrics.record_window_alert();
            report.window_alerts.push(alert);
        }
    }
}
