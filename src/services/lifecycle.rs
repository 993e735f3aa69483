//! Session lifecycle - absence countdown and finalization
//!
//! Per entity: `NoSession -> InZone -> AbsenceCountdown -> Finalized`.
//! Re-observing inside the zone cancels a countdown (handled by the table).
//! Finalization happens at most once per session object and only for
//! episodes that had zone presence.

use crate::domain::evidence::TextCandidate;
use crate::domain::record::{EndReason, FinalizedRecord};
use crate::services::session_table::{EntitySession, SessionTable};
use chrono::{DateTime, Utc};
use tracing::info;

/// Observable phase of an open session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionPhase {
    InZone,
    AbsenceCountdown { remaining: u32 },
}

pub struct SessionLifecycle {
    zone_name: String,
    absence_threshold: u32,
}

impl SessionLifecycle {
    pub fn new(zone_name: &str, absence_threshold: u32) -> Self {
        Self { zone_name: zone_name.to_string(), absence_threshold: absence_threshold.max(1) }
    }

    pub fn phase(&self, session: &EntitySession) -> SessionPhase {
        if session.outside_run_count == 0 {
            SessionPhase::InZone
        } else {
            SessionPhase::AbsenceCountdown {
                remaining: self.absence_threshold.saturating_sub(session.outside_run_count),
            }
        }
    }

    /// Produce the one record for this episode
    ///
    /// Returns None if the session was already emitted or never had zone presence.
    pub fn finalize(
        &self,
        session: &mut EntitySession,
        reason: EndReason,
        finalized_at: DateTime<Utc>,
    ) -> Option<FinalizedRecord> {
        if session.emitted {
            return None;
        }
        session.emitted = true;
        let entry_time = session.zone_enter_time?;

        let exit_time = session.last_seen_time;
        let duration = exit_time.duration_since(entry_time);
        let best = session.best_evidence.as_ref();

        let alternates = session
            .evidence_candidates
            .iter()
            .filter(|e| Some(*e) != best)
            .filter_map(|e| e.text.as_ref().map(|t| TextCandidate::new(t.clone(), e.confidence)))
            .collect();

        let record = FinalizedRecord {
            session_id: session.session_id,
            entity_id: session.entity_id,
            zone: self.zone_name.clone(),
            entry_time,
            exit_time,
            duration_secs: duration.as_secs_f64(),
            entry_wall_time: session.entry_wall_time,
            exit_wall_time: session.last_seen_wall_time,
            best_evidence_text: best.and_then(|e| e.text.clone()),
            best_confidence: best.map(|e| e.confidence).unwrap_or(0.0),
            evidence_valid: best.is_some_and(|e| e.valid),
            evidence_image_ref: best
                .and_then(|e| e.source_image_ref.clone())
                .or_else(|| session.last_crop.clone()),
            detection_confidence: best
                .map(|e| e.detection_confidence)
                .unwrap_or(session.peak_detection_confidence),
            alternates,
            end_reason: reason,
            finalized_at,
        };

        info!(
            session_id = %record.session_id,
            entity_id = %record.entity_id,
            reason = %reason.as_str(),
            duration_secs = format!("{:.1}", record.duration_secs),
            text = %record.best_evidence_text.as_deref().unwrap_or("-"),
            confidence = format!("{:.2}", record.best_confidence),
            "session_finalized"
        );

        Some(record)
    }

    /// Finalize every open session (shutdown)
    pub fn flush(&self, table: &mut SessionTable, finalized_at: DateTime<Utc>) -> Vec<FinalizedRecord> {
        table
            .drain_sessions()
            .into_iter()
            .filter_map(|mut s| self.finalize(&mut s, EndReason::Shutdown, finalized_at))
            .collect()
    }
}
