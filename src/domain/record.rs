//! Output records handed to the emission sink
//!
//! - `FinalizedRecord` - one per occupancy episode
//! - `WindowAlert` - crowd window threshold exceeded
//! - `DwellAlert` - loitering threshold reached (once per stay)
//! - `EvidenceUpdate` - best evidence of an open session changed

use crate::domain::evidence::TextCandidate;
use crate::domain::types::{EntityId, ImageRef, SessionId, Timestamp};
use chrono::{DateTime, Utc};
use serde::Serialize;

/// Why a session was finalized
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EndReason {
    /// Absence timeout reached
    Absent,
    /// Not observed within max age (stream gap or tracker churn)
    Expired,
    /// Process shutting down
    Shutdown,
}

impl EndReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            EndReason::Absent => "absent",
            EndReason::Expired => "expired",
            EndReason::Shutdown => "shutdown",
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct FinalizedRecord {
    pub session_id: SessionId,
    pub entity_id: EntityId,
    pub zone: String,
    pub entry_time: Timestamp,
    pub exit_time: Timestamp,
    pub duration_secs: f64,
    pub entry_wall_time: DateTime<Utc>,
    pub exit_wall_time: DateTime<Utc>,
    pub best_evidence_text: Option<String>,
    pub best_confidence: f64,
    pub evidence_valid: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub evidence_image_ref: Option<ImageRef>,
    pub detection_confidence: f64,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub alternates: Vec<TextCandidate>,
    pub end_reason: EndReason,
    pub finalized_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize)]
pub struct WindowAlert {
    pub zone: String,
    pub count: usize,
    pub threshold: usize,
    pub window_secs: u64,
    pub evaluated_at: Timestamp,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub snapshot: Option<ImageRef>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Medium,
    High,
}

#[derive(Debug, Clone, Serialize)]
pub struct DwellAlert {
    pub session_id: SessionId,
    pub entity_id: EntityId,
    pub zone: String,
    pub dwell_secs: u64,
    pub entered_at: DateTime<Utc>,
    pub severity: Severity,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub snapshot: Option<ImageRef>,
}

#[derive(Debug, Clone, Serialize)]
pub struct EvidenceUpdate {
    pub session_id: SessionId,
    pub entity_id: EntityId,
    pub text: Option<String>,
    pub confidence: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub image_ref: Option<ImageRef>,
}
