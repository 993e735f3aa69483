//! Entity session table
//!
//! Owns per-entity state for the tick loop. Two maps are kept:
//! - `sessions` - open occupancy episodes, created on first in-zone observation
//! - `memory` - short-lived track memory (last seen, last zone membership) for
//!   every entity observed, used for zone-entry detection
//!
//! Both are pruned by max age every tick so tracker id churn cannot grow them
//! without bound.

use crate::domain::evidence::Evidence;
use crate::domain::types::{EntityId, ImageRef, SessionId, Timestamp};
use chrono::{DateTime, Utc};
use rustc_hash::{FxHashMap, FxHashSet};
use smallvec::SmallVec;
use std::time::Duration;
use tracing::debug;

/// Mutable state of one occupancy episode
#[derive(Debug, Clone)]
pub struct EntitySession {
    pub session_id: SessionId,
    pub entity_id: EntityId,
    /// Last time the entity was observed inside the zone
    pub last_seen_time: Timestamp,
    /// Last time the entity was detected at all (inside or outside)
    pub last_observed_time: Timestamp,
    pub in_zone: bool,
    pub zone_enter_time: Option<Timestamp>,
    /// Consecutive ticks not observed in zone
    pub outside_run_count: u32,
    pub best_evidence: Option<Evidence>,
    /// Top candidates, best first
    pub evidence_candidates: SmallVec<[Evidence; 3]>,
    pub recognition_in_flight: bool,
    pub last_recognition_at: Option<Timestamp>,
    pub emitted: bool,
    pub dwell_alerted: bool,
    pub entry_wall_time: DateTime<Utc>,
    pub last_seen_wall_time: DateTime<Utc>,
    pub last_update_wall_time: DateTime<Utc>,
    /// Highest detector confidence seen in zone
    pub peak_detection_confidence: f64,
    pub last_crop: Option<ImageRef>,
}

impl EntitySession {
    pub fn new(entity_id: EntityId, now: Timestamp, wall: DateTime<Utc>) -> Self {
        Self {
            session_id: SessionId::new(),
            entity_id,
            last_seen_time: now,
            last_observed_time: now,
            in_zone: true,
            zone_enter_time: Some(now),
            outside_run_count: 0,
            best_evidence: None,
            evidence_candidates: SmallVec::new(),
            recognition_in_flight: false,
            last_recognition_at: None,
            emitted: false,
            dwell_alerted: false,
            entry_wall_time: wall,
            last_seen_wall_time: wall,
            last_update_wall_time: wall,
            peak_detection_confidence: 0.0,
            last_crop: None,
        }
    }

    /// Time spent since zone entry
    pub fn dwell(&self, now: Timestamp) -> Duration {
        self.zone_enter_time.map(|t| now.duration_since(t)).unwrap_or_default()
    }
}

/// Short-lived memory of any observed entity
#[derive(Debug, Clone, Copy)]
pub struct TrackMemory {
    pub last_seen: Timestamp,
    pub in_zone: bool,
}

/// Result of feeding one observation into the table
#[derive(Debug)]
pub enum SessionTransition {
    /// Outside the zone with no open session
    Idle,
    /// New episode opened
    Started { entered: bool },
    /// Still inside; `resumed` if an absence countdown was cancelled
    Continued { resumed: bool, entered: bool },
    /// Not observed in zone, countdown running
    Absent { outside_run: u32 },
    /// Absence timeout reached, session removed from the table
    EndedAbsent(Box<EntitySession>),
}

impl SessionTransition {
    /// Previously not in zone per track memory, now in zone
    pub fn entered_zone(&self) -> bool {
        match self {
            SessionTransition::Started { entered } => *entered,
            SessionTransition::Continued { entered, .. } => *entered,
            _ => false,
        }
    }
}

pub struct SessionTable {
    sessions: FxHashMap<EntityId, EntitySession>,
    memory: FxHashMap<EntityId, TrackMemory>,
    absence_threshold: u32,
}

impl SessionTable {
    pub fn new(absence_threshold: u32) -> Self {
        Self {
            sessions: FxHashMap::default(),
            memory: FxHashMap::default(),
            absence_threshold: absence_threshold.max(1),
        }
    }

    /// Feed one observation of `entity_id` at `now`
    pub fn observe(
        &mut self,
        entity_id: EntityId,
        in_zone: bool,
        now: Timestamp,
        wall: DateTime<Utc>,
    ) -> SessionTransition {
        let entered = {
            let mem = self
                .memory
                .entry(entity_id)
                .or_insert(TrackMemory { last_seen: now, in_zone: false });
            let entered = in_zone && !mem.in_zone;
            mem.in_zone = in_zone;
            mem.last_seen = now;
            entered
        };

        if in_zone {
            if let Some(session) = self.sessions.get_mut(&entity_id) {
                let resumed = session.outside_run_count > 0;
                session.in_zone = true;
                session.outside_run_count = 0;
                session.last_seen_time = now;
                session.last_observed_time = now;
                session.last_seen_wall_time = wall;
                if resumed {
                    debug!(entity_id = %entity_id, session_id = %session.session_id, "absence_cancelled");
                }
                return SessionTransition::Continued { resumed, entered };
            }
            self.sessions.insert(entity_id, EntitySession::new(entity_id, now, wall));
            return SessionTransition::Started { entered };
        }

        match self.sessions.get_mut(&entity_id) {
            Some(session) => {
                session.last_observed_time = now;
                self.count_absent(entity_id)
            }
            None => SessionTransition::Idle,
        }
    }

    /// Count one tick in which an open session's entity was not detected at all
    pub fn mark_absent(&mut self, entity_id: EntityId) -> SessionTransition {
        if self.sessions.contains_key(&entity_id) {
            self.count_absent(entity_id)
        } else {
            SessionTransition::Idle
        }
    }

    /// Mark every open session not in `seen` as absent; returns sessions that ended
    pub fn sweep_unseen(&mut self, seen: &FxHashSet<EntityId>) -> Vec<Box<EntitySession>> {
        let unseen: Vec<EntityId> =
            self.sessions.keys().filter(|id| !seen.contains(id)).copied().collect();

        let mut ended = Vec::new();
        for id in unseen {
            if let SessionTransition::EndedAbsent(session) = self.mark_absent(id) {
                ended.push(session);
            }
        }
        ended
    }

    fn count_absent(&mut self, entity_id: EntityId) -> SessionTransition {
        let outside_run = match self.sessions.get_mut(&entity_id) {
            Some(session) => {
                session.in_zone = false;
                session.outside_run_count += 1;
                session.outside_run_count
            }
            None => return SessionTransition::Idle,
        };

        if outside_run >= self.absence_threshold {
            match self.sessions.remove(&entity_id) {
                Some(session) => SessionTransition::EndedAbsent(Box::new(session)),
                None => SessionTransition::Idle,
            }
        } else {
            SessionTransition::Absent { outside_run }
        }
    }

    /// Drop sessions and track memory not observed within `max_age`
    ///
    /// Returns removed sessions so they can still be finalized.
    pub fn prune(&mut self, now: Timestamp, max_age: Duration) -> Vec<Box<EntitySession>> {
        let expired: Vec<EntityId> = self
            .sessions
            .iter()
            .filter(|(_, s)| now.duration_since(s.last_observed_time) > max_age)
            .map(|(id, _)| *id)
            .collect();

        let removed: Vec<Box<EntitySession>> = expired
            .into_iter()
            .filter_map(|id| self.sessions.remove(&id).map(Box::new))
            .collect();

        let before = self.memory.len();
        self.memory.retain(|_, m| now.duration_since(m.last_seen) <= max_age);
        let forgotten = before - self.memory.len();

        if !removed.is_empty() || forgotten > 0 {
            debug!(sessions = %removed.len(), forgotten = %forgotten, "table_pruned");
        }
        removed
    }

    /// Remove every open session (shutdown flush)
    pub fn drain_sessions(&mut self) -> Vec<EntitySession> {
        self.sessions.drain().map(|(_, s)| s).collect()
    }

    pub fn get(&self, entity_id: EntityId) -> Option<&EntitySession> {
        self.sessions.get(&entity_id)
    }

    pub fn get_mut(&mut self, entity_id: EntityId) -> Option<&mut EntitySession> {
        self.sessions.get_mut(&entity_id)
    }

    pub fn sessions_mut(&mut self) -> impl Iterator<Item = &mut EntitySession> {
        self.sessions.values_mut()
    }

    /// Number of open sessions
    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    /// Number of entities in track memory
    pub fn tracked_len(&self) -> usize {
        self.memory.len()
    }

    pub fn absence_threshold(&self) -> u32 {
        self.absence_threshold
    }
}
