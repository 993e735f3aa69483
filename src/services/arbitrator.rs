//! Evidence arbitration - best-of selection across noisy recognition attempts

use crate::domain::evidence::{rank_cmp, Evidence};
use crate::services::session_table::EntitySession;
use chrono::{DateTime, Utc};

pub struct EvidenceArbitrator {
    max_candidates: usize,
}

impl EvidenceArbitrator {
    pub fn new(max_candidates: usize) -> Self {
        Self { max_candidates: max_candidates.max(1) }
    }

    /// Offer a candidate to a session; true if it became the new best
    ///
    /// Candidates without text are not evidence and are ignored. The session
    /// keeps the top `max_candidates` by rank, best first.
    pub fn consider(
        &self,
        session: &mut EntitySession,
        candidate: Evidence,
        wall: DateTime<Utc>,
    ) -> bool {
        if !candidate.has_text() {
            return false;
        }

        if let Err(pos) =
            session.evidence_candidates.binary_search_by(|e| rank_cmp(e, &candidate))
        {
            if pos < self.max_candidates {
                session.evidence_candidates.insert(pos, candidate.clone());
                session.evidence_candidates.truncate(self.max_candidates);
            }
        }

        let better = match &session.best_evidence {
            Some(best) => candidate.is_better_than(best),
            None => true,
        };
        if better {
            session.best_evidence = Some(candidate);
            session.last_update_wall_time = wall;
        }
        better
    }
}
