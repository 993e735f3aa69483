//! Sliding-window crowd aggregator
//!
//! Records zone entry events and periodically counts distinct entities that
//! entered within the window. Fires a `WindowAlert` when the count exceeds the
//! threshold, at most once per cooldown.

use crate::domain::record::WindowAlert;
use crate::domain::types::{EntityId, ImageRef, Timestamp};
use rustc_hash::FxHashSet;
use std::collections::VecDeque;
use std::time::Duration;
use tracing::{debug, info};

pub struct WindowAggregator {
    zone: String,
    events: VecDeque<(Timestamp, EntityId)>,
    window: Duration,
    threshold: usize,
    cooldown: Duration,
    eval_period: Duration,
    last_eval: Option<Timestamp>,
    last_alert: Option<Timestamp>,
}

impl WindowAggregator {
    pub fn new(
        zone: &str,
        window: Duration,
        threshold: usize,
        cooldown: Duration,
        eval_period: Duration,
    ) -> Self {
        Self {
            zone: zone.to_string(),
            events: VecDeque::new(),
            window,
            threshold,
            cooldown,
            eval_period,
            last_eval: None,
            last_alert: None,
        }
    }

    /// Record a zone entry at `now`
    pub fn record_entry(&mut self, now: Timestamp, entity_id: EntityId) {
        self.events.push_back((now, entity_id));
        self.prune(now);
    }

    /// Drop events older than the window; an event exactly at the edge is kept
    fn prune(&mut self, now: Timestamp) {
        let cutoff = now.saturating_sub(self.window);
        while let Some(&(t, _)) = self.events.front() {
            if t >= cutoff {
                break;
            }
            self.events.pop_front();
        }
    }

    /// Distinct entities with an entry inside the window
    pub fn distinct_count(&self) -> usize {
        self.events.iter().map(|(_, id)| *id).collect::<FxHashSet<_>>().len()
    }

    /// Evaluate immediately, regardless of the period clock
    pub fn evaluate(&mut self, now: Timestamp, snapshot: Option<&ImageRef>) -> Option<WindowAlert> {
        self.prune(now);
        let count = self.distinct_count();
        debug!(zone = %self.zone, count = %count, threshold = %self.threshold, "window_evaluated");

        if count <= self.threshold {
            return None;
        }
        if let Some(last) = self.last_alert {
            if now.duration_since(last) < self.cooldown {
                debug!(zone = %self.zone, count = %count, "window_alert_suppressed");
                return None;
            }
        }

        self.last_alert = Some(now);
        info!(
            zone = %self.zone,
            count = %count,
            threshold = %self.threshold,
            window_secs = %self.window.as_secs(),
            "window_alert"
        );
        Some(WindowAlert {
            zone: self.zone.clone(),
            count,
            threshold: self.threshold,
            window_secs: self.window.as_secs(),
            evaluated_at: now,
            snapshot: snapshot.cloned(),
        })
    }

    /// Evaluate if the period has elapsed; the first call starts the period clock
    pub fn maybe_evaluate(
        &mut self,
        now: Timestamp,
        snapshot: Option<&ImageRef>,
    ) -> Option<WindowAlert> {
        match self.last_eval {
            None => {
                self.last_eval = Some(now);
                None
            }
            Some(last) if now.duration_since(last) >= self.eval_period => {
                self.last_eval = Some(now);
                self.evaluate(now, snapshot)
            }
            Some(_) => None,
        }
    }

    /// Number of retained entry events
    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }
}
