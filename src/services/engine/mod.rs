//! Zone engine - single-writer tick loop
//!
//! The engine owns all session state and reacts to frames as they arrive.
//! Each tick runs, in order:
//! 1. expire sessions not observed within max age
//! 2. apply completed recognition results (stale ones are discarded)
//! 3. classify detections against the zone and update sessions
//! 4. count undetected sessions as absent
//! 5. submit recognition jobs (cooldown and in-flight gated)
//! 6. dwell alerts
//! 7. window evaluation
//!
//! Outputs of a tick are collected in a `TickReport` and handed to the egress
//! channel by `run`. Ticks never wait on the channel; the final flush does.

mod handlers;
#[cfg(test)]
mod tests;

use crate::domain::record::{DwellAlert, EvidenceUpdate, FinalizedRecord, WindowAlert};
use crate::domain::types::{Frame, Timestamp};
use crate::domain::zone::Zone;
use crate::infra::config::Config;
use crate::infra::metrics::Metrics;
use crate::io::EgressSender;
use crate::services::arbitrator::EvidenceArbitrator;
use crate::services::lifecycle::SessionLifecycle;
use crate::services::recognition_pool::RecognitionQueues;
use crate::services::session_table::SessionTable;
use crate::services::window::WindowAggregator;
use chrono::Utc;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

/// Everything a single tick produced
#[derive(Debug, Default)]
pub struct TickReport {
    pub finalized: Vec<FinalizedRecord>,
    pub window_alerts: Vec<WindowAlert>,
    pub dwell_alerts: Vec<DwellAlert>,
    pub evidence_updates: Vec<EvidenceUpdate>,
}

impl TickReport {
    pub fn is_empty(&self) -> bool {
        self.finalized.is_empty()
            && self.window_alerts.is_empty()
            && self.dwell_alerts.is_empty()
            && self.evidence_updates.is_empty()
    }
}

pub struct ZoneEngine {
    pub(crate) zone: Zone,
    pub(crate) table: SessionTable,
    pub(crate) arbitrator: EvidenceArbitrator,
    pub(crate) lifecycle: SessionLifecycle,
    /// Crowd window, when enabled
    pub(crate) window: Option<WindowAggregator>,
    /// Recognition pool queues, when recognition is enabled
    pub(crate) recognition: Option<RecognitionQueues>,
    pub(crate) config: Config,
    pub(crate) metrics: Arc<Metrics>,
    pub(crate) egress_sender: Option<EgressSender>,
    /// Latest frame time seen; frame time never moves backwards inside the engine
    pub(crate) clock: Option<Timestamp>,
}

impl ZoneEngine {
    pub fn new(
        config: Config,
        zone: Zone,
        metrics: Arc<Metrics>,
        recognition: Option<RecognitionQueues>,
        egress_sender: Option<EgressSender>,
    ) -> Self {
        let window = config.window_enabled().then(|| {
            WindowAggregator::new(
                zone.name(),
                config.window(),
                config.window_threshold(),
                config.window_cooldown(),
                config.window_eval_period(),
            )
        });

        Self {
            table: SessionTable::new(config.absence_timeout_ticks()),
            arbitrator: EvidenceArbitrator::new(config.max_candidates()),
            lifecycle: SessionLifecycle::new(zone.name(), config.absence_timeout_ticks()),
            zone,
            window,
            recognition,
            config,
            metrics,
            egress_sender,
            clock: None,
        }
    }

    /// Consume frames until the channel closes, then flush open sessions
    pub async fn run(mut self, mut frame_rx: mpsc::Receiver<Frame>) {
        info!(
            zone = %self.zone.name(),
            absence_timeout_ticks = %self.table.absence_threshold(),
            recognition = %self.recognition.is_some(),
            window = %self.window.is_some(),
            "engine_started"
        );

        while let Some(frame) = frame_rx.recv().await {
            let report = self.tick(&frame);
            self.emit(&report);
        }

        let flushed = self.flush();
        info!(flushed = %flushed.finalized.len(), "engine_stopped");
        self.deliver(&flushed).await;
    }

    /// Process one frame
    pub fn tick(&mut self, frame: &Frame) -> TickReport {
        let tick_start = Instant::now();
        let now = self.advance_clock(frame.time);
        let wall = frame.wall_time();
        let mut report = TickReport::default();

        self.expire_sessions(now, wall, &mut report);
        self.apply_recognition_results(wall, &mut report);
        let seen = self.observe_detections(frame, now, wall, &mut report);
        self.sweep_unseen(&seen, wall, &mut report);
        self.submit_recognition(now);
        self.check_dwell(now, frame, &mut report);
        self.evaluate_window(now, frame, &mut report);

        self.metrics.set_table_sizes(self.table.len(), self.table.tracked_len());
        let latency_us = tick_start.elapsed().as_micros() as u64;
        self.metrics.record_tick(latency_us);

        debug!(
            t = %now,
            detections = %frame.detections.len(),
            active = %self.table.len(),
            finalized = %report.finalized.len(),
            latency_us = %latency_us,
            "tick"
        );
        report
    }

    /// Finalize every open session (shutdown)
    pub fn flush(&mut self) -> TickReport {
        let finalized = self.lifecycle.flush(&mut self.table, Utc::now());
        for _ in &finalized {
            self.metrics.record_session_finalized();
        }
        self.metrics.set_table_sizes(self.table.len(), self.table.tracked_len());
        TickReport { finalized, ..Default::default() }
    }

    fn advance_clock(&mut self, frame_time: Timestamp) -> Timestamp {
        let now = match self.clock {
            Some(last) if frame_time < last => {
                warn!(frame_time = %frame_time, last = %last, "frame_time_regressed");
                last
            }
            _ => frame_time,
        };
        self.clock = Some(now);
        now
    }

    /// Hand a tick's outputs to the egress channel (non-blocking, drops when full)
    fn emit(&self, report: &TickReport) {
        let Some(ref sender) = self.egress_sender else {
            return;
        };

        let mut dropped = 0usize;
        for record in &report.finalized {
            dropped += usize::from(!sender.send_record(record));
        }
        for alert in &report.window_alerts {
            dropped += usize::from(!sender.send_window_alert(alert));
        }
        for alert in &report.dwell_alerts {
            dropped += usize::from(!sender.send_dwell_alert(alert));
        }
        for update in &report.evidence_updates {
            dropped += usize::from(!sender.send_evidence_update(update));
        }

        if dropped > 0 {
            for _ in 0..dropped {
                self.metrics.record_egress_dropped();
            }
            warn!(dropped = %dropped, "egress_channel_full");
        }
    }

    /// Hand the shutdown flush to the egress channel, waiting for space
    ///
    /// The tick loop is over, so there is no reason to drop records here.
    async fn deliver(&self, report: &TickReport) {
        let Some(ref sender) = self.egress_sender else {
            return;
        };

        let mut lost = 0usize;
        for record in &report.finalized {
            if !sender.deliver_record(record).await {
                lost += 1;
                self.metrics.record_egress_dropped();
            }
        }
        if lost > 0 {
            error!(lost = %lost, "egress_closed_during_flush");
        }
    }

    /// Number of open sessions
    pub fn active_sessions(&self) -> usize {
        self.table.len()
    }

    pub fn zone(&self) -> &Zone {
        &self.zone
    }
}
