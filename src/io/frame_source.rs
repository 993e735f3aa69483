//! Frame source - JSON lines from a file or stdin
//!
//! Each line is one `Frame`. Malformed lines are skipped with a warning and
//! counted. A read or open failure on a file source is retried with a fixed
//! backoff up to the configured attempts; on reopen, lines already consumed
//! are skipped. End of input closes the frame channel, which lets the engine
//! flush and stop.

use crate::domain::types::Frame;
use crate::infra::config::Config;
use crate::infra::metrics::Metrics;
use anyhow::Context;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, BufReader};
use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info, warn};

/// Path value that selects stdin
pub const STDIN_PATH: &str = "-";

/// Parse one frame line
pub fn parse_frame(line: &str) -> anyhow::Result<Frame> {
    serde_json::from_str(line).context("Malformed frame line")
}

enum ReadOutcome {
    Eof,
    Shutdown,
    ChannelClosed,
    Failed(std::io::Error),
}

pub struct FrameSource {
    path: String,
    reconnect_attempts: u32,
    reconnect_backoff: Duration,
    metrics: Arc<Metrics>,
}

impl FrameSource {
    pub fn new(
        path: &str,
        reconnect_attempts: u32,
        reconnect_backoff: Duration,
        metrics: Arc<Metrics>,
    ) -> Self {
        Self { path: path.to_string(), reconnect_attempts, reconnect_backoff, metrics }
    }

    pub fn from_config(config: &Config, metrics: Arc<Metrics>) -> Self {
        Self::new(
            config.source_path(),
            config.source_reconnect_attempts(),
            config.source_reconnect_backoff(),
            metrics,
        )
    }

    /// Read frames into `frame_tx` until end of input, shutdown, or the
    /// receiver goes away. Returns the number of frames forwarded.
    pub async fn run(self, frame_tx: mpsc::Sender<Frame>, mut shutdown: watch::Receiver<bool>) -> u64 {
        info!(path = %self.path, "frame_source_started");
        let mut consumed = 0u64;
        let mut forwarded = 0u64;

        if self.path == STDIN_PATH {
            let reader = BufReader::new(tokio::io::stdin());
            let outcome =
                self.pump(reader, &mut consumed, &mut forwarded, &frame_tx, &mut shutdown).await;
            if let ReadOutcome::Failed(e) = outcome {
                error!(error = %e, "frame_source_read_failed");
            }
            info!(frames = %forwarded, "frame_source_stopped");
            return forwarded;
        }

        let mut failures = 0u32;
        loop {
            if *shutdown.borrow() {
                break;
            }
            let before = consumed;
            match tokio::fs::File::open(&self.path).await {
                Ok(file) => {
                    let reader = BufReader::new(file);
                    match self
                        .pump(reader, &mut consumed, &mut forwarded, &frame_tx, &mut shutdown)
                        .await
                    {
                        ReadOutcome::Eof => {
                            info!(path = %self.path, lines = %consumed, "frame_source_eof");
                            break;
                        }
                        ReadOutcome::Shutdown | ReadOutcome::ChannelClosed => break,
                        ReadOutcome::Failed(e) => {
                            warn!(path = %self.path, error = %e, "frame_source_read_failed");
                        }
                    }
                }
                Err(e) => {
                    warn!(path = %self.path, error = %e, "frame_source_open_failed");
                }
            }

            if consumed > before {
                failures = 0;
            }
            failures += 1;
            if failures > self.reconnect_attempts {
                error!(path = %self.path, attempts = %self.reconnect_attempts, "frame_source_gave_up");
                break;
            }
            self.metrics.record_source_reconnect();
            info!(
                path = %self.path,
                attempt = %failures,
                backoff_ms = %self.reconnect_backoff.as_millis(),
                "frame_source_reconnecting"
            );
            tokio::select! {
                _ = tokio::time::sleep(self.reconnect_backoff) => {}
                _ = shutdown.changed() => break,
            }
        }

        info!(frames = %forwarded, "frame_source_stopped");
        forwarded
    }

    /// Forward lines from one reader; lines numbered up to `consumed` were
    /// already handled by a previous reader and are skipped
    async fn pump<R: AsyncBufRead + Unpin>(
        &self,
        reader: R,
        consumed: &mut u64,
        forwarded: &mut u64,
        frame_tx: &mpsc::Sender<Frame>,
        shutdown: &mut watch::Receiver<bool>,
    ) -> ReadOutcome {
        let mut lines = reader.lines();
        let mut line_no = 0u64;

        loop {
            let next = tokio::select! {
                biased;
                _ = shutdown.changed() => return ReadOutcome::Shutdown,
                next = lines.next_line() => next,
            };
            let line = match next {
                Ok(Some(line)) => line,
                Ok(None) => return ReadOutcome::Eof,
                Err(e) => return ReadOutcome::Failed(e),
            };

            line_no += 1;
            if line_no <= *consumed {
                continue;
            }
            *consumed = line_no;

            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            let frame = match parse_frame(line) {
                Ok(frame) => frame,
                Err(e) => {
                    self.metrics.record_frame_malformed();
                    warn!(line = %line_no, error = %e, "frame_malformed");
                    continue;
                }
            };

            tokio::select! {
                biased;
                _ = shutdown.changed() => return ReadOutcome::Shutdown,
                sent = frame_tx.send(frame) => {
                    if sent.is_err() {
                        debug!("frame_channel_closed");
                        return ReadOutcome::ChannelClosed;
                    }
                    *forwarded += 1;
                }
            }
        }
    }
}
