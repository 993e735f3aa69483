//! Typed channel for egress messages
//!
//! Provides a non-blocking way to hand records and alerts to the publisher.
//! Uses a bounded mpsc channel to prevent unbounded memory growth.

use crate::domain::record::{DwellAlert, EvidenceUpdate, FinalizedRecord, WindowAlert};
use crate::domain::types::ImageRef;
use tokio::sync::mpsc;

/// Messages that can be sent to the publisher
#[derive(Debug)]
pub enum EgressMessage {
    /// Finalized occupancy episode
    Record(Box<FinalizedRecord>),
    /// Crowd window threshold exceeded
    WindowAlert(WindowAlert),
    /// Loitering threshold reached
    DwellAlert(DwellAlert),
    /// Best evidence of an open session changed
    EvidenceUpdate(EvidenceUpdate),
}

impl EgressMessage {
    /// Value of the `type` field written with each line
    pub fn kind(&self) -> &'static str {
        match self {
            EgressMessage::Record(_) => "session",
            EgressMessage::WindowAlert(_) => "window_alert",
            EgressMessage::DwellAlert(_) => "dwell_alert",
            EgressMessage::EvidenceUpdate(_) => "evidence_update",
        }
    }

    /// Image attached to the message, if any
    pub fn image_ref(&self) -> Option<&ImageRef> {
        match self {
            EgressMessage::Record(r) => r.evidence_image_ref.as_ref(),
            EgressMessage::WindowAlert(a) => a.snapshot.as_ref(),
            EgressMessage::DwellAlert(a) => a.snapshot.as_ref(),
            EgressMessage::EvidenceUpdate(u) => u.image_ref.as_ref(),
        }
    }

    /// Serialize the payload with its `type` tag
    pub fn to_value(&self) -> serde_json::Result<serde_json::Value> {
        let mut value = match self {
            EgressMessage::Record(r) => serde_json::to_value(r)?,
            EgressMessage::WindowAlert(a) => serde_json::to_value(a)?,
            EgressMessage::DwellAlert(a) => serde_json::to_value(a)?,
            EgressMessage::EvidenceUpdate(u) => serde_json::to_value(u)?,
        };
        if let Some(obj) = value.as_object_mut() {
            obj.insert("type".to_string(), self.kind().into());
        }
        Ok(value)
    }
}

/// Sender handle for the egress channel
///
/// Clone this to share across multiple producers.
/// Non-blocking - if the channel is full, messages are dropped and the
/// send method returns false. A slice of the buffer is held back from
/// evidence updates so a burst of them cannot crowd out finalized records.
#[derive(Clone)]
pub struct EgressSender {
    tx: mpsc::Sender<EgressMessage>,
    /// Free slots evidence updates must leave for records and alerts
    reserved: usize,
}

impl EgressSender {
    /// Create a new sender from an mpsc sender
    pub fn new(tx: mpsc::Sender<EgressMessage>, reserved: usize) -> Self {
        Self { tx, reserved }
    }

    pub fn send_record(&self, record: &FinalizedRecord) -> bool {
        self.tx.try_send(EgressMessage::Record(Box::new(record.clone()))).is_ok()
    }

    /// Wait for channel space instead of dropping; false only if the
    /// publisher is gone. For use outside the tick loop (shutdown flush).
    pub async fn deliver_record(&self, record: &FinalizedRecord) -> bool {
        self.tx.send(EgressMessage::Record(Box::new(record.clone()))).await.is_ok()
    }

    pub fn send_window_alert(&self, alert: &WindowAlert) -> bool {
        self.tx.try_send(EgressMessage::WindowAlert(alert.clone())).is_ok()
    }

    pub fn send_dwell_alert(&self, alert: &DwellAlert) -> bool {
        self.tx.try_send(EgressMessage::DwellAlert(alert.clone())).is_ok()
    }

    /// Dropped first: refused once only the reserved slots are left
    pub fn send_evidence_update(&self, update: &EvidenceUpdate) -> bool {
        if self.tx.capacity() <= self.reserved {
            return false;
        }
        self.tx.try_send(EgressMessage::EvidenceUpdate(update.clone())).is_ok()
    }
}

/// Create a new egress channel pair
///
/// Returns (sender, receiver) where sender can be cloned and shared.
/// Buffer size determines how many messages can be queued; a quarter of it
/// is reserved for records and alerts.
pub fn create_egress_channel(buffer_size: usize) -> (EgressSender, mpsc::Receiver<EgressMessage>) {
    let buffer_size = buffer_size.max(1);
    let (tx, rx) = mpsc::channel(buffer_size);
    (EgressSender::new(tx, buffer_size / 4), rx)
}
