//! Shared types for zone-sentinel

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use uuid::Uuid;

/// Newtype wrapper for tracker-assigned entity IDs to provide type safety
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[repr(transparent)]
pub struct EntityId(pub i64);

impl std::fmt::Display for EntityId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Locally generated episode identity (UUIDv7, time-sortable)
///
/// Track ids are not durable across occlusion or re-entry, so every
/// occupancy episode gets its own id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(transparent)]
pub struct SessionId(Uuid);

impl SessionId {
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }
}

impl Default for SessionId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for SessionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Frame time in milliseconds (video/stream clock, not the host clock)
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct Timestamp(pub u64);

impl Timestamp {
    #[inline]
    pub fn from_millis(ms: u64) -> Self {
        Self(ms)
    }

    #[inline]
    pub fn from_secs(secs: u64) -> Self {
        Self(secs.saturating_mul(1000))
    }

    #[inline]
    pub fn as_millis(&self) -> u64 {
        self.0
    }

    /// Time elapsed since `earlier`, zero if `earlier` is in the future
    #[inline]
    pub fn duration_since(&self, earlier: Timestamp) -> Duration {
        Duration::from_millis(self.0.saturating_sub(earlier.0))
    }

    #[inline]
    pub fn saturating_sub(&self, d: Duration) -> Timestamp {
        Timestamp(self.0.saturating_sub(d.as_millis() as u64))
    }
}

impl std::fmt::Display for Timestamp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}ms", self.0)
    }
}

/// Get current epoch milliseconds
#[inline]
pub fn epoch_ms() -> u64 {
    SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default().as_millis() as u64
}

/// Pixel-space point
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Point {
    pub x: f64,
    pub y: f64,
}

impl Point {
    #[inline]
    pub fn new(x: f64, y: f64) -> Self {
        Self { x, y }
    }
}

/// Axis-aligned bounding box `[x1, y1, x2, y2]` in pixel space
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(from = "[f64; 4]", into = "[f64; 4]")]
pub struct BBox {
    pub x1: f64,
    pub y1: f64,
    pub x2: f64,
    pub y2: f64,
}

impl From<[f64; 4]> for BBox {
    fn from(v: [f64; 4]) -> Self {
        Self { x1: v[0], y1: v[1], x2: v[2], y2: v[3] }
    }
}

impl From<BBox> for [f64; 4] {
    fn from(b: BBox) -> Self {
        [b.x1, b.y1, b.x2, b.y2]
    }
}

impl BBox {
    pub fn center(&self) -> Point {
        Point::new((self.x1 + self.x2) / 2.0, (self.y1 + self.y2) / 2.0)
    }

    /// Ground-contact point, useful for people walking through a floor zone
    pub fn bottom_center(&self) -> Point {
        Point::new((self.x1 + self.x2) / 2.0, self.y1.max(self.y2))
    }
}

/// Reference to an image (file path or URL) owned by an external collaborator
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ImageRef(pub String);

impl ImageRef {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for ImageRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// One tracked object in one frame, as reported by the detector/tracker
#[derive(Debug, Clone, Deserialize)]
pub struct Detection {
    #[serde(rename = "id")]
    pub entity_id: EntityId,
    pub bbox: BBox,
    #[serde(rename = "conf", default)]
    pub confidence: f64,
    #[serde(default)]
    pub class: Option<String>,
    /// Crop of this entity for recognition
    #[serde(default)]
    pub crop: Option<ImageRef>,
}

/// A single tick worth of detections
#[derive(Debug, Clone, Deserialize)]
pub struct Frame {
    #[serde(rename = "t_ms")]
    pub time: Timestamp,
    /// Wall-clock capture time; filled with the receive time when absent
    #[serde(default)]
    pub wall: Option<DateTime<Utc>>,
    /// Full-frame snapshot used for alerts
    #[serde(default)]
    pub snapshot: Option<ImageRef>,
    #[serde(default)]
    pub detections: Vec<Detection>,
}

impl Frame {
    pub fn new(time: Timestamp, detections: Vec<Detection>) -> Self {
        Self { time, wall: None, snapshot: None, detections }
    }

    /// Wall time of the frame, falling back to now
    pub fn wall_time(&self) -> DateTime<Utc> {
        self.wall.unwrap_or_else(Utc::now)
    }
}
