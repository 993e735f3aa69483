//! Domain models - detections, zone geometry, evidence and output records
//!
//! - `types` - ids, timestamps, bounding boxes, frames
//! - `zone` - polygon zone with point-in-polygon test
//! - `evidence` - recognized text evidence and its ranking
//! - `record` - finalized session records and alerts

pub mod evidence;
pub mod record;
pub mod types;
pub mod zone;

pub use evidence::{Evidence, TextCandidate};
pub use record::{DwellAlert, EndReason, EvidenceUpdate, FinalizedRecord, Severity, WindowAlert};
pub use types::{BBox, Detection, EntityId, Frame, ImageRef, Point, SessionId, Timestamp};
pub use zone::Zone;
