//! Recognized evidence and its best-of ordering
//!
//! Evidence is ranked by:
//! 1. validity (valid text first)
//! 2. confidence (higher first)
//! 3. recency of the frame it came from (newer first)
//! 4. text, only to make the order total
//!
//! Because the order is total, the best of a set of candidates does not
//! depend on the order in which they arrive.

use crate::domain::types::{ImageRef, Timestamp};
use serde::Serialize;
use std::cmp::Ordering;

/// Raw output of a recognizer call
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TextCandidate {
    pub text: String,
    pub confidence: f64,
}

impl TextCandidate {
    pub fn new(text: impl Into<String>, confidence: f64) -> Self {
        Self { text: text.into(), confidence }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Evidence {
    pub text: Option<String>,
    pub confidence: f64,
    pub valid: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source_image_ref: Option<ImageRef>,
    pub observed_at: Timestamp,
    /// Detector confidence of the frame the crop came from
    pub detection_confidence: f64,
}

impl Evidence {
    /// True if this evidence ranks strictly above `other`
    #[inline]
    pub fn is_better_than(&self, other: &Evidence) -> bool {
        rank_cmp(self, other) == Ordering::Less
    }

    pub fn has_text(&self) -> bool {
        self.text.as_deref().is_some_and(|t| !t.is_empty())
    }
}

/// Ordering where `Less` means "ranks first"
pub fn rank_cmp(a: &Evidence, b: &Evidence) -> Ordering {
    b.valid
        .cmp(&a.valid)
        .then_with(|| b.confidence.total_cmp(&a.confidence))
        .then_with(|| b.observed_at.cmp(&a.observed_at))
        .then_with(|| a.text.cmp(&b.text))
}
