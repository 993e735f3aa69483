//! Services - business logic and state management
//!
//! This module contains the core business logic services:
//! - `engine` - Single-writer tick loop orchestrating everything below
//! - `session_table` - Per-entity session state and track memory
//! - `lifecycle` - Absence countdown and one-shot finalization
//! - `arbitrator` - Best-of evidence selection
//! - `recognition_pool` - Async recognition workers behind bounded queues
//! - `window` - Sliding-window crowd aggregation

pub mod arbitrator;
pub mod engine;
pub mod lifecycle;
pub mod recognition_pool;
pub mod session_table;
pub mod window;

// Re-export commonly used types
pub use engine::{TickReport, ZoneEngine};
pub use recognition_pool::{
    RecognitionJob, RecognitionPool, RecognitionQueues, RecognitionResult, Recognizer, TextRules,
};
