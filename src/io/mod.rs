//! IO modules - external system interfaces
//!
//! This module contains all external IO operations:
//! - `frame_source` - JSON-lines frame input from a file or stdin
//! - `recognizer` - HTTP adapter for the text recognition service
//! - `egress_channel` - Typed channel for egress messages
//! - `egress` - JSONL file output
//! - `publisher` - Drains the egress channel to file and HTTP
//! - `prometheus` - Prometheus metrics HTTP endpoint

pub mod egress;
pub mod egress_channel;
pub mod frame_source;
pub mod prometheus;
pub mod publisher;
pub mod recognizer;

// Re-export commonly used types
pub use egress_channel::{create_egress_channel, EgressMessage, EgressSender};
pub use frame_source::FrameSource;
pub use publisher::Publisher;
pub use recognizer::HttpRecognizer;
