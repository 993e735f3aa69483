//! File egress - appends records and alerts to a JSONL file
//!
//! One JSON object per line, written to the file specified in config.
//! Parent directories are created on first write.

use std::fs::OpenOptions;
use std::io::Write;
use std::path::Path;
use tracing::{debug, error, info};

/// JSONL egress writer
pub struct Egress {
    file_path: String,
}

impl Egress {
    pub fn new(file_path: &str) -> Self {
        info!(file_path = %file_path, "egress_initialized");
        Self { file_path: file_path.to_string() }
    }

    pub fn file_path(&self) -> &str {
        &self.file_path
    }

    /// Write one JSON value as a line
    /// Returns true if successful, false otherwise
    pub fn write_value(&self, value: &serde_json::Value) -> bool {
        let line = value.to_string();

        match self.append_line(&line) {
            Ok(()) => true,
            Err(e) => {
                error!(file = %self.file_path, error = %e, "egress_write_failed");
                false
            }
        }
    }

    /// Append a line to the egress file
    fn append_line(&self, line: &str) -> std::io::Result<()> {
        let path = Path::new(&self.file_path);

        // Create parent directories if they don't exist
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() && !parent.exists() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let mut file = OpenOptions::new().create(true).append(true).open(path)?;

        writeln!(file, "{}", line)?;
        debug!(file = %self.file_path, bytes = %line.len(), "egress_written");

        Ok(())
    }
}
