//! Best-effort operator report file.
//!
//! When configured, file-level events (shipped, rolled) are appended as
//! timestamped lines. Report IO never fails a cycle.

use std::io::Write;
use std::path::PathBuf;

use chrono::Utc;

#[derive(Debug, Clone, Default)]
pub struct Report {
    path: Option<PathBuf>,
}

impl Report {
    pub fn new(path: Option<PathBuf>) -> Self {
        Self { path }
    }

    pub fn note(&self, msg: &str) {
        let Some(path) = &self.path else { return };
        let line = format!("{}  {}\n", Utc::now().format("%Y-%m-%d %H:%M:%S"), msg);
        let result = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .and_then(|mut f| f.write_all(line.as_bytes()));
        if let Err(e) = result {
            tracing::debug!("report append failed: {e}");
        }
    }
}
