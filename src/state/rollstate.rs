//! Persisted rotation schedule (`<WATCH>/RollState`, JSON).
//!
//! Timestamps are local-epoch seconds with `~`-separated ISO mirrors next to
//! them for the operator. Read at startup and rewritten after every roll.

use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

/// The files rolled by a controlled rotation, in rename order.
pub const ROLL_FILES: [&str; 4] = ["access.log", "access.logx", "error.log", "error.logx"];

/// State file name, stored in WATCH.
pub const ROLLSTATE_FILE: &str = "RollState";

/// Zero-byte sentinel forcing a roll, stored in WATCH; deleted on observation.
pub const FORCEROLL_FILE: &str = "ForceRoll";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RollState {
    pub files: Vec<String>,
    pub last_iso: Option<String>,
    /// Scheduled time of the last roll, local-epoch seconds.
    pub last_ts: Option<i64>,
    pub next_iso: Option<String>,
    /// Time of the next roll, local-epoch seconds.
    pub next_ts: Option<i64>,
    pub rolled_iso: Option<String>,
    /// When a roll actually last ran (scheduled or forced).
    pub rolled_ts: Option<i64>,
    /// Roll period in minutes.
    pub rpm: Option<u32>,
}

impl Default for RollState {
    fn default() -> Self {
        Self {
            files: ROLL_FILES.iter().map(|s| s.to_string()).collect(),
            last_iso: None,
            last_ts: None,
            next_iso: None,
            next_ts: None,
            rolled_iso: None,
            rolled_ts: None,
            rpm: None,
        }
    }
}

/// Load the rotation state; an absent or unreadable file yields defaults
/// (the schedule is then reseeded from configuration).
pub fn load(watch: &Path) -> RollState {
    let path = watch.join(ROLLSTATE_FILE);
    match std::fs::read_to_string(&path) {
        Ok(text) => serde_json::from_str(&text).unwrap_or_else(|e| {
            tracing::warn!("unreadable {}: {} — reseeding", path.display(), e);
            RollState::default()
        }),
        Err(_) => RollState::default(),
    }
}

/// Persist the rotation state.
pub fn save(watch: &Path, state: &RollState) -> Result<()> {
    let path = watch.join(ROLLSTATE_FILE);
    let json = serde_json::to_string(state)?;
    std::fs::write(&path, json).with_context(|| format!("writing {}", path.display()))?;
    Ok(())
}
