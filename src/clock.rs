//! Wall-clock and timezone service.
//!
//! The producer stamps access lines with an explicit UTC offset, but error
//! lines and the rotation schedule use naive local wall time. All local math
//! goes through one configured zone. "Local-epoch" seconds are the local wall
//! time's naive timestamp (UTC epoch shifted by the zone offset) — the unit
//! the rotation state file is written in.

use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, LocalResult, NaiveDateTime, TimeZone, Utc};
use chrono_tz::Tz;

/// Default zone when none is configured.
pub const DEFAULT_TZ: &str = "America/Vancouver";

#[derive(Debug, Clone, Copy)]
pub struct Clock {
    tz: Tz,
}

impl Clock {
    pub fn new(tz: Tz) -> Self {
        Self { tz }
    }

    /// Current UTC time as fractional unix seconds.
    pub fn utc_now(&self) -> f64 {
        let now = Utc::now();
        now.timestamp() as f64 + f64::from(now.timestamp_subsec_micros()) / 1e6
    }

    /// Current local-epoch seconds.
    pub fn local_epoch(&self) -> i64 {
        Utc::now()
            .with_timezone(&self.tz)
            .naive_local()
            .and_utc()
            .timestamp()
    }

    /// Current local time as fractional local-epoch seconds.
    pub fn local_now(&self) -> f64 {
        let now = Utc::now();
        let frac = f64::from(now.timestamp_subsec_micros()) / 1e6;
        now.with_timezone(&self.tz).naive_local().and_utc().timestamp() as f64 + frac
    }

    /// Access-log timestamp, brackets included: `[03/Aug/2015:12:53:06 -0700]`.
    /// The line carries its own offset, so the configured zone is not consulted.
    pub fn parse_access_time(&self, s: &str) -> Result<i64> {
        let inner = s
            .strip_prefix('[')
            .and_then(|t| t.strip_suffix(']'))
            .ok_or_else(|| anyhow!("missing brackets: {s}"))?;
        let dt = DateTime::parse_from_str(inner, "%d/%b/%Y:%H:%M:%S %z")
            .with_context(|| format!("access time: {inner}"))?;
        Ok(dt.timestamp())
    }

    /// Error-log timestamp: naive `2015/08/03 17:48:28` in the configured zone.
    pub fn parse_error_time(&self, s: &str) -> Result<i64> {
        let naive = NaiveDateTime::parse_from_str(s.trim(), "%Y/%m/%d %H:%M:%S")
            .with_context(|| format!("error time: {s}"))?;
        let local = match self.tz.from_local_datetime(&naive) {
            LocalResult::Single(dt) => dt,
            // DST fall-back repeats an hour; take the first occurrence.
            LocalResult::Ambiguous(first, _) => first,
            LocalResult::None => return Err(anyhow!("nonexistent local time: {s}")),
        };
        Ok(local.with_timezone(&Utc).timestamp())
    }

    /// Next-roll wall time: 10 digits `YYMMDDHHMM`, any separators ignored.
    /// Returns local-epoch seconds.
    pub fn parse_next_roll(&self, s: &str) -> Result<i64> {
        let digits: String = s.chars().filter(|c| c.is_ascii_digit()).collect();
        if digits.len() != 10 {
            return Err(anyhow!("expecting 10 digits but got: {digits}"));
        }
        let naive = NaiveDateTime::parse_from_str(&digits, "%y%m%d%H%M")
            .with_context(|| format!("next roll: {digits}"))?;
        Ok(naive.and_utc().timestamp())
    }
}

/// Local-epoch seconds → `YYYY-MM-DD~HH:MM:SS` (the rotation state mirror format).
pub fn iso_tilde(local_epoch: i64) -> String {
    match DateTime::from_timestamp(local_epoch, 0) {
        Some(dt) => dt.naive_utc().format("%Y-%m-%d~%H:%M:%S").to_string(),
        None => String::new(),
    }
}

/// Fractional epoch seconds → `YYYY-MM-DD HH:MM:SS.ffff` (heartbeat dt fields).
pub fn iso_frac(epoch: f64) -> String {
    let mut secs = epoch.floor() as i64;
    let mut frac = ((epoch - secs as f64) * 10_000.0).round() as u32;
    if frac >= 10_000 {
        secs += 1;
        frac = 0;
    }
    match DateTime::from_timestamp(secs, 0) {
        Some(dt) => format!("{}.{:04}", dt.naive_utc().format("%Y-%m-%d %H:%M:%S"), frac),
        None => String::new(),
    }
}

/// The `_ts` blank-decimal shape: 15-wide, 4 decimals, then the four zero
/// fraction digits blanked. The decimal point is retained for downstream
/// pattern matching: `"1438631586.    "`.
pub fn blank_decimal(epoch_secs: i64) -> String {
    format!("{:15.4}", epoch_secs as f64).replace(".0000", ".    ")
}

/// The unblanked variant used by heartbeat records: `"1438631586.9876"`.
pub fn full_decimal(epoch: f64) -> String {
    format!("{:15.4}", epoch)
}
