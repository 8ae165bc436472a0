//! Watcher configuration.
//!
//! Assembled from clap-parsed options in `main.rs`; INI-style defaults are a
//! concern of the launcher, not this crate. The `xfile` parameter doubles as
//! the sink selector: a strict IPv4 `host:port` means the TCP collector,
//! anything else is a flat-file path.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use chrono_tz::Tz;

use crate::clock::DEFAULT_TZ;

#[derive(Debug, Clone)]
pub struct Config {
    /// Where the producer writes; live `.log` files are read in place here.
    pub watch: PathBuf,
    /// Stable (rolled/compressed) files are moved here to be processed.
    pub work: PathBuf,
    /// Terminal destination after successful shipping.
    pub sent: PathBuf,
    /// Rolling trace-log directory; stderr logging when unset.
    pub ypath: Option<PathBuf>,
    /// Seconds between watcher cycles.
    pub interval: Duration,
    /// `host:port` for the TCP collector, or a file path for the dev sink.
    pub xfile: String,
    /// Max frames per second on the TCP sender; zero = unlimited.
    pub txrate: u32,
    /// Source ID stamped into every record (`_id`).
    pub srcid: String,
    /// Sub ID stamped into every record (`_si`).
    pub subid: String,
    /// Roll period, digits + `m|h|d|w`; absence disables the rotator.
    pub roll_period: Option<String>,
    /// Next roll wall time, 10 digits `YYMMDDHHMM` (separators ignored).
    pub next_roll: Option<String>,
    /// Nonzero: log a truncated record preview at debug level.
    pub txtlen: usize,
    /// Optional operator-visible report file.
    pub report: Option<PathBuf>,
    /// Local zone for error-log timestamps and the roll schedule.
    pub tz: Tz,
    /// Emit `ae='h'` heartbeat records each cycle.
    pub heartbeat: bool,
    /// On a shrunken live file, reset progress instead of failing the cycle.
    pub truncate_reset: bool,
    /// Producer pid file, signalled SIGUSR1 after a roll.
    pub pidfile: PathBuf,
    /// Days of rolling trace logs kept in `ypath`.
    pub trace_keep: u32,
    /// Run exactly one cycle and exit.
    pub once: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            watch: PathBuf::new(),
            work: PathBuf::new(),
            sent: PathBuf::new(),
            ypath: None,
            interval: Duration::from_secs_f64(6.0),
            xfile: String::new(),
            txrate: 0,
            srcid: "nx01".to_string(),
            subid: "____".to_string(),
            roll_period: None,
            next_roll: None,
            txtlen: 0,
            report: None,
            tz: DEFAULT_TZ.parse().expect("builtin zone"),
            heartbeat: false,
            truncate_reset: false,
            pidfile: PathBuf::from("/var/run/nginx.pid"),
            trace_keep: 7,
            once: false,
        }
    }
}

impl Config {
    /// Check the directory layout before the watcher starts.
    pub fn validate(&self) -> Result<()> {
        for (label, dir) in [("watch", &self.watch), ("work", &self.work), ("sent", &self.sent)] {
            if !dir.is_dir() {
                bail!("{} path does not exist: {}", label, dir.display());
            }
        }
        let probe = self.watch.join(".nlship-write-probe");
        std::fs::write(&probe, b"").context("watch path not writable")?;
        let _ = std::fs::remove_file(&probe);
        if self.xfile.is_empty() {
            bail!("xfile (collector address or sink path) is required");
        }
        Ok(())
    }
}

/// Detect a strict IPv4 `a.b.c.d:port` string. Anything else is a file path.
pub fn parse_host_port(s: &str) -> Option<(String, u16)> {
    let (host, port) = s.split_once(':')?;
    let port: u16 = port.parse().ok()?;
    let octets: Vec<&str> = host.split('.').collect();
    if octets.len() != 4 {
        return None;
    }
    if !octets.iter().all(|o| !o.is_empty() && o.bytes().all(|b| b.is_ascii_digit())) {
        return None;
    }
    Some((host.to_string(), port))
}

/// Roll period string → minutes: digits + suffix `m`inutes, `h`ours,
/// `d`ays, `w`eeks (case-insensitive).
pub fn parse_roll_period(s: &str) -> Result<u32> {
    if s.len() < 2 {
        bail!("roll period too short: {s:?}");
    }
    let (num, sfx) = s.split_at(s.len() - 1);
    let digits: String = num.chars().filter(|c| c.is_ascii_digit()).collect();
    let n: u32 = digits
        .parse()
        .with_context(|| format!("roll period digits: {s:?}"))?;
    let per_unit = match sfx.to_ascii_uppercase().as_str() {
        "M" => 1,
        "H" => 60,
        "D" => 24 * 60,
        "W" => 7 * 24 * 60,
        other => bail!("unknown roll period suffix {other:?} in {s:?}"),
    };
    Ok(n * per_unit)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_host_port_detection() {
        assert_eq!(
            parse_host_port("10.0.0.5:9440"),
            Some(("10.0.0.5".to_string(), 9440))
        );
        assert_eq!(parse_host_port("/tmp/sent.txt"), None);
        assert_eq!(parse_host_port("host.example.com:9440"), None);
        assert_eq!(parse_host_port("10.0.0:9440"), None);
        assert_eq!(parse_host_port("10.0.0.5:port"), None);
        assert_eq!(parse_host_port("10.0.0.5"), None);
    }

    #[test]
    fn test_roll_period_units() {
        assert_eq!(parse_roll_period("30m").unwrap(), 30);
        assert_eq!(parse_roll_period("2h").unwrap(), 120);
        assert_eq!(parse_roll_period("1d").unwrap(), 1440);
        assert_eq!(parse_roll_period("1W").unwrap(), 10080);
        assert!(parse_roll_period("5x").is_err());
        assert!(parse_roll_period("d").is_err());
    }

    #[test]
    fn test_validate_requires_dirs() {
        let dir = tempfile::tempdir().unwrap();
        let mut cfg = Config {
            watch: dir.path().to_path_buf(),
            work: dir.path().to_path_buf(),
            sent: dir.path().to_path_buf(),
            xfile: "/tmp/sink.txt".to_string(),
            ..Default::default()
        };
        cfg.validate().unwrap();

        cfg.work = dir.path().join("missing");
        assert!(cfg.validate().is_err());
    }
}
