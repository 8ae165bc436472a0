//! Controlled rename rotation.
//!
//! On schedule (or on the `ForceRoll` sentinel), renames the live `.log`
//! and `.logx` files to `.1`, recreates empty `.log` files, signals the
//! producer to reopen its logs, and persists the advanced schedule. Rolled
//! `.1` files are then picked up by the normal watcher intake.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{bail, Context, Result};

use crate::clock::{iso_tilde, Clock};
use crate::config::{self, Config};
use crate::files::{self, FileKind};
use crate::state::rollstate::{self, RollState, FORCEROLL_FILE, ROLL_FILES};

pub struct Rotator {
    watch: PathBuf,
    pidfile: PathBuf,
    interval: Duration,
    rpm: u32,
    clock: Clock,
    state: RollState,
}

impl Rotator {
    /// Build the rotator from configuration. Returns `None` when no roll
    /// period is configured (rotation disabled).
    pub fn init(cfg: &Config, clock: Clock) -> Result<Option<Self>> {
        let Some(period) = &cfg.roll_period else {
            return Ok(None);
        };
        let rpm = config::parse_roll_period(period)?;
        if rpm < 5 {
            bail!("roll period under 5 minutes: {rpm}");
        }

        let mut state = rollstate::load(&cfg.watch);
        state.rpm = Some(rpm);

        // A supplied next-roll time reseeds the schedule; so does a state
        // file that has never rolled.
        if cfg.next_roll.is_some() || state.last_ts.is_none() {
            let nr = cfg
                .next_roll
                .as_deref()
                .context("next roll time (nr) needed to seed the rotation schedule")?;
            let next = clock.parse_next_roll(nr)?;
            let last = next - i64::from(rpm) * 60;
            state.last_ts = Some(last);
            state.last_iso = Some(iso_tilde(last));
        }

        let mut rotator = Self {
            watch: cfg.watch.clone(),
            pidfile: cfg.pidfile.clone(),
            interval: cfg.interval,
            rpm,
            clock,
            state,
        };
        let now = rotator.clock.local_epoch();
        rotator.reschedule(now);
        rollstate::save(&rotator.watch, &rotator.state)?;
        tracing::info!(
            "next log roll @ {}",
            rotator.state.next_iso.as_deref().unwrap_or("?")
        );
        Ok(Some(rotator))
    }

    pub fn next_ts(&self) -> Option<i64> {
        self.state.next_ts
    }

    /// Called once per watcher cycle. Returns true when a roll ran.
    pub async fn tick(&mut self) -> Result<bool> {
        let forced = self.force_requested()?;
        let now = self.clock.local_epoch();
        let due = forced || self.state.next_ts.map(|next| now > next).unwrap_or(false);
        if !due {
            return Ok(false);
        }

        // A previous roll that was never fully consumed means the producer
        // is ahead of us; rolling again would clobber it.
        let leftovers = files::scan(&self.watch, FileKind::Rolled, true)?;
        if !leftovers.is_empty() {
            let names: Vec<&str> = leftovers.iter().map(|f| f.name.as_str()).collect();
            tracing::error!(
                "{} unconsumed .1 files at roll time, skipping roll: {:?}",
                names.len(),
                names
            );
            return Ok(false);
        }

        let mut rolled: Vec<&str> = Vec::new();
        for name in ROLL_FILES {
            let src = self.watch.join(name);
            if !src.is_file() {
                continue;
            }
            let dst = self.watch.join(format!("{name}.1"));
            std::fs::rename(&src, &dst)
                .with_context(|| format!("rolling {} -> {}", src.display(), dst.display()))?;
            // Live .log files come right back, empty; .logx sidecars are
            // recreated on demand by the next checkpoint.
            if !name.ends_with('x') {
                std::fs::File::create(&src)
                    .with_context(|| format!("recreating {}", src.display()))?;
            }
            rolled.push(name);
        }

        if rolled.is_empty() {
            tracing::warn!("roll due but no log files present");
        } else {
            if forced {
                tracing::info!("forced a roll");
            }
            tracing::info!("{} rolled: {:?}", rolled.len(), rolled);
            self.signal_producer();
            tokio::time::sleep(self.interval / 2).await;
        }

        self.state.rolled_ts = Some(now);
        self.state.rolled_iso = Some(iso_tilde(now));
        if !forced {
            self.state.last_ts = self.state.next_ts;
            self.state.last_iso = self.state.next_iso.clone();
        }
        self.reschedule(now);
        rollstate::save(&self.watch, &self.state)?;
        tracing::info!(
            "next log roll @ {}",
            self.state.next_iso.as_deref().unwrap_or("?")
        );
        Ok(!rolled.is_empty())
    }

    /// Derive `next_ts` from `last_ts`, strictly in the future.
    fn reschedule(&mut self, now: i64) {
        let period = i64::from(self.rpm) * 60;
        let last = self.state.last_ts.unwrap_or(now);
        let mut next = last + period;
        while next <= now {
            next += period;
        }
        self.state.next_ts = Some(next);
        self.state.next_iso = Some(iso_tilde(next));
    }

    /// Observe and consume the ForceRoll sentinel. Deleting before rolling
    /// debounces a second trigger into the next cycle.
    fn force_requested(&self) -> Result<bool> {
        let path = self.watch.join(FORCEROLL_FILE);
        if !path.is_file() {
            return Ok(false);
        }
        std::fs::remove_file(&path)
            .with_context(|| format!("removing {}", path.display()))?;
        Ok(true)
    }

    #[cfg(target_os = "linux")]
    fn signal_producer(&self) {
        let pid = std::fs::read_to_string(&self.pidfile)
            .ok()
            .and_then(|s| s.trim().parse::<i32>().ok());
        match pid {
            Some(pid) => {
                let rc = unsafe { libc::kill(pid, libc::SIGUSR1) };
                if rc == 0 {
                    tracing::info!("signalled producer (pid {pid}) to reopen logs");
                } else {
                    tracing::error!(
                        "could not signal producer pid {pid}: {}",
                        std::io::Error::last_os_error()
                    );
                }
            }
            None => {
                tracing::warn!("no producer pid at {}, not signalling", self.pidfile.display());
            }
        }
    }

    #[cfg(not(target_os = "linux"))]
    fn signal_producer(&self) {
        tracing::debug!("producer signalling unsupported on this platform");
    }
}
