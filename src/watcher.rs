//! The watcher engine: one background task, one cycle at a time.
//!
//! Each cycle, in order: heartbeat, rotation check, ship compressed then
//! rolled files out of WORK, intake newly-stable files from WATCH into WORK
//! (with the monotone archive prefix), then incrementally tail the live
//! `.log` files in place. All filesystem mutations and every progress-store
//! write happen on this one task; there is no parallelism over logical logs.
//!
//! A cycle's first error is squawked and the cycle abandoned; the next cycle
//! starts clean. Stop is cooperative: the flag is sampled between cycles,
//! between files, and between lines, and the in-flight file's checkpoint is
//! persisted before exit.

use std::collections::HashSet;
use std::io::BufRead;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use crc32fast::Hasher;

use crate::clock::Clock;
use crate::config::Config;
use crate::files::{self, FileInfo, FileKind, LogType};
use crate::heartbeat;
use crate::pipeline::parser;
use crate::pipeline::record::{self, SourceIds};
use crate::report::Report;
use crate::rotator::Rotator;
use crate::squawk::Squawk;
use crate::state::progress::{self, Progress};
use crate::transport::Transport;

pub struct Watcher {
    cfg: Config,
    clock: Clock,
    ids_access: SourceIds,
    ids_error: SourceIds,
    transport: Transport,
    rotator: Option<Rotator>,
    report: Report,
    squawk: Squawk,
    stop: Arc<AtomicBool>,
    /// Sidecars seen this run. A persisted `verified` belongs to an earlier
    /// process; resume requires one fresh verification per file per run.
    touched: HashSet<PathBuf>,
}

impl Watcher {
    pub fn new(
        cfg: Config,
        clock: Clock,
        transport: Transport,
        rotator: Option<Rotator>,
        report: Report,
        stop: Arc<AtomicBool>,
    ) -> Self {
        let ids_access = SourceIds {
            srcid: cfg.srcid.clone(),
            subid: cfg.subid.clone(),
            el: "0".to_string(),
            sl: "a".to_string(),
        };
        let ids_error = SourceIds {
            sl: "e".to_string(),
            ..ids_access.clone()
        };
        Self {
            cfg,
            clock,
            ids_access,
            ids_error,
            transport,
            rotator,
            report,
            squawk: Squawk::new(),
            stop,
            touched: HashSet::new(),
        }
    }

    /// Run cycles until stopped. Never skips a cycle; a failed cycle is
    /// squawked and retried on the next tick.
    pub async fn run(mut self) -> Result<()> {
        tracing::info!("watcher starts");
        let interval = self.cfg.interval;
        let mut cycle_started = tokio::time::Instant::now() - interval;

        while !self.stopped() {
            let since = cycle_started.elapsed();
            if since < interval {
                self.sleep_stoppable(interval - since).await;
                if self.stopped() {
                    break;
                }
            }
            cycle_started = tokio::time::Instant::now();

            self.squawk.begin_cycle();
            if let Err(e) = self.cycle().await {
                self.squawk.error(format!("cycle failed: {e:#}"));
            }
            if self.cfg.once {
                break;
            }
        }
        tracing::info!("watcher exits");
        Ok(())
    }

    async fn cycle(&mut self) -> Result<()> {
        if self.cfg.heartbeat {
            heartbeat::emit(&mut self.transport, &self.ids_access, &self.clock)
                .await
                .context("heartbeat")?;
        }

        if let Some(rotator) = self.rotator.as_mut() {
            let rolled = rotator.tick().await.context("rotation")?;
            if rolled {
                self.report.note("rolled logs");
                self.transport.drain().await.context("post-roll drain")?;
            }
        }

        self.ship_work_archives().await?;
        self.ship_work_rolled().await?;
        self.intake_watch_archives().await?;
        self.intake_watch_rolled().await?;
        self.tail_live().await?;
        Ok(())
    }

    // -----------------------------------------------------------------
    // WORK: process stable files to completion
    // -----------------------------------------------------------------

    /// Ship every compressed archive in WORK, oldest first, then move it to
    /// SENT. Compressed sidecars carry no data and are deleted.
    async fn ship_work_archives(&mut self) -> Result<()> {
        loop {
            let archives = files::scan(&self.cfg.work, FileKind::Compressed, false)?;
            if archives.is_empty() {
                return Ok(());
            }
            for fi in archives {
                if self.stopped() {
                    return Ok(());
                }
                let src = fi.path();
                if files::is_sidecar(&fi.name) {
                    std::fs::remove_file(&src)
                        .with_context(|| format!("deleting {}", src.display()))?;
                    continue;
                }
                tracing::info!("sending {}", fi.name);
                let reader = files::gz_reader(&src)?;
                for line in reader.lines() {
                    if self.stopped() {
                        return Ok(());
                    }
                    let line = line.with_context(|| format!("reading {}", src.display()))?;
                    self.send_line(fi.log_type, &line).await?;
                }
                let dst = self.cfg.sent.join(&fi.name);
                std::fs::rename(&src, &dst)
                    .with_context(|| format!("archiving {}", fi.name))?;
                self.report.note(&format!("sent {}", fi.name));
                tracing::info!("sent {}", fi.name);
                self.transport.drain().await?;
            }
        }
    }

    /// Ship every rolled file in WORK from its checkpointed offset, then
    /// move it to SENT and drop its sidecar.
    async fn ship_work_rolled(&mut self) -> Result<()> {
        loop {
            let rolled: Vec<FileInfo> = files::scan(&self.cfg.work, FileKind::Rolled, false)?
                .into_iter()
                .filter(|fi| !files::is_sidecar(&fi.name))
                .collect();
            if rolled.is_empty() {
                return Ok(());
            }
            // Let the producer's last writes settle before reading.
            self.sleep_stoppable(self.cfg.interval / 2).await;
            for fi in rolled {
                if self.stopped() {
                    return Ok(());
                }
                self.ship_rolled_file(&fi).await?;
            }
        }
    }

    async fn ship_rolled_file(&mut self, fi: &FileInfo) -> Result<()> {
        let ty = fi.log_type;
        let src = fi.path();
        tracing::info!("opening {}", fi.name);

        let mut px = progress::load(&self.cfg.work, ty, ".1")?;
        self.reset_verified_on_first_touch(progress::sidecar_path(&self.cfg.work, ty, ".1"), &mut px);
        if px.modified == 0 && px.sent == 0 {
            tracing::warn!("no .logx.1 checkpoint for {}", fi.name);
            px.verified = true;
        }
        if px.sent > 0 && !px.verified {
            progress::verify_resume(&mut px, &src)?;
        } else {
            px.verified = true;
        }

        let pumped = self.pump_range(&src, ty, &mut px, fi.size, fi.modified).await;
        progress::save(&self.cfg.work, ty, ".1", &px)?;
        pumped?;
        if self.stopped() {
            // Checkpoint saved; the file resumes next cycle or next run.
            return Ok(());
        }

        let dst = self.cfg.sent.join(&fi.name);
        std::fs::rename(&src, &dst).with_context(|| format!("archiving {}", fi.name))?;
        progress::discard(&self.cfg.work, ty, ".1");
        self.report.note(&format!("sent {}", fi.name));
        tracing::info!("sent {}", fi.name);
        self.transport.drain().await?;
        Ok(())
    }

    // -----------------------------------------------------------------
    // WATCH: intake newly-stable files into WORK
    // -----------------------------------------------------------------

    async fn intake_watch_archives(&mut self) -> Result<()> {
        let archives = files::scan(&self.cfg.watch, FileKind::Compressed, false)?;
        if archives.is_empty() {
            return Ok(());
        }
        for fi in archives {
            let src = fi.path();
            if files::is_sidecar(&fi.name) {
                std::fs::remove_file(&src)
                    .with_context(|| format!("deleting {}", src.display()))?;
                continue;
            }
            let prefix = files::next_prefix(&self.cfg.work, &self.cfg.sent)?;
            let name = format!("{prefix}{}", fi.name);
            std::fs::rename(&src, self.cfg.work.join(&name))
                .with_context(|| format!("moving {} to work", fi.name))?;
            tracing::info!("{} -> {}", fi.name, name);
        }
        self.ship_work_archives().await
    }

    async fn intake_watch_rolled(&mut self) -> Result<()> {
        let rolled = files::scan(&self.cfg.watch, FileKind::Rolled, false)?;
        if rolled.is_empty() {
            return Ok(());
        }
        for fi in rolled {
            let src = fi.path();
            // Sidecars move unprefixed so they co-locate by base name.
            let name = if files::is_sidecar(&fi.name) {
                fi.name.clone()
            } else {
                let prefix = files::next_prefix(&self.cfg.work, &self.cfg.sent)?;
                format!("{prefix}{}", fi.name)
            };
            std::fs::rename(&src, self.cfg.work.join(&name))
                .with_context(|| format!("moving {} to work", fi.name))?;
            tracing::info!("{} -> {}", fi.name, name);
        }
        self.ship_work_rolled().await
    }

    // -----------------------------------------------------------------
    // WATCH: incremental tail of live files
    // -----------------------------------------------------------------

    async fn tail_live(&mut self) -> Result<()> {
        let live = files::scan(&self.cfg.watch, FileKind::Live, false)?;
        for fi in live {
            if self.stopped() {
                return Ok(());
            }
            let ty = fi.log_type;
            let src = fi.path();

            let mut px = progress::load(&self.cfg.watch, ty, "")?;
            self.reset_verified_on_first_touch(progress::sidecar_path(&self.cfg.watch, ty, ""), &mut px);

            if fi.size < px.size {
                if self.cfg.truncate_reset {
                    self.squawk.error(format!(
                        "{} shrank ({} -> {} bytes), resetting progress",
                        fi.name, px.size, fi.size
                    ));
                    px = Progress {
                        verified: true,
                        ..Progress::default()
                    };
                } else {
                    bail!(
                        "{} shrank ({} -> {} bytes); rotated behind our back?",
                        fi.name,
                        px.size,
                        fi.size
                    );
                }
            }

            if px.sent > 0 && !px.verified {
                progress::verify_resume(&mut px, &src)?;
            } else {
                px.verified = true;
            }

            let pumped = self.pump_range(&src, ty, &mut px, fi.size, fi.modified).await;
            progress::save(&self.cfg.watch, ty, "", &px)?;
            pumped?;
            self.transport.drain().await?;
        }
        Ok(())
    }

    // -----------------------------------------------------------------
    // Shared plumbing
    // -----------------------------------------------------------------

    /// Ship `[px.sent, observed_size)` of a file line by line, advancing the
    /// checkpoint per fully-shipped line so a reject or stop never counts a
    /// line that was not handed to the transport.
    async fn pump_range(
        &mut self,
        path: &Path,
        ty: LogType,
        px: &mut Progress,
        observed_size: u64,
        modified: i64,
    ) -> Result<()> {
        if observed_size <= px.sent {
            return Ok(());
        }
        tracing::info!(
            "sending [{} .. {}) from {}",
            px.sent,
            observed_size,
            path.display()
        );

        let bytes = files::read_range(path, px.sent, observed_size)?;
        let mut hasher = Hasher::new_with_initial(px.crc);
        let total = bytes.len();
        let mut consumed = 0usize;
        let mut outcome = Ok(());

        while consumed < total {
            if self.stopped() {
                break;
            }
            let (line, step) = {
                let rest = &bytes[consumed..];
                match rest.iter().position(|&b| b == b'\n') {
                    Some(nl) => (String::from_utf8_lossy(&rest[..nl]).into_owned(), nl + 1),
                    None => (String::from_utf8_lossy(rest).into_owned(), rest.len()),
                }
            };
            if let Err(e) = self.send_line(ty, &line).await {
                outcome = Err(e);
                break;
            }
            hasher.update(&bytes[consumed..consumed + step]);
            consumed += step;
        }

        px.crc = hasher.finalize();
        px.sent += consumed as u64;
        px.size = observed_size;
        px.modified = modified;
        outcome
    }

    /// Parse, build, and ship one raw line. Parse failures skip the line
    /// (their bytes still count as sent); transport failures propagate.
    async fn send_line(&mut self, ty: LogType, raw: &str) -> Result<()> {
        let line = raw.trim();
        if line.is_empty() {
            return Ok(());
        }
        let chunks = match parser::split_chunks(line) {
            Ok(chunks) => chunks,
            Err(e) => {
                self.squawk.error(format!("skipping line: {e}"));
                return Ok(());
            }
        };
        let ids = match ty {
            LogType::Access => &self.ids_access,
            LogType::Error => &self.ids_error,
        };
        let frame = match record::build(ty, &chunks, ids, &self.clock) {
            Ok(frame) => frame,
            Err(e) => {
                self.squawk.error(format!("skipping line: {e}"));
                return Ok(());
            }
        };
        if self.cfg.txtlen > 0 {
            let preview: String = frame.preview.chars().take(self.cfg.txtlen).collect();
            tracing::debug!("{preview}");
        }
        self.transport
            .send(frame.json.into_bytes())
            .await
            .context("shipping frame")?;
        Ok(())
    }

    fn reset_verified_on_first_touch(&mut self, sidecar: PathBuf, px: &mut Progress) {
        if self.touched.insert(sidecar) {
            px.verified = false;
        }
    }

    fn stopped(&self) -> bool {
        self.stop.load(Ordering::Relaxed)
    }

    async fn sleep_stoppable(&self, dur: Duration) {
        let deadline = tokio::time::Instant::now() + dur;
        loop {
            let now = tokio::time::Instant::now();
            if self.stopped() || now >= deadline {
                return;
            }
            let slice = (deadline - now).min(Duration::from_millis(250));
            tokio::time::sleep(slice).await;
        }
    }
}
