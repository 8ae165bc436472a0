mod clock;
mod config;
mod files;
mod heartbeat;
mod pipeline;
mod report;
mod rotator;
mod squawk;
mod state;
mod transport;
mod watcher;

use std::io::BufRead;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use chrono::{Days, NaiveDate, Utc};
use clap::{Parser, Subcommand};

use clock::Clock;
use config::Config;
use pipeline::record::SourceIds;
use report::Report;
use rotator::Rotator;
use transport::file::FileSink;
use transport::tcp::TcpClient;
use transport::Transport;
use watcher::Watcher;

/// Base name of the rolling trace logs; the daily roller appends a date
/// stamp (`nlship.log.2026-08-01`).
const TRACE_LOG_BASENAME: &str = "nlship.log";

#[derive(Parser)]
#[command(name = "nlship", version, about = "nginx access/error log shipper")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Watch a log directory and ship records to the collector
    Watch {
        /// Directory the producer writes logs into
        #[arg(long)]
        watch: PathBuf,

        /// Directory stable (rolled/compressed) files are processed in
        #[arg(long)]
        work: PathBuf,

        /// Terminal directory for fully shipped files
        #[arg(long)]
        sent: PathBuf,

        /// Rolling trace-log directory (stderr logging when omitted)
        #[arg(long)]
        ypath: Option<PathBuf>,

        /// Seconds between watcher cycles
        #[arg(long, default_value = "6.0")]
        interval: f64,

        /// Collector address `a.b.c.d:port`, or a flat-file sink path
        #[arg(long)]
        xfile: String,

        /// Max frames per second on the TCP sender (0 = unlimited)
        #[arg(long, default_value = "0")]
        txrate: u32,

        /// Source ID stamped into every record
        #[arg(long, default_value = "nx01")]
        srcid: String,

        /// Sub ID stamped into every record
        #[arg(long, default_value = "____")]
        subid: String,

        /// Roll period, digits + m|h|d|w; omit to disable rotation
        #[arg(long)]
        rp: Option<String>,

        /// Next roll wall time, 10 digits YYMMDDHHMM (separators ignored)
        #[arg(long)]
        nr: Option<String>,

        /// Nonzero: debug-log a record preview up to this many chars
        #[arg(long, default_value = "0")]
        txtlen: usize,

        /// Operator report file (appended, best effort)
        #[arg(long)]
        rpt: Option<PathBuf>,

        /// Local zone for error-log times and the roll schedule
        #[arg(long, default_value = clock::DEFAULT_TZ)]
        tz: String,

        /// Emit ae='h' heartbeat records each cycle
        #[arg(long)]
        heartbeat: bool,

        /// Reset progress when a live file shrinks instead of failing
        #[arg(long)]
        truncate_reset: bool,

        /// Producer pid file, signalled SIGUSR1 after a roll
        #[arg(long, default_value = "/var/run/nginx.pid")]
        pidfile: PathBuf,

        /// Days of rolling trace logs kept in ypath
        #[arg(long, default_value = "7")]
        trace_keep: u32,

        /// Run exactly one cycle and exit
        #[arg(long)]
        once: bool,
    },

    /// Parse a log file and print the frames (dev/validation tool)
    Parse {
        /// Path to an access/error log (gzip accepted)
        path: PathBuf,

        /// access or error (default: detect from the file name)
        #[arg(long)]
        kind: Option<String>,

        #[arg(long, default_value = "TEST")]
        srcid: String,

        #[arg(long, default_value = "test")]
        subid: String,

        /// Print sortable `_ts|ae|json` decorated frames
        #[arg(long)]
        decorated: bool,

        /// Local zone for error-log times
        #[arg(long, default_value = clock::DEFAULT_TZ)]
        tz: String,
    },
}

/// Set up tracing once for the whole process: rolling daily files under the
/// trace directory when one is configured, plain stderr otherwise. Returns
/// the writer guard, which must stay alive until exit.
fn init_tracing(
    trace_dir: Option<&Path>,
    keep_days: u32,
) -> Result<Option<tracing_appender::non_blocking::WorkerGuard>> {
    let filter = tracing_subscriber::EnvFilter::from_default_env()
        .add_directive("nlship=info".parse()?);
    let subscriber = tracing_subscriber::fmt().with_env_filter(filter);

    let Some(dir) = trace_dir else {
        subscriber.init();
        return Ok(None);
    };

    std::fs::create_dir_all(dir).with_context(|| format!("creating {}", dir.display()))?;
    sweep_trace_logs(dir, keep_days);

    let (writer, guard) =
        tracing_appender::non_blocking(tracing_appender::rolling::daily(dir, TRACE_LOG_BASENAME));
    subscriber.with_writer(writer).with_ansi(false).init();
    Ok(Some(guard))
}

/// Drop trace logs that have aged out of the retention window. Retention
/// goes by the date stamp the daily roller puts in the file name, so a
/// box whose clock or mtimes were disturbed still keeps the right window;
/// files without a stamp are left alone.
fn sweep_trace_logs(dir: &Path, keep_days: u32) {
    let Ok(entries) = std::fs::read_dir(dir) else {
        return;
    };
    let oldest_kept = Utc::now().date_naive() - Days::new(u64::from(keep_days));
    for entry in entries.flatten() {
        let name = entry.file_name();
        let stamp = name
            .to_str()
            .and_then(|n| n.strip_prefix(TRACE_LOG_BASENAME))
            .and_then(|rest| rest.strip_prefix('.'));
        let Some(stamp) = stamp else { continue };
        if let Ok(date) = NaiveDate::parse_from_str(stamp, "%Y-%m-%d") {
            if date < oldest_kept {
                let _ = std::fs::remove_file(entry.path());
            }
        }
    }
}

fn main() -> Result<()> {
    match Cli::parse().command {
        Commands::Watch {
            watch,
            work,
            sent,
            ypath,
            interval,
            xfile,
            txrate,
            srcid,
            subid,
            rp,
            nr,
            txtlen,
            rpt,
            tz,
            heartbeat,
            truncate_reset,
            pidfile,
            trace_keep,
            once,
        } => {
            let tz = tz.parse().map_err(|e| anyhow!("bad timezone {tz:?}: {e}"))?;
            let cfg = Config {
                watch,
                work,
                sent,
                ypath,
                interval: std::time::Duration::from_secs_f64(interval),
                xfile,
                txrate,
                srcid,
                subid,
                roll_period: rp,
                next_roll: nr,
                txtlen,
                report: rpt,
                tz,
                heartbeat,
                truncate_reset,
                pidfile,
                trace_keep,
                once,
            };
            let _guard = init_tracing(cfg.ypath.as_deref(), cfg.trace_keep)?;
            let rt = tokio::runtime::Runtime::new()?;
            rt.block_on(run_watch(cfg))
        }
        Commands::Parse {
            path,
            kind,
            srcid,
            subid,
            decorated,
            tz,
        } => {
            let _guard = init_tracing(None, 0)?;
            let tz = tz.parse().map_err(|e| anyhow!("bad timezone {tz:?}: {e}"))?;
            cmd_parse(&path, kind.as_deref(), &srcid, &subid, decorated, tz)
        }
    }
}

// ---------------------------------------------------------------------------
// watch subcommand
// ---------------------------------------------------------------------------

async fn run_watch(cfg: Config) -> Result<()> {
    cfg.validate()?;

    tracing::info!("   watch: {}", cfg.watch.display());
    tracing::info!("    work: {}", cfg.work.display());
    tracing::info!("    sent: {}", cfg.sent.display());
    tracing::info!("interval: {:?}", cfg.interval);

    let transport = open_transport(&cfg).await?;
    tracing::info!("shipping to: {}", transport.describe());

    let clock = Clock::new(cfg.tz);
    let rotator = Rotator::init(&cfg, clock)?;
    let report = Report::new(cfg.report.clone());
    let stop = Arc::new(AtomicBool::new(false));
    let grace = cfg.interval * 3;

    let watcher = Watcher::new(cfg, clock, transport, rotator, report, stop.clone());
    let mut watcher_task = tokio::spawn(watcher.run());

    // Supervise: the watcher either finishes on its own (--once, or a fatal
    // startup problem) or runs until the operator interrupts the process.
    use tokio::signal::unix::{signal, SignalKind};
    let mut sigterm = signal(SignalKind::terminate()).context("installing SIGTERM handler")?;
    let interrupted = tokio::select! {
        res = &mut watcher_task => {
            res.context("watcher task")??;
            false
        }
        _ = tokio::signal::ctrl_c() => true,
        _ = sigterm.recv() => true,
    };

    if interrupted {
        tracing::info!("interrupt received, stopping watcher");
        stop.store(true, Ordering::Relaxed);
        // The watcher checkpoints its in-flight file before it quiesces.
        // Give it a few cycles' worth of grace, then take the transport
        // down with the task.
        match tokio::time::timeout(grace, &mut watcher_task).await {
            Ok(res) => res.context("watcher task")??,
            Err(_) => {
                tracing::warn!("watcher still busy after {grace:?}, shutting down anyway");
                watcher_task.abort();
            }
        }
    }

    tracing::info!("shutdown complete");
    Ok(())
}

async fn open_transport(cfg: &Config) -> Result<Transport> {
    match config::parse_host_port(&cfg.xfile) {
        Some((host, port)) => {
            let client = TcpClient::connect(&host, port, cfg.txrate)
                .await
                .with_context(|| format!("connecting to collector {host}:{port}"))?;
            Ok(Transport::Tcp(client))
        }
        None => {
            let sink = FileSink::open(Path::new(&cfg.xfile))
                .with_context(|| format!("opening sink file {}", cfg.xfile))?;
            Ok(Transport::File(sink))
        }
    }
}

// ---------------------------------------------------------------------------
// parse subcommand
// ---------------------------------------------------------------------------

fn cmd_parse(
    path: &Path,
    kind: Option<&str>,
    srcid: &str,
    subid: &str,
    decorated: bool,
    tz: chrono_tz::Tz,
) -> Result<()> {
    let name = path
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or_default();
    let ty = match kind {
        Some("access") => files::LogType::Access,
        Some("error") => files::LogType::Error,
        Some(other) => return Err(anyhow!("unknown kind {other:?} (access|error)")),
        None => files::log_type_of(name)
            .or_else(|| {
                if name.contains("access") {
                    Some(files::LogType::Access)
                } else if name.contains("error") {
                    Some(files::LogType::Error)
                } else {
                    None
                }
            })
            .context("cannot detect log type from file name; pass --kind")?,
    };

    let clock = Clock::new(tz);
    let ids = SourceIds {
        srcid: srcid.to_string(),
        subid: subid.to_string(),
        el: "0".to_string(),
        sl: match ty {
            files::LogType::Access => "a".to_string(),
            files::LogType::Error => "e".to_string(),
        },
    };

    let reader: Box<dyn BufRead> = if name.ends_with(".gz") {
        Box::new(files::gz_reader(path)?)
    } else {
        Box::new(std::io::BufReader::new(
            std::fs::File::open(path).with_context(|| format!("opening {}", path.display()))?,
        ))
    };

    let mut ok = 0usize;
    let mut skipped = 0usize;
    for line in reader.lines() {
        let line = line?;
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let frame = pipeline::parser::split_chunks(line)
            .map_err(anyhow::Error::from)
            .and_then(|chunks| {
                pipeline::record::build(ty, &chunks, &ids, &clock).map_err(anyhow::Error::from)
            });
        match frame {
            Ok(frame) => {
                if decorated {
                    println!("{}", frame.decorated());
                } else {
                    println!("{}", frame.json);
                }
                ok += 1;
            }
            Err(e) => {
                eprintln!("skipped: {e}");
                skipped += 1;
            }
        }
    }

    eprintln!("{ok} records, {skipped} skipped");
    Ok(())
}
