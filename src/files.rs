//! Filesystem adapter: classification and enumeration of log files across
//! the three directories, the monotone archive prefix, and range reads.
//!
//! Lifecycle naming, as the producer leaves it:
//! - `<type>.log` — live, currently appended
//! - `<type>.log.1` — rolled, immutable
//! - `<type>.log.N.gz` — compressed, immutable
//!
//! Files archived into WORK/SENT gain a 6-digit `NNNNNN-` prefix, so the
//! type tag is found either at position 0 or position 7 of the name.

use std::fs::File;
use std::io::{BufReader, Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use flate2::read::GzDecoder;
use memmap2::Mmap;

/// Above this size, range reads go through mmap instead of seek+read.
const MMAP_THRESHOLD: u64 = 1_048_576;

/// Which logical log a file belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LogType {
    Access,
    Error,
}

impl LogType {
    pub fn as_str(self) -> &'static str {
        match self {
            LogType::Access => "access",
            LogType::Error => "error",
        }
    }

    /// Single-letter tag carried in the `ae` record field.
    pub fn tag(self) -> char {
        match self {
            LogType::Access => 'a',
            LogType::Error => 'e',
        }
    }
}

/// Stage of life of a file, as encoded in its name.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileKind {
    Live,
    Rolled,
    Compressed,
}

/// A classified directory entry.
#[derive(Debug, Clone)]
pub struct FileInfo {
    pub dir: PathBuf,
    pub name: String,
    pub kind: FileKind,
    pub log_type: LogType,
    /// mtime, unix seconds.
    pub modified: i64,
    pub size: u64,
}

impl FileInfo {
    pub fn path(&self) -> PathBuf {
        self.dir.join(&self.name)
    }
}

/// Classify a file name as access or error, tolerating the archive prefix.
pub fn log_type_of(name: &str) -> Option<LogType> {
    for (needle, ty) in [("access.log", LogType::Access), ("error.log", LogType::Error)] {
        match name.find(needle) {
            Some(0) | Some(7) => return Some(ty),
            _ => {}
        }
    }
    None
}

/// Is this a progress sidecar (`.logx`, `.logx.1`, `.logx.N.gz`)?
pub fn is_sidecar(name: &str) -> bool {
    name.contains(".logx")
}

fn kind_matches(kind: FileKind, name: &str, include_sidecars: bool) -> bool {
    match kind {
        FileKind::Live => {
            name.ends_with(".log") || (include_sidecars && name.ends_with(".logx"))
        }
        FileKind::Rolled => name.ends_with('1'),
        FileKind::Compressed => name.ends_with(".gz"),
    }
}

/// List files of one kind in a directory, oldest-modified first.
///
/// `include_sidecars` widens the Live kind to `.logx` files (used by the
/// rotator, which rolls sidecars together with their data files). Rolled and
/// compressed scans always include sidecars; callers skip or delete them.
/// Entries that vanish between listing and stat are silently dropped.
pub fn scan(dir: &Path, kind: FileKind, include_sidecars: bool) -> Result<Vec<FileInfo>> {
    let entries =
        std::fs::read_dir(dir).with_context(|| format!("listing {}", dir.display()))?;

    let mut found = Vec::new();
    for entry in entries.flatten() {
        let name = match entry.file_name().into_string() {
            Ok(n) => n,
            Err(_) => continue,
        };
        let log_type = match log_type_of(&name) {
            Some(t) => t,
            None => continue,
        };
        if !kind_matches(kind, &name, include_sidecars) {
            continue;
        }
        let meta = match entry.metadata() {
            Ok(m) => m,
            Err(_) => continue, // renamed away under us
        };
        if !meta.is_file() {
            continue;
        }
        let modified = meta
            .modified()
            .ok()
            .and_then(|t| t.duration_since(std::time::UNIX_EPOCH).ok())
            .map(|d| d.as_secs() as i64)
            .unwrap_or(0);
        found.push(FileInfo {
            dir: dir.to_path_buf(),
            name,
            kind,
            log_type,
            modified,
            size: meta.len(),
        });
    }

    found.sort_by(|a, b| a.modified.cmp(&b.modified).then(a.name.cmp(&b.name)));
    Ok(found)
}

/// Next 6-digit archive prefix: one past the highest prefix carried by any
/// `.log.`-named file in WORK or SENT. Sidecars never count (they are stored
/// unprefixed so they co-locate with their data file by base name).
pub fn next_prefix(work: &Path, sent: &Path) -> Result<String> {
    let mut max = 0u32;
    for dir in [work, sent] {
        let entries =
            std::fs::read_dir(dir).with_context(|| format!("listing {}", dir.display()))?;
        for entry in entries.flatten() {
            let name = entry.file_name();
            let name = match name.to_str() {
                Some(n) => n,
                None => continue,
            };
            if !name.contains(".log.") {
                continue;
            }
            if let Some(pfx) = name.get(..6).and_then(|p| p.parse::<u32>().ok()) {
                max = max.max(pfx);
            }
        }
    }
    Ok(format!("{:06}-", max + 1))
}

/// Buffered line reader over a gzip archive.
pub fn gz_reader(path: &Path) -> Result<BufReader<GzDecoder<File>>> {
    let file = File::open(path).with_context(|| format!("opening {}", path.display()))?;
    Ok(BufReader::new(GzDecoder::new(file)))
}

/// Read the byte range `[start, end)` of a file.
pub fn read_range(path: &Path, start: u64, end: u64) -> Result<Vec<u8>> {
    let len = end.saturating_sub(start);
    if len == 0 {
        return Ok(Vec::new());
    }
    let mut file = File::open(path).with_context(|| format!("opening {}", path.display()))?;

    if len > MMAP_THRESHOLD {
        let mmap = unsafe { Mmap::map(&file) }
            .with_context(|| format!("mmap {}", path.display()))?;
        let lo = (start as usize).min(mmap.len());
        let hi = (end as usize).min(mmap.len());
        return Ok(mmap[lo..hi].to_vec());
    }

    file.seek(SeekFrom::Start(start))
        .with_context(|| format!("seeking {}", path.display()))?;
    let mut buf = Vec::with_capacity(len as usize);
    file.take(len)
        .read_to_end(&mut buf)
        .with_context(|| format!("reading {}", path.display()))?;
    Ok(buf)
}
