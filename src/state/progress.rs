//! Per-log shipping progress sidecar (`<type>.logx[.1]`).
//!
//! Tracks how much of a live or rolled file has already been transmitted:
//! `{modified, sent, crc, size, verified}` where `crc` covers the byte range
//! `[0, sent)` of the data file. Rolled to a `.1` companion alongside its
//! data file so a rolled file resumes from the exact checkpointed byte.
//!
//! Stored as a small versioned little-endian binary record (magic `LOGX`,
//! version 1) rather than any runtime-dependent serialization, so the file
//! survives upgrades. Saves are write-to-temp + rename.

use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use crc32fast::Hasher;

use crate::files::{self, LogType};

const MAGIC: [u8; 4] = *b"LOGX";
const VERSION: u8 = 1;
const ENCODED_LEN: usize = 34;

/// Checkpointed shipping progress for one data file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Progress {
    /// Last observed mtime of the data file, unix seconds.
    pub modified: i64,
    /// Bytes transmitted and handed to the transport, from the file head.
    pub sent: u64,
    /// CRC-32 over `[0, sent)` of the data file.
    pub crc: u32,
    /// Data file size when `sent` was last advanced.
    pub size: u64,
    /// Whether `crc` has been re-checked against the file this process run.
    pub verified: bool,
}

impl Progress {
    fn encode(&self) -> [u8; ENCODED_LEN] {
        let mut buf = [0u8; ENCODED_LEN];
        buf[0..4].copy_from_slice(&MAGIC);
        buf[4] = VERSION;
        buf[5..13].copy_from_slice(&self.modified.to_le_bytes());
        buf[13..21].copy_from_slice(&self.sent.to_le_bytes());
        buf[21..25].copy_from_slice(&self.crc.to_le_bytes());
        buf[25..33].copy_from_slice(&self.size.to_le_bytes());
        buf[33] = self.verified as u8;
        buf
    }

    fn decode(buf: &[u8]) -> Result<Self> {
        if buf.len() != ENCODED_LEN {
            bail!("progress record is {} bytes, expected {}", buf.len(), ENCODED_LEN);
        }
        if buf[0..4] != MAGIC {
            bail!("progress record has bad magic");
        }
        if buf[4] != VERSION {
            bail!("progress record version {} unsupported", buf[4]);
        }
        Ok(Self {
            modified: i64::from_le_bytes(buf[5..13].try_into().unwrap()),
            sent: u64::from_le_bytes(buf[13..21].try_into().unwrap()),
            crc: u32::from_le_bytes(buf[21..25].try_into().unwrap()),
            size: u64::from_le_bytes(buf[25..33].try_into().unwrap()),
            verified: buf[33] != 0,
        })
    }
}

/// Sidecar path for `(dir, type, suffix)`; suffix is `""` or `".1"`.
pub fn sidecar_path(dir: &Path, ty: LogType, suffix: &str) -> PathBuf {
    dir.join(format!("{}.logx{}", ty.as_str(), suffix))
}

/// Load a sidecar. A missing file yields zeroed defaults; a corrupt or
/// wrong-version file is an error (shipping blind would double-send).
pub fn load(dir: &Path, ty: LogType, suffix: &str) -> Result<Progress> {
    let path = sidecar_path(dir, ty, suffix);
    let buf = match std::fs::read(&path) {
        Ok(buf) => buf,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Progress::default()),
        Err(e) => return Err(e).with_context(|| format!("reading {}", path.display())),
    };
    Progress::decode(&buf).with_context(|| format!("decoding {}", path.display()))
}

/// Persist a sidecar atomically. Failure here is fatal to the caller's
/// cycle: without the checkpoint, a restart would ship the data twice.
pub fn save(dir: &Path, ty: LogType, suffix: &str, progress: &Progress) -> Result<()> {
    let path = sidecar_path(dir, ty, suffix);
    let tmp = dir.join(format!("{}.logx{}.tmp", ty.as_str(), suffix));
    std::fs::write(&tmp, progress.encode())
        .with_context(|| format!("writing {}", tmp.display()))?;
    std::fs::rename(&tmp, &path)
        .with_context(|| format!("replacing {}", path.display()))?;
    Ok(())
}

/// Best-effort delete.
pub fn discard(dir: &Path, ty: LogType, suffix: &str) {
    let _ = std::fs::remove_file(sidecar_path(dir, ty, suffix));
}

/// One-time resume verification: recompute the CRC over `[0, sent)` of the
/// data file and compare. On mismatch the checkpoint is untrustworthy, so
/// progress resets to the head. Returns true when reset.
pub fn verify_resume(progress: &mut Progress, data_path: &Path) -> Result<bool> {
    if progress.sent == 0 || progress.verified {
        progress.verified = true;
        return Ok(false);
    }
    let prefix = files::read_range(data_path, 0, progress.sent)?;
    let mut hasher = Hasher::new();
    hasher.update(&prefix);
    let crc = hasher.finalize();
    progress.verified = true;
    if crc != progress.crc || prefix.len() as u64 != progress.sent {
        tracing::warn!(
            "checkpoint CRC mismatch for {} (sent {}), re-shipping from head",
            data_path.display(),
            progress.sent
        );
        progress.sent = 0;
        progress.crc = 0;
        return Ok(true);
    }
    Ok(false)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn crc_of(data: &[u8]) -> u32 {
        let mut h = Hasher::new();
        h.update(data);
        h.finalize()
    }

    #[test]
    fn test_missing_sidecar_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let p = load(dir.path(), LogType::Access, "").unwrap();
        assert_eq!(p, Progress::default());
        assert!(!p.verified);
    }

    #[test]
    fn test_save_load_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let p = Progress {
            modified: 1438631586,
            sent: 600,
            crc: 0xdead_beef,
            size: 1000,
            verified: true,
        };
        save(dir.path(), LogType::Error, ".1", &p).unwrap();
        let back = load(dir.path(), LogType::Error, ".1").unwrap();
        assert_eq!(back, p);
        assert!(sidecar_path(dir.path(), LogType::Error, ".1").exists());
    }

    #[test]
    fn test_corrupt_sidecar_is_error() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(sidecar_path(dir.path(), LogType::Access, ""), b"garbage").unwrap();
        assert!(load(dir.path(), LogType::Access, "").is_err());
    }

    #[test]
    fn test_bad_magic_is_error() {
        let dir = tempfile::tempdir().unwrap();
        let mut buf = Progress::default().encode();
        buf[0] = b'Z';
        std::fs::write(sidecar_path(dir.path(), LogType::Access, ""), buf).unwrap();
        assert!(load(dir.path(), LogType::Access, "").is_err());
    }

    #[test]
    fn test_discard_is_silent() {
        let dir = tempfile::tempdir().unwrap();
        discard(dir.path(), LogType::Access, ".1"); // nothing there, no panic
        save(dir.path(), LogType::Access, ".1", &Progress::default()).unwrap();
        discard(dir.path(), LogType::Access, ".1");
        assert!(!sidecar_path(dir.path(), LogType::Access, ".1").exists());
    }

    #[test]
    fn test_verify_resume_match() {
        let dir = tempfile::tempdir().unwrap();
        let data = b"0123456789".repeat(100); // 1000 bytes
        let path = dir.path().join("access.log");
        std::fs::write(&path, &data).unwrap();

        let mut p = Progress {
            sent: 600,
            crc: crc_of(&data[..600]),
            size: 600,
            ..Default::default()
        };
        let reset = verify_resume(&mut p, &path).unwrap();
        assert!(!reset);
        assert!(p.verified);
        assert_eq!(p.sent, 600);
    }

    #[test]
    fn test_verify_resume_mismatch_resets() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("access.log");
        std::fs::write(&path, b"x".repeat(1000)).unwrap();

        let mut p = Progress {
            sent: 600,
            crc: 12345, // wrong
            size: 600,
            ..Default::default()
        };
        let reset = verify_resume(&mut p, &path).unwrap();
        assert!(reset);
        assert!(p.verified);
        assert_eq!(p.sent, 0);
        assert_eq!(p.crc, 0);
    }

    #[test]
    fn test_verify_runs_only_once() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("access.log");
        std::fs::write(&path, b"abc").unwrap();

        let mut p = Progress {
            sent: 3,
            crc: 999, // wrong, but already verified
            size: 3,
            verified: true,
            ..Default::default()
        };
        let reset = verify_resume(&mut p, &path).unwrap();
        assert!(!reset, "verified checkpoints are trusted");
        assert_eq!(p.sent, 3);
    }
}
