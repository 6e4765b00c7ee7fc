//! Platform abstraction over the live mount table.

#![allow(missing_docs)]

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use crate::core::errors::{NfsmError, Result};

const PROC_MOUNTS: &str = "/proc/self/mounts";

/// One row of the mount table.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct MountPoint {
    pub path: PathBuf,
    pub device: String,
    pub fs_type: String,
    pub options: String,
}

impl MountPoint {
    /// Whether the row belongs to an NFS client mount.
    #[must_use]
    pub fn is_nfs(&self) -> bool {
        matches!(self.fs_type.as_str(), "nfs" | "nfs4")
    }
}

/// OS abstraction used by the mount probe and operator.
pub trait Platform: Send + Sync {
    /// Current mount table. Never cached: staleness detection needs live data.
    fn mount_points(&self) -> Result<Vec<MountPoint>>;

    /// The table row whose mount path is exactly `path`, if any.
    fn mount_at(&self, path: &Path) -> Result<Option<MountPoint>> {
        Ok(self
            .mount_points()?
            .into_iter()
            .find(|mount| mount.path == path))
    }
}

/// Linux implementation backed by `/proc/self/mounts`.
#[derive(Debug, Default)]
pub struct LinuxPlatform;

impl LinuxPlatform {
    #[must_use]
    pub fn new() -> Self {
        Self
    }
}

impl Platform for LinuxPlatform {
    fn mount_points(&self) -> Result<Vec<MountPoint>> {
        let raw = fs::read_to_string(PROC_MOUNTS).map_err(|source| NfsmError::Io {
            path: PathBuf::from(PROC_MOUNTS),
            source,
        })?;
        Ok(parse_proc_mounts(&raw))
    }
}

/// In-memory mount table for deterministic tests.
#[derive(Debug, Clone, Default)]
pub struct MockPlatform {
    mounts: Arc<RwLock<Vec<MountPoint>>>,
}

impl MockPlatform {
    #[must_use]
    pub fn new(mounts: Vec<MountPoint>) -> Self {
        Self {
            mounts: Arc::new(RwLock::new(mounts)),
        }
    }

    /// Add an NFS row for `path`.
    pub fn add_nfs_mount(&self, device: &str, path: impl Into<PathBuf>) {
        self.mounts.write().push(MountPoint {
            path: path.into(),
            device: device.to_string(),
            fs_type: "nfs4".to_string(),
            options: "rw".to_string(),
        });
    }

    /// Drop every row for `path`.
    pub fn remove_mount(&self, path: &Path) {
        self.mounts.write().retain(|mount| mount.path != path);
    }
}

impl Platform for MockPlatform {
    fn mount_points(&self) -> Result<Vec<MountPoint>> {
        Ok(self.mounts.read().clone())
    }
}

/// Detect active platform implementation.
pub fn detect_platform() -> Result<Arc<dyn Platform>> {
    #[cfg(target_os = "linux")]
    {
        Ok(Arc::new(LinuxPlatform::new()))
    }
    #[cfg(not(target_os = "linux"))]
    {
        Err(NfsmError::UnsupportedPlatform {
            details: "only Linux mount tables are supported".to_string(),
        })
    }
}

pub(crate) fn parse_proc_mounts(raw: &str) -> Vec<MountPoint> {
    let mut mounts = Vec::new();
    for line in raw.lines() {
        let fields: Vec<&str> = line.split_whitespace().collect();
        if fields.len() < 3 {
            eprintln!("[NFSM-MOUNTS] skipping malformed mount table line: {line}");
            continue;
        }
        mounts.push(MountPoint {
            path: unescape_mount_path(fields[1]),
            device: unescape_mount_path(fields[0])
                .to_string_lossy()
                .into_owned(),
            fs_type: fields[2].to_string(),
            options: fields.get(3).copied().unwrap_or_default().to_string(),
        });
    }
    mounts
}

/// Decode octal escape sequences (`\NNN`) used by the Linux kernel.
/// Returns a PathBuf via OsString to preserve raw bytes (e.g. invalid UTF-8).
fn unescape_mount_path(raw: &str) -> PathBuf {
    let mut bytes = Vec::with_capacity(raw.len());
    let raw_bytes = raw.as_bytes();
    let mut i = 0;
    while i < raw_bytes.len() {
        if raw_bytes[i] == b'\\' && i + 3 < raw_bytes.len() {
            let digits = &raw_bytes[i + 1..i + 4];
            if digits.iter().all(|d| (b'0'..=b'7').contains(d)) {
                let val = (digits[0] - b'0') * 64 + (digits[1] - b'0') * 8 + (digits[2] - b'0');
                bytes.push(val);
                i += 4;
                continue;
            }
        }
        bytes.push(raw_bytes[i]);
        i += 1;
    }

    #[cfg(unix)]
    {
        use std::os::unix::ffi::OsStringExt;
        PathBuf::from(std::ffi::OsString::from_vec(bytes))
    }
    #[cfg(not(unix))]
    {
        PathBuf::from(String::from_utf8_lossy(&bytes).into_owned())
    }
}
