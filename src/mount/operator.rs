//! Mount, forced unmount, and mount-point clearing against the host OS.

#![allow(missing_docs)]

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use crate::core::config::ShareConfig;
use crate::core::errors::{NfsmError, Result};
use crate::mount::probe::{MountProbe, ProbeOutcome};
use crate::platform::command::{CommandOutput, render_command, run_with_timeout};
use crate::platform::pal::Platform;

/// Result of clearing a mount point's local contents.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ClearSummary {
    pub removed: usize,
    pub failed: Vec<(PathBuf, String)>,
}

impl ClearSummary {
    #[must_use]
    pub fn is_complete(&self) -> bool {
        self.failed.is_empty()
    }
}

/// Leaf capability: effectful mount operations.
pub trait MountOperator: Send + Sync {
    /// Mount `server:remote_path` on the share's local path, creating the
    /// mount point first.
    fn mount(&self, share: &ShareConfig) -> Result<()>;

    /// Force-unmount `path`. A path that is not mounted is a success.
    fn force_unmount(&self, path: &Path) -> Result<()>;

    /// Remove everything under `path` (but not `path` itself). Refuses with
    /// [`NfsmError::SafetyVeto`] while the path is mounted.
    fn clear_directory(&self, path: &Path) -> Result<ClearSummary>;
}

/// Operator that shells out to `mount`/`umount`.
pub struct SystemMountOperator {
    platform: Arc<dyn Platform>,
    probe: Arc<dyn MountProbe>,
    command_timeout: Duration,
}

impl SystemMountOperator {
    #[must_use]
    pub fn new(
        platform: Arc<dyn Platform>,
        probe: Arc<dyn MountProbe>,
        command_timeout: Duration,
    ) -> Self {
        Self {
            platform,
            probe,
            command_timeout,
        }
    }

    fn run(&self, program: &str, args: &[&str]) -> Result<CommandOutput> {
        run_with_timeout(program, args, self.command_timeout)
    }
}

/// Argument vector for `mount`.
#[must_use]
pub fn mount_args(share: &ShareConfig) -> Vec<String> {
    vec![
        "-t".to_string(),
        "nfs".to_string(),
        share.source_spec(),
        share.local_path.to_string_lossy().into_owned(),
        "-o".to_string(),
        share.options.clone(),
    ]
}

impl MountOperator for SystemMountOperator {
    fn mount(&self, share: &ShareConfig) -> Result<()> {
        fs::create_dir_all(&share.local_path)
            .map_err(|source| NfsmError::io(&share.local_path, source))?;

        let args = mount_args(share);
        let arg_refs: Vec<&str> = args.iter().map(String::as_str).collect();
        let output = self.run("mount", &arg_refs).map_err(|e| NfsmError::MountFailed {
            source_spec: share.source_spec(),
            path: share.local_path.clone(),
            details: e.to_string(),
        })?;

        if output.success() {
            Ok(())
        } else {
            Err(NfsmError::MountFailed {
                source_spec: share.source_spec(),
                path: share.local_path.clone(),
                details: output.failure_detail(),
            })
        }
    }

    fn force_unmount(&self, path: &Path) -> Result<()> {
        if self.platform.mount_at(path)?.is_none() {
            return Ok(());
        }

        let path_str = path.to_string_lossy();
        let args = ["-f", path_str.as_ref()];
        let output = self.run("umount", &args).map_err(|e| NfsmError::UnmountFailed {
            path: path.to_path_buf(),
            details: e.to_string(),
        })?;
        if output.success() {
            return Ok(());
        }

        // Another actor may have unmounted it between the check and the call.
        if self.platform.mount_at(path)?.is_none() {
            return Ok(());
        }
        Err(NfsmError::UnmountFailed {
            path: path.to_path_buf(),
            details: format!(
                "{}: {}",
                render_command("umount", &args),
                output.failure_detail()
            ),
        })
    }

    fn clear_directory(&self, path: &Path) -> Result<ClearSummary> {
        let observed = self.probe.probe(path);
        if observed != ProbeOutcome::NotMounted {
            return Err(NfsmError::SafetyVeto {
                path: path.to_path_buf(),
                reason: format!("refusing to clear: {}", observed.describe()),
            });
        }
        clear_local_contents(path)
    }
}

/// Remove files, symlinks, and directories directly under `path`.
///
/// A missing directory is an empty success. Per-entry failures are collected
/// and the sweep continues.
pub fn clear_local_contents(path: &Path) -> Result<ClearSummary> {
    let entries = match fs::read_dir(path) {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(ClearSummary::default()),
        Err(source) => return Err(NfsmError::io(path, source)),
    };

    let mut summary = ClearSummary::default();
    for entry in entries {
        let entry = entry.map_err(|source| NfsmError::io(path, source))?;
        let item = entry.path();
        let removal = match fs::symlink_metadata(&item) {
            Ok(meta) if meta.is_dir() => fs::remove_dir_all(&item),
            Ok(_) => fs::remove_file(&item),
            Err(e) => Err(e),
        };
        match removal {
            Ok(()) => summary.removed += 1,
            Err(e) => summary.failed.push((item, e.to_string())),
        }
    }
    Ok(summary)
}
