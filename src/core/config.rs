//! Configuration system: TOML (or legacy JSON) file + env var overrides + defaults.

#![allow(missing_docs)]

use std::collections::HashSet;
use std::env;
use std::fs;
use std::path::{Component, Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::core::errors::{NfsmError, Result};

/// Reserved container identifier meaning "no container to coordinate with".
pub const NO_CONTAINER: &str = "none";

/// Full daemon configuration model.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(default)]
pub struct Config {
    pub shares: Vec<ShareConfig>,
    pub supervision: SupervisionConfig,
    pub paths: PathsConfig,
}

/// One NFS share to keep mounted.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ShareConfig {
    pub name: String,
    pub server: String,
    pub remote_path: String,
    pub local_path: PathBuf,
    /// Passed verbatim to `mount -o`.
    pub options: String,
    /// Container to stop before (re)mounting and start afterwards.
    pub docker: String,
    /// Wipe the mount point's local contents before every mount attempt.
    pub delete_on_mount: bool,
}

impl Default for ShareConfig {
    fn default() -> Self {
        Self {
            name: String::new(),
            server: String::new(),
            remote_path: String::new(),
            local_path: PathBuf::new(),
            options: String::new(),
            docker: NO_CONTAINER.to_string(),
            delete_on_mount: false,
        }
    }
}

impl ShareConfig {
    /// `server:remote_path`, the device argument handed to mount.
    #[must_use]
    pub fn source_spec(&self) -> String {
        format!("{}:{}", self.server, self.remote_path)
    }

    /// The coordinated container, if any.
    #[must_use]
    pub fn container(&self) -> Option<&str> {
        if is_no_container(&self.docker) {
            None
        } else {
            Some(self.docker.as_str())
        }
    }
}

/// True when `id` is the "no container" sentinel (or blank).
#[must_use]
pub fn is_no_container(id: &str) -> bool {
    let trimmed = id.trim();
    trimmed.is_empty() || trimmed.eq_ignore_ascii_case(NO_CONTAINER)
}

/// Scheduler timing and retry knobs.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct SupervisionConfig {
    /// Seconds between supervision passes.
    pub tick_interval_secs: u64,
    /// Upper bound on the exponential retry multiplier (in ticks).
    pub max_backoff_factor: u32,
    /// Bound on the health-check directory listing before a mount is declared stale.
    pub probe_timeout_ms: u64,
    /// Bound on each external command (mount, umount, docker).
    pub command_timeout_secs: u64,
    /// Overall budget for unmounting everything on termination.
    pub shutdown_timeout_secs: u64,
    /// How often the daemon rewrites `state.json`.
    pub state_write_interval_secs: u64,
}

impl Default for SupervisionConfig {
    fn default() -> Self {
        Self {
            tick_interval_secs: 60,
            max_backoff_factor: 16,
            probe_timeout_ms: 5_000,
            command_timeout_secs: 30,
            shutdown_timeout_secs: 30,
            state_write_interval_secs: 30,
        }
    }
}

impl SupervisionConfig {
    #[must_use]
    pub fn tick_interval(&self) -> Duration {
        Duration::from_secs(self.tick_interval_secs)
    }

    #[must_use]
    pub fn probe_timeout(&self) -> Duration {
        Duration::from_millis(self.probe_timeout_ms)
    }

    #[must_use]
    pub fn command_timeout(&self) -> Duration {
        Duration::from_secs(self.command_timeout_secs)
    }

    #[must_use]
    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_secs(self.shutdown_timeout_secs)
    }
}

/// Filesystem paths used by the daemon and CLI.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct PathsConfig {
    pub config_file: PathBuf,
    pub jsonl_log: PathBuf,
    pub state_file: PathBuf,
    pub pid_file: PathBuf,
}

impl Default for PathsConfig {
    fn default() -> Self {
        Self {
            config_file: PathBuf::from("/etc/nfsmgr/config.toml"),
            jsonl_log: PathBuf::from("/var/log/nfsmgr/activity.jsonl"),
            state_file: PathBuf::from("/var/lib/nfsmgr/state.json"),
            pid_file: PathBuf::from("/var/run/nfsmgr.pid"),
        }
    }
}

impl Config {
    /// Default configuration path.
    #[must_use]
    pub fn default_path() -> PathBuf {
        PathsConfig::default().config_file
    }

    /// Load config from the default or an explicit path, apply env overrides,
    /// normalize, and validate.
    ///
    /// A share list is the whole point of the daemon, so a missing file is an
    /// error on both the default and explicit path.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let path_buf = path.map_or_else(Self::default_path, Path::to_path_buf);
        if !path_buf.exists() {
            return Err(NfsmError::MissingConfig { path: path_buf });
        }

        let raw = fs::read_to_string(&path_buf).map_err(|source| NfsmError::io(&path_buf, source))?;
        let mut cfg = Self::parse(&raw, &path_buf)?;

        cfg.paths.config_file = path_buf;
        cfg.apply_env_overrides_from(env_var)?;
        cfg.normalize_paths();
        cfg.validate()?;
        Ok(cfg)
    }

    /// Parse raw file contents; `.json` files use the legacy JSON layout,
    /// everything else is TOML.
    pub fn parse(raw: &str, path: &Path) -> Result<Self> {
        let is_json = path
            .extension()
            .is_some_and(|ext| ext.eq_ignore_ascii_case("json"));
        if is_json {
            serde_json::from_str(raw).map_err(|error| NfsmError::ConfigParse {
                context: "json",
                details: error.to_string(),
            })
        } else {
            Ok(toml::from_str(raw)?)
        }
    }

    /// Deterministic hash of the effective config for logging.
    ///
    /// FNV-1a over the canonical JSON so the value is stable across processes.
    pub fn stable_hash(&self) -> Result<String> {
        let canonical = serde_json::to_string(self)?;
        let mut hash: u64 = 0xcbf2_9ce4_8422_2325;
        for byte in canonical.as_bytes() {
            hash ^= u64::from(*byte);
            hash = hash.wrapping_mul(0x0100_0000_01b3);
        }
        Ok(format!("{hash:016x}"))
    }

    fn apply_env_overrides_from<F>(&mut self, mut lookup: F) -> Result<()>
    where
        F: FnMut(&str) -> Option<String>,
    {
        let sup = &mut self.supervision;
        if let Some(raw) = lookup("NFSM_TICK_INTERVAL_SECS") {
            sup.tick_interval_secs = parse_env("NFSM_TICK_INTERVAL_SECS", &raw)?;
        }
        if let Some(raw) = lookup("NFSM_MAX_BACKOFF_FACTOR") {
            sup.max_backoff_factor = parse_env("NFSM_MAX_BACKOFF_FACTOR", &raw)?;
        }
        if let Some(raw) = lookup("NFSM_PROBE_TIMEOUT_MS") {
            sup.probe_timeout_ms = parse_env("NFSM_PROBE_TIMEOUT_MS", &raw)?;
        }
        if let Some(raw) = lookup("NFSM_COMMAND_TIMEOUT_SECS") {
            sup.command_timeout_secs = parse_env("NFSM_COMMAND_TIMEOUT_SECS", &raw)?;
        }
        if let Some(raw) = lookup("NFSM_SHUTDOWN_TIMEOUT_SECS") {
            sup.shutdown_timeout_secs = parse_env("NFSM_SHUTDOWN_TIMEOUT_SECS", &raw)?;
        }

        if let Some(raw) = lookup("NFSM_JSONL_LOG") {
            self.paths.jsonl_log = PathBuf::from(raw);
        }
        if let Some(raw) = lookup("NFSM_STATE_FILE") {
            self.paths.state_file = PathBuf::from(raw);
        }
        if let Some(raw) = lookup("NFSM_PID_FILE") {
            self.paths.pid_file = PathBuf::from(raw);
        }
        Ok(())
    }

    /// Bring mount points into the form the kernel reports in the mount
    /// table, so overlap checks and mount-table lookups compare like with
    /// like.
    fn normalize_paths(&mut self) {
        for share in &mut self.shares {
            share.local_path = canonical_mount_point(&share.local_path);
            share.name = share.name.trim().to_string();
            share.server = share.server.trim().to_string();
            if share.remote_path.len() > 1
                && let Some(stripped) = share.remote_path.strip_suffix('/')
            {
                share.remote_path = stripped.to_string();
            }
        }
    }

    /// Reject share sets that cannot be supervised safely.
    pub fn validate(&self) -> Result<()> {
        let sup = &self.supervision;
        for (name, value) in [
            ("tick_interval_secs", sup.tick_interval_secs),
            ("probe_timeout_ms", sup.probe_timeout_ms),
            ("command_timeout_secs", sup.command_timeout_secs),
            ("shutdown_timeout_secs", sup.shutdown_timeout_secs),
            ("state_write_interval_secs", sup.state_write_interval_secs),
        ] {
            if value == 0 {
                return Err(NfsmError::InvalidConfig {
                    details: format!("supervision.{name} must be > 0"),
                });
            }
        }
        if sup.max_backoff_factor == 0 {
            return Err(NfsmError::InvalidConfig {
                details: "supervision.max_backoff_factor must be >= 1".to_string(),
            });
        }

        validate_shares(&self.shares)
    }
}

/// Per-share checks: required fields, absolute non-root mount points, unique
/// names, and no two mount points nested inside each other.
pub fn validate_shares(shares: &[ShareConfig]) -> Result<()> {
    let mut names = HashSet::new();
    for (index, share) in shares.iter().enumerate() {
        let label = if share.name.is_empty() {
            format!("shares[{index}]")
        } else {
            format!("share '{}'", share.name)
        };
        for (field, value) in [
            ("name", share.name.as_str()),
            ("server", share.server.as_str()),
            ("remote_path", share.remote_path.as_str()),
            ("options", share.options.as_str()),
        ] {
            if value.trim().is_empty() {
                return Err(NfsmError::InvalidConfig {
                    details: format!("{label}: {field} must not be empty"),
                });
            }
        }
        if share.name.chars().any(char::is_control) {
            return Err(NfsmError::InvalidConfig {
                details: format!("{label}: name must not contain control characters"),
            });
        }
        if share.local_path.as_os_str().is_empty() {
            return Err(NfsmError::InvalidConfig {
                details: format!("{label}: local_path must not be empty"),
            });
        }
        if !share.local_path.is_absolute() {
            return Err(NfsmError::InvalidConfig {
                details: format!(
                    "{label}: local_path must be absolute, got {}",
                    share.local_path.display()
                ),
            });
        }
        if lexical_normalize(&share.local_path) == Path::new("/") {
            return Err(NfsmError::InvalidConfig {
                details: format!("{label}: local_path must not be the filesystem root"),
            });
        }
        if !names.insert(share.name.as_str()) {
            return Err(NfsmError::InvalidConfig {
                details: format!("duplicate share name '{}'", share.name),
            });
        }
    }

    for (i, left) in shares.iter().enumerate() {
        for right in &shares[i + 1..] {
            if paths_overlap(&left.local_path, &right.local_path) {
                return Err(NfsmError::InvalidConfig {
                    details: format!(
                        "local paths overlap: '{}' ({}) and '{}' ({})",
                        left.name,
                        left.local_path.display(),
                        right.name,
                        right.local_path.display()
                    ),
                });
            }
        }
    }

    Ok(())
}

/// Two mount points overlap when they are equal or one contains the other.
#[must_use]
pub fn paths_overlap(left: &Path, right: &Path) -> bool {
    let (left, right) = (lexical_normalize(left), lexical_normalize(right));
    left.starts_with(&right) || right.starts_with(&left)
}

/// Resolve `.`, `..`, repeated and trailing slashes without touching the
/// filesystem. `..` never climbs above the root.
#[must_use]
pub fn lexical_normalize(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                if !out.pop() && !path.is_absolute() {
                    out.push("..");
                }
            }
            other => out.push(other.as_os_str()),
        }
    }
    if out.as_os_str().is_empty() && path.is_absolute() {
        out.push("/");
    }
    out
}

/// Lexically normalize `path`, then resolve symlinks in its parent when the
/// parent exists. The mount point itself is never stat'ed: on a dead hard
/// NFS mount that call blocks.
#[must_use]
pub fn canonical_mount_point(path: &Path) -> PathBuf {
    let normalized = lexical_normalize(path);
    if !normalized.is_absolute() {
        return normalized;
    }
    let (Some(parent), Some(leaf)) = (normalized.parent(), normalized.file_name()) else {
        return normalized;
    };
    match fs::canonicalize(parent) {
        Ok(resolved) => resolved.join(leaf),
        Err(_) => normalized,
    }
}

fn env_var(name: &str) -> Option<String> {
    env::var(name).ok().filter(|raw| !raw.trim().is_empty())
}

fn parse_env<T>(name: &str, raw: &str) -> Result<T>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    raw.trim().parse::<T>().map_err(|error| NfsmError::ConfigParse {
        context: "env",
        details: format!("{name}={raw:?}: {error}"),
    })
}
