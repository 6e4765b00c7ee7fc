//! NFSM-prefixed error types with structured error codes.

#![allow(missing_docs)]

use std::path::{Path, PathBuf};
use std::time::Duration;

use thiserror::Error;

/// Shared `Result` alias for the project.
pub type Result<T> = std::result::Result<T, NfsmError>;

/// Top-level error type for the NFS mount supervisor.
#[derive(Debug, Error)]
pub enum NfsmError {
    #[error("[NFSM-1001] invalid configuration: {details}")]
    InvalidConfig { details: String },

    #[error("[NFSM-1002] missing configuration file: {path}")]
    MissingConfig { path: PathBuf },

    #[error("[NFSM-1003] configuration parse failure in {context}: {details}")]
    ConfigParse {
        context: &'static str,
        details: String,
    },

    #[error("[NFSM-1101] unsupported platform: {details}")]
    UnsupportedPlatform { details: String },

    #[error("[NFSM-2001] mount of {source_spec} on {path} failed: {details}")]
    MountFailed {
        source_spec: String,
        path: PathBuf,
        details: String,
    },

    #[error("[NFSM-2002] mount table parse failure: {details}")]
    MountParse { details: String },

    #[error("[NFSM-2003] safety veto for {path}: {reason}")]
    SafetyVeto { path: PathBuf, reason: String },

    #[error("[NFSM-2004] unmount of {path} failed: {details}")]
    UnmountFailed { path: PathBuf, details: String },

    #[error("[NFSM-2005] container {container} {action} failed: {details}")]
    Container {
        container: String,
        action: &'static str,
        details: String,
    },

    #[error("[NFSM-2006] probe of {path} failed: {details}")]
    Probe { path: PathBuf, details: String },

    #[error("[NFSM-2101] serialization failure in {context}: {details}")]
    Serialization {
        context: &'static str,
        details: String,
    },

    #[error("[NFSM-3001] permission denied for {path}")]
    PermissionDenied { path: PathBuf },

    #[error("[NFSM-3002] IO failure at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("[NFSM-3003] channel closed in component {component}")]
    ChannelClosed { component: &'static str },

    #[error("[NFSM-3004] command `{command}` timed out after {timeout:?}")]
    CommandTimeout { command: String, timeout: Duration },

    #[error("[NFSM-3900] runtime failure: {details}")]
    Runtime { details: String },
}

impl NfsmError {
    /// Stable machine-parseable error code.
    #[must_use]
    pub const fn code(&self) -> &'static str {
        match self {
            Self::InvalidConfig { .. } => "NFSM-1001",
            Self::MissingConfig { .. } => "NFSM-1002",
            Self::ConfigParse { .. } => "NFSM-1003",
            Self::UnsupportedPlatform { .. } => "NFSM-1101",
            Self::MountFailed { .. } => "NFSM-2001",
            Self::MountParse { .. } => "NFSM-2002",
            Self::SafetyVeto { .. } => "NFSM-2003",
            Self::UnmountFailed { .. } => "NFSM-2004",
            Self::Container { .. } => "NFSM-2005",
            Self::Probe { .. } => "NFSM-2006",
            Self::Serialization { .. } => "NFSM-2101",
            Self::PermissionDenied { .. } => "NFSM-3001",
            Self::Io { .. } => "NFSM-3002",
            Self::ChannelClosed { .. } => "NFSM-3003",
            Self::CommandTimeout { .. } => "NFSM-3004",
            Self::Runtime { .. } => "NFSM-3900",
        }
    }

    /// Whether retrying might resolve the failure.
    ///
    /// Supervisors retry everything on the next tick regardless; this only
    /// feeds severity selection in the activity log.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::MountFailed { .. }
                | Self::UnmountFailed { .. }
                | Self::Container { .. }
                | Self::Probe { .. }
                | Self::Io { .. }
                | Self::ChannelClosed { .. }
                | Self::CommandTimeout { .. }
                | Self::Runtime { .. }
        )
    }

    /// Convenience constructor for IO errors with a known path.
    #[must_use]
    pub fn io(path: impl AsRef<Path>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.as_ref().to_path_buf(),
            source,
        }
    }

    /// Short failure description without the code prefix, used for
    /// `last_error` in share state snapshots.
    #[must_use]
    pub fn summary(&self) -> String {
        let full = self.to_string();
        match full.split_once("] ") {
            Some((_, rest)) => rest.to_string(),
            None => full,
        }
    }
}

impl From<serde_json::Error> for NfsmError {
    fn from(value: serde_json::Error) -> Self {
        Self::Serialization {
            context: "serde_json",
            details: value.to_string(),
        }
    }
}

impl From<toml::de::Error> for NfsmError {
    fn from(value: toml::de::Error) -> Self {
        Self::ConfigParse {
            context: "toml",
            details: value.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn all_variants() -> Vec<NfsmError> {
        vec![
            NfsmError::InvalidConfig {
                details: String::new(),
            },
            NfsmError::MissingConfig {
                path: PathBuf::new(),
            },
            NfsmError::ConfigParse {
                context: "",
                details: String::new(),
            },
            NfsmError::UnsupportedPlatform {
                details: String::new(),
            },
            NfsmError::MountFailed {
                source_spec: String::new(),
                path: PathBuf::new(),
                details: String::new(),
            },
            NfsmError::MountParse {
                details: String::new(),
            },
            NfsmError::SafetyVeto {
                path: PathBuf::new(),
                reason: String::new(),
            },
            NfsmError::UnmountFailed {
                path: PathBuf::new(),
                details: String::new(),
            },
            NfsmError::Container {
                container: String::new(),
                action: "stop",
                details: String::new(),
            },
            NfsmError::Probe {
                path: PathBuf::new(),
                details: String::new(),
            },
            NfsmError::Serialization {
                context: "",
                details: String::new(),
            },
            NfsmError::PermissionDenied {
                path: PathBuf::new(),
            },
            NfsmError::Io {
                path: PathBuf::new(),
                source: std::io::Error::other("test"),
            },
            NfsmError::ChannelClosed { component: "" },
            NfsmError::CommandTimeout {
                command: String::new(),
                timeout: Duration::from_secs(1),
            },
            NfsmError::Runtime {
                details: String::new(),
            },
        ]
    }

    #[test]
    fn error_codes_are_unique_and_prefixed() {
        let errors = all_variants();
        let codes: Vec<&str> = errors.iter().map(NfsmError::code).collect();
        let unique: std::collections::HashSet<&&str> = codes.iter().collect();
        assert_eq!(codes.len(), unique.len(), "error codes must be unique: {codes:?}");
        for code in codes {
            assert!(code.starts_with("NFSM-"), "code {code} must start with NFSM-");
        }
    }

    #[test]
    fn error_display_includes_code() {
        let err = NfsmError::MountFailed {
            source_spec: "10.0.0.5:/export/docs".to_string(),
            path: PathBuf::from("/mnt/docs"),
            details: "connection timed out".to_string(),
        };
        let msg = err.to_string();
        assert!(msg.contains("NFSM-2001"), "display should contain code: {msg}");
        assert!(msg.contains("10.0.0.5:/export/docs"));
        assert!(msg.contains("connection timed out"));
    }

    #[test]
    fn summary_strips_code_prefix() {
        let err = NfsmError::Runtime {
            details: "boom".to_string(),
        };
        assert_eq!(err.summary(), "runtime failure: boom");
    }

    #[test]
    fn config_errors_are_not_retryable() {
        assert!(
            !NfsmError::InvalidConfig {
                details: String::new()
            }
            .is_retryable()
        );
        assert!(
            !NfsmError::SafetyVeto {
                path: PathBuf::new(),
                reason: String::new()
            }
            .is_retryable()
        );
        assert!(
            NfsmError::MountFailed {
                source_spec: String::new(),
                path: PathBuf::new(),
                details: String::new()
            }
            .is_retryable()
        );
        assert!(
            NfsmError::CommandTimeout {
                command: "mount".to_string(),
                timeout: Duration::from_secs(30)
            }
            .is_retryable()
        );
    }

    #[test]
    fn io_convenience_constructor() {
        let err = NfsmError::io(
            "/mnt/docs",
            std::io::Error::new(std::io::ErrorKind::NotFound, "gone"),
        );
        assert_eq!(err.code(), "NFSM-3002");
        assert!(err.to_string().contains("/mnt/docs"));
    }

    #[test]
    fn from_serde_json_error() {
        let json_err = serde_json::from_str::<serde_json::Value>("not json").unwrap_err();
        let err: NfsmError = json_err.into();
        assert_eq!(err.code(), "NFSM-2101");
    }

    #[test]
    fn from_toml_error() {
        let toml_err = toml::from_str::<toml::Value>("= invalid").unwrap_err();
        let err: NfsmError = toml_err.into();
        assert_eq!(err.code(), "NFSM-1003");
    }
}
