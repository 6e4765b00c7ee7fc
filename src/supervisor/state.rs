//! Share phases, per-share mutable state, and retry backoff.

#![allow(missing_docs)]

use std::fmt;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// State-machine phase of one share.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum SharePhase {
    #[default]
    Unmounted,
    PreparingMount,
    Mounting,
    Mounted,
    CheckingHealth,
    Stale,
    Remounting,
    StartingContainer,
    Failed,
}

impl SharePhase {
    pub const ALL: [Self; 9] = [
        Self::Unmounted,
        Self::PreparingMount,
        Self::Mounting,
        Self::Mounted,
        Self::CheckingHealth,
        Self::Stale,
        Self::Remounting,
        Self::StartingContainer,
        Self::Failed,
    ];

    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Unmounted => "unmounted",
            Self::PreparingMount => "preparing_mount",
            Self::Mounting => "mounting",
            Self::Mounted => "mounted",
            Self::CheckingHealth => "checking_health",
            Self::Stale => "stale",
            Self::Remounting => "remounting",
            Self::StartingContainer => "starting_container",
            Self::Failed => "failed",
        }
    }

    /// Legal edges of the supervision state machine. Every phase may drop to
    /// `Unmounted` on shutdown.
    #[must_use]
    pub const fn can_transition_to(self, next: Self) -> bool {
        use SharePhase::{
            CheckingHealth, Failed, Mounted, Mounting, PreparingMount, Remounting, Stale,
            StartingContainer, Unmounted,
        };
        matches!(
            (self, next),
            (_, Unmounted)
                | (Unmounted, PreparingMount)
                | (PreparingMount, Mounting)
                | (Mounting, Mounted | Failed)
                | (Mounted, CheckingHealth | StartingContainer | Stale)
                | (CheckingHealth, Mounted | Stale)
                | (StartingContainer, Mounted)
                | (Stale, Remounting)
        )
    }
}

impl fmt::Display for SharePhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Mutable state owned exclusively by one supervisor.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ShareState {
    pub phase: SharePhase,
    pub consecutive_failures: u32,
    pub last_error: Option<String>,
}

/// Retry delay in ticks after `failures` consecutive failures: `min(2^failures, cap)`.
///
/// A cap of 0 is treated as 1 so the share is never retried in the same tick.
#[must_use]
pub fn backoff_ticks(failures: u32, cap: u32) -> u64 {
    let cap = u64::from(cap.max(1));
    1_u64.checked_shl(failures).map_or(cap, |ticks| ticks.min(cap))
}

/// Point-in-time view of a share, published to the status board and the
/// state file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShareSnapshot {
    pub name: String,
    pub local_path: PathBuf,
    pub phase: SharePhase,
    pub consecutive_failures: u32,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub last_error: Option<String>,
    /// RFC 3339 UTC.
    pub updated_at: String,
}
