//! Reporting seam between supervisors and the activity log.

#![allow(missing_docs)]

use serde::{Deserialize, Serialize};

use crate::logger::jsonl::Severity;
use crate::supervisor::state::SharePhase;

/// How the action attached to a transition went.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Outcome {
    Ok,
    /// A best-effort step failed; the transition still happened.
    Degraded,
    Failed,
    /// A destructive step was refused by its safety precondition.
    Vetoed,
}

impl Outcome {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Ok => "ok",
            Self::Degraded => "degraded",
            Self::Failed => "failed",
            Self::Vetoed => "vetoed",
        }
    }

    #[must_use]
    pub const fn severity(self) -> Severity {
        match self {
            Self::Ok => Severity::Info,
            Self::Degraded | Self::Failed => Severity::Warning,
            Self::Vetoed => Severity::Critical,
        }
    }
}

/// One reported transition or failure.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShareEvent {
    pub share: String,
    pub from: SharePhase,
    pub to: SharePhase,
    pub outcome: Outcome,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub detail: Option<String>,
    /// Set when the event concerns a container action.
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub container: Option<String>,
}

impl ShareEvent {
    #[must_use]
    pub fn new(share: &str, from: SharePhase, to: SharePhase, outcome: Outcome) -> Self {
        Self {
            share: share.to_string(),
            from,
            to,
            outcome,
            detail: None,
            container: None,
        }
    }

    #[must_use]
    pub fn with_detail(mut self, detail: impl Into<String>) -> Self {
        self.detail = Some(detail.into());
        self
    }

    #[must_use]
    pub fn with_container(mut self, container: &str) -> Self {
        self.container = Some(container.to_string());
        self
    }
}

/// Concurrency-safe, append-only destination for share events.
///
/// Implementations must not block the caller for long; supervisors report
/// from inside their tick.
pub trait EventSink: Send + Sync {
    fn report(&self, event: ShareEvent);

    /// Free-form operational message not tied to a transition.
    fn notice(&self, severity: Severity, message: &str) {
        eprintln!("[NFSM-NOTICE] {severity}: {message}");
    }

    /// Events this sink had to discard under back-pressure.
    fn dropped_events(&self) -> u64 {
        0
    }
}

/// Sink that only writes to stderr. Used when no activity log is configured
/// (e.g. `nfsmgr validate`).
#[derive(Debug, Clone, Copy, Default)]
pub struct StderrSink;

impl EventSink for StderrSink {
    fn report(&self, event: ShareEvent) {
        let detail = event.detail.as_deref().unwrap_or("");
        eprintln!(
            "[NFSM-SHARE] {} {} -> {} ({}) {detail}",
            event.share,
            event.from,
            event.to,
            event.outcome.as_str()
        );
    }
}
