//! Convenience re-exports for library consumers.
//!
//! ```rust,no_run
//! use nfs_mount_supervisor::prelude::*;
//! ```

// Core
pub use crate::core::config::{Config, ShareConfig, SupervisionConfig};
pub use crate::core::errors::{NfsmError, Result};

// Host capabilities
pub use crate::container::{ContainerController, DockerController};
pub use crate::mount::operator::{MountOperator, SystemMountOperator};
pub use crate::mount::probe::{MountProbe, ProbeOutcome, SystemMountProbe};
pub use crate::platform::pal::{MountPoint, Platform, detect_platform};

// Supervision
pub use crate::supervisor::{
    EventSink, HostAdapters, Outcome, ShareEvent, SharePhase, ShareSnapshot, ShareSupervisor,
};

// Daemon
#[cfg(feature = "daemon")]
pub use crate::daemon::loop_main::{ShutdownReport, SupervisionScheduler, run_daemon};
#[cfg(feature = "daemon")]
pub use crate::daemon::signals::ShutdownHandle;
