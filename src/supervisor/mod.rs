//! Per-share supervision: the state machine, its state, and how it reports.

pub mod machine;
pub mod report;
pub mod state;

use std::sync::Arc;

use crate::container::{ContainerController, DockerController};
use crate::core::config::SupervisionConfig;
use crate::core::errors::Result;
use crate::mount::operator::{MountOperator, SystemMountOperator};
use crate::mount::probe::{MountProbe, SystemMountProbe};
use crate::platform::pal::detect_platform;

pub use machine::ShareSupervisor;
pub use report::{EventSink, Outcome, ShareEvent};
pub use state::{SharePhase, ShareSnapshot, ShareState};

/// The three leaf capabilities a supervisor acts through.
#[derive(Clone)]
pub struct HostAdapters {
    pub probe: Arc<dyn MountProbe>,
    pub operator: Arc<dyn MountOperator>,
    pub containers: Arc<dyn ContainerController>,
}

impl HostAdapters {
    /// Real adapters: `/proc/self/mounts`, `mount`/`umount`, and `docker`.
    pub fn system(config: &SupervisionConfig) -> Result<Self> {
        let platform = detect_platform()?;
        let probe: Arc<dyn MountProbe> = Arc::new(SystemMountProbe::new(
            Arc::clone(&platform),
            config.probe_timeout(),
        ));
        let operator = Arc::new(SystemMountOperator::new(
            platform,
            Arc::clone(&probe),
            config.command_timeout(),
        ));
        let containers = Arc::new(DockerController::new(config.command_timeout()));
        Ok(Self {
            probe,
            operator,
            containers,
        })
    }
}
