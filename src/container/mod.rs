//! Container coordination: stop a share's consumer before touching the mount
//! point, start it again once the share is mounted.

#![allow(missing_docs)]

use std::time::Duration;

use crate::core::config::is_no_container;
use crate::core::errors::{NfsmError, Result};
use crate::platform::command::{CommandOutput, run_with_timeout};

/// Leaf capability: control a named container.
///
/// `stop` and `start` are success no-ops for the "none" sentinel, and
/// idempotent for real containers.
pub trait ContainerController: Send + Sync {
    fn stop(&self, id: &str) -> Result<()>;
    fn start(&self, id: &str) -> Result<()>;
    fn is_running(&self, id: &str) -> Result<bool>;
}

/// Controller driving the `docker` CLI.
#[derive(Debug, Clone)]
pub struct DockerController {
    binary: String,
    timeout: Duration,
}

impl DockerController {
    #[must_use]
    pub fn new(timeout: Duration) -> Self {
        Self::with_binary("docker", timeout)
    }

    /// Use an alternative CLI with docker-compatible verbs (e.g. `podman`).
    #[must_use]
    pub fn with_binary(binary: impl Into<String>, timeout: Duration) -> Self {
        Self {
            binary: binary.into(),
            timeout,
        }
    }

    fn invoke(&self, action: &'static str, args: &[&str], id: &str) -> Result<CommandOutput> {
        run_with_timeout(&self.binary, args, self.timeout).map_err(|e| NfsmError::Container {
            container: id.to_string(),
            action,
            details: e.to_string(),
        })
    }

    fn lifecycle(&self, action: &'static str, id: &str) -> Result<()> {
        if is_no_container(id) {
            return Ok(());
        }
        let output = self.invoke(action, &[action, id], id)?;
        if output.success() {
            Ok(())
        } else {
            Err(NfsmError::Container {
                container: id.to_string(),
                action,
                details: output.failure_detail(),
            })
        }
    }
}

impl ContainerController for DockerController {
    fn stop(&self, id: &str) -> Result<()> {
        self.lifecycle("stop", id)
    }

    fn start(&self, id: &str) -> Result<()> {
        self.lifecycle("start", id)
    }

    fn is_running(&self, id: &str) -> Result<bool> {
        if is_no_container(id) {
            return Ok(false);
        }
        let output = self.invoke("inspect", &["inspect", "-f", "{{.State.Running}}", id], id)?;
        if !output.success() {
            return Err(NfsmError::Container {
                container: id.to_string(),
                action: "inspect",
                details: output.failure_detail(),
            });
        }
        parse_running(&output.stdout).ok_or_else(|| NfsmError::Container {
            container: id.to_string(),
            action: "inspect",
            details: format!("unexpected inspect output: {:?}", output.stdout.trim()),
        })
    }
}

fn parse_running(stdout: &str) -> Option<bool> {
    match stdout.trim() {
        "true" => Some(true),
        "false" => Some(false),
        _ => None,
    }
}
