//! Signal handling: SIGTERM/SIGINT request a graceful shutdown.
//!
//! Uses `signal-hook` flag registration; the scheduler polls the flag between
//! sleep slices instead of blocking on signals.

#![allow(missing_docs)]

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use signal_hook::consts::{SIGINT, SIGTERM};

/// Cloneable shutdown trigger shared by the scheduler, signal hooks, and
/// anyone embedding the scheduler.
#[derive(Debug, Clone, Default)]
pub struct ShutdownHandle {
    flag: Arc<AtomicBool>,
}

impl ShutdownHandle {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn request(&self) {
        self.flag.store(true, Ordering::Relaxed);
    }

    #[must_use]
    pub fn is_requested(&self) -> bool {
        self.flag.load(Ordering::Relaxed)
    }
}

/// Routes termination signals into a [`ShutdownHandle`].
#[derive(Clone)]
pub struct SignalHandler {
    shutdown: ShutdownHandle,
}

impl SignalHandler {
    /// Register SIGTERM and SIGINT against `shutdown`.
    ///
    /// Registration is best-effort; failures are reported on stderr.
    #[must_use]
    pub fn install(shutdown: ShutdownHandle) -> Self {
        for (signal, name) in [(SIGTERM, "SIGTERM"), (SIGINT, "SIGINT")] {
            if let Err(e) = signal_hook::flag::register(signal, Arc::clone(&shutdown.flag)) {
                eprintln!("[NFSM-SIGNAL] failed to register {name}: {e}");
            }
        }
        Self { shutdown }
    }

    #[must_use]
    pub fn should_shutdown(&self) -> bool {
        self.shutdown.is_requested()
    }

    /// Programmatic equivalent of receiving SIGTERM.
    pub fn request_shutdown(&self) {
        self.shutdown.request();
    }
}
