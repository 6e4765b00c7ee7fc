//! Daemon subsystem: the supervision scheduler, signal handling, the PID
//! file, and the `state.json` snapshot.

#[cfg(feature = "daemon")]
pub mod loop_main;
#[cfg(unix)]
pub mod pidfile;
#[cfg(feature = "daemon")]
pub mod signals;
pub mod state_file;
