#![forbid(unsafe_code)]

//! nfs_mount_supervisor: keeps a declared set of NFS shares mounted, detects
//! stale handles and remounts them, and stops/starts a co-located container
//! around every mount change.
//!
//! Layers, leaves first:
//! 1. **Host capabilities** ([`mount`], [`container`]): mount-table probe,
//!    mount/unmount/clear, and container control behind traits.
//! 2. **Supervision** ([`supervisor`]): one state machine per share that only
//!    decides and acts through those traits.
//! 3. **Scheduling** ([`daemon`]): one worker per share on a shared tick,
//!    signal-driven shutdown, PID file, and `state.json`.
//!
//! # Library usage
//!
//! ```rust,no_run
//! use nfs_mount_supervisor::prelude::*;
//! ```
//!
//! [`testing`] provides in-memory host doubles for driving supervisors
//! without touching the OS.

pub mod prelude;

pub mod container;
pub mod core;
pub mod daemon;
pub mod logger;
pub mod mount;
pub mod platform;
pub mod supervisor;
pub mod testing;
