//! Platform abstraction layer: mount table access and bounded command execution.

pub mod command;
pub mod pal;
