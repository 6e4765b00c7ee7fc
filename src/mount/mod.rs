//! Mount capabilities: observing mount health and performing mount operations.

pub mod operator;
pub mod probe;
