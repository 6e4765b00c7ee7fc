//! Activity logging: append-only JSONL written by a dedicated thread.

pub mod activity;
pub mod jsonl;
