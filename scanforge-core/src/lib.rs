//! Domain types, on-disk task storage, the task state machine, idempotency
//! cache, and the KV/queue client for the scan-orchestration service.
//!
//! This crate carries no network or HTTP concerns — it is the foundation
//! `scanforge-engine` and `scanforge-server` build on, the same role the
//! teacher's `stalkermap-core` plays underneath `stalkermap`.

pub mod config;
pub mod error;
pub mod idempotency;
pub mod ids;
pub mod kv;
pub mod model;
pub mod state_machine;
pub mod target_filter;
pub mod task_store;
pub mod validation;

pub use error::{Result, ScanforgeError};
