//! Core types, configuration, and error handling for plan-race
//!
//! This crate provides:
//! - Query-shape identity and parameter types (`CacheKey`, `BoundParameter`, ...)
//! - Harness configuration (`HarnessConfig`, environment parsing)
//! - Lock ordering wrappers shared by the cache and the harness
//! - Reproduction context capture for reports
//! - Common error types

#![forbid(unsafe_code)]

pub mod config;
pub mod error;
pub mod lock_order;
pub mod models;
pub mod repro;

// Re-export key types for convenience
pub use config::{ConfigSource, HarnessConfig};
pub use error::{Error, Result};
pub use lock_order::{LockLevel, OrderedMutex, OrderedMutexGuard, OrderedRwLock};
pub use models::{BarrierPhase, BoundParameter, CacheKey, SlotMode, WorkerId};
pub use repro::{ReproContext, write_artifact};
