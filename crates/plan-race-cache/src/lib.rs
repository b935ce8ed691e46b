//! Keyed, lazily-populated plan cache under test.
//!
//! Two implementations share one [`PlanCache`] trait:
//!
//! - [`DoubleCheckedSlot`]: unlocked existence check, then
//!   lock-recheck-build. Its recheck branch assumes the entry it finds was
//!   built for the current call and finalizes with the stored build
//!   bindings, which is the defect the harness reproduces.
//! - [`LockedSlot`]: no unlocked fast path; every caller takes the build
//!   lock and always binds its own parameter.
//!
//! Both report every step through a [`SlotProbe`] so a harness can decide
//! *when* each caller is allowed to proceed.

#![forbid(unsafe_code)]

pub mod plan;
pub mod probe;
pub mod slot;

pub use plan::{
    BoundPlan, BuildError, CachedPlan, CommandError, PlanBuilder, SlotPath, TemplatePlanBuilder,
    parse_limit_offset,
};
pub use probe::{NoopProbe, SlotProbe};
pub use slot::{DoubleCheckedSlot, LockedSlot, PlanCache, SlotMetricsSnapshot, slot_for_mode};
