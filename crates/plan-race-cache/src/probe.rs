//! Hooks a slot calls at each step of `get_or_create`.
//!
//! Hooks run on the calling thread and may block; the slot makes no
//! assumptions about how long they take. `lock_acquired` runs while the build
//! lock is held, the others run with no slot lock held.

use plan_race_core::{CacheKey, WorkerId};

pub trait SlotProbe: Send + Sync {
    /// Identity of the caller, recorded as `built_by` when it publishes.
    fn worker(&self) -> WorkerId;

    /// The unlocked existence check missed; about to take the build lock.
    fn pre_lock(&self, _key: &CacheKey) {}

    /// The build lock was held by someone else; about to block on it.
    fn lock_contended(&self, _key: &CacheKey) {}

    /// The build lock is held; about to recheck the published map.
    fn lock_acquired(&self, _key: &CacheKey) {}

    /// The build lock has been released.
    fn lock_released(&self, _key: &CacheKey) {}
}

/// Probe that only carries an identity.
#[derive(Debug, Clone, Copy)]
pub struct NoopProbe {
    pub worker: WorkerId,
}

impl NoopProbe {
    #[must_use]
    pub const fn new(worker: WorkerId) -> Self {
        Self { worker }
    }
}

impl Default for NoopProbe {
    fn default() -> Self {
        Self::new(WorkerId(0))
    }
}

impl SlotProbe for NoopProbe {
    fn worker(&self) -> WorkerId {
        self.worker
    }
}
