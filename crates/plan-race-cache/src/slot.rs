//! Slot implementations.
//!
//! Both slots publish entries into a read-mostly map guarded by
//! [`LockLevel::SlotPublished`] and serialize builders on a separate build
//! lock at [`LockLevel::SlotBuild`]. The build lock is always taken first, so
//! a builder may publish while holding it.
//!
//! Entries remember the bindings of the call that built them. The corrected
//! slot never reads them back; the double-checked slot does on its recheck
//! branch.

use std::collections::HashMap;
use std::fmt;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use plan_race_core::{
    BoundParameter, CacheKey, LockLevel, OrderedMutex, OrderedMutexGuard, OrderedRwLock,
    SlotMode, WorkerId,
};
use serde::Serialize;

use crate::plan::{BoundPlan, BuildError, CachedPlan, PlanBuilder, SlotPath};
use crate::probe::SlotProbe;

fn panic_payload_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(msg) = payload.downcast_ref::<&str>() {
        return format!("plan builder panicked: {msg}");
    }
    if let Some(msg) = payload.downcast_ref::<String>() {
        return format!("plan builder panicked: {msg}");
    }
    "plan builder panicked".to_string()
}

/// Shared cache contract. `get_or_create` builds at most once per key and
/// must always hand back a command bound to the caller's `param`.
pub trait PlanCache: Send + Sync + fmt::Debug {
    fn mode(&self) -> SlotMode;

    fn get_or_create(
        &self,
        key: &CacheKey,
        param: BoundParameter,
        builder: &dyn PlanBuilder,
        probe: &dyn SlotProbe,
    ) -> Result<BoundPlan, BuildError>;

    /// The published plan for `key`, without building or binding.
    fn peek(&self, key: &CacheKey) -> Option<Arc<CachedPlan>>;

    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drop every published entry. Metrics are cumulative and survive.
    fn clear(&self);

    fn metrics(&self) -> SlotMetricsSnapshot;
}

/// Construct the slot implementation for `mode`.
#[must_use]
pub fn slot_for_mode(mode: SlotMode) -> Arc<dyn PlanCache> {
    match mode {
        SlotMode::Defective => Arc::new(DoubleCheckedSlot::new()),
        SlotMode::Corrected => Arc::new(LockedSlot::new()),
    }
}

// ---------------------------------------------------------------------------
// Metrics
// ---------------------------------------------------------------------------

#[derive(Debug, Default)]
struct SlotMetrics {
    fast_hits: AtomicU64,
    builds: AtomicU64,
    recheck_hits: AtomicU64,
    contended: AtomicU64,
    build_failures: AtomicU64,
}

/// Point-in-time copy of a slot's counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SlotMetricsSnapshot {
    pub fast_hits: u64,
    pub builds: u64,
    pub recheck_hits: u64,
    /// Calls that found the build lock held.
    pub contended: u64,
    pub build_failures: u64,
}

impl SlotMetrics {
    fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    fn snapshot(&self) -> SlotMetricsSnapshot {
        SlotMetricsSnapshot {
            fast_hits: self.fast_hits.load(Ordering::Relaxed),
            builds: self.builds.load(Ordering::Relaxed),
            recheck_hits: self.recheck_hits.load(Ordering::Relaxed),
            contended: self.contended.load(Ordering::Relaxed),
            build_failures: self.build_failures.load(Ordering::Relaxed),
        }
    }
}

// ---------------------------------------------------------------------------
// Shared state
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
struct SlotEntry {
    plan: Arc<CachedPlan>,
    build_bindings: BoundParameter,
    built_by: WorkerId,
}

#[derive(Debug)]
struct SlotCore {
    build: OrderedMutex<()>,
    published: OrderedRwLock<HashMap<CacheKey, SlotEntry>>,
    metrics: SlotMetrics,
}

impl SlotCore {
    fn new() -> Self {
        Self {
            build: OrderedMutex::new(LockLevel::SlotBuild, ()),
            published: OrderedRwLock::new(LockLevel::SlotPublished, HashMap::new()),
            metrics: SlotMetrics::default(),
        }
    }

    fn lookup(&self, key: &CacheKey) -> Option<SlotEntry> {
        self.published.read().get(key).cloned()
    }

    /// Take the build lock, reporting through `probe` if it was held.
    fn acquire_build(
        &self,
        key: &CacheKey,
        probe: &dyn SlotProbe,
    ) -> (OrderedMutexGuard<'_, ()>, bool) {
        if let Some(guard) = self.build.try_lock() {
            return (guard, false);
        }
        SlotMetrics::bump(&self.metrics.contended);
        tracing::debug!(key = %key, worker = %probe.worker(), "build lock contended");
        probe.lock_contended(key);
        (self.build.lock(), true)
    }

    /// Build `key` and publish it. Caller must hold the build lock.
    fn build_and_publish(
        &self,
        key: &CacheKey,
        param: BoundParameter,
        builder: &dyn PlanBuilder,
        worker: WorkerId,
    ) -> Result<Arc<CachedPlan>, BuildError> {
        let built = catch_unwind(AssertUnwindSafe(|| builder.build(key, param)))
            .unwrap_or_else(|payload| Err(BuildError::Panicked(panic_payload_message(&*payload))));
        let plan = match built {
            Ok(plan) => Arc::new(plan),
            Err(err) => {
                SlotMetrics::bump(&self.metrics.build_failures);
                tracing::warn!(key = %key, worker = %worker, error = %err, "plan build failed");
                return Err(err);
            }
        };
        self.published.write().insert(
            key.clone(),
            SlotEntry {
                plan: Arc::clone(&plan),
                build_bindings: param,
                built_by: worker,
            },
        );
        SlotMetrics::bump(&self.metrics.builds);
        tracing::debug!(key = %key, worker = %worker, offset = %param, "plan published");
        Ok(plan)
    }

    fn clear(&self) {
        let _build = self.build.lock();
        self.published.write().clear();
    }
}

// ---------------------------------------------------------------------------
// DoubleCheckedSlot
// ---------------------------------------------------------------------------

/// Check, lock, recheck, build.
///
/// A caller that loses the race observes the slot empty, blocks on the build
/// lock, and then finds the winner's entry on recheck. That branch finalizes
/// the entry with the bindings it was built with, so the loser's command
/// carries the winner's offset. Callers that find the entry on the unlocked
/// check are bound correctly.
#[derive(Debug)]
pub struct DoubleCheckedSlot {
    core: SlotCore,
}

impl DoubleCheckedSlot {
    #[must_use]
    pub fn new() -> Self {
        Self {
            core: SlotCore::new(),
        }
    }
}

impl Default for DoubleCheckedSlot {
    fn default() -> Self {
        Self::new()
    }
}

impl PlanCache for DoubleCheckedSlot {
    fn mode(&self) -> SlotMode {
        SlotMode::Defective
    }

    fn get_or_create(
        &self,
        key: &CacheKey,
        param: BoundParameter,
        builder: &dyn PlanBuilder,
        probe: &dyn SlotProbe,
    ) -> Result<BoundPlan, BuildError> {
        let worker = probe.worker();
        if let Some(entry) = self.core.lookup(key) {
            SlotMetrics::bump(&self.core.metrics.fast_hits);
            return Ok(BoundPlan {
                command: entry.plan.finalize(param),
                plan: entry.plan,
                path: SlotPath::FastHit,
                contended: false,
                built_by: entry.built_by,
            });
        }

        probe.pre_lock(key);
        let (guard, contended) = self.core.acquire_build(key, probe);
        probe.lock_acquired(key);

        let result = match self.core.lookup(key) {
            None => self
                .core
                .build_and_publish(key, param, builder, worker)
                .map(|plan| BoundPlan {
                    command: plan.finalize(param),
                    plan,
                    path: SlotPath::Built,
                    contended,
                    built_by: worker,
                }),
            Some(entry) => {
                SlotMetrics::bump(&self.core.metrics.recheck_hits);
                tracing::debug!(
                    key = %key,
                    worker = %worker,
                    built_by = %entry.built_by,
                    offset = %param,
                    build_offset = %entry.build_bindings,
                    "recheck found published plan"
                );
                let plan = Arc::new(entry.plan.bake(entry.build_bindings));
                Ok(BoundPlan {
                    command: plan.finalize(param),
                    plan,
                    path: SlotPath::RecheckHit,
                    contended,
                    built_by: entry.built_by,
                })
            }
        };

        drop(guard);
        probe.lock_released(key);
        result
    }

    fn peek(&self, key: &CacheKey) -> Option<Arc<CachedPlan>> {
        self.core.lookup(key).map(|entry| entry.plan)
    }

    fn len(&self) -> usize {
        self.core.published.read().len()
    }

    fn clear(&self) {
        self.core.clear();
    }

    fn metrics(&self) -> SlotMetricsSnapshot {
        self.core.metrics.snapshot()
    }
}

// ---------------------------------------------------------------------------
// LockedSlot
// ---------------------------------------------------------------------------

/// Every call takes the build lock and binds its own parameter.
#[derive(Debug)]
pub struct LockedSlot {
    core: SlotCore,
}

impl LockedSlot {
    #[must_use]
    pub fn new() -> Self {
        Self {
            core: SlotCore::new(),
        }
    }
}

impl Default for LockedSlot {
    fn default() -> Self {
        Self::new()
    }
}

impl PlanCache for LockedSlot {
    fn mode(&self) -> SlotMode {
        SlotMode::Corrected
    }

    fn get_or_create(
        &self,
        key: &CacheKey,
        param: BoundParameter,
        builder: &dyn PlanBuilder,
        probe: &dyn SlotProbe,
    ) -> Result<BoundPlan, BuildError> {
        let worker = probe.worker();
        probe.pre_lock(key);
        let (guard, contended) = self.core.acquire_build(key, probe);
        probe.lock_acquired(key);

        let result = match self.core.lookup(key) {
            None => self
                .core
                .build_and_publish(key, param, builder, worker)
                .map(|plan| BoundPlan {
                    command: plan.finalize(param),
                    plan,
                    path: SlotPath::Built,
                    contended,
                    built_by: worker,
                }),
            Some(entry) => {
                SlotMetrics::bump(&self.core.metrics.recheck_hits);
                Ok(BoundPlan {
                    command: entry.plan.finalize(param),
                    plan: entry.plan,
                    path: SlotPath::RecheckHit,
                    contended,
                    built_by: entry.built_by,
                })
            }
        };

        drop(guard);
        probe.lock_released(key);
        result
    }

    fn peek(&self, key: &CacheKey) -> Option<Arc<CachedPlan>> {
        self.core.lookup(key).map(|entry| entry.plan)
    }

    fn len(&self) -> usize {
        self.core.published.read().len()
    }

    fn clear(&self) {
        self.core.clear();
    }

    fn metrics(&self) -> SlotMetricsSnapshot {
        self.core.metrics.snapshot()
    }
}
