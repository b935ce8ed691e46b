//! Data models shared by the plan cache and the race harness.
//!
//! A [`CacheKey`] names a query *shape*; a [`BoundParameter`] is the per-call
//! offset that is deliberately not part of that identity. Two callers with the
//! same key and different parameters must share one cached plan but still get
//! back commands carrying their own offset.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::Error;

// =============================================================================
// CacheKey
// =============================================================================

/// Identity of a logical query shape.
///
/// # Constraints
/// - Value equality: two keys built from the same parts are interchangeable.
/// - Never carries a bound parameter. The page size is part of the shape
///   (every caller asks for the same page length); the offset is not.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CacheKey {
    pub name: String,
    pub projection: String,
    pub predicate: String,
    pub order_by: String,
    pub page_size: u32,
}

impl CacheKey {
    /// Name of the shape used by the reference reproduction.
    pub const SELECT_BY_PREDICATE: &'static str = "select-by-predicate";

    /// Key for `select id, name from person where id > 0 order by name asc`
    /// with the given page size.
    #[must_use]
    pub fn select_by_predicate(page_size: u32) -> Self {
        Self {
            name: Self::SELECT_BY_PREDICATE.to_string(),
            projection: "p.id, p.name".to_string(),
            predicate: "p.id > 0".to_string(),
            order_by: "p.name asc".to_string(),
            page_size,
        }
    }

    /// Same shape with a different name. Mostly useful for tests that need
    /// two distinct keys.
    #[must_use]
    pub fn renamed(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}[page={}]", self.name, self.page_size)
    }
}

// =============================================================================
// BoundParameter
// =============================================================================

/// Per-invocation offset bound into a finalized plan.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct BoundParameter(pub u64);

impl BoundParameter {
    #[must_use]
    pub const fn new(offset: u64) -> Self {
        Self(offset)
    }

    #[must_use]
    pub const fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for BoundParameter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u64> for BoundParameter {
    fn from(value: u64) -> Self {
        Self(value)
    }
}

impl FromStr for BoundParameter {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        s.trim()
            .parse::<u64>()
            .map(Self)
            .map_err(|_| Error::InvalidArgument(format!("invalid offset {s:?}")))
    }
}

// =============================================================================
// WorkerId
// =============================================================================

/// Stable identity of one workload within a harness run.
///
/// Ids are assigned in the order parameters are supplied: the first
/// parameter belongs to worker 0 ("A"), the second to worker 1 ("B").
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct WorkerId(pub u32);

impl WorkerId {
    #[must_use]
    pub const fn index(self) -> usize {
        self.0 as usize
    }

    /// Short label: `A`..`Z` for the first 26 workers, then `W<n>`.
    #[must_use]
    pub fn label(self) -> String {
        u8::try_from(self.0)
            .ok()
            .filter(|n| *n < 26)
            .map_or_else(|| format!("W{}", self.0), |n| char::from(b'A' + n).to_string())
    }
}

impl fmt::Display for WorkerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "worker-{}", self.label())
    }
}

// =============================================================================
// SlotMode
// =============================================================================

/// Which plan cache implementation a run exercises.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SlotMode {
    /// Double-checked locking with the stale-bindings recheck path.
    #[default]
    Defective,
    /// Always locks; always binds the caller's own parameter.
    Corrected,
}

impl SlotMode {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Defective => "defective",
            Self::Corrected => "corrected",
        }
    }
}

impl fmt::Display for SlotMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SlotMode {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "defective" | "dcl" | "double-checked" => Ok(Self::Defective),
            "corrected" | "locked" | "fixed" => Ok(Self::Corrected),
            other => Err(Error::InvalidArgument(format!(
                "invalid slot mode {other:?} (expected \"defective\" or \"corrected\")"
            ))),
        }
    }
}

// =============================================================================
// BarrierPhase
// =============================================================================

/// Synchronization points a workload passes through during a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BarrierPhase {
    /// Phase 1: every workload reached its pre-lock read point.
    Arrival,
    /// Phase 2: waiting for this workload's turn in release order.
    Release,
    /// The lock holder waiting for the next workload to block on the lock.
    Contention,
    /// The harness waiting for outcomes after all workloads were released.
    Join,
}

impl BarrierPhase {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Arrival => "arrival",
            Self::Release => "release",
            Self::Contention => "contention",
            Self::Join => "join",
        }
    }
}

impl fmt::Display for BarrierPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
