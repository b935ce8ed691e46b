//! One caller of the shared slot, and the record of what it saw.

use std::panic::{AssertUnwindSafe, catch_unwind};

use plan_race_cache::{BoundPlan, PlanBuilder, PlanCache, SlotPath, SlotProbe, parse_limit_offset};
use plan_race_core::{BoundParameter, CacheKey, WorkerId};
use serde::Serialize;

/// Why a workload could not report a clean observation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum OutcomeFailure {
    /// The finalized command could not have executed.
    MalformedPlan { command: String, reason: String },
    /// The plan builder failed.
    Unexpected { message: String },
    /// The workload panicked.
    Panicked { message: String },
}

impl OutcomeFailure {
    /// Failures that say nothing about parameter binding.
    #[must_use]
    pub const fn is_unexpected(&self) -> bool {
        matches!(self, Self::Unexpected { .. } | Self::Panicked { .. })
    }

    #[must_use]
    pub fn message(&self) -> String {
        match self {
            Self::MalformedPlan { command, reason } => format!("{reason} in `{command}`"),
            Self::Unexpected { message } | Self::Panicked { message } => message.clone(),
        }
    }
}

/// What one workload supplied and what its plan actually carried.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Outcome {
    pub worker: WorkerId,
    pub supplied: BoundParameter,
    /// Offset read back from the finalized command; `None` on failure.
    pub observed: Option<BoundParameter>,
    pub path: Option<SlotPath>,
    /// This workload's call built the cached plan.
    pub won_build: bool,
    pub contended: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub command: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failure: Option<OutcomeFailure>,
}

impl Outcome {
    fn failed(worker: WorkerId, supplied: BoundParameter, failure: OutcomeFailure) -> Self {
        Self {
            worker,
            supplied,
            observed: None,
            path: None,
            won_build: false,
            contended: false,
            command: None,
            failure: Some(failure),
        }
    }

    fn from_bound(worker: WorkerId, supplied: BoundParameter, bound: BoundPlan) -> Self {
        let (observed, failure) = match parse_limit_offset(&bound.command) {
            Ok(offset) => (Some(offset), None),
            Err(err) => (
                None,
                Some(OutcomeFailure::MalformedPlan {
                    command: bound.command.clone(),
                    reason: err.to_string(),
                }),
            ),
        };
        Self {
            worker,
            supplied,
            observed,
            path: Some(bound.path),
            won_build: bound.built_by == worker && bound.path == SlotPath::Built,
            contended: bound.contended,
            command: Some(bound.command),
            failure,
        }
    }

    /// Clean observation of the supplied offset.
    #[must_use]
    pub fn is_consistent(&self) -> bool {
        self.failure.is_none() && self.observed == Some(self.supplied)
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(msg) = payload.downcast_ref::<&str>() {
        return format!("workload panicked: {msg}");
    }
    if let Some(msg) = payload.downcast_ref::<String>() {
        return format!("workload panicked: {msg}");
    }
    "workload panicked".to_string()
}

/// A single `get_or_create` call against a shared slot.
#[derive(Debug, Clone, Copy)]
pub struct Workload {
    pub worker: WorkerId,
    pub param: BoundParameter,
}

impl Workload {
    #[must_use]
    pub const fn new(worker: WorkerId, param: BoundParameter) -> Self {
        Self { worker, param }
    }

    /// Run to completion. Never panics and never returns an error: every
    /// failure is recorded in the [`Outcome`].
    pub fn run(
        &self,
        slot: &dyn PlanCache,
        key: &CacheKey,
        builder: &dyn PlanBuilder,
        probe: &dyn SlotProbe,
    ) -> Outcome {
        let call = catch_unwind(AssertUnwindSafe(|| {
            slot.get_or_create(key, self.param, builder, probe)
        }));
        let outcome = match call {
            Ok(Ok(bound)) => Outcome::from_bound(self.worker, self.param, bound),
            Ok(Err(err)) => Outcome::failed(
                self.worker,
                self.param,
                OutcomeFailure::Unexpected {
                    message: err.to_string(),
                },
            ),
            Err(payload) => Outcome::failed(
                self.worker,
                self.param,
                OutcomeFailure::Panicked {
                    message: panic_message(&*payload),
                },
            ),
        };

        tracing::debug!(
            worker = %outcome.worker,
            supplied = %outcome.supplied,
            observed = ?outcome.observed.map(BoundParameter::get),
            path = ?outcome.path,
            failed = outcome.failure.is_some(),
            "workload finished"
        );
        outcome
    }
}
