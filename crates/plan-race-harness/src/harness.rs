//! Spawns workloads against one shared slot, sequences them, and collects
//! their outcomes.

use std::sync::{Arc, mpsc};
use std::thread::{self, JoinHandle};
use std::time::Instant;

use plan_race_cache::{
    PlanBuilder, PlanCache, SlotMetricsSnapshot, TemplatePlanBuilder, slot_for_mode,
};
use plan_race_core::{BarrierPhase, BoundParameter, Error, HarnessConfig, ReproContext, WorkerId};
use serde::Serialize;

use crate::error::HarnessError;
use crate::sequencer::{Sequencer, release_order};
use crate::verifier::{self, RaceReport, VerificationResult};
use crate::workload::{Outcome, Workload};

/// Everything a single run produced.
#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    pub context: ReproContext,
    pub outcomes: Vec<Outcome>,
    pub verification: VerificationResult,
    /// Order workloads actually took the build lock.
    pub acquisition_order: Vec<WorkerId>,
    pub metrics: SlotMetricsSnapshot,
}

/// Verdict counts over [`RaceHarness::reproduce_repeated`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RepeatSummary {
    pub runs: usize,
    pub passes: usize,
    pub races: usize,
    pub unexpected: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub first_race: Option<RaceReport>,
}

impl RepeatSummary {
    /// Every run reached the same verdict.
    #[must_use]
    pub const fn is_deterministic(&self) -> bool {
        self.passes == self.runs || self.races == self.runs || self.unexpected == self.runs
    }
}

pub struct RaceHarness {
    config: HarnessConfig,
    slot: Arc<dyn PlanCache>,
    builder: Arc<dyn PlanBuilder>,
}

impl std::fmt::Debug for RaceHarness {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RaceHarness")
            .field("config", &self.config)
            .field("slot", &self.slot)
            .finish_non_exhaustive()
    }
}

impl RaceHarness {
    /// Harness over a fresh slot for `config.mode` and the template builder.
    #[must_use]
    pub fn new(config: HarnessConfig) -> Self {
        let slot = slot_for_mode(config.mode);
        Self {
            config,
            slot,
            builder: Arc::new(TemplatePlanBuilder),
        }
    }

    #[must_use]
    pub fn with_slot(mut self, slot: Arc<dyn PlanCache>) -> Self {
        self.slot = slot;
        self
    }

    #[must_use]
    pub fn with_builder(mut self, builder: Arc<dyn PlanBuilder>) -> Self {
        self.builder = builder;
        self
    }

    #[must_use]
    pub const fn config(&self) -> &HarnessConfig {
        &self.config
    }

    #[must_use]
    pub fn slot(&self) -> &Arc<dyn PlanCache> {
        &self.slot
    }

    /// Two workloads, `param_a` as worker A and `param_b` as worker B.
    pub fn reproduce(
        &self,
        param_a: BoundParameter,
        param_b: BoundParameter,
    ) -> Result<(Outcome, Outcome), HarnessError> {
        let mut outcomes = self.reproduce_many(&[param_a, param_b])?.into_iter();
        match (outcomes.next(), outcomes.next()) {
            (Some(a), Some(b)) => Ok((a, b)),
            (a, _) => Err(HarnessError::Disconnected {
                received: usize::from(a.is_some()),
                expected: 2,
            }),
        }
    }

    /// One workload per parameter, all against the same slot and key.
    /// Outcomes come back in worker-id order.
    ///
    /// The slot is cleared first, so every call starts from an empty cache.
    pub fn reproduce_many(&self, params: &[BoundParameter]) -> Result<Vec<Outcome>, HarnessError> {
        Ok(self.run_once(params)?.0)
    }

    /// Run `runs` times and count the verdicts.
    pub fn reproduce_repeated(
        &self,
        params: &[BoundParameter],
        runs: usize,
    ) -> Result<RepeatSummary, HarnessError> {
        let mut summary = RepeatSummary {
            runs,
            ..RepeatSummary::default()
        };
        for run in 0..runs {
            let outcomes = self.reproduce_many(params)?;
            match verifier::check(&outcomes, params) {
                VerificationResult::Pass => summary.passes += 1,
                VerificationResult::DetectedRace(report) => {
                    summary.races += 1;
                    if summary.first_race.is_none() {
                        summary.first_race = Some(report);
                    }
                }
                VerificationResult::Unexpected(_) => summary.unexpected += 1,
            }
            tracing::debug!(run, "repeat run finished");
        }
        tracing::info!(
            runs,
            passes = summary.passes,
            races = summary.races,
            unexpected = summary.unexpected,
            "repeated reproduction finished"
        );
        Ok(summary)
    }

    /// Reproduce with the configured parameters and verify.
    pub fn run(&self) -> Result<RunReport, HarnessError> {
        let params = self.config.params.clone();
        let context = ReproContext::from_config(&self.config, release_order(&params));
        tracing::info!(
            mode = %self.slot.mode(),
            key = %self.config.key,
            workers = params.len(),
            "starting race reproduction"
        );

        let (outcomes, acquisition_order) = self.run_once(&params)?;
        let verification = verifier::check(&outcomes, &params);
        match &verification {
            VerificationResult::Pass => tracing::info!("no cross-contamination"),
            VerificationResult::DetectedRace(report) => {
                tracing::warn!(report = %report, "race reproduced");
            }
            VerificationResult::Unexpected(failures) => {
                tracing::warn!(failures = failures.len(), "workloads failed unexpectedly");
            }
        }

        Ok(RunReport {
            context,
            outcomes,
            verification,
            acquisition_order,
            metrics: self.slot.metrics(),
        })
    }

    fn run_once(
        &self,
        params: &[BoundParameter],
    ) -> Result<(Vec<Outcome>, Vec<WorkerId>), HarnessError> {
        if params.is_empty() {
            return Err(Error::InvalidArgument("no workload parameters".to_string()).into());
        }
        if u32::try_from(params.len()).is_err() {
            let message = format!("too many workloads: {}", params.len());
            return Err(Error::InvalidArgument(message).into());
        }

        // A warm slot answers from the unlocked read and never reaches the
        // sequencer.
        self.slot.clear();

        let sequencer = Arc::new(Sequencer::new(
            release_order(params),
            self.config.barrier_timeout,
            self.config.contention_handshake,
        ));
        let (tx, rx) = mpsc::channel::<Outcome>();
        let mut handles: Vec<(WorkerId, JoinHandle<()>)> = Vec::with_capacity(params.len());

        for (i, param) in params.iter().enumerate() {
            let worker = WorkerId(u32::try_from(i).unwrap_or(u32::MAX));
            let workload = Workload::new(worker, *param);
            let slot = Arc::clone(&self.slot);
            let builder = Arc::clone(&self.builder);
            let probe = sequencer.probe(worker);
            let key = self.config.key.clone();
            let tx = tx.clone();

            let spawned = thread::Builder::new()
                .name(format!("race-worker-{}", worker.0))
                .spawn(move || {
                    let outcome = workload.run(slot.as_ref(), &key, builder.as_ref(), &probe);
                    // Receiver is gone only after a run timeout.
                    let _ = tx.send(outcome);
                });
            match spawned {
                Ok(handle) => handles.push((worker, handle)),
                Err(source) => {
                    tracing::warn!(worker = %worker, error = %source, "failed to spawn workload");
                    sequencer.abort();
                    join_all(handles);
                    return Err(HarnessError::Spawn { worker, source });
                }
            }
        }
        drop(tx);

        let expected = params.len();
        let started = Instant::now();
        let mut outcomes = Vec::with_capacity(expected);
        let mut join_timeout = None;
        while outcomes.len() < expected {
            let remaining = self.config.run_timeout.saturating_sub(started.elapsed());
            match rx.recv_timeout(remaining) {
                Ok(outcome) => outcomes.push(outcome),
                Err(mpsc::RecvTimeoutError::Timeout) => {
                    let missing = (0..expected)
                        .map(|i| WorkerId(u32::try_from(i).unwrap_or(u32::MAX)))
                        .find(|w| !outcomes.iter().any(|o: &Outcome| o.worker == *w))
                        .unwrap_or(WorkerId(0));
                    tracing::warn!(worker = %missing, "run timed out waiting for outcomes");
                    sequencer.abort();
                    join_timeout = Some(missing);
                    break;
                }
                Err(mpsc::RecvTimeoutError::Disconnected) => break,
            }
        }

        let panicked = if join_timeout.is_some() {
            join_finished(handles)
        } else {
            join_all(handles)
        };

        if let Some(&(worker, phase)) = sequencer.timeouts().first() {
            return Err(HarnessError::Timeout { worker, phase });
        }
        if let Some(worker) = join_timeout {
            return Err(HarnessError::Timeout {
                worker,
                phase: BarrierPhase::Join,
            });
        }
        if let Some((worker, message)) = panicked {
            return Err(HarnessError::WorkerPanicked { worker, message });
        }
        if outcomes.len() < expected {
            return Err(HarnessError::Disconnected {
                received: outcomes.len(),
                expected,
            });
        }

        outcomes.sort_by_key(|o| o.worker);
        Ok((outcomes, sequencer.acquisition_order()))
    }
}

type Panicked = Option<(WorkerId, String)>;

/// Join every handle; report the first worker whose thread panicked.
fn join_all(handles: Vec<(WorkerId, JoinHandle<()>)>) -> Panicked {
    let mut first = None;
    for (worker, handle) in handles {
        if let Err(payload) = handle.join() {
            let message = payload
                .downcast_ref::<&str>()
                .map(ToString::to_string)
                .or_else(|| payload.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "unknown panic".to_string());
            first.get_or_insert((worker, message));
        }
    }
    first
}

/// After a run timeout: join threads that already exited and leave hung
/// ones detached.
fn join_finished(handles: Vec<(WorkerId, JoinHandle<()>)>) -> Panicked {
    let (finished, hung): (Vec<_>, Vec<_>) =
        handles.into_iter().partition(|(_, h)| h.is_finished());
    for (worker, _) in &hung {
        tracing::warn!(worker = %worker, "leaving hung workload thread detached");
    }
    join_all(finished)
}
