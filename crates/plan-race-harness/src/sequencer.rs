//! Two-phase barrier that decides when each workload may take the build lock.
//!
//! Phase 1 parks every workload at its pre-lock point until all of them have
//! missed the unlocked check. Phase 2 opens one gate at a time in release
//! order. The workload that holds the build lock opens the next gate and,
//! with the contention handshake enabled, keeps holding the lock until that
//! workload reports it is blocked on it.
//!
//! Every wait is bounded. A timed-out wait is recorded, aborts the
//! sequencer so no other workload keeps waiting, and is reported by the
//! harness after the join.

use std::sync::{Arc, Condvar};
use std::time::Duration;

use plan_race_cache::SlotProbe;
use plan_race_core::{
    BarrierPhase, BoundParameter, CacheKey, LockLevel, OrderedMutex, OrderedMutexGuard, WorkerId,
};

/// Larger parameter first; equal parameters go by lower worker id.
#[must_use]
pub fn release_order(params: &[BoundParameter]) -> Vec<WorkerId> {
    let mut order: Vec<(WorkerId, BoundParameter)> = params
        .iter()
        .enumerate()
        .map(|(i, param)| (WorkerId(u32::try_from(i).unwrap_or(u32::MAX)), *param))
        .collect();
    order.sort_by(|(wa, pa), (wb, pb)| pb.cmp(pa).then(wa.cmp(wb)));
    order.into_iter().map(|(worker, _)| worker).collect()
}

#[derive(Debug, Default)]
struct SequencerState {
    arrived: Vec<WorkerId>,
    /// Index into the release order of the next gate to open.
    released: usize,
    contended: Vec<WorkerId>,
    acquired: Vec<WorkerId>,
    timeouts: Vec<(WorkerId, BarrierPhase)>,
    aborted: bool,
}

#[derive(Debug)]
pub struct Sequencer {
    state: OrderedMutex<SequencerState>,
    changed: Condvar,
    release_order: Vec<WorkerId>,
    barrier_timeout: Duration,
    contention_handshake: bool,
}

impl Sequencer {
    #[must_use]
    pub fn new(
        release_order: Vec<WorkerId>,
        barrier_timeout: Duration,
        contention_handshake: bool,
    ) -> Self {
        Self {
            state: OrderedMutex::new(LockLevel::SequencerState, SequencerState::default()),
            changed: Condvar::new(),
            release_order,
            barrier_timeout,
            contention_handshake,
        }
    }

    #[must_use]
    pub fn release_order(&self) -> &[WorkerId] {
        &self.release_order
    }

    /// Probe that routes a workload's slot hooks through this sequencer.
    #[must_use]
    pub fn probe(self: &Arc<Self>, worker: WorkerId) -> WorkerProbe {
        WorkerProbe {
            worker,
            sequencer: Arc::clone(self),
        }
    }

    /// Phase 1 rendezvous followed by the phase 2 gate.
    pub fn arrive(&self, worker: WorkerId) {
        let mut state = self.state.lock();
        if state.aborted {
            return;
        }
        state.arrived.push(worker);
        tracing::debug!(worker = %worker, arrived = state.arrived.len(), "arrived at rendezvous");
        self.changed.notify_all();

        let expected = self.release_order.len();
        let result = state.wait_timeout_while(&self.changed, self.barrier_timeout, |s| {
            !s.aborted && s.arrived.len() < expected
        });
        if result.timed_out() {
            // Blame the first worker that never showed up.
            let missing = self
                .release_order
                .iter()
                .copied()
                .find(|w| !state.arrived.contains(w))
                .unwrap_or(worker);
            tracing::debug!(waiting = %worker, missing = %missing, "rendezvous incomplete");
            self.fail(&mut state, missing, BarrierPhase::Arrival);
            return;
        }
        if state.aborted {
            return;
        }

        let order = &self.release_order;
        let result = state.wait_timeout_while(&self.changed, self.barrier_timeout, |s| {
            !s.aborted && order.get(s.released) != Some(&worker)
        });
        if result.timed_out() {
            self.fail(&mut state, worker, BarrierPhase::Release);
            return;
        }
        tracing::debug!(worker = %worker, "released toward build lock");
    }

    pub fn contended(&self, worker: WorkerId) {
        let mut state = self.state.lock();
        state.contended.push(worker);
        self.changed.notify_all();
    }

    /// Called by the build-lock holder. Opens the next gate and, with the
    /// handshake enabled, waits for the next workload to block on the lock.
    pub fn acquired(&self, worker: WorkerId) {
        let mut state = self.state.lock();
        state.acquired.push(worker);
        if state.aborted {
            return;
        }
        state.released += 1;
        self.changed.notify_all();

        let Some(&next) = self.release_order.get(state.released) else {
            return;
        };
        if !self.contention_handshake {
            return;
        }
        let result = state.wait_timeout_while(&self.changed, self.barrier_timeout, |s| {
            !s.aborted && !s.contended.contains(&next)
        });
        if result.timed_out() {
            self.fail(&mut state, worker, BarrierPhase::Contention);
        }
    }

    /// Stop every pending wait without recording a timeout.
    pub fn abort(&self) {
        let mut state = self.state.lock();
        state.aborted = true;
        self.changed.notify_all();
    }

    #[must_use]
    pub fn timeouts(&self) -> Vec<(WorkerId, BarrierPhase)> {
        self.state.lock().timeouts.clone()
    }

    /// Workers in the order they actually took the build lock.
    #[must_use]
    pub fn acquisition_order(&self) -> Vec<WorkerId> {
        self.state.lock().acquired.clone()
    }

    fn fail(
        &self,
        state: &mut OrderedMutexGuard<'_, SequencerState>,
        worker: WorkerId,
        phase: BarrierPhase,
    ) {
        tracing::warn!(
            worker = %worker,
            phase = %phase,
            timeout = ?self.barrier_timeout,
            "barrier wait timed out"
        );
        state.timeouts.push((worker, phase));
        state.aborted = true;
        self.changed.notify_all();
    }
}

/// [`SlotProbe`] bound to one worker of a [`Sequencer`].
#[derive(Debug, Clone)]
pub struct WorkerProbe {
    worker: WorkerId,
    sequencer: Arc<Sequencer>,
}

impl SlotProbe for WorkerProbe {
    fn worker(&self) -> WorkerId {
        self.worker
    }

    fn pre_lock(&self, _key: &CacheKey) {
        self.sequencer.arrive(self.worker);
    }

    fn lock_contended(&self, _key: &CacheKey) {
        self.sequencer.contended(self.worker);
    }

    fn lock_acquired(&self, _key: &CacheKey) {
        self.sequencer.acquired(self.worker);
    }

    fn lock_released(&self, key: &CacheKey) {
        tracing::debug!(worker = %self.worker, key = %key, "build lock released");
    }
}
