//! Errors that abort a harness run.
//!
//! Anything that goes wrong *inside* a workload is captured in its
//! [`Outcome`](crate::workload::Outcome) instead.

use plan_race_core::{BarrierPhase, WorkerId};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum HarnessError {
    #[error("{worker} timed out at the {phase} barrier")]
    Timeout {
        worker: WorkerId,
        phase: BarrierPhase,
    },

    #[error("failed to spawn {worker}: {source}")]
    Spawn {
        worker: WorkerId,
        #[source]
        source: std::io::Error,
    },

    #[error("worker channel closed with {received} of {expected} outcomes")]
    Disconnected { received: usize, expected: usize },

    #[error("{worker} panicked outside its workload: {message}")]
    WorkerPanicked { worker: WorkerId, message: String },

    #[error(transparent)]
    Core(#[from] plan_race_core::Error),
}

impl From<HarnessError> for plan_race_core::Error {
    fn from(err: HarnessError) -> Self {
        match err {
            HarnessError::Timeout { worker, phase } => Self::HarnessTimeout { worker, phase },
            HarnessError::Spawn { worker, source } => Self::Spawn { worker, source },
            HarnessError::Disconnected { expected, .. } => Self::Disconnected(expected),
            HarnessError::WorkerPanicked { worker, message } => {
                Self::Internal(format!("{worker} panicked: {message}"))
            }
            HarnessError::Core(inner) => inner,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timeout_maps_to_core_timeout() {
        let err: plan_race_core::Error = HarnessError::Timeout {
            worker: WorkerId(1),
            phase: BarrierPhase::Arrival,
        }
        .into();
        assert_eq!(err.error_type(), "HARNESS_TIMEOUT");
        assert_eq!(err.exit_code(), 3);
        assert!(err.to_string().contains("worker-B"));
    }

    #[test]
    fn plumbing_failures_are_fatal() {
        let err: plan_race_core::Error = HarnessError::Disconnected {
            received: 1,
            expected: 2,
        }
        .into();
        assert!(err.is_fatal());
        assert_eq!(err.exit_code(), 4);

        let err: plan_race_core::Error = HarnessError::WorkerPanicked {
            worker: WorkerId(0),
            message: "boom".to_string(),
        }
        .into();
        assert_eq!(err.error_type(), "INTERNAL_ERROR");
    }
}
