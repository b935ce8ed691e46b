//! Deterministic race reproduction against a shared plan cache.
//!
//! [`RaceHarness`] runs one [`Workload`] per parameter against a single slot,
//! uses a [`Sequencer`] to force the interleaving where every workload misses
//! the unlocked check before any of them takes the build lock, and hands the
//! outcomes to [`verifier::check`].
//!
//! ```no_run
//! let verdict = plan_race_harness::reproduce_race();
//! std::process::exit(verdict.exit_code());
//! ```

#![forbid(unsafe_code)]

pub mod error;
pub mod harness;
pub mod sequencer;
pub mod verifier;
pub mod workload;

pub use error::HarnessError;
pub use harness::{RaceHarness, RepeatSummary, RunReport};
pub use sequencer::{Sequencer, WorkerProbe, release_order};
pub use verifier::{
    Mismatch, RaceReport, UnexpectedFailure, VerificationResult, check, check_pair,
};
pub use workload::{Outcome, OutcomeFailure, Workload};

use plan_race_core::{Error, HarnessConfig};
use serde::Serialize;

/// Why a run did not pass, in the shared error taxonomy.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Failure {
    pub error_type: String,
    pub exit_code: i32,
    pub detail: String,
}

impl From<&Error> for Failure {
    fn from(err: &Error) -> Self {
        Self {
            error_type: err.error_type().to_string(),
            exit_code: err.exit_code(),
            detail: err.to_string(),
        }
    }
}

/// Single pass/fail result of a reproduction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "verdict", content = "failure", rename_all = "snake_case")]
pub enum RaceVerdict {
    Pass,
    Fail(Failure),
}

impl RaceVerdict {
    #[must_use]
    pub const fn is_pass(&self) -> bool {
        matches!(self, Self::Pass)
    }

    /// 0 pass, 1 detected race, 2 unexpected error, 3 harness timeout,
    /// 4 other harness failure, 64 invalid configuration.
    #[must_use]
    pub const fn exit_code(&self) -> i32 {
        match self {
            Self::Pass => 0,
            Self::Fail(failure) => failure.exit_code,
        }
    }

    #[must_use]
    pub fn from_error(err: &Error) -> Self {
        Self::Fail(Failure::from(err))
    }

    /// Collapse a harness run into a verdict.
    #[must_use]
    pub fn from_run(run: Result<&RunReport, HarnessError>) -> Self {
        match run {
            Ok(report) => report
                .verification
                .to_error()
                .map_or(Self::Pass, |err| Self::from_error(&err)),
            Err(err) => Self::from_error(&Error::from(err)),
        }
    }
}

/// Reproduce with configuration from the environment.
///
/// Defaults to the reference reproduction: offsets 20 and 0 against the
/// defective slot, which yields a detected race.
#[must_use]
pub fn reproduce_race() -> RaceVerdict {
    let config = match HarnessConfig::from_env() {
        Ok(config) => config,
        Err(err) => {
            tracing::warn!(error = %err, "invalid harness configuration");
            return RaceVerdict::from_error(&err);
        }
    };
    let harness = RaceHarness::new(config);
    let verdict = match harness.run() {
        Ok(report) => RaceVerdict::from_run(Ok(&report)),
        Err(err) => RaceVerdict::from_run(Err(err)),
    };
    tracing::info!(exit_code = verdict.exit_code(), "reproduction finished");
    verdict
}
