//! Error types for plan-race
//!
//! Three failure families matter to a reproduction run and must never be
//! confused with one another: a detected race (the defect surfaced), a
//! harness timeout (something hung, a different defect), and unexpected
//! errors coming out of the plan builder.

use thiserror::Error;

use crate::models::{BarrierPhase, WorkerId};

/// Result type alias for plan-race operations
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for plan-race
#[derive(Debug, Error)]
pub enum Error {
    // ==========================================================================
    // Reproduction results
    // ==========================================================================
    #[error("Race detected: {0}")]
    DetectedRace(String),

    #[error("Harness timeout: {worker} did not pass the {phase} barrier")]
    HarnessTimeout {
        worker: WorkerId,
        phase: BarrierPhase,
    },

    #[error("Unexpected error in {worker}: {message}")]
    Unexpected { worker: WorkerId, message: String },

    // ==========================================================================
    // Harness plumbing
    // ==========================================================================
    #[error("Failed to spawn {worker}: {source}")]
    Spawn {
        worker: WorkerId,
        #[source]
        source: std::io::Error,
    },

    #[error("Worker channel closed before {0} outcomes arrived")]
    Disconnected(usize),

    // ==========================================================================
    // Validation Errors
    // ==========================================================================
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    // ==========================================================================
    // I/O Errors
    // ==========================================================================
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    // ==========================================================================
    // Internal Errors
    // ==========================================================================
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Returns the error type string (for JSON reports)
    #[must_use]
    pub const fn error_type(&self) -> &'static str {
        match self {
            Self::DetectedRace(_) => "DETECTED_RACE",
            Self::HarnessTimeout { .. } => "HARNESS_TIMEOUT",
            Self::Unexpected { .. } => "UNEXPECTED_ERROR",
            Self::Spawn { .. } | Self::Disconnected(_) => "HARNESS_FAILURE",
            Self::InvalidArgument(_) => "INVALID_ARGUMENT",
            Self::Io(_) => "OS_ERROR",
            Self::Serialization(_) => "TYPE_ERROR",
            Self::Internal(_) => "INTERNAL_ERROR",
        }
    }

    /// Process exit code for the `plan-race` binary.
    ///
    /// 0 is reserved for a clean pass.
    #[must_use]
    pub const fn exit_code(&self) -> i32 {
        match self {
            Self::DetectedRace(_) => 1,
            Self::Unexpected { .. } => 2,
            Self::HarnessTimeout { .. } => 3,
            Self::InvalidArgument(_) => 64,
            Self::Spawn { .. }
            | Self::Disconnected(_)
            | Self::Io(_)
            | Self::Serialization(_)
            | Self::Internal(_) => 4,
        }
    }

    /// Returns whether the error aborts a run outright instead of being a
    /// terminal verdict about the cache under test.
    #[must_use]
    pub const fn is_fatal(&self) -> bool {
        !matches!(self, Self::DetectedRace(_) | Self::Unexpected { .. })
    }
}
