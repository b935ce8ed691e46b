//! Cross-contamination check over a run's outcomes.
//!
//! Every workload must observe the parameter it supplied. Builder errors and
//! panics are reported as unexpected and never as a race; a malformed plan
//! counts as a binding failure because a lost binding is what it looks like
//! downstream.

use std::fmt;

use plan_race_core::{BoundParameter, Error, WorkerId};
use serde::Serialize;

use crate::workload::Outcome;

/// One workload whose plan did not carry its own parameter.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Mismatch {
    pub worker: WorkerId,
    pub supplied: BoundParameter,
    /// `None` when the command was malformed.
    pub observed: Option<BoundParameter>,
    /// The other workload whose parameter was observed, if any.
    pub leaked_from: Option<WorkerId>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RaceReport {
    pub params: Vec<BoundParameter>,
    /// Workload whose call built the shared plan.
    pub winner: Option<WorkerId>,
    pub mismatches: Vec<Mismatch>,
    /// Observed value per workload, in worker-id order.
    pub observed: Vec<Option<BoundParameter>>,
}

impl fmt::Display for RaceReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let winner = self
            .winner
            .map_or_else(|| "no worker".to_string(), |w| w.to_string());
        write!(f, "plan built by {winner}")?;
        for m in &self.mismatches {
            let observed = m
                .observed
                .map_or_else(|| "a malformed command".to_string(), |o| o.to_string());
            write!(f, "; {} supplied {} but observed {observed}", m.worker, m.supplied)?;
            if let Some(from) = m.leaked_from {
                write!(f, " (supplied by {from})")?;
            }
        }
        let observed = self
            .observed
            .iter()
            .map(|o| o.map_or_else(|| "-".to_string(), |o| o.to_string()))
            .collect::<Vec<_>>()
            .join(", ");
        write!(f, "; observed=[{observed}]")
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct UnexpectedFailure {
    pub worker: WorkerId,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "verdict", content = "detail", rename_all = "snake_case")]
pub enum VerificationResult {
    Pass,
    DetectedRace(RaceReport),
    Unexpected(Vec<UnexpectedFailure>),
}

impl VerificationResult {
    #[must_use]
    pub const fn is_pass(&self) -> bool {
        matches!(self, Self::Pass)
    }

    #[must_use]
    pub const fn race_report(&self) -> Option<&RaceReport> {
        match self {
            Self::DetectedRace(report) => Some(report),
            _ => None,
        }
    }

    /// The failure in the shared error taxonomy, `None` for a pass.
    #[must_use]
    pub fn to_error(&self) -> Option<Error> {
        match self {
            Self::Pass => None,
            Self::DetectedRace(report) => Some(Error::DetectedRace(report.to_string())),
            Self::Unexpected(failures) => {
                let worker = failures.first().map_or(WorkerId(0), |f| f.worker);
                let message = failures
                    .iter()
                    .map(|f| format!("{}: {}", f.worker, f.message))
                    .collect::<Vec<_>>()
                    .join("; ");
                Some(Error::Unexpected { worker, message })
            }
        }
    }
}

/// Check `outcomes` against the parameters each worker was given.
///
/// `params[i]` belongs to `WorkerId(i)`.
#[must_use]
pub fn check(outcomes: &[Outcome], params: &[BoundParameter]) -> VerificationResult {
    let mut unexpected: Vec<UnexpectedFailure> = outcomes
        .iter()
        .filter_map(|o| {
            o.failure
                .as_ref()
                .filter(|f| f.is_unexpected())
                .map(|f| UnexpectedFailure {
                    worker: o.worker,
                    message: f.message(),
                })
        })
        .collect();
    for (i, _) in params.iter().enumerate() {
        if !outcomes.iter().any(|o| o.worker.index() == i) {
            let worker = WorkerId(u32::try_from(i).unwrap_or(u32::MAX));
            unexpected.push(UnexpectedFailure {
                worker,
                message: "no outcome recorded".to_string(),
            });
        }
    }
    if !unexpected.is_empty() {
        return VerificationResult::Unexpected(unexpected);
    }

    let all_equal = params.windows(2).all(|w| w[0] == w[1]);
    let malformed = outcomes.iter().any(|o| o.failure.is_some());
    if all_equal && !malformed {
        return VerificationResult::Pass;
    }

    let mut sorted: Vec<&Outcome> = outcomes.iter().collect();
    sorted.sort_by_key(|o| o.worker);

    let mismatches: Vec<Mismatch> = sorted
        .iter()
        .filter_map(|o| {
            let expected = params.get(o.worker.index()).copied().unwrap_or(o.supplied);
            if o.failure.is_none() && o.observed == Some(expected) {
                return None;
            }
            let leaked_from = o.observed.and_then(|observed| {
                params
                    .iter()
                    .enumerate()
                    .find(|(i, p)| *i != o.worker.index() && **p == observed)
                    .map(|(i, _)| WorkerId(u32::try_from(i).unwrap_or(u32::MAX)))
            });
            Some(Mismatch {
                worker: o.worker,
                supplied: expected,
                observed: o.observed,
                leaked_from,
                detail: o.failure.as_ref().map(crate::workload::OutcomeFailure::message),
            })
        })
        .collect();

    if mismatches.is_empty() {
        return VerificationResult::Pass;
    }

    let report = RaceReport {
        params: params.to_vec(),
        winner: sorted.iter().find(|o| o.won_build).map(|o| o.worker),
        mismatches,
        observed: sorted.iter().map(|o| o.observed).collect(),
    };
    tracing::warn!(report = %report, "parameter cross-contamination detected");
    VerificationResult::DetectedRace(report)
}

/// Two-workload form of [`check`].
#[must_use]
pub fn check_pair(
    a: &Outcome,
    b: &Outcome,
    param_a: BoundParameter,
    param_b: BoundParameter,
) -> VerificationResult {
    check(&[a.clone(), b.clone()], &[param_a, param_b])
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::workload::OutcomeFailure;
    use plan_race_cache::SlotPath;

    fn outcome(worker: u32, supplied: u64, observed: Option<u64>, won: bool) -> Outcome {
        Outcome {
            worker: WorkerId(worker),
            supplied: BoundParameter(supplied),
            observed: observed.map(BoundParameter),
            path: Some(if won {
                SlotPath::Built
            } else {
                SlotPath::RecheckHit
            }),
            won_build: won,
            contended: !won,
            command: None,
            failure: None,
        }
    }

    #[test]
    fn matching_observations_pass() {
        let a = outcome(0, 20, Some(20), true);
        let b = outcome(1, 0, Some(0), false);
        assert!(check_pair(&a, &b, BoundParameter(20), BoundParameter(0)).is_pass());
    }

    #[test]
    fn leaked_winner_offset_is_a_race() {
        let a = outcome(0, 20, Some(20), true);
        let b = outcome(1, 0, Some(20), false);
        let result = check_pair(&a, &b, BoundParameter(20), BoundParameter(0));
        let report = result.race_report().expect("race expected");

        assert_eq!(report.winner, Some(WorkerId(0)));
        assert_eq!(report.observed, vec![Some(BoundParameter(20)); 2]);
        assert_eq!(
            report.mismatches,
            vec![Mismatch {
                worker: WorkerId(1),
                supplied: BoundParameter(0),
                observed: Some(BoundParameter(20)),
                leaked_from: Some(WorkerId(0)),
                detail: None,
            }]
        );
        let text = report.to_string();
        assert!(text.contains("worker-B supplied 0 but observed 20"), "{text}");
        assert!(text.contains("plan built by worker-A"), "{text}");
        assert!(text.ends_with("; observed=[20, 20]"), "{text}");

        let err = result.to_error().unwrap();
        assert_eq!(err.exit_code(), 1);
    }

    #[test]
    fn equal_params_pass_trivially() {
        let a = outcome(0, 7, Some(7), true);
        let b = outcome(1, 7, Some(7), false);
        assert_eq!(
            check_pair(&a, &b, BoundParameter(7), BoundParameter(7)),
            VerificationResult::Pass
        );
    }

    #[test]
    fn builder_errors_are_never_races() {
        let a = outcome(0, 20, Some(20), true);
        let mut b = outcome(1, 0, None, false);
        b.failure = Some(OutcomeFailure::Unexpected {
            message: "catalog offline".to_string(),
        });
        let result = check_pair(&a, &b, BoundParameter(20), BoundParameter(0));
        let VerificationResult::Unexpected(failures) = &result else {
            panic!("expected unexpected, got {result:?}");
        };
        assert_eq!(failures[0].worker, WorkerId(1));
        assert_eq!(result.to_error().unwrap().exit_code(), 2);
    }

    #[test]
    fn malformed_plan_is_a_binding_failure() {
        let a = outcome(0, 20, Some(20), true);
        let mut b = outcome(1, 0, None, false);
        b.failure = Some(OutcomeFailure::MalformedPlan {
            command: "select 1 limit null, 20".to_string(),
            reason: "syntax error".to_string(),
        });
        let result = check_pair(&a, &b, BoundParameter(20), BoundParameter(0));
        let report = result.race_report().expect("race expected");
        assert_eq!(report.mismatches[0].observed, None);
        assert_eq!(report.mismatches[0].leaked_from, None);
        assert!(report.to_string().contains("a malformed command"));
    }

    #[test]
    fn missing_outcome_is_unexpected() {
        let a = outcome(0, 20, Some(20), true);
        let result = check(&[a], &[BoundParameter(20), BoundParameter(0)]);
        assert!(matches!(result, VerificationResult::Unexpected(_)));
    }

    #[test]
    fn three_way_reports_every_mismatch() {
        let outcomes = [
            outcome(0, 5, Some(40), false),
            outcome(1, 40, Some(40), true),
            outcome(2, 10, Some(40), false),
        ];
        let params = [BoundParameter(5), BoundParameter(40), BoundParameter(10)];
        let report = check(&outcomes, &params).race_report().cloned().unwrap();
        assert_eq!(report.mismatches.len(), 2);
        assert!(
            report
                .mismatches
                .iter()
                .all(|m| m.leaked_from == Some(WorkerId(1)))
        );
    }

    #[test]
    fn verdict_serializes_with_tag() {
        let json = serde_json::to_value(VerificationResult::Pass).unwrap();
        assert_eq!(json["verdict"], "pass");
    }
}
