//! Folding execution results and readiness into a single report.
//!
//! The outcome is three-valued: `Success` when every planned action left the
//! host satisfied and every mandatory readiness target is ready,
//! `PartialSuccess` when the run did useful work but something was left
//! undone, and `Failure` when nothing useful can be assumed.

use serde::Serialize;
use std::collections::BTreeMap;
use std::fmt::Write as _;

use crate::plan::{ActionOutcome, ExecutionLog, ExecutionResult, Halt, NoteSeverity, Plan, PlanNote};
use crate::readiness::{ReadinessStatus, ReadinessTarget};
use crate::DeployError;

/// Overall result of a run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Outcome {
    /// Everything requested is in place
    Success,
    /// Some of the request is in place
    PartialSuccess,
    /// The request could not be carried out
    Failure,
}

impl Outcome {
    /// Process exit code for this outcome
    pub fn exit_code(&self) -> u8 {
        match self {
            Outcome::Success => 0,
            Outcome::Failure => 1,
            Outcome::PartialSuccess => 2,
        }
    }
}

/// Serializable view of a [`DeployError`]
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ErrorSummary {
    /// Stable category name
    pub category: String,
    /// Error message naming the failing items
    pub message: String,
    /// Suggested remedy
    pub remedy: String,
    /// Actions completed before the error
    pub completed: Vec<String>,
}

impl From<&DeployError> for ErrorSummary {
    fn from(err: &DeployError) -> Self {
        Self {
            category: err.category().to_string(),
            message: err.to_string(),
            remedy: err.remedy(),
            completed: err.completed().to_vec(),
        }
    }
}

/// Everything the operator needs to know about a run
#[derive(Debug, Clone, Serialize)]
pub struct Report {
    /// Intent that was run
    pub intent: String,
    /// Overall outcome
    pub outcome: Outcome,
    /// Per-action results in plan order
    pub results: Vec<ExecutionResult>,
    /// Latest readiness status per target
    pub readiness: BTreeMap<ReadinessTarget, ReadinessStatus>,
    /// Planner notes
    pub notes: Vec<PlanNote>,
    /// Why execution stopped early
    pub halt: Option<Halt>,
    /// The error that decided a failed or partial outcome
    pub error: Option<ErrorSummary>,
    /// Non-fatal problems
    pub warnings: Vec<ErrorSummary>,
}

/// Report for a run that failed before any action was attempted
pub fn failed(intent: &str, err: &DeployError) -> Report {
    Report {
        intent: intent.to_string(),
        outcome: Outcome::Failure,
        results: Vec::new(),
        readiness: BTreeMap::new(),
        notes: Vec::new(),
        halt: None,
        error: Some(err.into()),
        warnings: Vec::new(),
    }
}

/// Fold a plan, its execution log and readiness results into a report
///
/// `mandatory` lists the readiness targets that must be `Ready` for `Success`.
pub fn report(
    plan: &Plan,
    log: ExecutionLog,
    readiness: BTreeMap<ReadinessTarget, ReadinessStatus>,
    mandatory: &[ReadinessTarget],
) -> Report {
    let completed = log.satisfied_actions();
    let any_succeeded = log
        .results
        .iter()
        .any(|r| r.outcome == ActionOutcome::Succeeded);

    let mut warnings = Vec::new();
    let mut error = None;

    let mut outcome = match &log.halt {
        None => Outcome::Success,
        Some(Halt::ActionFailed { index }) => {
            let failed = log.results.last();
            let action = plan
                .actions
                .get(*index)
                .map(|a| a.describe())
                .unwrap_or_default();
            let err = DeployError::ActionFailed {
                action,
                detail: failed
                    .and_then(|r| r.error_detail.clone())
                    .unwrap_or_default(),
                completed: completed.clone(),
            };
            let blocking = plan.actions.get(*index).is_none_or(|a| a.is_blocking());
            if blocking {
                error = Some(ErrorSummary::from(&err));
                Outcome::Failure
            } else {
                warnings.push(ErrorSummary::from(&err));
                Outcome::PartialSuccess
            }
        }
        Some(Halt::StateDrift { detail, .. }) => {
            let err = DeployError::ConcurrentOperationInProgress {
                detail: detail.clone(),
                completed: completed.clone(),
            };
            error = Some(ErrorSummary::from(&err));
            Outcome::Failure
        }
        Some(Halt::Cancelled { .. }) => {
            let err = DeployError::Cancelled {
                completed: completed.clone(),
            };
            error = Some(ErrorSummary::from(&err));
            if any_succeeded {
                Outcome::PartialSuccess
            } else {
                Outcome::Failure
            }
        }
    };

    if outcome == Outcome::Success {
        let not_ready: Vec<ReadinessTarget> = mandatory
            .iter()
            .copied()
            .filter(|t| readiness.get(t) != Some(&ReadinessStatus::Ready))
            .collect();
        if !not_ready.is_empty() {
            warnings.push(ErrorSummary::from(&DeployError::ReadinessTimeout {
                targets: not_ready,
            }));
            outcome = Outcome::PartialSuccess;
        }
        if plan
            .notes
            .iter()
            .any(|n| n.severity == NoteSeverity::Degraded)
        {
            outcome = Outcome::PartialSuccess;
        }
    }

    Report {
        intent: plan.intent.to_string(),
        outcome,
        results: log.results,
        readiness,
        notes: plan.notes.clone(),
        halt: log.halt,
        error,
        warnings,
    }
}

impl Report {
    /// Process exit code
    pub fn exit_code(&self) -> u8 {
        self.outcome.exit_code()
    }

    /// Human readable multi-line summary
    pub fn summary(&self) -> String {
        let mut out = String::new();
        let outcome = match self.outcome {
            Outcome::Success => "success",
            Outcome::PartialSuccess => "partial success",
            Outcome::Failure => "failure",
        };
        let _ = writeln!(out, "{}: {}", self.intent, outcome);

        if self.results.is_empty() && self.error.is_none() {
            let _ = writeln!(out, "  nothing to do");
        }
        for result in &self.results {
            match result.outcome {
                ActionOutcome::Succeeded => {
                    let _ = writeln!(out, "  ✓ {} ({}ms)", result.action, result.duration_ms);
                }
                ActionOutcome::Skipped => {
                    let _ = writeln!(out, "  - {} (already done)", result.action);
                }
                ActionOutcome::Failed => {
                    let _ = writeln!(
                        out,
                        "  ✗ {}: {}",
                        result.action,
                        result.error_detail.as_deref().unwrap_or("failed")
                    );
                }
            }
        }
        for (target, status) in &self.readiness {
            let _ = writeln!(out, "  {target}: {status}");
        }
        for note in &self.notes {
            let label = match note.severity {
                NoteSeverity::Warning => "warning",
                NoteSeverity::Degraded => "degraded",
            };
            let _ = writeln!(out, "  {label}: {}", note.message);
        }
        for warning in &self.warnings {
            let _ = writeln!(out, "  warning [{}]: {}", warning.category, warning.message);
            let _ = writeln!(out, "    hint: {}", warning.remedy);
        }
        if let Some(error) = &self.error {
            let _ = writeln!(out, "  error [{}]: {}", error.category, error.message);
            if !error.completed.is_empty() {
                let _ = writeln!(out, "    completed: {}", error.completed.join(", "));
            }
            let _ = writeln!(out, "    hint: {}", error.remedy);
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plan::{Action, Intent};
    use std::path::PathBuf;

    fn dir(path: &str) -> Action {
        Action::EnsureDirectory {
            path: PathBuf::from(path),
            mode: 0o755,
        }
    }

    fn result(action: Action, outcome: ActionOutcome) -> ExecutionResult {
        ExecutionResult {
            action,
            outcome,
            error_detail: (outcome == ActionOutcome::Failed).then(|| "boom".to_string()),
            duration_ms: 1,
        }
    }

    fn plan_of(actions: Vec<Action>) -> Plan {
        let mut plan = Plan::new(&Intent::Configure);
        plan.actions = actions;
        plan
    }

    #[test]
    fn test_all_satisfied_is_success() {
        let plan = plan_of(vec![dir("/a"), dir("/b")]);
        let log = ExecutionLog {
            results: vec![
                result(dir("/a"), ActionOutcome::Succeeded),
                result(dir("/b"), ActionOutcome::Skipped),
            ],
            halt: None,
        };

        let report = report(&plan, log, BTreeMap::new(), &[]);
        assert_eq!(report.outcome, Outcome::Success);
        assert_eq!(report.exit_code(), 0);
        assert!(report.summary().contains("- ensure directory /b (755) (already done)"));
    }

    #[test]
    fn test_blocking_failure_lists_completed_actions() {
        let plan = plan_of(vec![dir("/a"), dir("/b"), dir("/c")]);
        let log = ExecutionLog {
            results: vec![
                result(dir("/a"), ActionOutcome::Succeeded),
                result(dir("/b"), ActionOutcome::Failed),
            ],
            halt: Some(Halt::ActionFailed { index: 1 }),
        };

        let report = report(&plan, log, BTreeMap::new(), &[]);
        assert_eq!(report.outcome, Outcome::Failure);
        let error = report.error.unwrap();
        assert_eq!(error.category, "action-failed");
        assert_eq!(error.completed, vec!["ensure directory /a (755)".to_string()]);
        assert!(error.message.contains("ensure directory /b"));
    }

    #[test]
    fn test_failed_prune_is_partial() {
        let plan = plan_of(vec![dir("/a"), Action::PruneDanglingImages]);
        let log = ExecutionLog {
            results: vec![
                result(dir("/a"), ActionOutcome::Succeeded),
                result(Action::PruneDanglingImages, ActionOutcome::Failed),
            ],
            halt: Some(Halt::ActionFailed { index: 1 }),
        };

        let report = report(&plan, log, BTreeMap::new(), &[]);
        assert_eq!(report.outcome, Outcome::PartialSuccess);
        assert_eq!(report.exit_code(), 2);
        assert!(report.error.is_none());
        assert_eq!(report.warnings.len(), 1);
    }

    #[test]
    fn test_unready_target_is_partial() {
        let plan = plan_of(vec![]);
        let mut readiness = BTreeMap::new();
        readiness.insert(ReadinessTarget::Database, ReadinessStatus::Ready);
        readiness.insert(ReadinessTarget::Application, ReadinessStatus::Unhealthy);

        let report = report(
            &plan,
            ExecutionLog::default(),
            readiness,
            &[ReadinessTarget::Database, ReadinessTarget::Application],
        );
        assert_eq!(report.outcome, Outcome::PartialSuccess);
        assert_eq!(report.warnings[0].category, "readiness-timeout");
        assert!(report.summary().contains("application: unhealthy"));
    }

    #[test]
    fn test_degraded_note_caps_outcome() {
        let mut plan = plan_of(vec![]);
        plan.notes.push(PlanNote::degraded("volumes kept"));
        let report = report(&plan, ExecutionLog::default(), BTreeMap::new(), &[]);
        assert_eq!(report.outcome, Outcome::PartialSuccess);

        let mut plan = plan_of(vec![]);
        plan.notes.push(PlanNote::warning("port in use"));
        let report = super::report(&plan, ExecutionLog::default(), BTreeMap::new(), &[]);
        assert_eq!(report.outcome, Outcome::Success);
    }

    #[test]
    fn test_cancellation() {
        let plan = plan_of(vec![dir("/a"), dir("/b")]);

        let untouched = report(
            &plan,
            ExecutionLog {
                results: vec![],
                halt: Some(Halt::Cancelled { index: 0 }),
            },
            BTreeMap::new(),
            &[],
        );
        assert_eq!(untouched.outcome, Outcome::Failure);

        let halfway = report(
            &plan,
            ExecutionLog {
                results: vec![result(dir("/a"), ActionOutcome::Succeeded)],
                halt: Some(Halt::Cancelled { index: 1 }),
            },
            BTreeMap::new(),
            &[],
        );
        assert_eq!(halfway.outcome, Outcome::PartialSuccess);
        assert_eq!(halfway.error.unwrap().category, "cancelled");
    }

    #[test]
    fn test_failed_report_serializes() {
        let err = DeployError::CollaboratorUnavailable {
            collaborator: "container runtime".to_string(),
            reason: "Cannot connect to the Docker daemon".to_string(),
        };
        let report = failed("start", &err);
        assert_eq!(report.outcome, Outcome::Failure);

        let json = serde_json::to_value(&report).unwrap();
        assert_eq!(json["outcome"], "failure");
        assert_eq!(json["error"]["category"], "collaborator-unavailable");
        assert!(report.summary().contains("hint: make sure the container runtime"));
    }
}
