//! # Deploy Orchestration
//!
//! Deployment-state reconciliation for an offline, compose-based installation of
//! a collaboration server backed by MySQL or PostgreSQL.
//!
//! Every lifecycle command follows the same pipeline:
//!
//! 1. [`InventoryProbe`] observes the host (images, containers, ports, service unit, paths)
//! 2. [`planner::plan`] diffs the desired state against the observation into an ordered [`Plan`]
//! 3. [`ActionExecutor`] applies the plan fail-fast, skipping work that is already done
//! 4. [`ReadinessMonitor`] waits for the database and application with bounded backoff
//! 5. [`reporter`] folds everything into a single [`Report`] with a three-valued [`Outcome`]
//!
//! The host is reached only through the collaborator traits in [`collaborators`], so the
//! whole pipeline runs against in-memory fakes in tests.
//!
//! ## Example
//!
//! ```rust,no_run
//! use deploy_orchestration::{CancelFlag, Intent, Reconciler};
//!
//! # async fn example(desired: deploy_orchestration::DesiredState) {
//! let reconciler = Reconciler::detect().await;
//! let report = reconciler.run(&desired, Intent::Start, &CancelFlag::new()).await;
//! println!("{}", report.summary());
//! std::process::exit(report.exit_code().into());
//! # }
//! ```

#![warn(missing_docs)]
#![warn(unsafe_code)]

pub mod collaborators;
mod env_file;
mod executor;
pub mod images;
mod model;
mod plan;
pub mod planner;
mod probe;
mod readiness;
mod reconciler;
pub mod reporter;

#[cfg(any(test, feature = "test-utils"))]
pub mod testing;

pub use collaborators::{
    CollaboratorError, ComposeCapability, ContainerRuntime, Filesystem, ImageSummary, PortProbe,
    ServiceManager, UnitStatus,
};
pub use env_file::EnvFile;
pub use executor::{ActionExecutor, CancelFlag};
pub use model::{
    ActionTimeouts, BackoffPolicy, ContainerNames, DatabaseBackend, DesiredState, ImageRef,
    ObservedState, ReadinessPolicies, UnitSpec,
};
pub use plan::{
    Action, ActionKind, ActionOutcome, ComposeWorkload, ExecutionLog, ExecutionResult, Halt,
    ImportRequest, Intent, NoteSeverity, Plan, PlanNote, StopRequest,
};
pub use probe::InventoryProbe;
pub use readiness::{
    CommandReadinessProbe, ReadinessMonitor, ReadinessProbe, ReadinessStatus, ReadinessTarget,
};
pub use reconciler::{Reconciler, StatusReport, READINESS_TARGETS};
pub use reporter::{ErrorSummary, Outcome, Report};

use std::path::PathBuf;

/// Error kinds surfaced by a reconciliation run
#[derive(thiserror::Error, Debug)]
pub enum DeployError {
    /// The desired state is unusable as configured
    #[error("Invalid configuration: {reason}")]
    InvalidConfiguration {
        /// What is wrong with the configuration
        reason: String,
    },

    /// A required collaborator (container runtime, service manager) cannot be reached
    #[error("{collaborator} unavailable: {reason}")]
    CollaboratorUnavailable {
        /// Which collaborator failed
        collaborator: String,
        /// Underlying failure
        reason: String,
    },

    /// Images or paths the intent depends on are absent
    #[error("Missing prerequisites: {}", describe_missing(.images, .paths))]
    MissingPrerequisite {
        /// Images that must be loaded first
        images: Vec<ImageRef>,
        /// Paths that must exist first
        paths: Vec<PathBuf>,
        /// Command that resolves the gap
        remedy: String,
    },

    /// An action was attempted and failed
    #[error("Action failed: {action}: {detail}")]
    ActionFailed {
        /// Description of the failed action
        action: String,
        /// Collaborator error detail
        detail: String,
        /// Actions that completed before the failure
        completed: Vec<String>,
    },

    /// Readiness checks did not pass before their deadline
    #[error("Readiness timeout: {}", join_display(.targets))]
    ReadinessTimeout {
        /// Targets that never became ready
        targets: Vec<ReadinessTarget>,
    },

    /// The host changed between probing and executing
    #[error("Concurrent operation in progress: {detail}")]
    ConcurrentOperationInProgress {
        /// What changed underneath the run
        detail: String,
        /// Actions that completed before the drift was detected
        completed: Vec<String>,
    },

    /// The run was cancelled between actions
    #[error("Cancelled after {} completed action(s)", .completed.len())]
    Cancelled {
        /// Actions that completed before cancellation
        completed: Vec<String>,
    },

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl DeployError {
    /// Stable, machine-readable category name
    pub fn category(&self) -> &'static str {
        match self {
            DeployError::InvalidConfiguration { .. } => "invalid-configuration",
            DeployError::CollaboratorUnavailable { .. } => "collaborator-unavailable",
            DeployError::MissingPrerequisite { .. } => "missing-prerequisite",
            DeployError::ActionFailed { .. } => "action-failed",
            DeployError::ReadinessTimeout { .. } => "readiness-timeout",
            DeployError::ConcurrentOperationInProgress { .. } => "concurrent-operation",
            DeployError::Cancelled { .. } => "cancelled",
            DeployError::Io(_) => "io",
        }
    }

    /// Operator-facing hint for resolving the error
    pub fn remedy(&self) -> String {
        match self {
            DeployError::InvalidConfiguration { .. } => {
                "fix the configuration file and re-run the command".to_string()
            }
            DeployError::CollaboratorUnavailable { collaborator, .. } => {
                format!("make sure the {collaborator} is installed and running (e.g. `systemctl start docker`)")
            }
            DeployError::MissingPrerequisite { remedy, .. } => remedy.clone(),
            DeployError::ActionFailed { .. } => {
                "fix the reported problem and re-run the same command; completed steps are skipped"
                    .to_string()
            }
            DeployError::ReadinessTimeout { .. } => {
                "inspect the container logs with `airgap-deploy logs app` or `airgap-deploy logs database`"
                    .to_string()
            }
            DeployError::ConcurrentOperationInProgress { .. } => {
                "wait for the other operation to finish, then re-run the command".to_string()
            }
            DeployError::Cancelled { .. } => {
                "re-run the same command to finish the remaining steps".to_string()
            }
            DeployError::Io(_) => "check file permissions and free disk space".to_string(),
        }
    }

    /// Descriptions of the actions that completed before this error, if it carries them
    pub fn completed(&self) -> &[String] {
        match self {
            DeployError::ActionFailed { completed, .. }
            | DeployError::ConcurrentOperationInProgress { completed, .. }
            | DeployError::Cancelled { completed } => completed,
            _ => &[],
        }
    }
}

fn describe_missing(images: &[ImageRef], paths: &[PathBuf]) -> String {
    let mut parts = Vec::new();
    if !images.is_empty() {
        parts.push(format!("images [{}]", join_display(images)));
    }
    if !paths.is_empty() {
        let paths: Vec<String> = paths.iter().map(|p| p.display().to_string()).collect();
        parts.push(format!("paths [{}]", paths.join(", ")));
    }
    parts.join("; ")
}

fn join_display<T: std::fmt::Display>(items: &[T]) -> String {
    items
        .iter()
        .map(|item| item.to_string())
        .collect::<Vec<_>>()
        .join(", ")
}

/// Result type for deployment operations
pub type Result<T> = std::result::Result<T, DeployError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_prerequisite_lists_images_and_paths() {
        let err = DeployError::MissingPrerequisite {
            images: vec!["mysql:8.0".parse().unwrap()],
            paths: vec![PathBuf::from("/opt/confluence/docker-compose.yml")],
            remedy: "load images".to_string(),
        };

        let message = err.to_string();
        assert!(message.contains("images [mysql:8.0]"));
        assert!(message.contains("paths [/opt/confluence/docker-compose.yml]"));
        assert_eq!(err.category(), "missing-prerequisite");
        assert_eq!(err.remedy(), "load images");
    }

    #[test]
    fn test_completed_actions_are_exposed() {
        let err = DeployError::Cancelled {
            completed: vec!["ensure directory /opt/confluence".to_string()],
        };
        assert_eq!(err.completed().len(), 1);
        assert!(err.to_string().contains("1 completed"));

        let err = DeployError::ReadinessTimeout {
            targets: vec![ReadinessTarget::Database],
        };
        assert!(err.completed().is_empty());
        assert_eq!(err.to_string(), "Readiness timeout: database");
    }
}
