//! Plans, actions and execution records.

use serde::Serialize;
use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;

use crate::images::{ImageArchive, RejectedArchive};
use crate::model::{ImageRef, UnitSpec};

/// A compose project to bring up or down
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ComposeWorkload {
    /// Compose file variant name
    pub variant: String,
    /// Compose file path
    pub compose_file: PathBuf,
    /// Project directory; compose also reads `.env` from here
    pub project_dir: PathBuf,
    /// Environment passed to the compose process
    pub env: BTreeMap<String, String>,
}

/// A single idempotent step against the host
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Action {
    /// Create a directory (and its parents) with the given mode
    EnsureDirectory {
        /// Directory path
        path: PathBuf,
        /// Unix permission bits
        mode: u32,
    },
    /// Write a file with the given content and mode
    WriteFile {
        /// File path
        path: PathBuf,
        /// Full file content
        content: String,
        /// Unix permission bits
        mode: u32,
    },
    /// Load an image archive into the container runtime
    LoadImage {
        /// Archive path
        archive: PathBuf,
        /// Image the archive is known to contain
        image: Option<ImageRef>,
    },
    /// Start the compose workload detached
    ComposeUp {
        /// Workload to start
        workload: ComposeWorkload,
    },
    /// Stop the compose workload, keeping its containers
    ComposeStop {
        /// Workload to stop
        workload: ComposeWorkload,
    },
    /// Stop and remove the compose workload's containers
    ComposeDown {
        /// Workload to remove
        workload: ComposeWorkload,
        /// Also remove named volumes
        remove_volumes: bool,
    },
    /// Install the service unit and reload the service manager
    RegisterService {
        /// Unit to install
        unit: UnitSpec,
    },
    /// Enable or disable the unit at boot
    SetServiceEnabled {
        /// Unit name
        unit_name: String,
        /// Target enablement
        enabled: bool,
    },
    /// Remove dangling images
    PruneDanglingImages,
}

/// Broad class of an action, used to pick its timeout
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionKind {
    /// Directory and file operations
    Filesystem,
    /// Image archive loading
    ImageLoad,
    /// Compose operations
    Compose,
    /// Service manager operations
    ServiceManager,
    /// Image cleanup
    Prune,
}

impl Action {
    /// Broad class of this action
    pub fn kind(&self) -> ActionKind {
        match self {
            Action::EnsureDirectory { .. } | Action::WriteFile { .. } => ActionKind::Filesystem,
            Action::LoadImage { .. } => ActionKind::ImageLoad,
            Action::ComposeUp { .. } | Action::ComposeStop { .. } | Action::ComposeDown { .. } => {
                ActionKind::Compose
            }
            Action::RegisterService { .. } | Action::SetServiceEnabled { .. } => {
                ActionKind::ServiceManager
            }
            Action::PruneDanglingImages => ActionKind::Prune,
        }
    }

    /// Whether a failure of this action makes the whole run fail
    ///
    /// Image cleanup is the only optional step.
    pub fn is_blocking(&self) -> bool {
        !matches!(self, Action::PruneDanglingImages)
    }

    /// Whether the action changes the set of running workload containers
    pub fn touches_workload(&self) -> bool {
        self.kind() == ActionKind::Compose
    }

    /// One-line description for logs and reports
    pub fn describe(&self) -> String {
        self.to_string()
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Action::EnsureDirectory { path, mode } => {
                write!(f, "ensure directory {} ({:o})", path.display(), mode)
            }
            Action::WriteFile { path, .. } => write!(f, "write {}", path.display()),
            Action::LoadImage {
                archive,
                image: Some(image),
            } => write!(f, "load image {} from {}", image, archive.display()),
            Action::LoadImage {
                archive,
                image: None,
            } => write!(f, "load image archive {}", archive.display()),
            Action::ComposeUp { workload } => {
                write!(f, "compose up ({})", workload.variant)
            }
            Action::ComposeStop { workload } => {
                write!(f, "compose stop ({})", workload.variant)
            }
            Action::ComposeDown {
                workload,
                remove_volumes,
            } => {
                write!(f, "compose down ({})", workload.variant)?;
                if *remove_volumes {
                    write!(f, " with volumes")?;
                }
                Ok(())
            }
            Action::RegisterService { unit } => {
                write!(f, "register service {}", unit.name)
            }
            Action::SetServiceEnabled { unit_name, enabled } => {
                let verb = if *enabled { "enable" } else { "disable" };
                write!(f, "{verb} service {unit_name}")
            }
            Action::PruneDanglingImages => write!(f, "prune dangling images"),
        }
    }
}

/// Parameters for the stop intent
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StopRequest {
    /// Remove containers instead of only stopping them
    pub remove_containers: bool,
    /// Remove named volumes too (implies removing containers)
    pub remove_volumes: bool,
    /// The operator confirmed volume removal
    pub confirmed: bool,
    /// Remove dangling images afterwards
    pub prune_images: bool,
}

/// Parameters for the import intent
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ImportRequest {
    /// Archives to load, in order
    pub archives: Vec<ImageArchive>,
    /// Archives found unusable before planning
    pub rejected: Vec<RejectedArchive>,
    /// Load archives even when their image is already present
    pub force: bool,
    /// Remove dangling images afterwards
    pub prune: bool,
}

/// What the operator asked for
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "intent", rename_all = "snake_case")]
pub enum Intent {
    /// Create the directory layout and env file
    Configure,
    /// Bring the workload up
    Start,
    /// Bring the workload down
    Stop(StopRequest),
    /// Register the workload with the service manager
    Install,
    /// Load offline image archives
    Import(ImportRequest),
    /// Observe only
    StatusOnly,
}

impl Intent {
    /// Short lowercase name
    pub fn name(&self) -> &'static str {
        match self {
            Intent::Configure => "configure",
            Intent::Start => "start",
            Intent::Stop(_) => "stop",
            Intent::Install => "install",
            Intent::Import(_) => "import",
            Intent::StatusOnly => "status",
        }
    }
}

/// Severity of a plan note
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum NoteSeverity {
    /// Informational; does not affect the outcome
    Warning,
    /// Part of the request was deliberately not carried out
    Degraded,
}

/// A note the planner attaches to a plan
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PlanNote {
    /// Severity
    pub severity: NoteSeverity,
    /// Human readable message
    pub message: String,
}

impl PlanNote {
    /// Informational note
    pub fn warning(message: impl Into<String>) -> Self {
        Self {
            severity: NoteSeverity::Warning,
            message: message.into(),
        }
    }

    /// Note that downgrades the outcome
    pub fn degraded(message: impl Into<String>) -> Self {
        Self {
            severity: NoteSeverity::Degraded,
            message: message.into(),
        }
    }
}

/// Ordered list of actions for one intent
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Plan {
    /// Intent the plan was built for
    pub intent: &'static str,
    /// Actions in execution order
    pub actions: Vec<Action>,
    /// Warnings and degradations found while planning
    pub notes: Vec<PlanNote>,
    /// Containers whose running set must not change underneath the executor
    pub watched_containers: Vec<String>,
}

impl Plan {
    /// Empty plan for an intent
    pub fn new(intent: &Intent) -> Self {
        Self {
            intent: intent.name(),
            actions: Vec::new(),
            notes: Vec::new(),
            watched_containers: Vec::new(),
        }
    }

    /// Whether there is nothing to do
    pub fn is_empty(&self) -> bool {
        self.actions.is_empty()
    }
}

/// How an individual action ended
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionOutcome {
    /// The action changed the host as intended
    Succeeded,
    /// The action did not complete
    Failed,
    /// The host already satisfied the action
    Skipped,
}

/// Record of one attempted action
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ExecutionResult {
    /// The action
    pub action: Action,
    /// How it ended
    pub outcome: ActionOutcome,
    /// Collaborator error detail when it failed
    pub error_detail: Option<String>,
    /// Wall-clock duration in milliseconds
    pub duration_ms: u64,
}

impl ExecutionResult {
    /// Whether the host now satisfies the action
    pub fn is_satisfied(&self) -> bool {
        matches!(
            self.outcome,
            ActionOutcome::Succeeded | ActionOutcome::Skipped
        )
    }
}

/// Why execution stopped before the end of the plan
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "reason", rename_all = "snake_case")]
pub enum Halt {
    /// The action at `index` failed
    ActionFailed {
        /// Plan index of the failed action
        index: usize,
    },
    /// The running containers changed before the action at `index`
    StateDrift {
        /// Plan index of the action that was not attempted
        index: usize,
        /// What changed
        detail: String,
    },
    /// Cancellation was observed before the action at `index`
    Cancelled {
        /// Plan index of the first action not attempted
        index: usize,
    },
}

/// Ordered execution results plus the reason execution stopped early
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ExecutionLog {
    /// One entry per attempted action, in plan order
    pub results: Vec<ExecutionResult>,
    /// Set when execution did not reach the end of the plan
    pub halt: Option<Halt>,
}

impl ExecutionLog {
    /// Whether every planned action ran to satisfaction
    pub fn completed(&self) -> bool {
        self.halt.is_none() && self.results.iter().all(ExecutionResult::is_satisfied)
    }

    /// Descriptions of the actions that left the host satisfied
    pub fn satisfied_actions(&self) -> Vec<String> {
        self.results
            .iter()
            .filter(|r| r.is_satisfied())
            .map(|r| r.action.describe())
            .collect()
    }
}
