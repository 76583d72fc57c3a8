//! Interfaces to the host: container runtime, service manager, filesystem and ports.
//!
//! The reconciliation pipeline only talks to these traits. Production
//! implementations drive the real CLIs through `command-executor`; tests use
//! the in-memory fakes from the `testing` module.

mod docker;
mod host;
mod systemd;

pub use docker::{detect_compose, DockerCli};
pub use host::{HostFs, TcpPortProbe};
pub use systemd::{render_unit, Systemctl, DEFAULT_UNIT_DIR};

use async_trait::async_trait;
use command_executor::ExitResult;
use serde::Serialize;
use std::collections::BTreeSet;
use std::future::Future;
use std::path::Path;
use std::time::Duration;

use crate::model::{ImageRef, UnitSpec};
use crate::plan::ComposeWorkload;

/// Failure reported by a collaborator
#[derive(thiserror::Error, Debug)]
pub enum CollaboratorError {
    /// The collaborator could not be reached; retrying may help
    #[error("{collaborator} is unreachable: {detail}")]
    Unreachable {
        /// Collaborator name
        collaborator: &'static str,
        /// Underlying failure
        detail: String,
    },

    /// The collaborator ran and reported an error
    #[error("`{command}` failed: {detail}")]
    CommandFailed {
        /// Command that failed
        command: String,
        /// Error output
        detail: String,
    },

    /// The call did not finish in time
    #[error("timed out after {0:?}")]
    TimedOut(Duration),

    /// Local IO failure
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// The collaborator CLI could not be launched
    #[error("{0}")]
    Launch(#[from] command_executor::Error),
}

impl CollaboratorError {
    /// Whether retrying the same call may succeed
    pub fn is_transient(&self) -> bool {
        matches!(self, CollaboratorError::Unreachable { .. })
    }
}

/// Result type for collaborator calls
pub type CollabResult<T> = std::result::Result<T, CollaboratorError>;

/// Race a collaborator call against a timer
pub async fn with_timeout<T, F>(limit: Duration, fut: F) -> CollabResult<T>
where
    F: Future<Output = CollabResult<T>>,
{
    smol::future::or(fut, async move {
        smol::Timer::after(limit).await;
        Err(CollaboratorError::TimedOut(limit))
    })
    .await
}

/// Which compose front end the host provides
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ComposeCapability {
    /// `docker compose` plugin
    Plugin,
    /// Standalone `docker-compose` binary
    Standalone,
}

impl ComposeCapability {
    /// Program to launch
    pub fn program(&self) -> &'static str {
        match self {
            ComposeCapability::Plugin => "docker",
            ComposeCapability::Standalone => "docker-compose",
        }
    }

    /// Arguments preceding the compose subcommand
    pub fn base_args(&self) -> &'static [&'static str] {
        match self {
            ComposeCapability::Plugin => &["compose"],
            ComposeCapability::Standalone => &[],
        }
    }

    /// Command prefix as a single string (`docker compose`)
    pub fn command_line(&self) -> String {
        let mut parts = vec![self.program()];
        parts.extend(self.base_args());
        parts.join(" ")
    }
}

/// One image as listed by the runtime
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ImageSummary {
    /// `repository:tag`
    pub image: ImageRef,
    /// Size as the runtime prints it (`512MB`)
    pub size: String,
    /// Creation time as the runtime prints it
    pub created: String,
}

/// Container runtime and compose engine
#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    /// Server version; fails when the daemon is unreachable
    async fn version(&self) -> CollabResult<String>;

    /// Images known to the runtime
    async fn list_images(&self) -> CollabResult<BTreeSet<ImageRef>>;

    /// Tagged images with their size and creation time, in listing order
    async fn describe_images(&self) -> CollabResult<Vec<ImageSummary>>;

    /// Names of running containers
    async fn list_running_containers(&self) -> CollabResult<BTreeSet<String>>;

    /// Pull an image from its registry
    async fn pull_image(&self, image: &ImageRef) -> CollabResult<()>;

    /// Save an image to an archive file
    async fn save_image(&self, image: &ImageRef, archive: &Path) -> CollabResult<()>;

    /// Load an archive, returning the images it contained
    async fn load_image(&self, archive: &Path) -> CollabResult<Vec<ImageRef>>;

    /// Remove dangling images, returning how many were removed
    async fn prune_dangling_images(&self) -> CollabResult<usize>;

    /// `compose up -d`
    async fn compose_up(&self, workload: &ComposeWorkload) -> CollabResult<()>;

    /// `compose stop`
    async fn compose_stop(&self, workload: &ComposeWorkload) -> CollabResult<()>;

    /// `compose down`, optionally with `--volumes`
    async fn compose_down(
        &self,
        workload: &ComposeWorkload,
        remove_volumes: bool,
    ) -> CollabResult<()>;

    /// Last `tail` log lines of a container
    async fn container_logs(&self, container: &str, tail: usize) -> CollabResult<String>;

    /// Run a command inside a running container
    async fn exec(&self, container: &str, argv: &[String]) -> CollabResult<ExitResult>;
}

/// Registration state of a service unit
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct UnitStatus {
    /// Unit file is installed
    pub registered: bool,
    /// Unit starts at boot
    pub enabled: bool,
    /// Unit is currently active
    pub active: bool,
}

/// Host service manager
#[async_trait]
pub trait ServiceManager: Send + Sync {
    /// Registration state of a unit
    async fn status(&self, unit_name: &str) -> CollabResult<UnitStatus>;

    /// Whether the installed unit is the one `register` would write for `unit`
    async fn is_current(&self, unit: &UnitSpec) -> CollabResult<bool>;

    /// Install the unit and reload the manager
    async fn register(&self, unit: &UnitSpec) -> CollabResult<()>;

    /// Enable or disable a unit at boot
    async fn set_enabled(&self, unit_name: &str, enabled: bool) -> CollabResult<()>;

    /// Recent journal lines for a unit
    async fn journal(&self, unit_name: &str, lines: usize) -> CollabResult<String>;
}

/// Host filesystem
#[async_trait]
pub trait Filesystem: Send + Sync {
    /// Whether a path exists
    async fn exists(&self, path: &Path) -> bool;

    /// File content, `None` when the file does not exist
    async fn read_to_string(&self, path: &Path) -> CollabResult<Option<String>>;

    /// Create a directory and its parents; apply `mode` to the directory
    async fn ensure_dir(&self, path: &Path, mode: u32) -> CollabResult<()>;

    /// Write a file and apply `mode`
    async fn write_file(&self, path: &Path, content: &str, mode: u32) -> CollabResult<()>;
}

/// Local port probe
#[async_trait]
pub trait PortProbe: Send + Sync {
    /// Whether something accepts connections on the port
    async fn is_bound(&self, port: u16) -> bool;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_timeout_fires() {
        smol::block_on(async {
            let result: CollabResult<()> = with_timeout(
                Duration::from_millis(20),
                futures::future::pending(),
            )
            .await;
            assert!(matches!(result, Err(CollaboratorError::TimedOut(_))));
        });
    }

    #[test]
    fn test_timeout_passes_result_through() {
        smol::block_on(async {
            let result = with_timeout(Duration::from_secs(5), async { Ok(7) }).await;
            assert_eq!(result.unwrap(), 7);
        });
    }

    #[test]
    fn test_compose_command_line() {
        assert_eq!(ComposeCapability::Plugin.command_line(), "docker compose");
        assert_eq!(ComposeCapability::Standalone.command_line(), "docker-compose");
    }

    #[test]
    fn test_only_unreachable_is_transient() {
        let err = CollaboratorError::Unreachable {
            collaborator: "docker",
            detail: "Cannot connect to the Docker daemon".to_string(),
        };
        assert!(err.is_transient());
        assert!(!CollaboratorError::TimedOut(Duration::from_secs(1)).is_transient());
    }
}
