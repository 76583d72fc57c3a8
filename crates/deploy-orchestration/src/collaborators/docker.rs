//! Container runtime backed by the docker CLI.

use async_trait::async_trait;
use command_executor::{Command, Error as ExecError, ExitResult, Launcher, LocalLauncher};
use std::collections::BTreeSet;
use std::path::Path;
use tracing::{debug, info, warn};

use super::{CollabResult, CollaboratorError, ComposeCapability, ContainerRuntime, ImageSummary};
use crate::model::ImageRef;
use crate::plan::ComposeWorkload;

const DAEMON_DOWN_MARKERS: &[&str] = &[
    "Cannot connect to the Docker daemon",
    "Is the docker daemon running",
    "error during connect",
];

/// Docker CLI with a detected compose front end
#[derive(Debug, Clone)]
pub struct DockerCli {
    launcher: LocalLauncher,
    compose: Option<ComposeCapability>,
}

impl DockerCli {
    /// Create a runtime using the given compose front end
    pub fn new(compose: Option<ComposeCapability>) -> Self {
        Self {
            launcher: LocalLauncher,
            compose,
        }
    }

    /// Detect the compose front end and create a runtime
    pub async fn detect() -> Self {
        let compose = detect_compose(&LocalLauncher).await;
        Self::new(compose)
    }

    /// Compose front end in use, if any was found
    pub fn compose_capability(&self) -> Option<ComposeCapability> {
        self.compose
    }

    async fn run(&self, command: Command) -> CollabResult<ExitResult> {
        let rendered = command.to_string();
        match self.launcher.execute(command).await {
            Ok(result) => Ok(result),
            Err(ExecError::CommandNotFound { command }) => Err(CollaboratorError::Unreachable {
                collaborator: "container runtime",
                detail: format!("`{command}` is not installed"),
            }),
            Err(e) => {
                debug!("Failed to launch `{}`: {}", rendered, e);
                Err(e.into())
            }
        }
    }

    /// Run a docker command and require success
    async fn docker(&self, args: &[&str]) -> CollabResult<ExitResult> {
        let command = Command::builder("docker").args(args.iter().copied()).build();
        let rendered = command.to_string();
        let result = self.run(command).await?;
        check(rendered, result)
    }

    async fn compose(&self, workload: &ComposeWorkload, args: &[&str]) -> CollabResult<()> {
        let capability = self.compose.ok_or_else(|| CollaboratorError::Unreachable {
            collaborator: "compose engine",
            detail: "neither `docker compose` nor `docker-compose` is available".to_string(),
        })?;

        let command = compose_command(capability, workload, args);
        let rendered = command.to_string();
        info!("Running {}", rendered);
        let result = self.run(command).await?;
        check(rendered, result).map(|_| ())
    }
}

impl Default for DockerCli {
    fn default() -> Self {
        Self::new(Some(ComposeCapability::Plugin))
    }
}

/// Probe for `docker compose`, then `docker-compose`
pub async fn detect_compose<L: Launcher>(launcher: &L) -> Option<ComposeCapability> {
    for capability in [ComposeCapability::Plugin, ComposeCapability::Standalone] {
        let command = Command::builder(capability.program())
            .args(capability.base_args().iter().copied())
            .arg("version")
            .build();
        match launcher.execute(command).await {
            Ok(result) if result.success() => {
                debug!("Using compose front end `{}`", capability.command_line());
                return Some(capability);
            }
            Ok(_) | Err(_) => continue,
        }
    }
    warn!("No compose front end found");
    None
}

/// Build a compose invocation for a workload
pub(crate) fn compose_command(
    capability: ComposeCapability,
    workload: &ComposeWorkload,
    args: &[&str],
) -> Command {
    Command::builder(capability.program())
        .args(capability.base_args().iter().copied())
        .arg("-f")
        .arg(workload.compose_file.display().to_string())
        .arg("--project-directory")
        .arg(workload.project_dir.display().to_string())
        .args(args.iter().copied())
        .envs(workload.env.clone())
        .current_dir(&workload.project_dir)
        .build()
}

fn check(command: String, result: ExitResult) -> CollabResult<ExitResult> {
    if result.success() {
        return Ok(result);
    }
    let detail = result.failure_detail();
    if DAEMON_DOWN_MARKERS.iter().any(|m| detail.contains(m)) {
        return Err(CollaboratorError::Unreachable {
            collaborator: "container runtime",
            detail,
        });
    }
    Err(CollaboratorError::CommandFailed { command, detail })
}

/// Extract image names from `docker load` output
pub(crate) fn parse_loaded_images(output: &str) -> Vec<ImageRef> {
    output
        .lines()
        .filter_map(|line| line.trim().strip_prefix("Loaded image: "))
        .filter_map(|name| name.trim().parse().ok())
        .collect()
}

fn parse_image_list(output: &str) -> BTreeSet<ImageRef> {
    output
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.contains("<none>"))
        .filter_map(|line| line.parse().ok())
        .collect()
}

fn parse_image_details(output: &str) -> Vec<ImageSummary> {
    output
        .lines()
        .filter_map(|line| {
            let mut fields = line.trim().splitn(3, '\t');
            let name = fields.next()?;
            if name.contains("<none>") {
                return None;
            }
            Some(ImageSummary {
                image: name.parse().ok()?,
                size: fields.next().unwrap_or_default().trim().to_string(),
                created: fields.next().unwrap_or_default().trim().to_string(),
            })
        })
        .collect()
}

#[async_trait]
impl ContainerRuntime for DockerCli {
    async fn version(&self) -> CollabResult<String> {
        let result = self
            .docker(&["version", "--format", "{{.Server.Version}}"])
            .await?;
        Ok(result.stdout.trim().to_string())
    }

    async fn list_images(&self) -> CollabResult<BTreeSet<ImageRef>> {
        let result = self
            .docker(&["image", "ls", "--format", "{{.Repository}}:{{.Tag}}"])
            .await?;
        Ok(parse_image_list(&result.stdout))
    }

    async fn describe_images(&self) -> CollabResult<Vec<ImageSummary>> {
        let result = self
            .docker(&[
                "image",
                "ls",
                "--format",
                "{{.Repository}}:{{.Tag}}\t{{.Size}}\t{{.CreatedAt}}",
            ])
            .await?;
        Ok(parse_image_details(&result.stdout))
    }

    async fn list_running_containers(&self) -> CollabResult<BTreeSet<String>> {
        let result = self.docker(&["ps", "--format", "{{.Names}}"]).await?;
        Ok(result
            .stdout
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty())
            .map(str::to_string)
            .collect())
    }

    async fn pull_image(&self, image: &ImageRef) -> CollabResult<()> {
        info!("Pulling {}", image);
        self.docker(&["pull", &image.to_string()]).await?;
        Ok(())
    }

    async fn save_image(&self, image: &ImageRef, archive: &Path) -> CollabResult<()> {
        info!("Saving {} to {}", image, archive.display());
        let archive = archive.display().to_string();
        self.docker(&["save", "-o", &archive, &image.to_string()])
            .await?;
        Ok(())
    }

    async fn load_image(&self, archive: &Path) -> CollabResult<Vec<ImageRef>> {
        let archive = archive.display().to_string();
        let result = self.docker(&["load", "-i", &archive]).await?;

        // Older engines print the summary on stderr
        let mut loaded = parse_loaded_images(&result.stdout);
        if loaded.is_empty() {
            loaded = parse_loaded_images(&result.stderr);
        }
        Ok(loaded)
    }

    async fn prune_dangling_images(&self) -> CollabResult<usize> {
        let result = self
            .docker(&["images", "-f", "dangling=true", "-q"])
            .await?;
        let ids: BTreeSet<&str> = result
            .stdout
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty())
            .collect();
        if ids.is_empty() {
            debug!("No dangling images to remove");
            return Ok(0);
        }

        let mut args = vec!["rmi"];
        args.extend(ids.iter().copied());
        self.docker(&args).await?;
        info!("Removed {} dangling image(s)", ids.len());
        Ok(ids.len())
    }

    async fn compose_up(&self, workload: &ComposeWorkload) -> CollabResult<()> {
        self.compose(workload, &["up", "-d"]).await
    }

    async fn compose_stop(&self, workload: &ComposeWorkload) -> CollabResult<()> {
        self.compose(workload, &["stop"]).await
    }

    async fn compose_down(
        &self,
        workload: &ComposeWorkload,
        remove_volumes: bool,
    ) -> CollabResult<()> {
        if remove_volumes {
            self.compose(workload, &["down", "--volumes"]).await
        } else {
            self.compose(workload, &["down"]).await
        }
    }

    async fn container_logs(&self, container: &str, tail: usize) -> CollabResult<String> {
        let tail = tail.to_string();
        let result = self
            .docker(&["logs", "--tail", &tail, container])
            .await?;
        // docker logs replays the container's stderr on stderr
        let mut output = result.stdout;
        output.push_str(&result.stderr);
        Ok(output)
    }

    async fn exec(&self, container: &str, argv: &[String]) -> CollabResult<ExitResult> {
        let command = Command::builder("docker")
            .arg("exec")
            .arg(container)
            .args(argv.iter().cloned())
            .build();
        self.run(command).await
    }
}
