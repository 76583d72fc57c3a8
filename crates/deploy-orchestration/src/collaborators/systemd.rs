//! Service manager backed by systemctl.

use async_trait::async_trait;
use command_executor::{Command, Error as ExecError, ExitResult, Launcher, LocalLauncher};
use std::fmt::Write as _;
use std::path::PathBuf;
use tracing::{debug, info};

use super::host::write_with_mode;
use super::{CollabResult, CollaboratorError, ComposeCapability, ServiceManager, UnitStatus};
use crate::model::UnitSpec;

/// systemd unit directory for administrator-installed units
pub const DEFAULT_UNIT_DIR: &str = "/etc/systemd/system";

/// Unit files carry the environment overrides, credentials included
const UNIT_FILE_MODE: u32 = 0o600;

/// systemctl-driven service manager
#[derive(Debug, Clone)]
pub struct Systemctl {
    launcher: LocalLauncher,
    unit_dir: PathBuf,
    compose: ComposeCapability,
}

impl Systemctl {
    /// Manage units in `unit_dir`, starting the workload with `compose`
    pub fn new(unit_dir: impl Into<PathBuf>, compose: ComposeCapability) -> Self {
        Self {
            launcher: LocalLauncher,
            unit_dir: unit_dir.into(),
            compose,
        }
    }

    fn unit_path(&self, unit_name: &str) -> PathBuf {
        self.unit_dir.join(format!("{unit_name}.service"))
    }

    async fn systemctl(&self, args: &[&str]) -> CollabResult<ExitResult> {
        let command = Command::builder("systemctl").args(args.iter().copied()).build();
        debug!("Running {}", command);
        match self.launcher.execute(command).await {
            Ok(result) => Ok(result),
            Err(ExecError::CommandNotFound { .. }) => Err(CollaboratorError::Unreachable {
                collaborator: "service manager",
                detail: "`systemctl` is not installed".to_string(),
            }),
            Err(e) => Err(e.into()),
        }
    }

    async fn systemctl_checked(&self, args: &[&str]) -> CollabResult<ExitResult> {
        let result = self.systemctl(args).await?;
        if result.success() {
            return Ok(result);
        }
        let detail = result.failure_detail();
        if detail.contains("System has not been booted with systemd")
            || detail.contains("Failed to connect to bus")
        {
            return Err(CollaboratorError::Unreachable {
                collaborator: "service manager",
                detail,
            });
        }
        Err(CollaboratorError::CommandFailed {
            command: format!("systemctl {}", args.join(" ")),
            detail,
        })
    }
}

impl Default for Systemctl {
    fn default() -> Self {
        Self::new(DEFAULT_UNIT_DIR, ComposeCapability::Plugin)
    }
}

/// Render a unit file that runs the compose workload as a oneshot service
pub fn render_unit(unit: &UnitSpec, compose: ComposeCapability) -> String {
    let workload = &unit.workload;
    let base = format!(
        "/usr/bin/env {} -f {} --project-directory {}",
        compose.command_line(),
        workload.compose_file.display(),
        workload.project_dir.display()
    );

    let mut out = String::new();
    let _ = writeln!(out, "[Unit]");
    let _ = writeln!(out, "Description={}", unit.description);
    let _ = writeln!(out, "Requires=docker.service");
    let _ = writeln!(out, "After=docker.service network-online.target");
    let _ = writeln!(out, "Wants=network-online.target");
    let _ = writeln!(out);
    let _ = writeln!(out, "[Service]");
    let _ = writeln!(out, "Type=oneshot");
    let _ = writeln!(out, "RemainAfterExit=yes");
    let _ = writeln!(out, "WorkingDirectory={}", unit.working_dir.display());
    for (key, value) in &workload.env {
        let _ = writeln!(out, "Environment=\"{}={}\"", key, value.replace('"', "\\\""));
    }
    let _ = writeln!(out, "ExecStart={base} up -d");
    let _ = writeln!(out, "ExecStop={base} down");
    let _ = writeln!(out, "ExecReload={base} restart");
    let _ = writeln!(out, "Restart={}", unit.restart);
    let _ = writeln!(out, "TimeoutStartSec={}", unit.timeout_start_secs);
    let _ = writeln!(out, "TimeoutStopSec={}", unit.timeout_stop_secs);
    let _ = writeln!(out);
    let _ = writeln!(out, "[Install]");
    let _ = writeln!(out, "WantedBy=multi-user.target");
    out
}

#[async_trait]
impl ServiceManager for Systemctl {
    async fn status(&self, unit_name: &str) -> CollabResult<UnitStatus> {
        let service = format!("{unit_name}.service");
        let registered = async_fs::metadata(self.unit_path(unit_name)).await.is_ok();

        let enabled = self.systemctl(&["is-enabled", &service]).await?;
        let active = self.systemctl(&["is-active", &service]).await?;

        Ok(UnitStatus {
            registered: registered || enabled.success(),
            enabled: enabled.success() && enabled.stdout.trim() == "enabled",
            active: active.stdout.trim() == "active",
        })
    }

    async fn is_current(&self, unit: &UnitSpec) -> CollabResult<bool> {
        match async_fs::read_to_string(self.unit_path(&unit.name)).await {
            Ok(installed) => Ok(installed == render_unit(unit, self.compose)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    async fn register(&self, unit: &UnitSpec) -> CollabResult<()> {
        let path = self.unit_path(&unit.name);
        info!("Installing unit file {}", path.display());
        write_with_mode(&path, &render_unit(unit, self.compose), UNIT_FILE_MODE).await?;
        self.systemctl_checked(&["daemon-reload"]).await?;
        Ok(())
    }

    async fn set_enabled(&self, unit_name: &str, enabled: bool) -> CollabResult<()> {
        let verb = if enabled { "enable" } else { "disable" };
        let service = format!("{unit_name}.service");
        info!("Running systemctl {} {}", verb, service);
        self.systemctl_checked(&[verb, &service]).await?;
        Ok(())
    }

    async fn journal(&self, unit_name: &str, lines: usize) -> CollabResult<String> {
        let lines = lines.to_string();
        let command = Command::builder("journalctl")
            .args(["-u", unit_name, "-n", lines.as_str(), "--no-pager"])
            .build();
        let result = self.launcher.execute(command).await?;
        if !result.success() {
            return Err(CollaboratorError::CommandFailed {
                command: format!("journalctl -u {unit_name}"),
                detail: result.failure_detail(),
            });
        }
        Ok(result.stdout)
    }
}
