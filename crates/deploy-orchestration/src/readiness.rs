//! Readiness polling for the database and the application.

use async_trait::async_trait;
use command_executor::{Command, Error as ExecError, Launcher, LocalLauncher};
use futures::future::join_all;
use serde::Serialize;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

use crate::collaborators::ContainerRuntime;
use crate::model::{BackoffPolicy, DatabaseBackend, DesiredState, ReadinessPolicies};

/// HTTP status codes that mean the application is serving requests
///
/// 302 and 403 are what the setup wizard and login redirect answer with.
pub const READY_HTTP_CODES: &[u16] = &[200, 302, 403];

/// What is being waited for
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ReadinessTarget {
    /// Database container accepts connections
    Database,
    /// Application answers HTTP
    Application,
}

impl fmt::Display for ReadinessTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ReadinessTarget::Database => f.write_str("database"),
            ReadinessTarget::Application => f.write_str("application"),
        }
    }
}

/// Result of the latest readiness check
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ReadinessStatus {
    /// Not checked yet
    Unknown,
    /// Nothing answered
    Unreachable,
    /// Something answered but not with a ready response
    Unhealthy,
    /// Ready
    Ready,
}

impl fmt::Display for ReadinessStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ReadinessStatus::Unknown => "unknown",
            ReadinessStatus::Unreachable => "unreachable",
            ReadinessStatus::Unhealthy => "unhealthy",
            ReadinessStatus::Ready => "ready",
        };
        f.write_str(s)
    }
}

/// One readiness check against a target
#[async_trait]
pub trait ReadinessProbe: Send + Sync {
    /// Check a target once
    async fn check(&self, target: ReadinessTarget) -> ReadinessStatus;
}

/// Readiness checks run as commands: `docker exec` for the database, `curl` for the application
pub struct CommandReadinessProbe {
    runtime: Arc<dyn ContainerRuntime>,
    launcher: LocalLauncher,
    backend: DatabaseBackend,
    database_container: String,
    database_user: String,
    service_port: u16,
    request_timeout: Duration,
}

impl CommandReadinessProbe {
    /// Probe the workload described by `desired`
    pub fn new(desired: &DesiredState, runtime: Arc<dyn ContainerRuntime>) -> Self {
        Self {
            runtime,
            launcher: LocalLauncher,
            backend: desired.database_backend,
            database_container: desired.containers.database.clone(),
            database_user: desired.database_user.clone(),
            service_port: desired.service_port,
            request_timeout: Duration::from_secs(10),
        }
    }

    /// Command run inside the database container
    pub fn database_argv(&self) -> Vec<String> {
        let argv: Vec<&str> = match self.backend {
            DatabaseBackend::Mysql => vec!["mysqladmin", "ping", "-h", "localhost", "--silent"],
            DatabaseBackend::Postgresql => vec!["pg_isready", "-U", self.database_user.as_str()],
        };
        argv.into_iter().map(str::to_string).collect()
    }

    /// HTTP check against the application port
    pub fn application_command(&self) -> Command {
        Command::builder("curl")
            .args(["-s", "-o", "/dev/null", "-w", "%{http_code}"])
            .arg("--max-time")
            .arg(self.request_timeout.as_secs().max(1).to_string())
            .arg(format!("http://127.0.0.1:{}/", self.service_port))
            .build()
    }

    async fn check_database(&self) -> ReadinessStatus {
        match self
            .runtime
            .exec(&self.database_container, &self.database_argv())
            .await
        {
            Ok(result) if result.success() => ReadinessStatus::Ready,
            Ok(result) => {
                let detail = result.failure_detail();
                debug!("Database check failed: {}", detail);
                if detail.contains("No such container") || detail.contains("is not running") {
                    ReadinessStatus::Unreachable
                } else {
                    ReadinessStatus::Unhealthy
                }
            }
            Err(e) => {
                debug!("Database check could not run: {}", e);
                ReadinessStatus::Unreachable
            }
        }
    }

    async fn check_application(&self) -> ReadinessStatus {
        match self.launcher.execute(self.application_command()).await {
            Ok(result) => classify_http(result.status.code, result.stdout.trim()),
            Err(ExecError::CommandNotFound { .. }) => {
                warn!("curl is not installed; the application cannot be checked");
                ReadinessStatus::Unreachable
            }
            Err(e) => {
                debug!("Application check could not run: {}", e);
                ReadinessStatus::Unreachable
            }
        }
    }
}

/// Map a curl exit code and `%{http_code}` output to a status
fn classify_http(exit_code: Option<i32>, http_code: &str) -> ReadinessStatus {
    // 7: connection refused, 28: timed out, 52: empty reply
    if matches!(exit_code, Some(7) | Some(28) | Some(52)) {
        return ReadinessStatus::Unreachable;
    }
    match http_code.parse::<u16>() {
        Ok(0) | Err(_) => ReadinessStatus::Unreachable,
        Ok(code) if READY_HTTP_CODES.contains(&code) => ReadinessStatus::Ready,
        Ok(code) => {
            debug!("Application answered HTTP {}", code);
            ReadinessStatus::Unhealthy
        }
    }
}

#[async_trait]
impl ReadinessProbe for CommandReadinessProbe {
    async fn check(&self, target: ReadinessTarget) -> ReadinessStatus {
        match target {
            ReadinessTarget::Database => self.check_database().await,
            ReadinessTarget::Application => self.check_application().await,
        }
    }
}

/// Polls targets concurrently under their backoff policies and a shared deadline
pub struct ReadinessMonitor {
    probe: Arc<dyn ReadinessProbe>,
    policies: ReadinessPolicies,
}

impl ReadinessMonitor {
    /// Create a monitor
    pub fn new(probe: Arc<dyn ReadinessProbe>, policies: ReadinessPolicies) -> Self {
        Self { probe, policies }
    }

    /// Policy for a target
    pub fn policy(&self, target: ReadinessTarget) -> &BackoffPolicy {
        match target {
            ReadinessTarget::Database => &self.policies.database,
            ReadinessTarget::Application => &self.policies.application,
        }
    }

    /// Longest per-target deadline
    pub fn default_deadline(&self) -> Duration {
        self.policies
            .database
            .deadline
            .max(self.policies.application.deadline)
    }

    /// Poll every target until it is ready, its policy is exhausted or `deadline` passes
    pub async fn await_ready(
        &self,
        targets: &[ReadinessTarget],
        deadline: Duration,
    ) -> BTreeMap<ReadinessTarget, ReadinessStatus> {
        let until = deadline_from_now(deadline);
        info!(
            "Waiting up to {:?} for {}",
            deadline,
            targets
                .iter()
                .map(ToString::to_string)
                .collect::<Vec<_>>()
                .join(" and ")
        );

        join_all(
            targets
                .iter()
                .map(|&target| async move { (target, self.poll(target, until).await) }),
        )
        .await
        .into_iter()
        .collect()
    }

    /// Check every target once, each bounded by `timeout`
    pub async fn check_once(
        &self,
        targets: &[ReadinessTarget],
        timeout: Duration,
    ) -> BTreeMap<ReadinessTarget, ReadinessStatus> {
        let until = deadline_from_now(timeout);
        join_all(targets.iter().map(|&target| async move {
            (target, self.bounded_check(target, until).await)
        }))
        .await
        .into_iter()
        .map(|(target, status)| (target, status.unwrap_or(ReadinessStatus::Unreachable)))
        .collect()
    }

    async fn bounded_check(
        &self,
        target: ReadinessTarget,
        until: Instant,
    ) -> Option<ReadinessStatus> {
        let remaining = until.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            return None;
        }
        smol::future::or(async { Some(self.probe.check(target).await) }, async {
            smol::Timer::after(remaining).await;
            None
        })
        .await
    }

    async fn poll(&self, target: ReadinessTarget, global_deadline: Instant) -> ReadinessStatus {
        let policy = self.policy(target);
        let until = global_deadline.min(deadline_from_now(policy.deadline));
        let max_attempts = policy.max_attempts.max(1);
        let mut interval = policy.interval;
        let mut status = ReadinessStatus::Unknown;

        for attempt in 1..=max_attempts {
            match self.bounded_check(target, until).await {
                Some(latest) => status = latest,
                None => break,
            }

            if status == ReadinessStatus::Ready {
                info!("{} is ready after {} attempt(s)", target, attempt);
                return status;
            }
            debug!(
                "{} is {} (attempt {}/{})",
                target, status, attempt, max_attempts
            );

            let remaining = until.saturating_duration_since(Instant::now());
            if attempt == max_attempts || remaining.is_zero() {
                break;
            }
            smol::Timer::after(interval.min(remaining)).await;
            interval = policy.next_interval(interval);
        }

        if status == ReadinessStatus::Unknown {
            status = ReadinessStatus::Unreachable;
        }
        warn!("{} did not become ready: {}", target, status);
        status
    }
}

fn deadline_from_now(timeout: Duration) -> Instant {
    let now = Instant::now();
    now.checked_add(timeout)
        .unwrap_or_else(|| now + Duration::from_secs(365 * 24 * 60 * 60))
}
