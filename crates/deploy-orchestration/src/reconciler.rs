//! Probe → plan → execute → readiness → report.

use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

use crate::collaborators::{
    with_timeout, ComposeCapability, ContainerRuntime, DockerCli, Filesystem, HostFs,
    ImageSummary, PortProbe, ServiceManager, Systemctl, TcpPortProbe, DEFAULT_UNIT_DIR,
};
use crate::executor::{ActionExecutor, CancelFlag};
use crate::images::ImageDownloader;
use crate::model::{DesiredState, ImageRef, ObservedState};
use crate::plan::{Intent, NoteSeverity};
use crate::planner;
use crate::probe::InventoryProbe;
use crate::readiness::{
    CommandReadinessProbe, ReadinessMonitor, ReadinessProbe, ReadinessStatus, ReadinessTarget,
};
use crate::reporter::{self, Report};
use crate::{DeployError, Result};

/// Targets awaited after the workload starts
pub const READINESS_TARGETS: [ReadinessTarget; 2] =
    [ReadinessTarget::Database, ReadinessTarget::Application];

const STATUS_CHECK_TIMEOUT: Duration = Duration::from_secs(15);
const LOG_TIMEOUT: Duration = Duration::from_secs(30);
const CANCEL_POLL: Duration = Duration::from_millis(200);

/// Point-in-time view of the deployment
#[derive(Debug, Clone, Serialize)]
pub struct StatusReport {
    /// What the probe saw
    pub observed: ObservedState,
    /// Required images the runtime does not have
    pub missing_images: Vec<ImageRef>,
    /// Workload containers that are not running
    pub stopped_containers: Vec<String>,
    /// One readiness check per target
    pub readiness: BTreeMap<ReadinessTarget, ReadinessStatus>,
}

impl StatusReport {
    /// Whether everything required is present, running and ready
    pub fn healthy(&self) -> bool {
        self.missing_images.is_empty()
            && self.stopped_containers.is_empty()
            && self
                .readiness
                .values()
                .all(|status| *status == ReadinessStatus::Ready)
    }
}

/// Chains the pipeline stages over one set of collaborators
#[derive(Clone)]
pub struct Reconciler {
    runtime: Arc<dyn ContainerRuntime>,
    service_manager: Arc<dyn ServiceManager>,
    fs: Arc<dyn Filesystem>,
    ports: Arc<dyn PortProbe>,
    readiness: Option<Arc<dyn ReadinessProbe>>,
    wait_ready: bool,
}

impl Reconciler {
    /// Create a reconciler over the given collaborators
    pub fn new(
        runtime: Arc<dyn ContainerRuntime>,
        service_manager: Arc<dyn ServiceManager>,
        fs: Arc<dyn Filesystem>,
        ports: Arc<dyn PortProbe>,
    ) -> Self {
        Self {
            runtime,
            service_manager,
            fs,
            ports,
            readiness: None,
            wait_ready: true,
        }
    }

    /// Reconciler over the real host: docker, systemd, local filesystem and ports
    ///
    /// The compose front end is detected once here. When neither is installed
    /// compose actions fail with an unreachable collaborator.
    pub async fn detect() -> Self {
        let docker = DockerCli::detect().await;
        let compose = docker.compose_capability().unwrap_or_else(|| {
            warn!("No compose front end found; compose actions will fail");
            ComposeCapability::Plugin
        });
        info!("Using `{}`", compose.command_line());

        Self::new(
            Arc::new(docker),
            Arc::new(Systemctl::new(DEFAULT_UNIT_DIR, compose)),
            Arc::new(HostFs),
            Arc::new(TcpPortProbe::default()),
        )
    }

    /// Use `probe` for readiness checks instead of the command-based probe
    pub fn with_readiness_probe(mut self, probe: Arc<dyn ReadinessProbe>) -> Self {
        self.readiness = Some(probe);
        self
    }

    /// Whether `start` waits for readiness (default true)
    pub fn with_wait_ready(mut self, wait_ready: bool) -> Self {
        self.wait_ready = wait_ready;
        self
    }

    /// Container runtime in use
    pub fn runtime(&self) -> Arc<dyn ContainerRuntime> {
        Arc::clone(&self.runtime)
    }

    /// Image downloader over the same container runtime
    pub fn downloader(&self) -> ImageDownloader {
        ImageDownloader::new(self.runtime())
    }

    fn inventory(&self) -> InventoryProbe {
        InventoryProbe::new(
            Arc::clone(&self.runtime),
            Arc::clone(&self.service_manager),
            Arc::clone(&self.fs),
            Arc::clone(&self.ports),
        )
    }

    fn monitor(&self, desired: &DesiredState) -> ReadinessMonitor {
        let probe = match &self.readiness {
            Some(probe) => Arc::clone(probe),
            None => Arc::new(CommandReadinessProbe::new(desired, self.runtime())),
        };
        ReadinessMonitor::new(probe, desired.readiness.clone())
    }

    /// Observe the host without changing it
    pub async fn probe(&self, desired: &DesiredState) -> Result<ObservedState> {
        self.inventory().probe(desired).await
    }

    /// Observe the host and check readiness once
    pub async fn status(&self, desired: &DesiredState) -> Result<StatusReport> {
        let observed = self.probe(desired).await?;
        let readiness = self
            .monitor(desired)
            .check_once(&READINESS_TARGETS, STATUS_CHECK_TIMEOUT)
            .await;

        let missing_images = desired
            .required_images
            .iter()
            .filter(|image| !observed.present_images.contains(*image))
            .cloned()
            .collect();
        let stopped_containers = desired
            .containers
            .all()
            .into_iter()
            .filter(|name| !observed.running_containers.contains(name))
            .collect();

        Ok(StatusReport {
            observed,
            missing_images,
            stopped_containers,
            readiness,
        })
    }

    /// Last `tail` lines of a workload container's log
    pub async fn logs(&self, container: &str, tail: usize) -> Result<String> {
        with_timeout(LOG_TIMEOUT, self.runtime.container_logs(container, tail))
            .await
            .map_err(|e| DeployError::CollaboratorUnavailable {
                collaborator: "container runtime".to_string(),
                reason: e.to_string(),
            })
    }

    /// Images the container runtime holds, with size and creation time
    pub async fn image_inventory(&self) -> Result<Vec<ImageSummary>> {
        with_timeout(LOG_TIMEOUT, self.runtime.describe_images())
            .await
            .map_err(|e| DeployError::CollaboratorUnavailable {
                collaborator: "container runtime".to_string(),
                reason: e.to_string(),
            })
    }

    /// Recent service manager journal lines for the workload unit
    pub async fn journal(&self, desired: &DesiredState, lines: usize) -> Result<String> {
        with_timeout(
            LOG_TIMEOUT,
            self.service_manager.journal(&desired.unit.name, lines),
        )
        .await
        .map_err(|e| DeployError::CollaboratorUnavailable {
            collaborator: "service manager".to_string(),
            reason: e.to_string(),
        })
    }

    /// Run one intent end to end
    ///
    /// Never fails: errors before execution become a `Failure` report.
    pub async fn run(&self, desired: &DesiredState, intent: Intent, cancel: &CancelFlag) -> Report {
        let observed = match self.probe(desired).await {
            Ok(observed) => observed,
            Err(e) => return reporter::failed(intent.name(), &e),
        };

        let plan = match planner::plan(desired, &observed, &intent) {
            Ok(plan) => plan,
            Err(e) => return reporter::failed(intent.name(), &e),
        };
        for note in &plan.notes {
            match note.severity {
                NoteSeverity::Warning => warn!("{}", note.message),
                NoteSeverity::Degraded => warn!("Not carried out: {}", note.message),
            }
        }
        info!("Planned {} action(s) for {}", plan.actions.len(), plan.intent);

        let executor = ActionExecutor::new(
            Arc::clone(&self.runtime),
            Arc::clone(&self.service_manager),
            Arc::clone(&self.fs),
            desired.timeouts.clone(),
        );
        let log = executor.execute(&plan, &observed, cancel).await;

        let await_readiness = matches!(intent, Intent::Start) && self.wait_ready && log.completed();
        if !await_readiness {
            return reporter::report(&plan, log, BTreeMap::new(), &[]);
        }

        let monitor = self.monitor(desired);
        let readiness = smol::future::or(
            monitor.await_ready(&READINESS_TARGETS, monitor.default_deadline()),
            async {
                while !cancel.is_cancelled() {
                    smol::Timer::after(CANCEL_POLL).await;
                }
                warn!("Cancelled while waiting for readiness");
                BTreeMap::new()
            },
        )
        .await;

        reporter::report(&plan, log, readiness, &READINESS_TARGETS)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{BackoffPolicy, ReadinessPolicies};
    use crate::reporter::Outcome;
    use crate::testing::{desired_state, Fakes};

    fn quick(desired: &mut DesiredState) {
        desired.readiness = ReadinessPolicies {
            database: BackoffPolicy::fixed(Duration::from_millis(5), 3),
            application: BackoffPolicy::fixed(Duration::from_millis(5), 3),
        };
    }

    #[test]
    fn test_start_waits_for_readiness() {
        smol::block_on(async {
            let mut desired = desired_state("/opt/confluence");
            quick(&mut desired);
            let fakes = Fakes::ready(&desired);
            fakes
                .readiness
                .script(ReadinessTarget::Database, &[ReadinessStatus::Ready]);
            fakes.readiness.script(
                ReadinessTarget::Application,
                &[ReadinessStatus::Unreachable, ReadinessStatus::Ready],
            );

            let report = fakes
                .reconciler()
                .run(&desired, Intent::Start, &CancelFlag::new())
                .await;

            assert_eq!(report.outcome, Outcome::Success, "{}", report.summary());
            assert_eq!(fakes.runtime.compose_calls(), vec!["up mysql".to_string()]);
            assert_eq!(
                report.readiness[&ReadinessTarget::Application],
                ReadinessStatus::Ready
            );
        });
    }

    #[test]
    fn test_unready_application_is_partial() {
        smol::block_on(async {
            let mut desired = desired_state("/opt/confluence");
            quick(&mut desired);
            let fakes = Fakes::ready(&desired);
            fakes
                .readiness
                .script(ReadinessTarget::Database, &[ReadinessStatus::Ready]);
            fakes
                .readiness
                .script(ReadinessTarget::Application, &[ReadinessStatus::Unhealthy]);

            let report = fakes
                .reconciler()
                .run(&desired, Intent::Start, &CancelFlag::new())
                .await;

            assert_eq!(report.outcome, Outcome::PartialSuccess);
            assert_eq!(report.exit_code(), 2);
        });
    }

    #[test]
    fn test_readiness_can_be_skipped() {
        smol::block_on(async {
            let desired = desired_state("/opt/confluence");
            let fakes = Fakes::ready(&desired);

            let report = fakes
                .reconciler()
                .with_wait_ready(false)
                .run(&desired, Intent::Start, &CancelFlag::new())
                .await;

            assert_eq!(report.outcome, Outcome::Success);
            assert!(report.readiness.is_empty());
            assert_eq!(fakes.readiness.checks(ReadinessTarget::Database), 0);
        });
    }

    #[test]
    fn test_runtime_down_is_failure_without_actions() {
        smol::block_on(async {
            let desired = desired_state("/opt/confluence");
            let fakes = Fakes::ready(&desired);
            fakes.runtime.set_reachable(false);

            let report = fakes
                .reconciler()
                .run(&desired, Intent::Start, &CancelFlag::new())
                .await;

            assert_eq!(report.outcome, Outcome::Failure);
            assert!(report.results.is_empty());
            assert_eq!(
                report.error.unwrap().category,
                "collaborator-unavailable"
            );
        });
    }

    #[test]
    fn test_status_lists_gaps() {
        smol::block_on(async {
            let desired = desired_state("/opt/confluence");
            let fakes = Fakes::new();
            fakes.runtime.add_image("mysql:8.0");
            fakes.runtime.set_running(&["confluence-mysql"]);
            fakes
                .readiness
                .script(ReadinessTarget::Database, &[ReadinessStatus::Ready]);

            let status = fakes.reconciler().status(&desired).await.unwrap();

            assert_eq!(
                status.missing_images,
                vec![ImageRef::new("haxqer/confluence", "9.2.1")]
            );
            assert_eq!(status.stopped_containers, vec!["confluence".to_string()]);
            assert_eq!(
                status.readiness[&ReadinessTarget::Database],
                ReadinessStatus::Ready
            );
            assert!(!status.healthy());
            assert!(fakes.runtime.compose_calls().is_empty());
        });
    }

    #[test]
    fn test_logs_come_from_runtime() {
        smol::block_on(async {
            let fakes = Fakes::new();
            let logs = fakes.reconciler().logs("confluence", 50).await.unwrap();
            assert!(logs.contains("confluence"));
            assert!(fakes.runtime.calls().contains(&"logs confluence 50".to_string()));
        });
    }

    #[test]
    fn test_image_inventory_lists_present_images() {
        smol::block_on(async {
            let fakes = Fakes::new();
            fakes.runtime.add_image("mysql:8.0");
            let inventory = fakes.reconciler().image_inventory().await.unwrap();
            assert_eq!(inventory.len(), 1);
            assert_eq!(inventory[0].image, ImageRef::new("mysql", "8.0"));

            fakes.runtime.set_reachable(false);
            let err = fakes.reconciler().image_inventory().await.unwrap_err();
            assert_eq!(err.category(), "collaborator-unavailable");
        });
    }

    #[test]
    fn test_journal_names_the_unit() {
        smol::block_on(async {
            let desired = desired_state("/opt/confluence");
            let fakes = Fakes::new();
            let journal = fakes.reconciler().journal(&desired, 20).await.unwrap();
            assert_eq!(journal, "-- 20 line(s) of confluence --\n");
        });
    }
}
