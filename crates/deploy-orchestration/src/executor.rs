//! Fail-fast plan execution.

use std::collections::BTreeSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{error, info, warn};

use crate::collaborators::{
    with_timeout, CollabResult, ContainerRuntime, Filesystem, ServiceManager,
};
use crate::model::{ActionTimeouts, ObservedState};
use crate::plan::{
    Action, ActionKind, ActionOutcome, ExecutionLog, ExecutionResult, Halt, Plan,
};

/// Cooperative cancellation, checked between actions
///
/// An action that has started always runs to completion.
#[derive(Debug, Clone, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    /// A flag that is not set
    pub fn new() -> Self {
        Self::default()
    }

    /// Request cancellation
    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    /// Whether cancellation was requested
    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    /// The shared flag, for registering with a signal handler
    pub fn as_atomic(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.0)
    }
}

enum Applied {
    Done,
    AlreadySatisfied,
}

/// Applies plans through the collaborators
#[derive(Clone)]
pub struct ActionExecutor {
    runtime: Arc<dyn ContainerRuntime>,
    service_manager: Arc<dyn ServiceManager>,
    fs: Arc<dyn Filesystem>,
    timeouts: ActionTimeouts,
}

impl ActionExecutor {
    /// Create an executor
    pub fn new(
        runtime: Arc<dyn ContainerRuntime>,
        service_manager: Arc<dyn ServiceManager>,
        fs: Arc<dyn Filesystem>,
        timeouts: ActionTimeouts,
    ) -> Self {
        Self {
            runtime,
            service_manager,
            fs,
            timeouts,
        }
    }

    fn timeout_for(&self, kind: ActionKind) -> Duration {
        match kind {
            ActionKind::Filesystem => self.timeouts.filesystem,
            ActionKind::ImageLoad => self.timeouts.image_load,
            ActionKind::Compose => self.timeouts.compose,
            ActionKind::ServiceManager => self.timeouts.service_manager,
            ActionKind::Prune => self.timeouts.prune,
        }
    }

    /// Running containers of the plan's workload
    async fn live_workload(&self, plan: &Plan) -> CollabResult<BTreeSet<String>> {
        let running = with_timeout(
            self.timeouts.service_manager,
            self.runtime.list_running_containers(),
        )
        .await?;
        Ok(workload_subset(&running, plan))
    }

    /// Execute `plan` in order, stopping at the first failure
    ///
    /// `snapshot` is the observation the plan was built from; compose actions
    /// only run while the live workload still matches it.
    pub async fn execute(
        &self,
        plan: &Plan,
        snapshot: &ObservedState,
        cancel: &CancelFlag,
    ) -> ExecutionLog {
        let mut log = ExecutionLog::default();
        let mut expected = workload_subset(&snapshot.running_containers, plan);

        for (index, action) in plan.actions.iter().enumerate() {
            if cancel.is_cancelled() {
                warn!(
                    "Cancelled before {} ({} action(s) left)",
                    action,
                    plan.actions.len() - index
                );
                log.halt = Some(Halt::Cancelled { index });
                break;
            }

            let start = Instant::now();

            if action.touches_workload() {
                let drift = match self.live_workload(plan).await {
                    Ok(live) if live == expected => None,
                    Ok(live) => Some(format!(
                        "running workload containers changed from [{}] to [{}]",
                        join(&expected),
                        join(&live)
                    )),
                    Err(e) => Some(format!("could not list running containers: {e}")),
                };
                if let Some(detail) = drift {
                    error!("Not running {}: {}", action, detail);
                    log.results.push(ExecutionResult {
                        action: action.clone(),
                        outcome: ActionOutcome::Failed,
                        error_detail: Some(detail.clone()),
                        duration_ms: start.elapsed().as_millis() as u64,
                    });
                    log.halt = Some(Halt::StateDrift { index, detail });
                    break;
                }
            }

            info!("Running {}", action);
            let outcome = self.apply_with_retry(action).await;
            let duration_ms = start.elapsed().as_millis() as u64;

            match outcome {
                Ok(applied) => {
                    let outcome = match applied {
                        Applied::Done => ActionOutcome::Succeeded,
                        Applied::AlreadySatisfied => ActionOutcome::Skipped,
                    };
                    info!("{} {:?} in {}ms", action, outcome, duration_ms);
                    log.results.push(ExecutionResult {
                        action: action.clone(),
                        outcome,
                        error_detail: None,
                        duration_ms,
                    });

                    if action.touches_workload() {
                        match self.live_workload(plan).await {
                            Ok(live) => expected = live,
                            Err(e) => warn!("Could not refresh running containers: {}", e),
                        }
                    }
                }
                Err(detail) => {
                    error!("{} failed after {}ms: {}", action, duration_ms, detail);
                    log.results.push(ExecutionResult {
                        action: action.clone(),
                        outcome: ActionOutcome::Failed,
                        error_detail: Some(detail),
                        duration_ms,
                    });
                    log.halt = Some(Halt::ActionFailed { index });
                    break;
                }
            }
        }

        log
    }

    /// Apply an action; compose actions get one retry on a transient error
    async fn apply_with_retry(&self, action: &Action) -> Result<Applied, String> {
        let limit = self.timeout_for(action.kind());
        match with_timeout(limit, self.apply(action)).await {
            Ok(applied) => Ok(applied),
            Err(e) if e.is_transient() && action.kind() == ActionKind::Compose => {
                warn!("{} hit a transient error, retrying once: {}", action, e);
                with_timeout(limit, self.apply(action))
                    .await
                    .map_err(|e| e.to_string())
            }
            Err(e) => Err(e.to_string()),
        }
    }

    async fn apply(&self, action: &Action) -> CollabResult<Applied> {
        match action {
            Action::EnsureDirectory { path, mode } => {
                if self.fs.exists(path).await {
                    return Ok(Applied::AlreadySatisfied);
                }
                self.fs.ensure_dir(path, *mode).await?;
            }
            Action::WriteFile {
                path,
                content,
                mode,
            } => {
                if self.fs.read_to_string(path).await?.as_deref() == Some(content.as_str()) {
                    return Ok(Applied::AlreadySatisfied);
                }
                self.fs.write_file(path, content, *mode).await?;
            }
            Action::LoadImage { archive, image } => {
                let loaded = self.runtime.load_image(archive).await?;
                if let Some(expected) = image {
                    if !loaded.is_empty() && !loaded.contains(expected) {
                        warn!(
                            "{} contained [{}], not {}",
                            archive.display(),
                            join(loaded.iter().map(ToString::to_string)),
                            expected
                        );
                    }
                }
            }
            Action::ComposeUp { workload } => self.runtime.compose_up(workload).await?,
            Action::ComposeStop { workload } => self.runtime.compose_stop(workload).await?,
            Action::ComposeDown {
                workload,
                remove_volumes,
            } => self.runtime.compose_down(workload, *remove_volumes).await?,
            Action::RegisterService { unit } => self.service_manager.register(unit).await?,
            Action::SetServiceEnabled { unit_name, enabled } => {
                self.service_manager.set_enabled(unit_name, *enabled).await?
            }
            Action::PruneDanglingImages => {
                let removed = self.runtime.prune_dangling_images().await?;
                if removed == 0 {
                    return Ok(Applied::AlreadySatisfied);
                }
            }
        }
        Ok(Applied::Done)
    }
}

fn workload_subset(running: &BTreeSet<String>, plan: &Plan) -> BTreeSet<String> {
    plan.watched_containers
        .iter()
        .filter(|name| running.contains(*name))
        .cloned()
        .collect()
}

fn join<I, S>(items: I) -> String
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    items
        .into_iter()
        .map(|s| s.as_ref().to_string())
        .collect::<Vec<_>>()
        .join(", ")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::planner;
    use crate::plan::{Intent, StopRequest};
    use crate::testing::{desired_state, observed_ready, Fakes};
    use std::path::PathBuf;

    fn fresh_start() -> (Fakes, Plan, ObservedState) {
        let desired = desired_state("/opt/confluence");
        let fakes = Fakes::ready(&desired);
        fakes.fs.remove("/opt/confluence");
        let mut observed = observed_ready(&desired);
        observed.existing_paths.remove(&desired.install_root);
        for dir in &desired.data_dirs {
            observed.existing_paths.remove(dir);
        }
        let plan = planner::plan(&desired, &observed, &Intent::Start).unwrap();
        (fakes, plan, observed)
    }

    #[test]
    fn test_executes_in_order() {
        smol::block_on(async {
            let (fakes, plan, observed) = fresh_start();

            let log = fakes
                .executor()
                .execute(&plan, &observed, &CancelFlag::new())
                .await;

            assert!(log.completed());
            assert_eq!(log.results.len(), plan.actions.len());
            assert_eq!(log.results[0].outcome, ActionOutcome::Succeeded);
            // Data directories already existed on the fake host
            assert_eq!(log.results[1].outcome, ActionOutcome::Skipped);
            assert!(fakes.fs.exists_sync("/opt/confluence"));
            assert_eq!(fakes.runtime.compose_calls(), vec!["up mysql".to_string()]);
        });
    }

    #[test]
    fn test_halts_on_first_failure() {
        smol::block_on(async {
            let (fakes, plan, observed) = fresh_start();
            fakes.fs.fail_on("/opt/confluence");

            let log = fakes
                .executor()
                .execute(&plan, &observed, &CancelFlag::new())
                .await;

            assert_eq!(log.results.len(), 1);
            assert_eq!(log.results[0].outcome, ActionOutcome::Failed);
            assert_eq!(log.halt, Some(Halt::ActionFailed { index: 0 }));
            assert!(fakes.runtime.compose_calls().is_empty());
        });
    }

    #[test]
    fn test_cancel_before_first_action() {
        smol::block_on(async {
            let (fakes, plan, observed) = fresh_start();
            let cancel = CancelFlag::new();
            cancel.cancel();

            let log = fakes.executor().execute(&plan, &observed, &cancel).await;

            assert!(log.results.is_empty());
            assert_eq!(log.halt, Some(Halt::Cancelled { index: 0 }));
        });
    }

    #[test]
    fn test_drift_blocks_compose_action() {
        smol::block_on(async {
            let (fakes, plan, observed) = fresh_start();
            // Someone else started the database after the probe ran
            fakes.runtime.set_running(&["confluence-mysql"]);

            let log = fakes
                .executor()
                .execute(&plan, &observed, &CancelFlag::new())
                .await;

            let last = log.results.last().unwrap();
            assert!(matches!(last.action, Action::ComposeUp { .. }));
            assert_eq!(last.outcome, ActionOutcome::Failed);
            assert!(matches!(log.halt, Some(Halt::StateDrift { .. })));
            assert!(fakes.runtime.compose_calls().is_empty());
        });
    }

    #[test]
    fn test_transient_compose_error_is_retried_once() {
        smol::block_on(async {
            let (fakes, plan, observed) = fresh_start();
            fakes.runtime.fail_compose_transiently(1);

            let log = fakes
                .executor()
                .execute(&plan, &observed, &CancelFlag::new())
                .await;
            assert!(log.completed());
            assert_eq!(fakes.runtime.compose_calls().len(), 1);
        });
    }

    #[test]
    fn test_persistent_transient_error_fails() {
        smol::block_on(async {
            let (fakes, plan, observed) = fresh_start();
            fakes.runtime.fail_compose_transiently(2);

            let log = fakes
                .executor()
                .execute(&plan, &observed, &CancelFlag::new())
                .await;
            assert!(matches!(log.halt, Some(Halt::ActionFailed { .. })));
            assert!(log.results.last().unwrap().error_detail.is_some());
        });
    }

    #[test]
    fn test_timeout_fails_action() {
        smol::block_on(async {
            let desired = desired_state("/opt/confluence");
            let fakes = Fakes::ready(&desired);
            fakes.services.hang();
            let observed = observed_ready(&desired);
            let plan = planner::plan(&desired, &observed, &Intent::Install).unwrap();

            let timeouts = ActionTimeouts {
                service_manager: Duration::from_millis(50),
                ..Default::default()
            };
            let log = fakes
                .executor_with(timeouts)
                .execute(&plan, &observed, &CancelFlag::new())
                .await;

            assert_eq!(log.halt, Some(Halt::ActionFailed { index: 0 }));
            assert!(log.results[0]
                .error_detail
                .as_deref()
                .unwrap()
                .contains("timed out"));
        });
    }

    #[test]
    fn test_failed_prune_is_recorded() {
        smol::block_on(async {
            let desired = desired_state("/opt/confluence");
            let fakes = Fakes::ready(&desired);
            fakes.runtime.fail_prune();
            let observed = observed_ready(&desired);
            let request = StopRequest {
                prune_images: true,
                ..Default::default()
            };
            let plan = planner::plan(&desired, &observed, &Intent::Stop(request)).unwrap();

            let log = fakes
                .executor()
                .execute(&plan, &observed, &CancelFlag::new())
                .await;
            assert_eq!(log.results.len(), 1);
            assert_eq!(log.results[0].outcome, ActionOutcome::Failed);
        });
    }

    #[test]
    fn test_write_file_with_same_content_is_skipped() {
        smol::block_on(async {
            let desired = desired_state("/opt/confluence");
            let fakes = Fakes::ready(&desired);
            fakes.fs.add_file("/opt/confluence/.env", "A=1\n");
            let mut plan = Plan::new(&Intent::Configure);
            plan.actions.push(Action::WriteFile {
                path: PathBuf::from("/opt/confluence/.env"),
                content: "A=1\n".to_string(),
                mode: 0o644,
            });

            let log = fakes
                .executor()
                .execute(&plan, &ObservedState::default(), &CancelFlag::new())
                .await;
            assert_eq!(log.results[0].outcome, ActionOutcome::Skipped);
            assert!(fakes.fs.writes().is_empty());
        });
    }
}
