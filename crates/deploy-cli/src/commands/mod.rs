pub mod configure;
pub mod download;
pub mod import;
pub mod install;
pub mod logs;
pub mod start;
pub mod status;
pub mod stop;

use anyhow::Result;
use deploy_orchestration::{reporter, CancelFlag, DeployError, DesiredState, Intent, Reconciler, Report};
use signal_hook::consts::{SIGINT, SIGTERM};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::debug;

/// Exit code of a run interrupted a second time
const FORCED_EXIT: i32 = 130;

/// Options shared by every command
pub struct Context {
    pub config: Option<PathBuf>,
    pub json: bool,
}

impl Context {
    /// Resolve the desired state, applying a backend named on the command line
    pub fn desired(&self, backend: Option<&str>) -> std::result::Result<DesiredState, DeployError> {
        let mut raw = deploy_config::load(self.config.as_deref())?;
        if let Some(backend) = backend {
            raw.override_database(backend);
        }
        Ok(deploy_config::resolve(&raw)?)
    }

    /// Print a report and return its exit code
    pub fn emit(&self, report: &Report) -> Result<u8> {
        if self.json {
            println!("{}", serde_json::to_string_pretty(report)?);
        } else {
            print!("{}", report.summary());
        }
        Ok(report.exit_code())
    }

    /// Print a failure raised before anything ran
    pub fn fail(&self, intent: &str, err: &DeployError) -> Result<u8> {
        self.emit(&reporter::failed(intent, err))
    }
}

/// Cancellation flag raised by SIGINT or SIGTERM
///
/// The first signal lets the current action finish; a second one exits at once.
pub fn interrupt_flag() -> Result<CancelFlag> {
    let cancel = CancelFlag::new();
    let flag = cancel.as_atomic();
    for signal in [SIGINT, SIGTERM] {
        signal_hook::flag::register_conditional_shutdown(signal, FORCED_EXIT, Arc::clone(&flag))?;
        signal_hook::flag::register(signal, Arc::clone(&flag))?;
    }
    Ok(cancel)
}

/// Resolve, reconcile and report one intent
pub async fn reconcile(
    ctx: &Context,
    backend: Option<&str>,
    intent: Intent,
    wait_ready: bool,
) -> Result<u8> {
    let desired = match ctx.desired(backend) {
        Ok(desired) => desired,
        Err(e) => return ctx.fail(intent.name(), &e),
    };
    debug!(
        "Reconciling {} for {} backend at {}",
        intent.name(),
        desired.database_backend,
        desired.install_root.display()
    );

    execute(ctx, &desired, intent, wait_ready).await
}

/// Reconcile one intent against an already resolved state
pub async fn execute(
    ctx: &Context,
    desired: &DesiredState,
    intent: Intent,
    wait_ready: bool,
) -> Result<u8> {
    let cancel = interrupt_flag()?;
    let reconciler = Reconciler::detect().await.with_wait_ready(wait_ready);
    let report = reconciler.run(desired, intent, &cancel).await;
    ctx.emit(&report)
}
