use super::{execute, Context};
use anyhow::Result;
use deploy_orchestration::{DesiredState, Intent, StopRequest};
use std::io::{self, BufRead, IsTerminal, Write};

pub struct Args {
    pub backend: Option<String>,
    pub remove: bool,
    pub cleanup: bool,
    pub volumes: bool,
    pub yes: bool,
}

pub async fn run(ctx: &Context, args: Args) -> Result<u8> {
    let desired = match ctx.desired(args.backend.as_deref()) {
        Ok(desired) => desired,
        Err(e) => return ctx.fail("stop", &e),
    };

    let confirmed = args.volumes && (args.yes || confirm_volume_removal(&desired)?);
    let request = StopRequest {
        remove_containers: args.remove,
        remove_volumes: args.volumes,
        confirmed,
        prune_images: args.cleanup,
    };
    execute(ctx, &desired, Intent::Stop(request), false).await
}

/// Ask on the terminal before deleting volumes
///
/// Without a terminal the answer is no and the planner records the skipped removal.
fn confirm_volume_removal(desired: &DesiredState) -> Result<bool> {
    let stdin = io::stdin();
    if !stdin.is_terminal() {
        return Ok(false);
    }

    let mut stderr = io::stderr();
    writeln!(
        stderr,
        "Removing volumes deletes every {} database and application file of this deployment:",
        desired.database_backend
    )?;
    for dir in &desired.data_dirs {
        writeln!(stderr, "  {}", dir.display())?;
    }
    write!(stderr, "Continue? [y/N] ")?;
    stderr.flush()?;

    let mut answer = String::new();
    stdin.lock().read_line(&mut answer)?;
    Ok(is_yes(&answer))
}

fn is_yes(answer: &str) -> bool {
    matches!(answer.trim().to_ascii_lowercase().as_str(), "y" | "yes")
}
