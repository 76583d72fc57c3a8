use super::{reconcile, Context};
use anyhow::Result;
use deploy_orchestration::Intent;

pub async fn run(ctx: &Context, backend: Option<String>, wait_ready: bool) -> Result<u8> {
    if wait_ready && !ctx.json {
        eprintln!("Starting workload; waiting for the database and application to become ready...");
    }
    reconcile(ctx, backend.as_deref(), Intent::Start, wait_ready).await
}
