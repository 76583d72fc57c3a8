use super::{reconcile, Context};
use anyhow::Result;
use deploy_orchestration::Intent;

pub async fn run(ctx: &Context) -> Result<u8> {
    reconcile(ctx, None, Intent::Install, false).await
}
