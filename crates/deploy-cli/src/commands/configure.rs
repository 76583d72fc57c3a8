use super::{reconcile, Context};
use anyhow::Result;
use deploy_orchestration::Intent;

pub async fn run(ctx: &Context, backend: Option<String>) -> Result<u8> {
    reconcile(ctx, backend.as_deref(), Intent::Configure, false).await
}
