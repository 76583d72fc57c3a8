use super::Context;
use crate::LogTarget;
use anyhow::Result;
use deploy_orchestration::Reconciler;

pub async fn run(ctx: &Context, target: LogTarget, tail: usize) -> Result<u8> {
    let desired = match ctx.desired(None) {
        Ok(desired) => desired,
        Err(e) => return ctx.fail("logs", &e),
    };

    let reconciler = Reconciler::detect().await;
    let (source, output) = match target {
        LogTarget::App => {
            let container = &desired.containers.app;
            (container.clone(), reconciler.logs(container, tail).await)
        }
        LogTarget::Database => {
            let container = &desired.containers.database;
            (container.clone(), reconciler.logs(container, tail).await)
        }
        LogTarget::Service => (
            format!("{}.service", desired.unit.name),
            reconciler.journal(&desired, tail).await,
        ),
    };
    let output = match output {
        Ok(output) => output,
        Err(e) => return ctx.fail("logs", &e),
    };

    if ctx.json {
        let value = serde_json::json!({ "source": source, "tail": tail, "log": output });
        println!("{}", serde_json::to_string_pretty(&value)?);
    } else {
        print!("{}", output);
    }
    Ok(0)
}
