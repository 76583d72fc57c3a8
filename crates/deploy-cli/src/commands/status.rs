use super::Context;
use anyhow::Result;
use comfy_table::{Cell, Color, Table};
use deploy_orchestration::{DesiredState, ReadinessStatus, Reconciler, StatusReport};

pub async fn run(ctx: &Context) -> Result<u8> {
    let desired = match ctx.desired(None) {
        Ok(desired) => desired,
        Err(e) => return ctx.fail("status", &e),
    };

    let reconciler = Reconciler::detect().await;
    let status = match reconciler.status(&desired).await {
        Ok(status) => status,
        Err(e) => return ctx.fail("status", &e),
    };

    if ctx.json {
        println!("{}", serde_json::to_string_pretty(&status)?);
    } else {
        println!(
            "Confluence {} with {} at {}",
            desired.app_version,
            desired.database_backend,
            desired.install_root.display()
        );
        if let Some(version) = &status.observed.runtime_version {
            println!("Container runtime: {}", version);
        }
        println!("{}", status_table(&desired, &status));
        if status.healthy() {
            println!("All components healthy");
        } else {
            println!("Some components need attention");
        }
    }
    Ok(0)
}

fn flag(ok: bool, yes: &str, no: &str) -> Cell {
    if ok {
        Cell::new(yes).fg(Color::Green)
    } else {
        Cell::new(no).fg(Color::Red)
    }
}

fn status_table(desired: &DesiredState, status: &StatusReport) -> Table {
    let observed = &status.observed;
    let mut table = Table::new();
    table.set_header(vec!["Component", "Name", "Status"]);

    for image in &desired.required_images {
        table.add_row(vec![
            Cell::new("image"),
            Cell::new(image.to_string()),
            flag(!status.missing_images.contains(image), "present", "missing"),
        ]);
    }

    for container in desired.containers.all() {
        let stopped = status.stopped_containers.contains(&container);
        table.add_row(vec![
            Cell::new("container"),
            Cell::new(&container),
            flag(!stopped, "running", "stopped"),
        ]);
    }

    table.add_row(vec![
        Cell::new("port"),
        Cell::new(desired.service_port),
        flag(
            observed.bound_ports.contains(&desired.service_port),
            "listening",
            "closed",
        ),
    ]);

    let unit_state = match (
        observed.service_unit_registered,
        observed.service_unit_current,
        observed.service_unit_enabled,
    ) {
        (false, _, _) => Cell::new("not installed").fg(Color::Yellow),
        (true, false, _) => Cell::new("outdated (re-run install)").fg(Color::Yellow),
        (true, true, true) => Cell::new("enabled").fg(Color::Green),
        (true, true, false) => Cell::new("registered").fg(Color::Yellow),
    };
    table.add_row(vec![
        Cell::new("service"),
        Cell::new(&desired.unit.name),
        unit_state,
    ]);

    for path in desired.tracked_paths() {
        table.add_row(vec![
            Cell::new("path"),
            Cell::new(path.display()),
            flag(observed.path_exists(&path), "exists", "missing"),
        ]);
    }

    for (target, readiness) in &status.readiness {
        let color = match readiness {
            ReadinessStatus::Ready => Color::Green,
            ReadinessStatus::Unhealthy => Color::Yellow,
            ReadinessStatus::Unreachable | ReadinessStatus::Unknown => Color::Red,
        };
        table.add_row(vec![
            Cell::new("readiness"),
            Cell::new(target),
            Cell::new(readiness).fg(color),
        ]);
    }

    table
}
