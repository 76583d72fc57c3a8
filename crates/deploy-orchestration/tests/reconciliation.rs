//! End-to-end reconciliation runs against in-memory collaborators

use deploy_orchestration::images::{discover_archives, inspect_archives};
use deploy_orchestration::testing::{desired_state, Fakes};
use deploy_orchestration::{
    ActionOutcome, BackoffPolicy, CancelFlag, DatabaseBackend, DesiredState, ImportRequest,
    Intent, NoteSeverity, Outcome, ReadinessPolicies, ReadinessStatus, ReadinessTarget,
    StopRequest,
};
use std::time::Duration;

fn fast_readiness(desired: &mut DesiredState) {
    desired.readiness = ReadinessPolicies {
        database: BackoffPolicy::fixed(Duration::from_millis(10), 5),
        application: BackoffPolicy::fixed(Duration::from_millis(10), 5),
    };
}

/// Images loaded and compose file shipped, but no directories and nothing running
fn fresh_host(desired: &DesiredState) -> Fakes {
    let fakes = Fakes::ready(desired);
    fakes.fs.remove(&desired.install_root);
    for dir in &desired.data_dirs {
        fakes.fs.remove(dir);
    }
    fakes
        .readiness
        .script(ReadinessTarget::Database, &[ReadinessStatus::Ready]);
    fakes.readiness.script(
        ReadinessTarget::Application,
        &[ReadinessStatus::Unreachable, ReadinessStatus::Ready],
    );
    fakes
}

#[smol_potat::test]
async fn test_start_on_fresh_host_succeeds() {
    let mut desired = desired_state("/opt/confluence");
    fast_readiness(&mut desired);
    let fakes = fresh_host(&desired);

    let report = fakes
        .reconciler()
        .run(&desired, Intent::Start, &CancelFlag::new())
        .await;

    let actions: Vec<String> = report.results.iter().map(|r| r.action.describe()).collect();
    assert_eq!(
        actions,
        vec![
            "ensure directory /opt/confluence (755)",
            "ensure directory /opt/confluence/data (755)",
            "ensure directory /opt/confluence/mysql (755)",
            "compose up (mysql)",
        ]
    );
    assert!(report
        .results
        .iter()
        .all(|r| r.outcome == ActionOutcome::Succeeded));
    assert_eq!(report.readiness[&ReadinessTarget::Database], ReadinessStatus::Ready);
    assert_eq!(report.readiness[&ReadinessTarget::Application], ReadinessStatus::Ready);
    assert_eq!(report.outcome, Outcome::Success);
    assert_eq!(report.exit_code(), 0);
    assert!(fakes.runtime.running().contains("confluence"));
}

#[smol_potat::test]
async fn test_start_without_database_image_fails_before_acting() {
    let desired = desired_state("/opt/confluence");
    let fakes = Fakes::new();
    fakes.runtime.add_image("haxqer/confluence:9.2.1");
    fakes.fs.add_file(&desired.compose_file, "services: {}\n");

    let report = fakes
        .reconciler()
        .run(&desired, Intent::Start, &CancelFlag::new())
        .await;

    assert_eq!(report.outcome, Outcome::Failure);
    assert_ne!(report.exit_code(), 0);
    assert!(report.results.is_empty());
    let error = report.error.expect("error summary");
    assert_eq!(error.category, "missing-prerequisite");
    assert!(error.message.contains("mysql:8.0"));
    assert!(!error.message.contains("haxqer/confluence"));
    assert!(error.remedy.contains("import"));
    assert!(fakes.fs.writes().is_empty());
    assert!(fakes.runtime.compose_calls().is_empty());
}

#[smol_potat::test]
async fn test_unconfirmed_volume_removal_keeps_volumes() {
    let desired = desired_state("/opt/confluence");
    let fakes = Fakes::ready(&desired);
    fakes.runtime.set_running(&["confluence", "confluence-mysql"]);

    let request = StopRequest {
        remove_volumes: true,
        confirmed: false,
        ..Default::default()
    };
    let report = fakes
        .reconciler()
        .run(&desired, Intent::Stop(request), &CancelFlag::new())
        .await;

    assert_eq!(fakes.runtime.compose_calls(), vec!["down mysql".to_string()]);
    assert_eq!(report.outcome, Outcome::PartialSuccess);
    assert_eq!(report.exit_code(), 2);
    assert!(report
        .notes
        .iter()
        .any(|n| n.severity == NoteSeverity::Degraded && n.message.contains("volume")));
    assert!(fakes.runtime.running().is_empty());
}

#[smol_potat::test]
async fn test_confirmed_volume_removal() {
    let desired = desired_state("/opt/confluence");
    let fakes = Fakes::ready(&desired);
    fakes.runtime.set_running(&["confluence", "confluence-mysql"]);

    let request = StopRequest {
        remove_volumes: true,
        confirmed: true,
        ..Default::default()
    };
    let report = fakes
        .reconciler()
        .run(&desired, Intent::Stop(request), &CancelFlag::new())
        .await;

    assert_eq!(
        fakes.runtime.compose_calls(),
        vec!["down-volumes mysql".to_string()]
    );
    assert_eq!(report.outcome, Outcome::Success);
}

#[smol_potat::test]
async fn test_second_start_is_a_no_op() {
    let mut desired = desired_state("/opt/confluence");
    desired
        .env_overrides
        .insert("JVM_MAXIMUM_MEMORY".to_string(), "4g".to_string());
    fast_readiness(&mut desired);
    let fakes = fresh_host(&desired);
    let reconciler = fakes.reconciler();

    let first = reconciler
        .run(&desired, Intent::Start, &CancelFlag::new())
        .await;
    assert_eq!(first.outcome, Outcome::Success, "{}", first.summary());
    assert_eq!(fakes.fs.writes().len(), 1);

    let second = reconciler
        .run(&desired, Intent::Start, &CancelFlag::new())
        .await;
    assert_eq!(second.outcome, Outcome::Success, "{}", second.summary());
    assert!(second.results.is_empty());
    assert_eq!(fakes.runtime.compose_calls().len(), 1);
    assert_eq!(fakes.fs.writes().len(), 1);
}

#[smol_potat::test]
async fn test_failure_stops_the_run() {
    let mut desired = desired_state("/opt/confluence");
    fast_readiness(&mut desired);
    let fakes = fresh_host(&desired);
    fakes.fs.fail_on("/opt/confluence/data");

    let report = fakes
        .reconciler()
        .run(&desired, Intent::Start, &CancelFlag::new())
        .await;

    assert_eq!(report.results.len(), 2);
    assert_eq!(report.results[1].outcome, ActionOutcome::Failed);
    assert_eq!(report.outcome, Outcome::Failure);
    let error = report.error.expect("error summary");
    assert_eq!(
        error.completed,
        vec!["ensure directory /opt/confluence (755)".to_string()]
    );
    assert!(fakes.runtime.compose_calls().is_empty());
    assert!(report.readiness.is_empty());

    // After the operator fixes the problem the rerun skips what is done
    let fixed = Fakes::ready(&desired);
    fixed.fs.remove("/opt/confluence/mysql");
    let rerun = fixed
        .reconciler()
        .with_wait_ready(false)
        .run(&desired, Intent::Start, &CancelFlag::new())
        .await;
    assert_eq!(rerun.outcome, Outcome::Success);
    assert_eq!(rerun.results.len(), 2);
}

#[smol_potat::test]
async fn test_cancelled_run_reports_progress() {
    let desired = desired_state("/opt/confluence");
    let fakes = fresh_host(&desired);
    let cancel = CancelFlag::new();
    cancel.cancel();

    let report = fakes.reconciler().run(&desired, Intent::Start, &cancel).await;

    assert_eq!(report.outcome, Outcome::Failure);
    assert_eq!(report.error.expect("error summary").category, "cancelled");
    assert!(fakes.runtime.compose_calls().is_empty());
}

#[smol_potat::test]
async fn test_install_registers_and_enables() {
    let desired = desired_state("/opt/confluence");
    let fakes = Fakes::ready(&desired);

    let report = fakes
        .reconciler()
        .run(&desired, Intent::Install, &CancelFlag::new())
        .await;

    assert_eq!(report.outcome, Outcome::Success);
    assert_eq!(
        fakes.services.calls(),
        vec!["register confluence".to_string(), "enable confluence".to_string()]
    );
    // The workload itself is not started
    assert!(fakes.runtime.compose_calls().is_empty());

    let again = fakes
        .reconciler()
        .run(&desired, Intent::Install, &CancelFlag::new())
        .await;
    assert!(again.results.is_empty());
}

#[smol_potat::test]
async fn test_install_replaces_unit_after_backend_change() {
    let desired = desired_state("/opt/confluence");
    let fakes = Fakes::ready(&desired);
    let reconciler = fakes.reconciler();
    reconciler
        .run(&desired, Intent::Install, &CancelFlag::new())
        .await;

    let mut postgres = desired.clone();
    postgres.database_backend = DatabaseBackend::Postgresql;
    postgres.compose_variant = "postgresql".to_string();
    postgres.compose_file = postgres.source_dir.join("docker-compose-postgresql.yml");
    postgres.unit.workload = postgres.workload();
    fakes.fs.add_file(&postgres.compose_file, "services: {}\n");

    let report = reconciler
        .run(&postgres, Intent::Install, &CancelFlag::new())
        .await;

    assert_eq!(report.outcome, Outcome::Success, "{}", report.summary());
    let actions: Vec<String> = report.results.iter().map(|r| r.action.describe()).collect();
    assert_eq!(actions, vec!["register service confluence"]);
    let installed = fakes.services.installed().expect("installed unit");
    assert_eq!(installed.workload.compose_file, postgres.compose_file);
}

#[smol_potat::test]
async fn test_start_applies_changed_overrides_to_running_workload() {
    let mut desired = desired_state("/opt/confluence");
    desired
        .env_overrides
        .insert("JVM_MAXIMUM_MEMORY".to_string(), "4g".to_string());
    fast_readiness(&mut desired);
    let fakes = Fakes::ready(&desired);
    let running = desired.containers.all();
    fakes
        .runtime
        .set_running(&running.iter().map(String::as_str).collect::<Vec<_>>());
    fakes
        .fs
        .add_file(&desired.env_file, "JVM_MAXIMUM_MEMORY=2g\n");
    fakes
        .readiness
        .script(ReadinessTarget::Database, &[ReadinessStatus::Ready]);
    fakes
        .readiness
        .script(ReadinessTarget::Application, &[ReadinessStatus::Ready]);

    let report = fakes
        .reconciler()
        .run(&desired, Intent::Start, &CancelFlag::new())
        .await;

    assert_eq!(report.outcome, Outcome::Success, "{}", report.summary());
    let actions: Vec<String> = report.results.iter().map(|r| r.action.describe()).collect();
    assert_eq!(actions, vec!["write /opt/confluence/.env", "compose up (mysql)"]);
    assert_eq!(fakes.runtime.compose_calls(), vec!["up mysql".to_string()]);
    assert!(fakes
        .fs
        .content(&desired.env_file)
        .unwrap()
        .contains("JVM_MAXIMUM_MEMORY=4g"));
}

#[smol_potat::test]
async fn test_install_before_configure_is_rejected() {
    let desired = desired_state("/opt/confluence");
    let fakes = Fakes::ready(&desired);
    fakes.fs.remove(&desired.install_root);

    let report = fakes
        .reconciler()
        .run(&desired, Intent::Install, &CancelFlag::new())
        .await;

    assert_eq!(report.outcome, Outcome::Failure);
    assert_eq!(
        report.error.expect("error summary").category,
        "missing-prerequisite"
    );
    assert!(fakes.services.calls().is_empty());
}

#[smol_potat::test]
async fn test_import_loads_archives_and_rejects_empty_ones() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(dir.path().join("haxqer_confluence-9.2.1.tar"), b"layers").unwrap();
    std::fs::write(dir.path().join("broken.tar"), b"").unwrap();
    std::fs::write(dir.path().join("README.txt"), b"not an archive").unwrap();

    let desired = desired_state("/opt/confluence");
    let fakes = Fakes::new();

    let paths = discover_archives(dir.path()).await.unwrap();
    assert_eq!(paths.len(), 2);
    let (archives, rejected) = inspect_archives(&paths, None).await;
    let request = ImportRequest {
        archives,
        rejected,
        force: false,
        prune: false,
    };

    let report = fakes
        .reconciler()
        .run(&desired, Intent::Import(request), &CancelFlag::new())
        .await;

    assert_eq!(report.results.len(), 1);
    assert_eq!(report.results[0].outcome, ActionOutcome::Succeeded);
    assert_eq!(report.outcome, Outcome::PartialSuccess);
    assert!(report.notes[0].message.contains("broken.tar"));
    assert!(fakes
        .runtime
        .images()
        .iter()
        .any(|image| image.to_string() == "haxqer/confluence:9.2.1"));
}
