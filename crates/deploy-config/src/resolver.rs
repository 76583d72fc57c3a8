//! Resolution of a raw configuration into the desired deployment state

use crate::{ConfigError, RawBackoff, RawConfig, Result};
use deploy_orchestration::images::catalogue;
use deploy_orchestration::{
    ActionTimeouts, BackoffPolicy, ContainerNames, DatabaseBackend, DesiredState, ImageRef,
    ReadinessPolicies, UnitSpec,
};
use std::collections::{BTreeMap, BTreeSet};
use std::path::PathBuf;
use std::time::Duration;

/// Default installation root
pub const DEFAULT_INSTALL_ROOT: &str = "/opt/confluence";
/// Default application version
pub const DEFAULT_APP_VERSION: &str = "9.2.1";
/// Default application port
pub const DEFAULT_SERVICE_PORT: u16 = 8090;

/// Built-in compose file catalogue: variant name to file name
pub fn default_compose_files() -> BTreeMap<String, String> {
    [
        ("default", "docker-compose.yml"),
        ("lts", "docker-compose-lts.yml"),
        ("mysql", "docker-compose-mysql.yml"),
        ("postgresql", "docker-compose-postgresql.yml"),
    ]
    .into_iter()
    .map(|(variant, file)| (variant.to_string(), file.to_string()))
    .collect()
}

/// Restart policies systemd accepts on a `Type=oneshot` unit
pub const ONESHOT_RESTART_POLICIES: [&str; 5] =
    ["no", "on-failure", "on-abnormal", "on-abort", "on-watchdog"];

fn invalid(reason: impl Into<String>) -> ConfigError {
    ConfigError::ValidationError(reason.into())
}

fn absolute(field: &str, value: &str) -> Result<PathBuf> {
    let path = PathBuf::from(value);
    if !path.is_absolute() {
        return Err(invalid(format!(
            "{field} must be an absolute path, got '{value}'"
        )));
    }
    Ok(path)
}

fn backoff(raw: Option<&RawBackoff>, default: BackoffPolicy) -> Result<BackoffPolicy> {
    let Some(raw) = raw else {
        return Ok(default);
    };

    let interval = raw
        .interval_ms
        .map(Duration::from_millis)
        .unwrap_or(default.interval);
    let max_attempts = raw.max_attempts.unwrap_or(default.max_attempts);
    if interval.is_zero() || max_attempts == 0 {
        return Err(invalid(
            "readiness interval and max_attempts must be greater than zero",
        ));
    }
    let factor = raw.backoff_factor.unwrap_or(1.0);
    if !factor.is_finite() || factor < 1.0 {
        return Err(invalid("readiness backoff_factor must be at least 1.0"));
    }

    let mut policy = BackoffPolicy::fixed(interval, max_attempts);
    policy.factor = factor;
    policy.max_interval = raw
        .max_interval_ms
        .map(Duration::from_millis)
        .unwrap_or(interval)
        .max(interval);
    policy.deadline = match raw.deadline_ms {
        Some(ms) => Duration::from_millis(ms),
        None => policy.max_interval.saturating_mul(max_attempts),
    };
    Ok(policy)
}

fn restart_policy(raw: Option<&str>) -> Result<String> {
    let policy = raw.unwrap_or("on-failure").trim();
    if !ONESHOT_RESTART_POLICIES.contains(&policy) {
        return Err(invalid(format!(
            "unit restart policy '{policy}' is not allowed for a oneshot unit (expected one of: {})",
            ONESHOT_RESTART_POLICIES.join(", ")
        )));
    }
    Ok(policy.to_string())
}

fn timeouts(raw: &crate::RawTimeouts) -> ActionTimeouts {
    let defaults = ActionTimeouts::default();
    let secs = |value: Option<u64>, default: Duration| {
        value.map(Duration::from_secs).unwrap_or(default)
    };
    ActionTimeouts {
        filesystem: secs(raw.filesystem_secs, defaults.filesystem),
        compose: secs(raw.compose_secs, defaults.compose),
        image_load: secs(raw.image_load_secs, defaults.image_load),
        service_manager: secs(raw.service_manager_secs, defaults.service_manager),
        prune: secs(raw.prune_secs, defaults.prune),
    }
}

/// Resolve a raw configuration into a desired state
///
/// Pure: the same configuration always yields the same state and nothing on
/// the host is read.
pub fn resolve(raw: &RawConfig) -> Result<DesiredState> {
    let backend: DatabaseBackend = raw
        .database
        .as_deref()
        .unwrap_or("mysql")
        .parse()
        .map_err(invalid)?;

    let install_root = absolute(
        "install_root",
        raw.install_root.as_deref().unwrap_or(DEFAULT_INSTALL_ROOT),
    )?;
    let source_dir = match raw.source_dir.as_deref() {
        Some(dir) => absolute("source_dir", dir)?,
        None => install_root.clone(),
    };

    let compose_files = if raw.compose_files.is_empty() {
        default_compose_files()
    } else {
        raw.compose_files.clone()
    };
    let compose_variant = raw
        .compose_variant
        .clone()
        .unwrap_or_else(|| backend.as_str().to_string());
    let compose_file_name = compose_files.get(&compose_variant).ok_or_else(|| {
        invalid(format!(
            "compose variant '{compose_variant}' has no compose file (known: {})",
            compose_files.keys().cloned().collect::<Vec<_>>().join(", ")
        ))
    })?;
    let compose_file = source_dir.join(compose_file_name);

    let app_version = raw
        .app_version
        .clone()
        .unwrap_or_else(|| DEFAULT_APP_VERSION.to_string());
    let required_images = match &raw.images {
        Some(images) => images
            .iter()
            .map(|image| image.parse::<ImageRef>())
            .collect::<std::result::Result<Vec<_>, _>>()
            .map_err(invalid)?,
        None => catalogue(backend, &app_version).map_err(invalid)?,
    };

    let data_dirs: BTreeSet<PathBuf> = match &raw.data_dirs {
        Some(dirs) => dirs
            .iter()
            .map(|dir| absolute("data_dirs", dir))
            .collect::<Result<_>>()?,
        None => [install_root.join("data"), install_root.join(backend.as_str())]
            .into_iter()
            .collect(),
    };

    let dir_mode = match raw.dir_mode.as_deref() {
        Some(mode) => u32::from_str_radix(mode.trim_start_matches("0o"), 8)
            .ok()
            .filter(|mode| *mode <= 0o7777)
            .ok_or_else(|| invalid(format!("dir_mode '{mode}' is not an octal permission")))?,
        None => 0o755,
    };

    let containers = ContainerNames {
        app: raw
            .containers
            .app
            .clone()
            .unwrap_or_else(|| "confluence".to_string()),
        database: raw
            .containers
            .database
            .clone()
            .unwrap_or_else(|| backend.default_container().to_string()),
    };

    let defaults = ReadinessPolicies::default();
    let readiness = ReadinessPolicies {
        database: backoff(raw.readiness.database.as_ref(), defaults.database)?,
        application: backoff(raw.readiness.application.as_ref(), defaults.application)?,
    };

    let unit_name = raw
        .unit
        .name
        .clone()
        .unwrap_or_else(|| "confluence".to_string());
    let unit_description = raw
        .unit
        .description
        .clone()
        .unwrap_or_else(|| format!("Confluence with {} (docker compose)", backend));

    let mut desired = DesiredState {
        database_backend: backend,
        compose_variant,
        env_file: install_root.join(".env"),
        install_root: install_root.clone(),
        source_dir,
        compose_file,
        data_dirs,
        required_images,
        service_port: raw.service_port.unwrap_or(DEFAULT_SERVICE_PORT),
        database_port: raw.database_port.unwrap_or_else(|| backend.default_port()),
        database_user: raw
            .database_user
            .clone()
            .unwrap_or_else(|| "confluence".to_string()),
        app_version,
        env_overrides: raw.env.clone(),
        containers,
        unit: UnitSpec {
            name: unit_name,
            description: unit_description,
            working_dir: install_root,
            workload: Default::default(),
            restart: restart_policy(raw.unit.restart.as_deref())?,
            timeout_start_secs: raw.unit.timeout_start_secs.unwrap_or(300),
            timeout_stop_secs: raw.unit.timeout_stop_secs.unwrap_or(120),
        },
        dir_mode,
        readiness,
        timeouts: timeouts(&raw.timeouts),
    };
    desired.unit.workload = desired.workload();

    desired.validate().map_err(invalid)?;
    Ok(desired)
}
