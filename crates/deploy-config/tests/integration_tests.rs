use deploy_config::{ConfigError, load, parse_file, parse_str, resolve};
use deploy_orchestration::{DatabaseBackend, DeployError};
use std::io::Write;
use std::path::Path;
use tempfile::NamedTempFile;

#[test]
fn test_full_config_file() {
    let yaml = r#"
install_root: /data/wiki
source_dir: /data/bundle
database: postgresql
app_version: 8.5.23
service_port: 8091
env:
  JVM_MAXIMUM_MEMORY: 4g
  TZ: Europe/Berlin
containers:
  app: wiki
  database: wiki-db
database_user: wiki
unit:
  name: wiki
  restart: on-abnormal
dir_mode: "750"
readiness:
  application:
    interval_ms: 1000
    max_attempts: 10
timeouts:
  compose_secs: 900
"#;
    let mut file = NamedTempFile::new().unwrap();
    file.write_all(yaml.as_bytes()).unwrap();

    let raw = parse_file(file.path()).unwrap();
    let desired = resolve(&raw).unwrap();

    assert_eq!(desired.database_backend, DatabaseBackend::Postgresql);
    assert_eq!(
        desired.compose_file,
        Path::new("/data/bundle/docker-compose-postgresql.yml")
    );
    assert_eq!(desired.env_file, Path::new("/data/wiki/.env"));
    assert_eq!(
        desired
            .required_images
            .iter()
            .map(ToString::to_string)
            .collect::<Vec<_>>(),
        vec!["haxqer/confluence:8.5.23", "postgres:15"]
    );
    assert_eq!(desired.containers.all(), vec!["wiki", "wiki-db"]);
    assert_eq!(desired.unit.name, "wiki");
    assert_eq!(desired.unit.restart, "on-abnormal");
    assert_eq!(desired.unit.working_dir, Path::new("/data/wiki"));
    assert_eq!(desired.dir_mode, 0o750);
    assert_eq!(desired.readiness.application.max_attempts, 10);
    assert_eq!(desired.timeouts.compose.as_secs(), 900);

    let env = desired.compose_env();
    assert_eq!(env["DATABASE_TYPE"], "postgresql");
    assert_eq!(env["APP_PORT"], "8091");
    assert_eq!(env["DATABASE_PORT"], "5432");
    assert_eq!(env["TZ"], "Europe/Berlin");
}

#[test]
fn test_explicit_image_list() {
    let raw = parse_str(
        "images:\n  - registry.local:5000/confluence:9.2.1\n  - registry.local:5000/mysql:8.0\n",
    )
    .unwrap();
    let desired = resolve(&raw).unwrap();
    assert_eq!(desired.required_images[0].repository, "registry.local:5000/confluence");
    assert_eq!(desired.required_images[1].tag, "8.0");
}

#[test]
fn test_unsupported_app_version_without_image_list() {
    let raw = parse_str("app_version: 6.0.0\n").unwrap();
    assert!(resolve(&raw).unwrap_err().to_string().contains("6.0.0"));
}

#[test]
fn test_explicit_missing_file_is_an_error() {
    let dir = tempfile::tempdir().unwrap();
    let missing = dir.path().join("nope.yaml");
    assert!(matches!(
        load(Some(missing.as_path())),
        Err(ConfigError::ReadError(_))
    ));
}

#[test]
fn test_config_errors_become_invalid_configuration() {
    let raw = parse_str("database: sqlite\n").unwrap();
    let err: DeployError = resolve(&raw).unwrap_err().into();
    assert_eq!(err.category(), "invalid-configuration");
    assert!(err.to_string().contains("sqlite"));
}
