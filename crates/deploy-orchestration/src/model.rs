//! Desired and observed deployment state.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use crate::plan::ComposeWorkload;

/// Database engine backing the application
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum DatabaseBackend {
    /// MySQL 8
    Mysql,
    /// PostgreSQL 15
    Postgresql,
}

impl DatabaseBackend {
    /// Lowercase name as used in configuration and compose environment
    pub fn as_str(&self) -> &'static str {
        match self {
            DatabaseBackend::Mysql => "mysql",
            DatabaseBackend::Postgresql => "postgresql",
        }
    }

    /// Image the offline bundle ships for this backend
    pub fn default_image(&self) -> ImageRef {
        match self {
            DatabaseBackend::Mysql => ImageRef::new("mysql", "8.0"),
            DatabaseBackend::Postgresql => ImageRef::new("postgres", "15"),
        }
    }

    /// Port the database listens on
    pub fn default_port(&self) -> u16 {
        match self {
            DatabaseBackend::Mysql => 3306,
            DatabaseBackend::Postgresql => 5432,
        }
    }

    /// Container name used by the bundled compose files
    pub fn default_container(&self) -> &'static str {
        match self {
            DatabaseBackend::Mysql => "confluence-mysql",
            DatabaseBackend::Postgresql => "confluence-postgres",
        }
    }
}

impl fmt::Display for DatabaseBackend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DatabaseBackend {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "mysql" => Ok(DatabaseBackend::Mysql),
            "postgresql" => Ok(DatabaseBackend::Postgresql),
            other => Err(format!(
                "unsupported database backend '{other}' (expected 'mysql' or 'postgresql')"
            )),
        }
    }
}

/// Container image reference (`repository:tag`)
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ImageRef {
    /// Repository including any registry host and namespace
    pub repository: String,
    /// Tag, `latest` when the reference carries none
    pub tag: String,
}

impl ImageRef {
    /// Create an image reference from its parts
    pub fn new(repository: impl Into<String>, tag: impl Into<String>) -> Self {
        Self {
            repository: repository.into(),
            tag: tag.into(),
        }
    }

    /// File stem used when the image is saved to an offline archive
    ///
    /// `haxqer/confluence:9.2.1` becomes `haxqer_confluence-9.2.1`.
    pub fn archive_stem(&self) -> String {
        self.to_string().replace(':', "-").replace('/', "_")
    }

    /// Archive file name (`<stem>.tar`)
    pub fn archive_file_name(&self) -> String {
        format!("{}.tar", self.archive_stem())
    }

    /// Best-effort inverse of [`ImageRef::archive_stem`]
    ///
    /// Only namespaced stems can be inverted unambiguously: the first `_`
    /// separates the namespace and the first `-` after it separates the tag.
    pub fn from_archive_stem(stem: &str) -> Option<Self> {
        let (namespace, rest) = stem.split_once('_')?;
        if namespace.is_empty() || rest.is_empty() {
            return None;
        }
        let (name, tag) = match rest.split_once('-') {
            Some((name, tag)) if !name.is_empty() && !tag.is_empty() => (name, tag),
            _ => (rest, "latest"),
        };
        Some(Self::new(format!("{namespace}/{name}"), tag))
    }
}

impl fmt::Display for ImageRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.repository, self.tag)
    }
}

impl FromStr for ImageRef {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if s.is_empty() || s.chars().any(char::is_whitespace) {
            return Err(format!("invalid image reference '{s}'"));
        }

        // A colon before the last slash belongs to a registry host, not a tag
        let name_start = s.rfind('/').map(|i| i + 1).unwrap_or(0);
        match s[name_start..].rfind(':') {
            Some(offset) => {
                let split = name_start + offset;
                let (repository, tag) = (&s[..split], &s[split + 1..]);
                if repository.is_empty() || tag.is_empty() {
                    return Err(format!("invalid image reference '{s}'"));
                }
                Ok(Self::new(repository, tag))
            }
            None => Ok(Self::new(s, "latest")),
        }
    }
}

impl TryFrom<String> for ImageRef {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<ImageRef> for String {
    fn from(value: ImageRef) -> Self {
        value.to_string()
    }
}

/// Names of the containers the compose workload creates
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContainerNames {
    /// Application container
    pub app: String,
    /// Database container
    pub database: String,
}

impl ContainerNames {
    /// Both container names
    pub fn all(&self) -> Vec<String> {
        vec![self.app.clone(), self.database.clone()]
    }
}

/// Service manager unit that runs the compose workload at boot
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct UnitSpec {
    /// Unit name without the `.service` suffix
    pub name: String,
    /// Human readable description
    pub description: String,
    /// Working directory for the compose commands
    pub working_dir: PathBuf,
    /// Workload started and stopped by the unit
    pub workload: ComposeWorkload,
    /// Restart policy (`no`, `on-failure`, `always`)
    pub restart: String,
    /// Start timeout in seconds
    pub timeout_start_secs: u64,
    /// Stop timeout in seconds
    pub timeout_stop_secs: u64,
}

/// Polling policy for a readiness check
#[derive(Debug, Clone, PartialEq)]
pub struct BackoffPolicy {
    /// Delay before the second attempt
    pub interval: Duration,
    /// Upper bound on attempts
    pub max_attempts: u32,
    /// Upper bound on total time spent polling
    pub deadline: Duration,
    /// Multiplier applied to the interval after each attempt (1.0 = fixed)
    pub factor: f64,
    /// Ceiling for the grown interval
    pub max_interval: Duration,
}

impl BackoffPolicy {
    /// Fixed-interval policy whose deadline covers every attempt
    pub fn fixed(interval: Duration, max_attempts: u32) -> Self {
        Self {
            interval,
            max_attempts,
            deadline: interval.saturating_mul(max_attempts),
            factor: 1.0,
            max_interval: interval,
        }
    }

    /// Interval to wait after an attempt that waited `current`
    pub fn next_interval(&self, current: Duration) -> Duration {
        if self.factor <= 1.0 {
            return current;
        }
        current.mul_f64(self.factor).min(self.max_interval.max(self.interval))
    }
}

/// Readiness policies for both targets
#[derive(Debug, Clone, PartialEq)]
pub struct ReadinessPolicies {
    /// Database policy (default every 2s, 30 attempts)
    pub database: BackoffPolicy,
    /// Application policy (default every 5s, 60 attempts)
    pub application: BackoffPolicy,
}

impl Default for ReadinessPolicies {
    fn default() -> Self {
        Self {
            database: BackoffPolicy::fixed(Duration::from_secs(2), 30),
            application: BackoffPolicy::fixed(Duration::from_secs(5), 60),
        }
    }
}

/// Upper bounds for each kind of collaborator call
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActionTimeouts {
    /// Directory and file operations
    pub filesystem: Duration,
    /// Compose up, stop and down
    pub compose: Duration,
    /// Loading one image archive
    pub image_load: Duration,
    /// Service manager registration and enablement
    pub service_manager: Duration,
    /// Dangling image cleanup
    pub prune: Duration,
}

impl Default for ActionTimeouts {
    fn default() -> Self {
        Self {
            filesystem: Duration::from_secs(10),
            compose: Duration::from_secs(600),
            image_load: Duration::from_secs(600),
            service_manager: Duration::from_secs(30),
            prune: Duration::from_secs(120),
        }
    }
}

/// What the operator wants the host to look like
#[derive(Debug, Clone)]
pub struct DesiredState {
    /// Database backend
    pub database_backend: DatabaseBackend,
    /// Compose file variant (`default`, `lts`, `mysql`, `postgresql`, ...)
    pub compose_variant: String,
    /// Installation root; persisted artifacts live below it
    pub install_root: PathBuf,
    /// Directory holding the bundled compose files
    pub source_dir: PathBuf,
    /// Compose file for the selected variant
    pub compose_file: PathBuf,
    /// Persisted environment overrides (`<install_root>/.env`)
    pub env_file: PathBuf,
    /// Data directories that must exist before the workload starts
    pub data_dirs: BTreeSet<PathBuf>,
    /// Images that must be present before the workload starts
    pub required_images: Vec<ImageRef>,
    /// Application HTTP port
    pub service_port: u16,
    /// Database port
    pub database_port: u16,
    /// Database user for readiness checks
    pub database_user: String,
    /// Application version passed to compose
    pub app_version: String,
    /// Operator environment overrides
    pub env_overrides: BTreeMap<String, String>,
    /// Containers the workload creates
    pub containers: ContainerNames,
    /// Service unit definition
    pub unit: UnitSpec,
    /// Mode for directories and files the tool creates
    pub dir_mode: u32,
    /// Readiness polling policies
    pub readiness: ReadinessPolicies,
    /// Collaborator call timeouts
    pub timeouts: ActionTimeouts,
}

impl DesiredState {
    /// Environment passed to compose: derived values overlaid by operator overrides
    pub fn compose_env(&self) -> BTreeMap<String, String> {
        let mut env = BTreeMap::new();
        env.insert(
            "DATABASE_TYPE".to_string(),
            self.database_backend.as_str().to_string(),
        );
        env.insert("APP_PORT".to_string(), self.service_port.to_string());
        env.insert("DATABASE_PORT".to_string(), self.database_port.to_string());
        env.insert("APP_VERSION".to_string(), self.app_version.clone());
        env.extend(
            self.env_overrides
                .iter()
                .map(|(k, v)| (k.clone(), v.clone())),
        );
        env
    }

    /// Compose workload for this state
    pub fn workload(&self) -> ComposeWorkload {
        ComposeWorkload {
            variant: self.compose_variant.clone(),
            compose_file: self.compose_file.clone(),
            project_dir: self.install_root.clone(),
            env: self.compose_env(),
        }
    }

    /// Paths whose existence the probe records
    pub fn tracked_paths(&self) -> Vec<PathBuf> {
        let mut paths = vec![self.install_root.clone()];
        paths.extend(self.data_dirs.iter().cloned());
        paths.push(self.compose_file.clone());
        paths.push(self.env_file.clone());
        paths
    }

    /// Check structural invariants
    pub fn validate(&self) -> Result<(), String> {
        if self.required_images.is_empty() {
            return Err("at least one required image must be configured".to_string());
        }
        for path in self.tracked_paths() {
            if !path.is_absolute() {
                return Err(format!("path '{}' must be absolute", path.display()));
            }
        }
        if !self.env_file.starts_with(&self.install_root) {
            return Err(format!(
                "env file '{}' must live under the install root '{}'",
                self.env_file.display(),
                self.install_root.display()
            ));
        }
        if self.service_port == 0 || self.database_port == 0 {
            return Err("ports must be non-zero".to_string());
        }
        if self.containers.app == self.containers.database {
            return Err("application and database containers need distinct names".to_string());
        }
        for (key, value) in &self.env_overrides {
            crate::env_file::validate_entry(key, value)?;
        }
        Ok(())
    }
}

/// Snapshot of the host as seen by the probe
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ObservedState {
    /// Images known to the container runtime
    pub present_images: BTreeSet<ImageRef>,
    /// Names of running containers
    pub running_containers: BTreeSet<String>,
    /// Ports with a listener on the loopback interface
    pub bound_ports: BTreeSet<u16>,
    /// Whether the service unit file exists
    pub service_unit_registered: bool,
    /// Whether the installed unit matches the desired one
    pub service_unit_current: bool,
    /// Whether the service unit starts at boot
    pub service_unit_enabled: bool,
    /// Tracked paths that exist
    pub existing_paths: BTreeSet<PathBuf>,
    /// Current env file content, if the file exists
    pub env_file_content: Option<String>,
    /// Container runtime server version
    pub runtime_version: Option<String>,
}

impl ObservedState {
    /// Whether a path was seen on the host
    pub fn path_exists(&self, path: &Path) -> bool {
        self.existing_paths.contains(path)
    }
}
