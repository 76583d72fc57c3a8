//! # Deploy Configuration
//!
//! YAML configuration for airgap-deploy.
//!
//! A `deploy.yaml` file is parsed into a [`RawConfig`], with `${VAR}` and
//! `${VAR:-default}` references substituted from the environment, and then
//! resolved into the [`DesiredState`](deploy_orchestration::DesiredState) the
//! reconciler works from. Every field is optional:
//!
//! ```yaml
//! install_root: /opt/confluence
//! source_dir: /srv/confluence-bundle
//! database: postgresql
//! app_version: 9.2.1
//! service_port: ${APP_PORT:-8090}
//! env:
//!   JVM_MAXIMUM_MEMORY: 4g
//! readiness:
//!   application:
//!     interval_ms: 5000
//!     max_attempts: 60
//! ```

#![warn(missing_docs)]

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use thiserror::Error;

pub mod parser;
pub mod resolver;
mod scalar;

pub use parser::{load, parse_file, parse_str, substitute_env_vars, DEFAULT_CONFIG_FILE};
pub use resolver::resolve;

/// Configuration error types
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Failed to read configuration file
    #[error("Failed to read config file: {0}")]
    ReadError(#[from] std::io::Error),

    /// Failed to parse YAML
    #[error("Failed to parse YAML: {0}")]
    YamlError(#[from] serde_yaml::Error),

    /// The configuration parses but cannot be used
    #[error("Invalid configuration: {0}")]
    ValidationError(String),

    /// Environment variable referenced without a default is not set
    #[error("Environment variable not found: {0}")]
    EnvVarNotFound(String),
}

/// Result type for configuration operations
pub type Result<T> = std::result::Result<T, ConfigError>;

impl From<ConfigError> for deploy_orchestration::DeployError {
    fn from(err: ConfigError) -> Self {
        let reason = match err {
            ConfigError::ValidationError(reason) => reason,
            other => other.to_string(),
        };
        deploy_orchestration::DeployError::InvalidConfiguration { reason }
    }
}

/// Root configuration structure, as written by the operator
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RawConfig {
    /// Installation root (default `/opt/confluence`)
    pub install_root: Option<String>,

    /// Directory holding the bundled compose files (default: the install root)
    pub source_dir: Option<String>,

    /// `mysql` or `postgresql` (default `mysql`)
    pub database: Option<String>,

    /// Application version (default `9.2.1`)
    #[serde(deserialize_with = "scalar::option_text")]
    pub app_version: Option<String>,

    /// Compose file variant (default: the database name)
    pub compose_variant: Option<String>,

    /// Variant name to compose file name; replaces the built-in catalogue
    pub compose_files: BTreeMap<String, String>,

    /// Explicit image list; replaces the catalogue images
    pub images: Option<Vec<String>>,

    /// Data directories (default `<install_root>/data` and `<install_root>/<database>`)
    pub data_dirs: Option<Vec<String>>,

    /// Application port (default 8090)
    #[serde(deserialize_with = "scalar::option_number")]
    pub service_port: Option<u16>,

    /// Database port (default 3306 / 5432)
    #[serde(deserialize_with = "scalar::option_number")]
    pub database_port: Option<u16>,

    /// Environment overrides written to `<install_root>/.env`
    #[serde(deserialize_with = "scalar::scalar_map")]
    pub env: BTreeMap<String, String>,

    /// Container names
    pub containers: RawContainers,

    /// Database user for readiness checks (default `confluence`)
    pub database_user: Option<String>,

    /// Service unit settings
    pub unit: RawUnit,

    /// Octal permission bits for created directories (default `755`)
    #[serde(deserialize_with = "scalar::option_text")]
    pub dir_mode: Option<String>,

    /// Readiness polling policies
    pub readiness: RawReadiness,

    /// Per-action-kind timeouts
    pub timeouts: RawTimeouts,
}

impl RawConfig {
    /// Apply a backend named on the command line
    ///
    /// The compose variant follows the backend unless it was set explicitly.
    pub fn override_database(&mut self, database: &str) {
        self.database = Some(database.to_string());
    }
}

/// Container names
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RawContainers {
    /// Application container (default `confluence`)
    pub app: Option<String>,
    /// Database container (default `confluence-mysql` / `confluence-postgres`)
    pub database: Option<String>,
}

/// Service unit settings
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RawUnit {
    /// Unit name (default `confluence`)
    pub name: Option<String>,
    /// Unit description
    pub description: Option<String>,
    /// Restart policy (default `on-failure`)
    pub restart: Option<String>,
    /// Start timeout in seconds (default 300)
    #[serde(deserialize_with = "scalar::option_number")]
    pub timeout_start_secs: Option<u64>,
    /// Stop timeout in seconds (default 120)
    #[serde(deserialize_with = "scalar::option_number")]
    pub timeout_stop_secs: Option<u64>,
}

/// Readiness polling policies
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RawReadiness {
    /// Database policy
    pub database: Option<RawBackoff>,
    /// Application policy
    pub application: Option<RawBackoff>,
}

/// One readiness polling policy
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RawBackoff {
    /// Delay between attempts in milliseconds
    #[serde(deserialize_with = "scalar::option_number")]
    pub interval_ms: Option<u64>,
    /// Upper bound on attempts
    #[serde(deserialize_with = "scalar::option_number")]
    pub max_attempts: Option<u32>,
    /// Interval multiplier after each attempt (default 1.0)
    #[serde(deserialize_with = "scalar::option_number")]
    pub backoff_factor: Option<f64>,
    /// Ceiling for the grown interval in milliseconds
    #[serde(deserialize_with = "scalar::option_number")]
    pub max_interval_ms: Option<u64>,
    /// Upper bound on total polling time in milliseconds
    #[serde(deserialize_with = "scalar::option_number")]
    pub deadline_ms: Option<u64>,
}

/// Per-action-kind timeouts in seconds
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RawTimeouts {
    /// Directory and file operations
    #[serde(deserialize_with = "scalar::option_number")]
    pub filesystem_secs: Option<u64>,
    /// Compose up, stop and down
    #[serde(deserialize_with = "scalar::option_number")]
    pub compose_secs: Option<u64>,
    /// Loading one image archive
    #[serde(deserialize_with = "scalar::option_number")]
    pub image_load_secs: Option<u64>,
    /// Service manager calls
    #[serde(deserialize_with = "scalar::option_number")]
    pub service_manager_secs: Option<u64>,
    /// Dangling image cleanup
    #[serde(deserialize_with = "scalar::option_number")]
    pub prune_secs: Option<u64>,
}
