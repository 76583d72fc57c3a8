//! Configuration parser with environment variable substitution

use crate::{ConfigError, RawConfig, Result};
use regex::Regex;
use serde_yaml::Value;
use std::path::Path;
use tracing::debug;

/// Configuration file looked up in the working directory
pub const DEFAULT_CONFIG_FILE: &str = "deploy.yaml";

fn env_reference() -> Result<Regex> {
    Regex::new(r"\$\{([^}]+)\}").map_err(|e| ConfigError::ValidationError(e.to_string()))
}

/// Load configuration
///
/// An explicit `path` must exist. Without one, [`DEFAULT_CONFIG_FILE`] is
/// read when present and built-in defaults are used otherwise.
pub fn load(path: Option<&Path>) -> Result<RawConfig> {
    match path {
        Some(path) => parse_file(path),
        None => {
            let default = Path::new(DEFAULT_CONFIG_FILE);
            if default.exists() {
                parse_file(default)
            } else {
                debug!("No {} found, using defaults", DEFAULT_CONFIG_FILE);
                Ok(RawConfig::default())
            }
        }
    }
}

/// Parse a YAML configuration file
pub fn parse_file(path: impl AsRef<Path>) -> Result<RawConfig> {
    let path = path.as_ref();
    debug!("Reading configuration from {}", path.display());
    let content = std::fs::read_to_string(path)?;
    parse_str(&content)
}

/// Parse YAML configuration from a string, substituting from the process environment
pub fn parse_str(content: &str) -> Result<RawConfig> {
    parse_str_with(content, |name| std::env::var(name).ok())
}

/// Parse YAML configuration, resolving `${VAR}` references through `lookup`
pub fn parse_str_with<F>(content: &str, lookup: F) -> Result<RawConfig>
where
    F: Fn(&str) -> Option<String>,
{
    // An empty document is an empty configuration
    if content.trim().is_empty() {
        return Ok(RawConfig::default());
    }

    let mut doc: Value = serde_yaml::from_str(content)?;
    let re = env_reference()?;
    let mut missing = Vec::new();
    substitute_tree(&mut doc, &re, &lookup, &mut missing)?;
    if !missing.is_empty() {
        missing.sort();
        missing.dedup();
        return Err(ConfigError::EnvVarNotFound(missing.join(", ")));
    }

    if doc.is_null() {
        return Ok(RawConfig::default());
    }
    Ok(serde_yaml::from_value(doc)?)
}

/// Substitute every string scalar in place
///
/// Substituted values stay strings; numeric fields accept numeric strings.
fn substitute_tree<F>(
    value: &mut Value,
    re: &Regex,
    lookup: &F,
    missing: &mut Vec<String>,
) -> Result<()>
where
    F: Fn(&str) -> Option<String>,
{
    match value {
        Value::String(s) => {
            let (substituted, unresolved) = substitute_with(s, re, lookup);
            missing.extend(unresolved);
            *s = substituted;
        }
        Value::Sequence(items) => {
            for item in items {
                substitute_tree(item, re, lookup, missing)?;
            }
        }
        Value::Mapping(map) => {
            for (_, item) in map.iter_mut() {
                substitute_tree(item, re, lookup, missing)?;
            }
        }
        Value::Tagged(tagged) => substitute_tree(&mut tagged.value, re, lookup, missing)?,
        Value::Null | Value::Bool(_) | Value::Number(_) => {}
    }
    Ok(())
}

fn substitute_with<F>(input: &str, re: &Regex, lookup: &F) -> (String, Vec<String>)
where
    F: Fn(&str) -> Option<String>,
{
    let mut missing = Vec::new();
    let result = re.replace_all(input, |cap: &regex::Captures<'_>| {
        let var_expr = &cap[1];

        // Handle default values: ${VAR:-default}
        let (var_name, default_value) = match var_expr.split_once(":-") {
            Some((name, default)) => (name, Some(default)),
            None => (var_expr, None),
        };

        match lookup(var_name) {
            Some(value) if !value.is_empty() || default_value.is_none() => value,
            _ => match default_value {
                Some(default) => default.to_string(),
                None => {
                    missing.push(var_name.to_string());
                    String::new()
                }
            },
        }
    });
    (result.into_owned(), missing)
}

/// Substitute environment variables in a string
pub fn substitute_env_vars(input: &str) -> Result<String> {
    let re = env_reference()?;
    let (result, missing) = substitute_with(input, &re, &|name: &str| std::env::var(name).ok());
    if !missing.is_empty() {
        return Err(ConfigError::EnvVarNotFound(missing.join(", ")));
    }
    Ok(result)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn vars(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |name: &str| map.get(name).cloned()
    }

    #[test]
    fn test_defaults_and_lookups() {
        let re = env_reference().unwrap();
        let lookup = vars(&[("ROOT", "/srv/app")]);

        let (out, missing) = substitute_with("${ROOT}/data", &re, &lookup);
        assert_eq!(out, "/srv/app/data");
        assert!(missing.is_empty());

        let (out, _) = substitute_with("${PORT:-8090}", &re, &lookup);
        assert_eq!(out, "8090");

        let (_, missing) = substitute_with("${NOPE}", &re, &lookup);
        assert_eq!(missing, vec!["NOPE".to_string()]);
    }

    #[test]
    fn test_empty_variable_falls_back_to_default() {
        let re = env_reference().unwrap();
        let lookup = vars(&[("PORT", "")]);
        let (out, _) = substitute_with("${PORT:-8090}", &re, &lookup);
        assert_eq!(out, "8090");
    }

    #[test]
    fn test_substituted_numbers_keep_their_type() {
        let config = parse_str_with(
            "service_port: ${APP_PORT:-8090}\ndatabase: ${DB}\n",
            vars(&[("DB", "postgresql")]),
        )
        .unwrap();
        assert_eq!(config.service_port, Some(8090));
        assert_eq!(config.database.as_deref(), Some("postgresql"));
    }

    #[test]
    fn test_numeric_and_boolean_values_stay_text() {
        let config = parse_str_with(
            "app_version: ${VERSION}\nenv:\n  DB_PASSWORD: \"${DB_PASSWORD}\"\n  DEBUG: ${DEBUG:-true}\n",
            vars(&[("DB_PASSWORD", "123456"), ("VERSION", "8.5")]),
        )
        .unwrap();
        assert_eq!(config.env["DB_PASSWORD"], "123456");
        assert_eq!(config.env["DEBUG"], "true");
        assert_eq!(config.app_version.as_deref(), Some("8.5"));
    }

    #[test]
    fn test_substituted_timeouts_and_mode() {
        let config = parse_str_with(
            "dir_mode: ${MODE:-750}\ntimeouts:\n  compose_secs: ${COMPOSE_TIMEOUT}\n",
            vars(&[("COMPOSE_TIMEOUT", "600")]),
        )
        .unwrap();
        assert_eq!(config.dir_mode.as_deref(), Some("750"));
        assert_eq!(config.timeouts.compose_secs, Some(600));
    }

    #[test]
    fn test_non_numeric_port_is_rejected() {
        let err = parse_str_with("service_port: ${PORT}\n", vars(&[("PORT", "http")])).unwrap_err();
        assert!(matches!(err, ConfigError::YamlError(_)));
    }

    #[test]
    fn test_missing_variables_are_reported_together() {
        let err = parse_str_with(
            "install_root: ${ROOT}\nsource_dir: ${BUNDLE}\n",
            vars(&[]),
        )
        .unwrap_err();
        assert!(matches!(err, ConfigError::EnvVarNotFound(names) if names == "BUNDLE, ROOT"));
    }

    #[test]
    fn test_empty_document() {
        assert_eq!(parse_str_with("", vars(&[])).unwrap(), RawConfig::default());
        assert_eq!(
            parse_str_with("# only a comment\n", vars(&[])).unwrap(),
            RawConfig::default()
        );
    }

    #[test]
    fn test_unknown_fields_are_rejected() {
        let err = parse_str_with("instal_root: /opt/x\n", vars(&[])).unwrap_err();
        assert!(matches!(err, ConfigError::YamlError(_)));
    }
}
