//! Persisted environment overrides (`KEY=value` lines).

use std::borrow::Cow;
use std::collections::BTreeMap;

const HEADER: &str = "# Managed by airgap-deploy. Values here override the compose defaults.";

/// Renders and parses the env file compose reads from the project directory
pub struct EnvFile;

impl EnvFile {
    /// Render entries as sorted `KEY=value` lines under a header comment
    ///
    /// Values that would not read back verbatim are quoted. Entries must not
    /// contain line breaks; [`DesiredState::validate`](crate::DesiredState::validate)
    /// rejects them.
    pub fn render(entries: &BTreeMap<String, String>) -> String {
        let mut out = String::from(HEADER);
        out.push('\n');
        for (key, value) in entries {
            out.push_str(key);
            out.push('=');
            out.push_str(&quote(value));
            out.push('\n');
        }
        out
    }

    /// Parse `KEY=value` lines, ignoring blanks and comments
    ///
    /// A value wrapped in matching single or double quotes is unquoted.
    pub fn parse(content: &str) -> BTreeMap<String, String> {
        content
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty() && !line.starts_with('#'))
            .filter_map(|line| {
                let line = line.strip_prefix("export ").unwrap_or(line);
                let (key, value) = line.split_once('=')?;
                let key = key.trim();
                if key.is_empty() {
                    return None;
                }
                Some((key.to_string(), unquote(value.trim()).into_owned()))
            })
            .collect()
    }

    /// Whether `current` already holds exactly `entries`
    pub fn matches(current: Option<&str>, entries: &BTreeMap<String, String>) -> bool {
        current.is_some_and(|content| &Self::parse(content) == entries)
    }
}

/// Check that an entry fits on one `KEY=value` line
pub fn validate_entry(key: &str, value: &str) -> Result<(), String> {
    if key.is_empty() || key.contains(|c: char| c == '=' || c == '#' || c.is_whitespace()) {
        return Err(format!("env override name '{key}' is not a valid variable name"));
    }
    if value.contains(['\n', '\r']) {
        return Err(format!("env override {key} must not contain a line break"));
    }
    Ok(())
}

fn quote(value: &str) -> Cow<'_, str> {
    let needs_quotes = value.trim() != value
        || value.starts_with(['"', '\''])
        || value.contains('#');
    if !needs_quotes {
        return Cow::Borrowed(value);
    }
    if !value.contains('\'') {
        return Cow::Owned(format!("'{value}'"));
    }
    let escaped = value.replace('\\', "\\\\").replace('"', "\\\"");
    Cow::Owned(format!("\"{escaped}\""))
}

fn unquote(value: &str) -> Cow<'_, str> {
    if value.len() >= 2 && value.starts_with('\'') && value.ends_with('\'') {
        return Cow::Borrowed(&value[1..value.len() - 1]);
    }
    if value.len() >= 2 && value.starts_with('"') && value.ends_with('"') {
        let inner = &value[1..value.len() - 1];
        if !inner.contains('\\') {
            return Cow::Borrowed(inner);
        }
        let mut out = String::with_capacity(inner.len());
        let mut chars = inner.chars();
        while let Some(c) = chars.next() {
            match c {
                '\\' => match chars.next() {
                    Some(next @ ('"' | '\\')) => out.push(next),
                    Some(other) => {
                        out.push('\\');
                        out.push(other);
                    }
                    None => out.push('\\'),
                },
                c => out.push(c),
            }
        }
        return Cow::Owned(out);
    }
    Cow::Borrowed(value)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_render_is_sorted_and_parseable() {
        let mut entries = BTreeMap::new();
        entries.insert("JVM_MAXIMUM_MEMORY".to_string(), "4g".to_string());
        entries.insert("APP_PORT".to_string(), "9000".to_string());

        let rendered = EnvFile::render(&entries);
        let body: Vec<&str> = rendered.lines().skip(1).collect();
        assert_eq!(body, vec!["APP_PORT=9000", "JVM_MAXIMUM_MEMORY=4g"]);
        assert_eq!(EnvFile::parse(&rendered), entries);
    }

    #[test]
    fn test_parse_tolerates_hand_edits() {
        let content = "# comment\n\nexport TZ='Asia/Shanghai'\nDB_PASSWORD=\"a=b\"\ngarbage\n";
        let parsed = EnvFile::parse(content);
        assert_eq!(parsed["TZ"], "Asia/Shanghai");
        assert_eq!(parsed["DB_PASSWORD"], "a=b");
        assert_eq!(parsed.len(), 2);
    }

    #[test]
    fn test_awkward_values_read_back_verbatim() {
        let mut entries = BTreeMap::new();
        for (key, value) in [
            ("PADDED", " spaced "),
            ("QUOTED", "\"secret\""),
            ("MIXED", "\"it's\" \\ ok"),
            ("HASH", "a#b"),
            ("EMPTY", ""),
            ("PLAIN", "p@ss=word"),
        ] {
            entries.insert(key.to_string(), value.to_string());
        }

        let rendered = EnvFile::render(&entries);
        assert!(rendered.contains("PLAIN=p@ss=word\n"));
        assert!(rendered.contains("HASH='a#b'\n"));
        assert_eq!(EnvFile::parse(&rendered), entries);
    }

    #[test]
    fn test_entries_must_fit_on_one_line() {
        assert!(validate_entry("DB_PASSWORD", "x\nINJECTED=1").is_err());
        assert!(validate_entry("BAD NAME", "x").is_err());
        assert!(validate_entry("", "x").is_err());
        assert!(validate_entry("TZ", "Asia/Shanghai").is_ok());
    }

    #[test]
    fn test_matches_ignores_formatting() {
        let mut entries = BTreeMap::new();
        entries.insert("APP_PORT".to_string(), "9000".to_string());

        assert!(EnvFile::matches(Some("APP_PORT = 9000\n"), &entries));
        assert!(!EnvFile::matches(Some("APP_PORT=8090\n"), &entries));
        assert!(!EnvFile::matches(None, &entries));
        assert!(EnvFile::matches(Some("# only a header\n"), &BTreeMap::new()));
    }
}
