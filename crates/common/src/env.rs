//! Named-environment configuration store.
//!
//! Each deployment environment is a flat `KEY=VALUE` file named
//! `<name>.env`, looked up under `config/` and then the working directory.
//! Process environment variables override file entries, so operators can
//! patch a single key without editing the file.

use std::collections::HashMap;
use std::fmt::Display;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("environment file not found for '{0}' (looked in config/ and cwd)")]
    EnvFileNotFound(String),

    #[error("failed to read environment file {path}: {source}")]
    EnvFileRead {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("malformed line {line} in {path}: expected KEY=VALUE")]
    MalformedLine { path: PathBuf, line: usize },

    #[error("missing required configuration key: {0}")]
    MissingKey(String),

    #[error("invalid value for {key}: {value}: {reason}")]
    InvalidValue {
        key: String,
        value: String,
        reason: String,
    },
}

/// Immutable key→value configuration resolved at startup.
#[derive(Debug, Clone, Default)]
pub struct Environment {
    name: String,
    values: HashMap<String, String>,
}

impl Environment {
    /// Load environment `name`, overlaying process environment variables on
    /// top of the file contents.
    pub fn load(name: &str) -> Result<Self, ConfigError> {
        let candidates = [
            PathBuf::from("config").join(format!("{name}.env")),
            PathBuf::from(format!("{name}.env")),
        ];
        let path = candidates
            .iter()
            .find(|p| p.exists())
            .ok_or_else(|| ConfigError::EnvFileNotFound(name.to_string()))?;

        let mut env = Self::from_file(name, path)?;
        for (key, value) in std::env::vars() {
            env.values.insert(key, value);
        }
        Ok(env)
    }

    /// Parse a single `KEY=VALUE` file without the process-env overlay.
    pub fn from_file(name: &str, path: &Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path).map_err(|e| ConfigError::EnvFileRead {
            path: path.to_path_buf(),
            source: e,
        })?;

        let mut values = HashMap::new();
        for (idx, line) in raw.lines().enumerate() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let (key, value) = line.split_once('=').ok_or(ConfigError::MalformedLine {
                path: path.to_path_buf(),
                line: idx + 1,
            })?;
            values.insert(
                key.trim().to_string(),
                value.trim().trim_matches('"').to_string(),
            );
        }

        Ok(Self {
            name: name.to_string(),
            values,
        })
    }

    /// Build an environment from an in-memory map. Used by tests and by
    /// embedded setups that do not read files.
    pub fn from_map(name: &str, values: HashMap<String, String>) -> Self {
        Self {
            name: name.to_string(),
            values,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.values.get(key).map(String::as_str)
    }

    pub fn get_or<'a>(&'a self, key: &str, default: &'a str) -> &'a str {
        self.get(key).unwrap_or(default)
    }

    pub fn require(&self, key: &str) -> Result<&str, ConfigError> {
        self.get(key)
            .ok_or_else(|| ConfigError::MissingKey(key.to_string()))
    }

    /// Parse a required key into any `FromStr` type.
    pub fn require_parse<T>(&self, key: &str) -> Result<T, ConfigError>
    where
        T: FromStr,
        T::Err: Display,
    {
        let raw = self.require(key)?;
        raw.parse().map_err(|e: T::Err| ConfigError::InvalidValue {
            key: key.to_string(),
            value: raw.to_string(),
            reason: e.to_string(),
        })
    }

    /// Parse an optional key, falling back to `default` when absent.
    pub fn parse_or<T>(&self, key: &str, default: T) -> Result<T, ConfigError>
    where
        T: FromStr,
        T::Err: Display,
    {
        match self.get(key) {
            None => Ok(default),
            Some(raw) => raw.parse().map_err(|e: T::Err| ConfigError::InvalidValue {
                key: key.to_string(),
                value: raw.to_string(),
                reason: e.to_string(),
            }),
        }
    }

    pub fn get_bool(&self, key: &str, default: bool) -> Result<bool, ConfigError> {
        match self.get(key) {
            None => Ok(default),
            Some(raw) => match raw.to_ascii_lowercase().as_str() {
                "1" | "true" | "yes" | "on" => Ok(true),
                "0" | "false" | "no" | "off" => Ok(false),
                other => Err(ConfigError::InvalidValue {
                    key: key.to_string(),
                    value: other.to_string(),
                    reason: "expected a boolean".to_string(),
                }),
            },
        }
    }

    /// Split a comma-separated value into trimmed, non-empty items.
    pub fn get_csv(&self, key: &str) -> Vec<String> {
        self.get(key)
            .map(|raw| {
                raw.split(',')
                    .map(|s| s.trim().to_string())
                    .filter(|s| !s.is_empty())
                    .collect()
            })
            .unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_env(content: &str) -> tempfile::NamedTempFile {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(content.as_bytes()).unwrap();
        file
    }

    #[test]
    fn test_parse_basic_file() {
        let file = write_env("# comment\nNODE_IDS=n1,n2,n3\nMPC_THRESHOLD=2\n\nQUOTED=\"hello\"\n");
        let env = Environment::from_file("dev", file.path()).unwrap();

        assert_eq!(env.get("NODE_IDS"), Some("n1,n2,n3"));
        assert_eq!(env.get_csv("NODE_IDS"), vec!["n1", "n2", "n3"]);
        assert_eq!(env.require_parse::<u32>("MPC_THRESHOLD").unwrap(), 2);
        assert_eq!(env.get("QUOTED"), Some("hello"));
        assert_eq!(env.get("MISSING"), None);
    }

    #[test]
    fn test_malformed_line_is_rejected() {
        let file = write_env("GOOD=1\nnot a pair\n");
        let err = Environment::from_file("dev", file.path()).unwrap_err();
        assert!(matches!(err, ConfigError::MalformedLine { line: 2, .. }));
    }

    #[test]
    fn test_missing_required_key() {
        let env = Environment::from_map("dev", HashMap::new());
        assert!(matches!(
            env.require("NODE_IDS"),
            Err(ConfigError::MissingKey(_))
        ));
    }

    #[test]
    fn test_bool_parsing() {
        let env = Environment::from_map(
            "dev",
            HashMap::from([
                ("A".to_string(), "true".to_string()),
                ("B".to_string(), "0".to_string()),
                ("C".to_string(), "maybe".to_string()),
            ]),
        );
        assert!(env.get_bool("A", false).unwrap());
        assert!(!env.get_bool("B", true).unwrap());
        assert!(env.get_bool("MISSING", true).unwrap());
        assert!(env.get_bool("C", false).is_err());
    }
}
