//! App-layer configuration: registration capacities and request timeouts.
//!
//! Loaded from TOML, then overridden by environment:
//! CHPP_MAX_CLIENTS, CHPP_MAX_SERVICES, CHPP_REQUEST_TIMEOUT_MS, CHPP_OPEN_TIMEOUT_MS.

use std::path::Path;
use std::time::Duration;

use anyhow::Context as _;
use serde::Deserialize;

use crate::protocol::HANDLE_NEGOTIATED_RANGE_START;

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// Client registration table size (default 4).
    #[serde(default = "default_max_clients")]
    pub max_clients: usize,
    /// Service registration table size (default 4).
    #[serde(default = "default_max_services")]
    pub max_services: usize,
    /// Wait budget of a blocking request without explicit timeout (default 1000 ms).
    #[serde(default = "default_request_timeout_ms")]
    pub default_request_timeout_ms: u64,
    /// Wait budget of a blocking open request (default 1000 ms).
    #[serde(default = "default_open_timeout_ms")]
    pub open_timeout_ms: u64,
}

fn default_max_clients() -> usize {
    4
}
fn default_max_services() -> usize {
    4
}
fn default_request_timeout_ms() -> u64 {
    1000
}
fn default_open_timeout_ms() -> u64 {
    1000
}

impl Default for Config {
    fn default() -> Self {
        Self {
            max_clients: default_max_clients(),
            max_services: default_max_services(),
            default_request_timeout_ms: default_request_timeout_ms(),
            open_timeout_ms: default_open_timeout_ms(),
        }
    }
}

impl Config {
    pub fn from_toml_str(s: &str) -> Result<Self, ConfigError> {
        let c: Config = toml::from_str(s)?;
        c.validate()?;
        Ok(c)
    }

    /// Read and validate a TOML file.
    pub fn load_file(path: &Path) -> anyhow::Result<Self> {
        let s = std::fs::read_to_string(path)
            .with_context(|| format!("reading {}", path.display()))?;
        Self::from_toml_str(&s).with_context(|| format!("parsing {}", path.display()))
    }

    /// Apply environment overrides. Unparseable values are ignored.
    pub fn apply_env(mut self) -> Self {
        self.apply_overrides(|key| std::env::var(key).ok());
        self
    }

    fn apply_overrides(&mut self, get: impl Fn(&str) -> Option<String>) {
        if let Some(v) = get("CHPP_MAX_CLIENTS").and_then(|s| s.parse().ok()) {
            self.max_clients = v;
        }
        if let Some(v) = get("CHPP_MAX_SERVICES").and_then(|s| s.parse().ok()) {
            self.max_services = v;
        }
        if let Some(v) = get("CHPP_REQUEST_TIMEOUT_MS").and_then(|s| s.parse().ok()) {
            self.default_request_timeout_ms = v;
        }
        if let Some(v) = get("CHPP_OPEN_TIMEOUT_MS").and_then(|s| s.parse().ok()) {
            self.open_timeout_ms = v;
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_clients == 0 || self.max_services == 0 {
            return Err(ConfigError::ZeroCapacity);
        }
        let handles = usize::from(u8::MAX - HANDLE_NEGOTIATED_RANGE_START) + 1;
        if self.max_services > handles {
            return Err(ConfigError::TooManyServices {
                requested: self.max_services,
                available: handles,
            });
        }
        Ok(())
    }

    pub fn default_request_timeout(&self) -> Duration {
        Duration::from_millis(self.default_request_timeout_ms)
    }

    pub fn open_timeout(&self) -> Duration {
        Duration::from_millis(self.open_timeout_ms)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("parse error: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("registration capacities must be non-zero")]
    ZeroCapacity,
    #[error("{requested} services requested but only {available} handles exist")]
    TooManyServices { requested: usize, available: usize },
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn empty_file_gives_defaults() {
        assert_eq!(Config::from_toml_str("").unwrap(), Config::default());
    }

    #[test]
    fn fields_parse() {
        let c = Config::from_toml_str("max_clients = 2\nopen_timeout_ms = 50\n").unwrap();
        assert_eq!(c.max_clients, 2);
        assert_eq!(c.max_services, 4);
        assert_eq!(c.open_timeout(), Duration::from_millis(50));
    }

    #[test]
    fn unknown_field_rejected() {
        assert!(matches!(
            Config::from_toml_str("max_endpoints = 3"),
            Err(ConfigError::Parse(_))
        ));
    }

    #[test]
    fn capacity_bounds_validated() {
        assert!(matches!(
            Config::from_toml_str("max_clients = 0"),
            Err(ConfigError::ZeroCapacity)
        ));
        assert!(matches!(
            Config::from_toml_str("max_services = 241"),
            Err(ConfigError::TooManyServices { available: 240, .. })
        ));
        assert!(Config::from_toml_str("max_services = 240").is_ok());
    }

    #[test]
    fn env_overrides_apply_and_ignore_garbage() {
        let env: HashMap<&str, &str> = [
            ("CHPP_MAX_CLIENTS", "7"),
            ("CHPP_REQUEST_TIMEOUT_MS", "not-a-number"),
        ]
        .into_iter()
        .collect();
        let mut c = Config::default();
        c.apply_overrides(|k| env.get(k).map(|v| v.to_string()));
        assert_eq!(c.max_clients, 7);
        assert_eq!(c.default_request_timeout_ms, 1000);
    }

    #[test]
    fn missing_file_reports_path() {
        let err = Config::load_file(Path::new("/nonexistent/chpp.toml")).unwrap_err();
        assert!(format!("{err:#}").contains("/nonexistent/chpp.toml"));
    }
}
