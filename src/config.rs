//! Bridge configuration: defaults, environment overrides, and (with the
//! `toml-config` feature) a TOML file.

use serde::{Deserialize, Serialize};
use tracing::warn;

#[cfg(feature = "toml-config")]
use crate::bridge::BridgeError;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BridgeConfig {
    /// Initial handle table capacity.
    pub handle_capacity: usize,
    /// Collect on every native frame exit.
    pub gc_stress: bool,
    /// Default log filter; `CEXT_LOG` wins when set.
    pub log_filter: String,
    /// Abort the process on fatal conditions. When off, they panic instead.
    pub abort_on_fatal: bool,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            handle_capacity: 1024,
            gc_stress: false,
            log_filter: "warn".to_string(),
            abort_on_fatal: true,
        }
    }
}

impl BridgeConfig {
    /// Defaults with `CEXT_*` environment overrides applied.
    pub fn from_env() -> Self {
        Self::default().with_env_overrides()
    }

    pub fn with_env_overrides(mut self) -> Self {
        if let Some(capacity) = env_value("CEXT_HANDLE_CAPACITY") {
            self.handle_capacity = capacity;
        }
        if let Some(stress) = env_value("CEXT_GC_STRESS") {
            self.gc_stress = stress;
        }
        if let Some(abort) = env_value("CEXT_ABORT_ON_FATAL") {
            self.abort_on_fatal = abort;
        }
        self
    }

    #[cfg(feature = "toml-config")]
    pub fn from_toml_str(source: &str) -> Result<Self, BridgeError> {
        toml::from_str(source).map_err(|err| BridgeError::Config(err.to_string()))
    }

    /// Reads `path`, then applies environment overrides.
    #[cfg(feature = "toml-config")]
    pub fn load(path: &std::path::Path) -> Result<Self, BridgeError> {
        let source = std::fs::read_to_string(path)
            .map_err(|err| BridgeError::Config(format!("{}: {err}", path.display())))?;
        Ok(Self::from_toml_str(&source)?.with_env_overrides())
    }
}

fn env_value<T: std::str::FromStr>(name: &str) -> Option<T> {
    let raw = std::env::var(name).ok()?;
    match raw.trim().parse() {
        Ok(value) => Some(value),
        Err(_) => {
            warn!(variable = name, value = %raw, "ignoring unparseable environment override");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let config = BridgeConfig::default();
        assert_eq!(config.handle_capacity, 1024);
        assert!(!config.gc_stress);
        assert_eq!(config.log_filter, "warn");
        assert!(config.abort_on_fatal);
    }

    #[test]
    fn serde_fills_missing_fields() {
        let config: BridgeConfig = serde_json::from_str(r#"{"gc_stress": true}"#).unwrap();
        assert!(config.gc_stress);
        assert_eq!(config.handle_capacity, 1024);
    }
}
