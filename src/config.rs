//! vmshim configuration.
//!
//! Configuration is a small TOML file. Its location is resolved in order
//! from `--config`, `$VMSHIM_CONFIG`, and the platform config directory
//! (`~/.config/vmshim/config.toml` on Linux). A missing file is not an
//! error; every field has a default.

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Application name for config and state storage.
const APP_NAME: &str = "vmshim";

/// Config file name inside the config directory.
const CONFIG_FILE: &str = "config.toml";

/// Simulated host state file name inside the data directory.
const STATE_FILE: &str = "simulated-host.json";

/// Environment variable that overrides the config path.
pub const CONFIG_ENV: &str = "VMSHIM_CONFIG";

/// Global vmshim configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ShimConfig {
    /// Driver backend name.
    pub driver: String,

    /// Where the simulated host keeps its state between invocations.
    pub state_file: Option<PathBuf>,

    /// Delay between job polls (humantime, e.g. "100ms").
    pub job_poll_interval: String,

    /// Upper bound on a single job (humantime, or "none").
    pub job_timeout: String,

    /// Details returned with `ReadyCommand` answers.
    pub ready_details: Option<String>,
}

impl Default for ShimConfig {
    fn default() -> Self {
        Self {
            driver: crate::driver::simulated::BACKEND_NAME.to_string(),
            state_file: None,
            job_poll_interval: "100ms".to_string(),
            job_timeout: "10m".to_string(),
            ready_details: None,
        }
    }
}

impl ShimConfig {
    /// Load configuration.
    ///
    /// An explicit path must exist. Otherwise `$VMSHIM_CONFIG` and then the
    /// default location are tried, falling back to defaults if neither file
    /// exists.
    pub fn load(explicit: Option<&Path>) -> Result<Self> {
        if let Some(path) = explicit {
            return Self::load_file(path);
        }

        let path = match std::env::var_os(CONFIG_ENV) {
            Some(p) if !p.is_empty() => Some(PathBuf::from(p)),
            _ => Self::default_path(),
        };

        match path {
            Some(path) if path.exists() => Self::load_file(&path),
            _ => {
                tracing::debug!("no config file found, using defaults");
                Ok(Self::default())
            }
        }
    }

    /// Default config file location.
    pub fn default_path() -> Option<PathBuf> {
        dirs::config_dir().map(|d| d.join(APP_NAME).join(CONFIG_FILE))
    }

    fn load_file(path: &Path) -> Result<Self> {
        let data = std::fs::read_to_string(path).map_err(|e| {
            Error::config(format!("read {}", path.display()), e.to_string())
        })?;
        let config = Self::from_toml(&data)
            .map_err(|e| Error::config(format!("load {}", path.display()), e.to_string()))?;
        tracing::debug!(path = %path.display(), driver = %config.driver, "loaded config");
        Ok(config)
    }

    /// Parse and validate a TOML document.
    pub fn from_toml(data: &str) -> Result<Self> {
        let config: Self =
            toml::from_str(data).map_err(|e| Error::config("parse config", e.to_string()))?;
        config.poll_interval()?;
        config.job_timeout()?;
        Ok(config)
    }

    /// Serialize to TOML.
    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self).map_err(|e| Error::config("serialize config", e.to_string()))
    }

    pub fn poll_interval(&self) -> Result<Duration> {
        humantime::parse_duration(&self.job_poll_interval).map_err(|e| {
            Error::config(
                "parse job_poll_interval",
                format!("'{}': {}", self.job_poll_interval, e),
            )
        })
    }

    /// Job timeout; `None` when disabled.
    pub fn job_timeout(&self) -> Result<Option<Duration>> {
        let raw = self.job_timeout.trim();
        if raw.eq_ignore_ascii_case("none") {
            return Ok(None);
        }
        let timeout = humantime::parse_duration(raw).map_err(|e| {
            Error::config("parse job_timeout", format!("'{}': {}", self.job_timeout, e))
        })?;
        Ok((!timeout.is_zero()).then_some(timeout))
    }

    /// Resolved simulated host state file.
    pub fn state_file(&self) -> Result<PathBuf> {
        if let Some(path) = &self.state_file {
            return Ok(path.clone());
        }
        dirs::data_local_dir()
            .map(|d| d.join(APP_NAME).join(STATE_FILE))
            .ok_or_else(|| Error::config("locate state file", "no local data directory"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;

    #[test]
    fn test_defaults() {
        let config = ShimConfig::default();
        assert_eq!(config.driver, "simulated");
        assert_eq!(config.poll_interval().unwrap(), Duration::from_millis(100));
        assert_eq!(
            config.job_timeout().unwrap(),
            Some(Duration::from_secs(600))
        );
    }

    #[test]
    fn test_partial_toml_uses_defaults() {
        let config = ShimConfig::from_toml("job_timeout = \"30s\"\n").unwrap();
        assert_eq!(config.driver, "simulated");
        assert_eq!(config.job_timeout().unwrap(), Some(Duration::from_secs(30)));
    }

    #[test]
    fn test_timeout_can_be_disabled() {
        for raw in ["none", "None", "0s"] {
            let config = ShimConfig {
                job_timeout: raw.to_string(),
                ..ShimConfig::default()
            };
            assert_eq!(config.job_timeout().unwrap(), None, "{}", raw);
        }
    }

    #[test]
    fn test_malformed_duration_is_config_error() {
        let err = ShimConfig::from_toml("job_poll_interval = \"soon\"\n").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Local);
        assert!(err.to_string().contains("job_poll_interval"));
    }

    #[test]
    fn test_load_explicit_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        let state = dir.path().join("host.json");
        let config = ShimConfig {
            state_file: Some(state.clone()),
            ready_details: Some("hyperv host 7".into()),
            ..ShimConfig::default()
        };
        std::fs::write(&path, config.to_toml().unwrap()).unwrap();

        let loaded = ShimConfig::load(Some(&path)).unwrap();
        assert_eq!(loaded, config);
        assert_eq!(loaded.state_file().unwrap(), state);
    }

    #[test]
    fn test_load_missing_explicit_file_fails() {
        let dir = tempfile::tempdir().unwrap();
        let err = ShimConfig::load(Some(&dir.path().join("nope.toml"))).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Local);
    }
}
