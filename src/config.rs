use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use crate::upnp::{ClientOptions, DiscoveryOptions};

/// Runtime settings for the UPnP component
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// How long to collect SSDP responses per IGD version
    pub discovery_timeout_secs: u64,
    /// Upper bound for each control action
    pub action_timeout_secs: u64,
    /// Safety bound on generic-entry enumeration
    pub max_enumeration_entries: u16,
    /// Description base when neither the service nor the advertisement sets one
    pub default_description: String,
    /// Delete mappings carrying `default_description` that this process did not create,
    /// when this node is the elected owner of every UPnP pool
    pub sweep_orphans_on_startup: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            discovery_timeout_secs: 3,
            action_timeout_secs: 5,
            max_enumeration_entries: 1000,
            default_description: "LoadBalancer".to_string(),
            sweep_orphans_on_startup: false,
        }
    }
}

impl Config {
    /// Load a JSON config file. Missing fields take their defaults.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        let config: Self = serde_json::from_str(&raw)
            .with_context(|| format!("Failed to parse config file {}", path.display()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.discovery_timeout_secs == 0 {
            bail!("discovery_timeout_secs must be greater than 0");
        }
        if self.action_timeout_secs == 0 {
            bail!("action_timeout_secs must be greater than 0");
        }
        if self.max_enumeration_entries == 0 {
            bail!("max_enumeration_entries must be greater than 0");
        }
        if self.default_description.trim().is_empty() {
            bail!("default_description must not be empty");
        }
        Ok(())
    }

    pub fn discovery_options(&self) -> DiscoveryOptions {
        DiscoveryOptions {
            search_window: Duration::from_secs(self.discovery_timeout_secs),
            fetch_timeout: Duration::from_secs(self.action_timeout_secs),
        }
    }

    pub fn client_options(&self) -> ClientOptions {
        ClientOptions {
            action_timeout: Duration::from_secs(self.action_timeout_secs),
            max_enumeration_entries: self.max_enumeration_entries,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_temp(name: &str, contents: &str) -> std::path::PathBuf {
        let path = std::env::temp_dir().join(format!("igd-speaker-{}-{}.json", name, std::process::id()));
        let mut file = std::fs::File::create(&path).unwrap();
        file.write_all(contents.as_bytes()).unwrap();
        path
    }

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.client_options().action_timeout, Duration::from_secs(5));
        assert_eq!(config.client_options().max_enumeration_entries, 1000);
        assert_eq!(config.discovery_options().search_window, Duration::from_secs(3));
        assert!(!config.sweep_orphans_on_startup);
    }

    #[test]
    fn test_partial_file_keeps_defaults() {
        let path = write_temp("partial", r#"{ "action_timeout_secs": 2, "sweep_orphans_on_startup": true }"#);
        let config = Config::from_file(&path).unwrap();
        std::fs::remove_file(&path).ok();

        assert_eq!(config.action_timeout_secs, 2);
        assert!(config.sweep_orphans_on_startup);
        assert_eq!(config.default_description, "LoadBalancer");
    }

    #[test]
    fn test_invalid_values_are_rejected() {
        let path = write_temp("invalid", r#"{ "max_enumeration_entries": 0 }"#);
        let err = Config::from_file(&path).unwrap_err();
        std::fs::remove_file(&path).ok();
        assert!(err.to_string().contains("max_enumeration_entries"));

        assert!(Config::from_file("/nonexistent/igd-speaker.json").is_err());
    }
}
