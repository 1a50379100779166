//! Service settings
//!
//! Loaded once at startup from a TOML or JSON file, picked by extension.

use crate::blocklist::{BlocklistStore, DEFAULT_BLOCKLIST_FILE_COUNT};
use crate::config::{ConfigError, TunnelConfig};
use crate::controller::ControllerOptions;
use crate::tracker::DEFAULT_TRACKER_CAPACITY;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::info;

/// Host service settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServiceSettings {
    /// Upper bound on adapter construction, in seconds
    #[serde(default = "default_factory_timeout_secs")]
    pub factory_timeout_secs: u64,
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,
    #[serde(default = "default_tracker_capacity")]
    pub tracker_capacity: usize,
    /// Directory holding local blocklist downloads
    #[serde(default = "default_blocklist_root")]
    pub blocklist_root: PathBuf,
    /// Files in a complete blocklist download
    #[serde(default = "default_blocklist_file_count")]
    pub blocklist_file_count: usize,
    /// Default tracing filter; `RUST_LOG` wins when set
    #[serde(default = "default_log_filter")]
    pub log_filter: String,
    /// Tunnel configuration used for the first start
    #[serde(default)]
    pub tunnel: Option<TunnelConfig>,
}

fn default_factory_timeout_secs() -> u64 {
    30
}

fn default_queue_capacity() -> usize {
    32
}

fn default_tracker_capacity() -> usize {
    DEFAULT_TRACKER_CAPACITY
}

fn default_blocklist_root() -> PathBuf {
    PathBuf::from("blocklists")
}

fn default_blocklist_file_count() -> usize {
    DEFAULT_BLOCKLIST_FILE_COUNT
}

fn default_log_filter() -> String {
    "info".to_string()
}

impl Default for ServiceSettings {
    fn default() -> Self {
        Self {
            factory_timeout_secs: default_factory_timeout_secs(),
            queue_capacity: default_queue_capacity(),
            tracker_capacity: default_tracker_capacity(),
            blocklist_root: default_blocklist_root(),
            blocklist_file_count: default_blocklist_file_count(),
            log_filter: default_log_filter(),
            tunnel: None,
        }
    }
}

impl ServiceSettings {
    /// Load from a `.toml` or `.json` file
    pub fn from_file(path: &Path) -> Result<Self, SettingsError> {
        let ext = path.extension()
            .and_then(|e| e.to_str())
            .unwrap_or("");

        let content = std::fs::read_to_string(path)
            .map_err(|e| SettingsError::Io(format!("{}: {}", path.display(), e)))?;

        let settings = match ext {
            "toml" => Self::from_toml(&content)?,
            "json" => Self::from_json(&content)?,
            other => return Err(SettingsError::UnsupportedFormat(other.to_string())),
        };

        info!("Loaded service settings from {}", path.display());
        Ok(settings)
    }

    pub fn from_toml(content: &str) -> Result<Self, SettingsError> {
        let settings: Self = toml::from_str(content)
            .map_err(|e| SettingsError::Parse(e.to_string()))?;
        settings.validate()?;
        Ok(settings)
    }

    pub fn from_json(content: &str) -> Result<Self, SettingsError> {
        let settings: Self = serde_json::from_str(content)
            .map_err(|e| SettingsError::Parse(e.to_string()))?;
        settings.validate()?;
        Ok(settings)
    }

    fn validate(&self) -> Result<(), SettingsError> {
        if self.factory_timeout_secs == 0 {
            return Err(SettingsError::Invalid("factory_timeout_secs must be positive".into()));
        }
        if self.queue_capacity == 0 {
            return Err(SettingsError::Invalid("queue_capacity must be positive".into()));
        }
        if self.tracker_capacity == 0 {
            return Err(SettingsError::Invalid("tracker_capacity must be positive".into()));
        }
        if let Some(tunnel) = &self.tunnel {
            tunnel.validate()?;
        }
        Ok(())
    }

    pub fn controller_options(&self) -> ControllerOptions {
        ControllerOptions {
            factory_timeout: Duration::from_secs(self.factory_timeout_secs),
            queue_capacity: self.queue_capacity,
            tracker_capacity: self.tracker_capacity,
        }
    }

    pub fn blocklist_store(&self) -> BlocklistStore {
        BlocklistStore::new(self.blocklist_root.clone(), self.blocklist_file_count)
    }
}

/// Settings loading errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SettingsError {
    #[error("IO error: {0}")]
    Io(String),

    #[error("Parse error: {0}")]
    Parse(String),

    #[error("Unsupported settings format: {0:?}")]
    UnsupportedFormat(String),

    #[error("Invalid settings: {0}")]
    Invalid(String),

    #[error("Invalid tunnel configuration: {0}")]
    Tunnel(#[from] ConfigError),
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DnsMode;
    use std::io::Write;

    #[test]
    fn test_defaults_from_empty_toml() {
        let settings = ServiceSettings::from_toml("").unwrap();
        assert_eq!(settings, ServiceSettings::default());

        let options = settings.controller_options();
        assert_eq!(options.factory_timeout, Duration::from_secs(30));
        assert_eq!(options.queue_capacity, 32);
        assert_eq!(options.tracker_capacity, 1024);
        assert_eq!(settings.blocklist_store().expected_files(), 9);
    }

    #[test]
    fn test_toml_with_tunnel() {
        let settings = ServiceSettings::from_toml(
            r#"
            factory_timeout_secs = 5
            log_filter = "debug"

            [tunnel]
            server_url = "https://dns.example.net/dns-query"
            dns_mode = "dns_crypt"
            "#,
        )
        .unwrap();

        assert_eq!(settings.factory_timeout_secs, 5);
        assert_eq!(settings.log_filter, "debug");
        let tunnel = settings.tunnel.unwrap();
        assert_eq!(tunnel.dns_mode, DnsMode::DnsCrypt);
    }

    #[test]
    fn test_rejects_invalid_values() {
        assert!(matches!(
            ServiceSettings::from_json(r#"{"queue_capacity": 0}"#),
            Err(SettingsError::Invalid(_))
        ));
        assert!(matches!(
            ServiceSettings::from_json(r#"{"tunnel": {"server_url": ""}}"#),
            Err(SettingsError::Tunnel(ConfigError::MissingUrl))
        ));
        assert!(matches!(
            ServiceSettings::from_toml("queue_capacity = \"many\""),
            Err(SettingsError::Parse(_))
        ));
    }

    #[test]
    fn test_from_file_by_extension() {
        let mut json = tempfile::Builder::new().suffix(".json").tempfile().unwrap();
        write!(json, r#"{{"tracker_capacity": 16}}"#).unwrap();
        let settings = ServiceSettings::from_file(json.path()).unwrap();
        assert_eq!(settings.tracker_capacity, 16);

        let yaml = tempfile::Builder::new().suffix(".yaml").tempfile().unwrap();
        assert_eq!(
            ServiceSettings::from_file(yaml.path()),
            Err(SettingsError::UnsupportedFormat("yaml".into()))
        );

        let missing = ServiceSettings::from_file(Path::new("/nonexistent/settings.toml"));
        assert!(matches!(missing, Err(SettingsError::Io(_))));
    }
}
