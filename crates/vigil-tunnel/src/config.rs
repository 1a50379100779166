//! Tunnel Configuration
//!
//! Immutable snapshots of the user-editable settings that decide how an
//! adapter is built. Snapshots are compared by value: the controller
//! diffs the previous and next snapshot to pick between a full restart
//! and a cheaper resolver-only update.

use crate::blocklist::is_valid_timestamp;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::path::Path;
use url::Url;

/// Package that is always routed outside the tunnel unless the firewall
/// runs in sinkhole mode. App store traffic breaks when tunnelled.
pub const APP_STORE_PACKAGE: &str = "com.android.vending";

/// Application identifier (package name)
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AppId(pub String);

impl AppId {
    /// Create a new app identifier
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for AppId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// How DNS queries are resolved inside the tunnel
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DnsMode {
    /// DNS over HTTPS to `server_url`
    #[default]
    Doh,
    /// DNSCrypt relay
    DnsCrypt,
    /// Plain forwarding to the system resolvers
    Proxy,
}

/// Per-app firewall behavior
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FirewallMode {
    /// No app rules
    Off,
    /// Excluded apps bypass the tunnel
    #[default]
    Filter,
    /// Only the listed apps are routed into the tunnel
    Sinkhole,
}

/// A single user-editable setting that can change at runtime
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConfigKey {
    Apps,
    DnsMode,
    FirewallMode,
    Url,
    LocalBlocklist,
}

impl ConfigKey {
    /// Does a change to this key need a new adapter?
    ///
    /// App exclusions, modes and the blocklist are baked into the adapter
    /// at construction. The server URL can be pushed to a live adapter.
    pub fn requires_restart(&self) -> bool {
        !matches!(self, ConfigKey::Url)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ConfigKey::Apps => "apps",
            ConfigKey::DnsMode => "dns_mode",
            ConfigKey::FirewallMode => "firewall_mode",
            ConfigKey::Url => "url",
            ConfigKey::LocalBlocklist => "local_blocklist",
        }
    }
}

impl std::fmt::Display for ConfigKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for ConfigKey {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "apps" | "excluded_apps" => Ok(ConfigKey::Apps),
            "dns_mode" => Ok(ConfigKey::DnsMode),
            "firewall_mode" => Ok(ConfigKey::FirewallMode),
            "url" | "server_url" => Ok(ConfigKey::Url),
            "local_blocklist" => Ok(ConfigKey::LocalBlocklist),
            _ => Err(ConfigError::UnknownKey(s.to_string())),
        }
    }
}

/// Which apps the adapter routes through the tunnel
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AppRouting {
    /// Only these apps use the tunnel
    Allow(BTreeSet<AppId>),
    /// Every app except these uses the tunnel
    Disallow(BTreeSet<AppId>),
}

impl AppRouting {
    /// Is `app` routed through the tunnel under this plan?
    pub fn is_tunnelled(&self, app: &AppId) -> bool {
        match self {
            AppRouting::Allow(apps) => apps.contains(app),
            AppRouting::Disallow(apps) => !apps.contains(app),
        }
    }
}

/// Snapshot of the settings an adapter is built from
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TunnelConfig {
    /// Resolver endpoint
    pub server_url: String,
    /// DNS resolution mode
    #[serde(default)]
    pub dns_mode: DnsMode,
    /// Firewall mode
    #[serde(default)]
    pub firewall_mode: FirewallMode,
    /// Apps excluded from (or, in sinkhole mode, admitted to) the tunnel
    #[serde(default)]
    pub excluded_apps: BTreeSet<AppId>,
    /// Timestamp of the on-device blocklist the adapter loads, if any
    #[serde(default)]
    pub local_blocklist: Option<String>,
}

impl TunnelConfig {
    /// Create a configuration with default modes and no exclusions
    pub fn new(server_url: impl Into<String>) -> Self {
        Self {
            server_url: server_url.into(),
            dns_mode: DnsMode::default(),
            firewall_mode: FirewallMode::default(),
            excluded_apps: BTreeSet::new(),
            local_blocklist: None,
        }
    }

    pub fn with_dns_mode(mut self, mode: DnsMode) -> Self {
        self.dns_mode = mode;
        self
    }

    pub fn with_firewall_mode(mut self, mode: FirewallMode) -> Self {
        self.firewall_mode = mode;
        self
    }

    pub fn with_excluded_app(mut self, app: impl Into<String>) -> Self {
        self.excluded_apps.insert(AppId::new(app));
        self
    }

    pub fn with_local_blocklist(mut self, timestamp: impl Into<String>) -> Self {
        self.local_blocklist = Some(timestamp.into());
        self
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.server_url.trim().is_empty() {
            return Err(ConfigError::MissingUrl);
        }
        let url = Url::parse(&self.server_url)
            .map_err(|e| ConfigError::InvalidUrl(format!("{}: {}", self.server_url, e)))?;
        if !matches!(url.scheme(), "https" | "http") {
            return Err(ConfigError::UnsupportedScheme(url.scheme().to_string()));
        }
        if let Some(stamp) = &self.local_blocklist {
            if stamp.trim().is_empty() {
                return Err(ConfigError::EmptyBlocklistStamp);
            }
            if !is_valid_timestamp(stamp) {
                return Err(ConfigError::InvalidBlocklistStamp(stamp.clone()));
            }
        }
        Ok(())
    }

    /// Keys whose values differ between `self` and `next`
    pub fn changes(&self, next: &TunnelConfig) -> Vec<ConfigKey> {
        let mut keys = Vec::new();
        if self.excluded_apps != next.excluded_apps {
            keys.push(ConfigKey::Apps);
        }
        if self.dns_mode != next.dns_mode {
            keys.push(ConfigKey::DnsMode);
        }
        if self.firewall_mode != next.firewall_mode {
            keys.push(ConfigKey::FirewallMode);
        }
        if self.server_url != next.server_url {
            keys.push(ConfigKey::Url);
        }
        if self.local_blocklist != next.local_blocklist {
            keys.push(ConfigKey::LocalBlocklist);
        }
        keys
    }

    /// Per-app routing plan for the adapter
    ///
    /// In sinkhole mode the listed apps are the only ones admitted.
    /// Otherwise they bypass the tunnel, together with the app store and
    /// the host application itself.
    pub fn app_routing(&self, host_app: &AppId) -> AppRouting {
        match self.firewall_mode {
            FirewallMode::Sinkhole => AppRouting::Allow(self.excluded_apps.clone()),
            FirewallMode::Off | FirewallMode::Filter => {
                let mut apps = self.excluded_apps.clone();
                apps.insert(AppId::new(APP_STORE_PACKAGE));
                apps.insert(host_app.clone());
                AppRouting::Disallow(apps)
            }
        }
    }

    /// Load from TOML file
    pub fn from_toml_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::Io(e.to_string()))?;
        Self::from_toml(&content)
    }

    /// Load from TOML string
    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        toml::from_str(content).map_err(|e| ConfigError::Parse(e.to_string()))
    }

    /// Load from JSON string
    pub fn from_json(content: &str) -> Result<Self, ConfigError> {
        serde_json::from_str(content).map_err(|e| ConfigError::Parse(e.to_string()))
    }

    /// Export as TOML
    pub fn to_toml(&self) -> Result<String, ConfigError> {
        toml::to_string_pretty(self).map_err(|e| ConfigError::Parse(e.to_string()))
    }

    /// Export as JSON
    pub fn to_json(&self) -> Result<String, ConfigError> {
        serde_json::to_string_pretty(self).map_err(|e| ConfigError::Parse(e.to_string()))
    }
}

/// Configuration errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    #[error("Server URL is missing")]
    MissingUrl,

    #[error("Invalid server URL: {0}")]
    InvalidUrl(String),

    #[error("Unsupported URL scheme: {0}")]
    UnsupportedScheme(String),

    #[error("Local blocklist timestamp is empty")]
    EmptyBlocklistStamp,

    #[error("Local blocklist timestamp is not a directory name: {0}")]
    InvalidBlocklistStamp(String),

    #[error("Unknown configuration key: {0}")]
    UnknownKey(String),

    #[error("IO error: {0}")]
    Io(String),

    #[error("Parse error: {0}")]
    Parse(String),
}
