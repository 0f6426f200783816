//! Configuration management

use crate::error::{NetwardenError, Result};
use crate::types::{InstalledApp, Uid};
use serde::{Deserialize, Serialize};
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, info};

pub const CONFIG_ENV: &str = "NETWARDEN_CONFIG";
pub const DB_ENV: &str = "NETWARDEN_DB";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TunnelSettings {
    /// Interface name of the TUN device
    pub name: String,
    pub session_name: String,
    pub mtu: u16,
    pub address_v4: Ipv4Addr,
    pub address_v6: Ipv6Addr,
    pub dns_servers: Vec<IpAddr>,
    /// Policy routing table holding the tunnel routes
    pub route_table: u32,
    /// Priority of the catch-all rule; bypass rules sit just above it
    pub rule_priority: u32,
}

impl Default for TunnelSettings {
    fn default() -> Self {
        Self {
            name: "nwtun0".to_string(),
            session_name: "Netwarden".to_string(),
            mtu: 1500,
            address_v4: Ipv4Addr::new(10, 0, 0, 2),
            address_v6: Ipv6Addr::new(0xfd00, 0x1, 0xfd00, 0x1, 0xfd00, 0x1, 0xfd00, 0x1),
            dns_servers: vec![
                IpAddr::V4(Ipv4Addr::new(8, 8, 8, 8)),
                IpAddr::V4(Ipv4Addr::new(8, 8, 4, 4)),
            ],
            route_table: 5288,
            rule_priority: 5288,
        }
    }
}

/// Extra application declared in the config file
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppDeclaration {
    pub identifier: String,
    pub display_name: Option<String>,
    pub uid: Uid,
    #[serde(default)]
    pub is_system: bool,
}

impl From<&AppDeclaration> for InstalledApp {
    fn from(decl: &AppDeclaration) -> Self {
        InstalledApp {
            identifier: decl.identifier.clone(),
            display_name: decl.display_name.clone().unwrap_or_else(|| decl.identifier.clone()),
            uid: decl.uid,
            is_system: decl.is_system,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub database: Option<PathBuf>,
    pub tunnel: TunnelSettings,
    pub cache_capacity: usize,
    pub log_batch_size: usize,
    pub log_flush_interval_ms: u64,
    pub drain_backoff_ms: u64,
    pub log_retention_days: u32,
    pub auto_start: bool,
    /// Identifier of this application; never routed through the tunnel
    pub self_identifier: String,
    pub prune_uninstalled: bool,
    pub rules_poll_secs: u64,
    pub network_poll_secs: u64,
    /// Accounts below this uid are flagged as system applications
    pub min_user_uid: Uid,
    pub apps: Vec<AppDeclaration>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            database: None,
            tunnel: TunnelSettings::default(),
            cache_capacity: 150,
            log_batch_size: 50,
            log_flush_interval_ms: 500,
            drain_backoff_ms: 10,
            log_retention_days: 7,
            auto_start: true,
            self_identifier: "netwarden".to_string(),
            prune_uninstalled: true,
            rules_poll_secs: 2,
            network_poll_secs: 2,
            min_user_uid: 1000,
            apps: Vec::new(),
        }
    }
}

impl Config {
    /// Load from the first configured location; a missing file yields defaults
    pub fn load(explicit: Option<&Path>) -> Result<Self> {
        match Self::config_path(explicit) {
            Some(path) if path.exists() => Self::from_file(&path),
            Some(path) => {
                debug!("No config file at {}, using defaults", path.display());
                Ok(Self::default())
            }
            None => Ok(Self::default()),
        }
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config = serde_json::from_str::<Config>(&content)
            .map_err(|e| NetwardenError::InvalidConfig(format!("{}: {}", path.display(), e)))?;
        config.validate()?;
        info!("Loaded config from {}", path.display());
        Ok(config)
    }

    /// `explicit`, then `NETWARDEN_CONFIG`, then the user config dir
    pub fn config_path(explicit: Option<&Path>) -> Option<PathBuf> {
        if let Some(path) = explicit {
            return Some(path.to_path_buf());
        }
        if let Ok(path) = std::env::var(CONFIG_ENV) {
            return Some(PathBuf::from(path));
        }
        dirs::config_dir().map(|dir| dir.join("netwarden").join("config.json"))
    }

    pub fn database_path(&self) -> PathBuf {
        if let Some(path) = &self.database {
            return path.clone();
        }
        std::env::var(DB_ENV).map(PathBuf::from).unwrap_or_else(|_| {
            dirs::data_local_dir()
                .unwrap_or_else(|| PathBuf::from("."))
                .join("netwarden")
                .join("netwarden.db")
        })
    }

    pub fn validate(&self) -> Result<()> {
        if self.tunnel.mtu < 576 {
            return Err(NetwardenError::InvalidConfig(format!(
                "tunnel mtu {} is below the IPv4 minimum of 576",
                self.tunnel.mtu
            )));
        }
        if self.cache_capacity == 0 {
            return Err(NetwardenError::InvalidConfig("cache_capacity must be positive".into()));
        }
        if self.log_batch_size == 0 {
            return Err(NetwardenError::InvalidConfig("log_batch_size must be positive".into()));
        }
        if self.tunnel.name.is_empty() {
            return Err(NetwardenError::InvalidConfig("tunnel name must not be empty".into()));
        }
        Ok(())
    }

    pub fn log_flush_interval(&self) -> Duration {
        Duration::from_millis(self.log_flush_interval_ms)
    }

    pub fn drain_backoff(&self) -> Duration {
        Duration::from_millis(self.drain_backoff_ms)
    }

    pub fn rules_poll_interval(&self) -> Duration {
        Duration::from_secs(self.rules_poll_secs.max(1))
    }

    pub fn network_poll_interval(&self) -> Duration {
        Duration::from_secs(self.network_poll_secs.max(1))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_match_documented_values() {
        let config = Config::default();
        assert_eq!(config.tunnel.mtu, 1500);
        assert_eq!(config.tunnel.address_v4.to_string(), "10.0.0.2");
        assert_eq!(config.tunnel.address_v6.to_string(), "fd00:1:fd00:1:fd00:1:fd00:1");
        assert_eq!(config.tunnel.dns_servers.len(), 2);
        assert_eq!(config.cache_capacity, 150);
        assert_eq!(config.log_batch_size, 50);
        assert_eq!(config.log_flush_interval(), Duration::from_millis(500));
        assert_eq!(config.drain_backoff(), Duration::from_millis(10));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_partial_file_keeps_defaults() {
        let json = r#"{
            "auto_start": false,
            "tunnel": { "name": "fw0" },
            "apps": [{ "identifier": "svc.backup", "uid": 2001 }]
        }"#;
        let config: Config = serde_json::from_str(json).unwrap();

        assert!(!config.auto_start);
        assert_eq!(config.tunnel.name, "fw0");
        assert_eq!(config.tunnel.mtu, 1500);
        assert_eq!(config.log_retention_days, 7);

        let app = InstalledApp::from(&config.apps[0]);
        assert_eq!(app.display_name, "svc.backup");
        assert_eq!(app.uid, 2001);
        assert!(!app.is_system);
    }

    #[test]
    fn test_malformed_file_reports_path() {
        let dir = std::env::temp_dir().join(format!("netwarden-config-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("config.json");
        std::fs::write(&path, "{ not json").unwrap();

        let err = Config::load(Some(&path)).unwrap_err();
        assert!(err.to_string().contains("config.json"));

        std::fs::remove_dir_all(&dir).unwrap();
    }

    #[test]
    fn test_missing_explicit_file_means_defaults() {
        let path = std::env::temp_dir().join("netwarden-does-not-exist.json");
        let config = Config::load(Some(&path)).unwrap();
        assert_eq!(config.self_identifier, "netwarden");
    }

    #[test]
    fn test_explicit_database_path_wins() {
        let config = Config {
            database: Some(PathBuf::from("/tmp/rules.db")),
            ..Config::default()
        };
        assert_eq!(config.database_path(), PathBuf::from("/tmp/rules.db"));
    }

    #[test]
    fn test_validate_rejects_zero_capacity() {
        let config = Config {
            cache_capacity: 0,
            ..Config::default()
        };
        assert!(matches!(config.validate(), Err(NetwardenError::InvalidConfig(_))));
    }
}
