// Configuration management for the meshrelay CLI
//
// Cross-platform config stored in:
// - macOS: ~/Library/Application Support/meshrelay/config.json
// - Linux: ~/.config/meshrelay/config.json
// - Windows: %APPDATA%\meshrelay\config.json

use anyhow::{Context, Result};
use meshrelay_core::NodeConfig;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

pub const DEFAULT_LISTEN_PORT: u16 = 7400;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Shared network passphrase (overridden by MESHRELAY_PASSPHRASE)
    pub passphrase: Option<String>,

    /// TCP port for incoming peer links
    pub listen_port: u16,

    /// Peers dialed on start, as host:port
    pub peers: Vec<String>,

    /// Storage path for identity and outbox
    pub storage_path: Option<String>,

    /// Optional JSON log file
    pub log_file: Option<String>,

    /// Routing and retry policy
    pub node: NodeConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            passphrase: None,
            listen_port: DEFAULT_LISTEN_PORT,
            peers: Vec::new(),
            storage_path: None,
            log_file: None,
            node: NodeConfig::default(),
        }
    }
}

impl Config {
    /// Get the config directory path (cross-platform)
    pub fn config_dir() -> Result<PathBuf> {
        let config_dir = dirs::config_dir()
            .context("Failed to determine config directory")?
            .join("meshrelay");

        std::fs::create_dir_all(&config_dir).context("Failed to create config directory")?;

        Ok(config_dir)
    }

    /// Get the data directory path (cross-platform)
    pub fn data_dir() -> Result<PathBuf> {
        let data_dir = dirs::data_local_dir()
            .context("Failed to determine data directory")?
            .join("meshrelay");

        std::fs::create_dir_all(&data_dir).context("Failed to create data directory")?;

        Ok(data_dir)
    }

    /// Get the config file path
    pub fn config_file() -> Result<PathBuf> {
        Ok(Self::config_dir()?.join("config.json"))
    }

    /// Load config from the default location, creating it if missing
    pub fn load() -> Result<Self> {
        Self::load_from(&Self::config_file()?)
    }

    /// Load config from `path`, or write and return the default
    pub fn load_from(path: &Path) -> Result<Self> {
        if path.exists() {
            let contents = std::fs::read_to_string(path).context("Failed to read config file")?;
            let config: Config =
                serde_json::from_str(&contents).context("Failed to parse config file")?;
            Ok(config)
        } else {
            let config = Config::default();
            config.save_to(path)?;
            Ok(config)
        }
    }

    /// Save config to the default location
    pub fn save(&self) -> Result<()> {
        self.save_to(&Self::config_file()?)
    }

    pub fn save_to(&self, path: &Path) -> Result<()> {
        let contents = serde_json::to_string_pretty(self).context("Failed to serialize config")?;
        std::fs::write(path, contents).context("Failed to write config file")?;
        Ok(())
    }

    /// Where the sled database lives
    pub fn storage_dir(&self) -> Result<PathBuf> {
        match &self.storage_path {
            Some(path) => Ok(PathBuf::from(path)),
            None => Ok(Self::data_dir()?.join("storage")),
        }
    }

    /// Passphrase from the environment, falling back to the config file
    pub fn resolve_passphrase(&self) -> Result<String> {
        if let Ok(passphrase) = std::env::var("MESHRELAY_PASSPHRASE") {
            if !passphrase.is_empty() {
                return Ok(passphrase);
            }
        }
        self.passphrase.clone().filter(|p| !p.is_empty()).context(
            "No network passphrase. Set MESHRELAY_PASSPHRASE or run: meshrelay config set passphrase <value>",
        )
    }

    /// Add a static peer address. Returns `false` if already present.
    pub fn add_peer(&mut self, address: String) -> bool {
        if self.peers.contains(&address) {
            return false;
        }
        self.peers.push(address);
        true
    }

    /// Remove a static peer address. Returns `false` if absent.
    pub fn remove_peer(&mut self, address: &str) -> bool {
        let before = self.peers.len();
        self.peers.retain(|p| p != address);
        self.peers.len() != before
    }

    /// Set a config value
    pub fn set(&mut self, key: &str, value: &str) -> Result<()> {
        match key {
            "passphrase" => self.passphrase = non_empty(value),
            "listen_port" => {
                self.listen_port = value.parse().context("Invalid port number")?;
            }
            "storage_path" => self.storage_path = non_empty(value),
            "log_file" => self.log_file = non_empty(value),
            "device_id" => self.node.device_id = non_empty(value),
            "max_hops" => {
                self.node.max_hops = value.parse().context("Invalid number")?;
            }
            "ttl_secs" => {
                self.node.ttl_secs = value.parse().context("Invalid number")?;
            }
            "seen_capacity" => {
                self.node.seen_capacity = value.parse().context("Invalid number")?;
            }
            "retry_interval_secs" => {
                self.node.retry_interval_secs = value.parse().context("Invalid number")?;
            }
            "give_up_after_secs" => {
                self.node.give_up_after_secs = value.parse().context("Invalid number")?;
            }
            "delivered_retention_secs" => {
                self.node.delivered_retention_secs = value.parse().context("Invalid number")?;
            }
            "auto_read" => {
                self.node.auto_read = value.parse().context("Invalid boolean value")?;
            }
            _ => anyhow::bail!("Unknown config key: {}", key),
        }
        self.node
            .validate()
            .map_err(|e| anyhow::anyhow!("Invalid value for {}: {}", key, e))?;
        Ok(())
    }

    /// Get a config value
    pub fn get(&self, key: &str) -> Option<String> {
        match key {
            "passphrase" => self.passphrase.as_ref().map(|_| "(set)".to_string()),
            "listen_port" => Some(self.listen_port.to_string()),
            "storage_path" => self.storage_path.clone(),
            "log_file" => self.log_file.clone(),
            "device_id" => self.node.device_id.clone(),
            "max_hops" => Some(self.node.max_hops.to_string()),
            "ttl_secs" => Some(self.node.ttl_secs.to_string()),
            "seen_capacity" => Some(self.node.seen_capacity.to_string()),
            "retry_interval_secs" => Some(self.node.retry_interval_secs.to_string()),
            "give_up_after_secs" => Some(self.node.give_up_after_secs.to_string()),
            "delivered_retention_secs" => Some(self.node.delivered_retention_secs.to_string()),
            "auto_read" => Some(self.node.auto_read.to_string()),
            _ => None,
        }
    }

    /// List all config values
    pub fn list(&self) -> Vec<(String, String)> {
        let unset = || "(unset)".to_string();
        vec![
            (
                "passphrase".to_string(),
                self.get("passphrase").unwrap_or_else(unset),
            ),
            ("listen_port".to_string(), self.listen_port.to_string()),
            (
                "storage_path".to_string(),
                self.storage_path.clone().unwrap_or_else(|| "(auto)".to_string()),
            ),
            ("log_file".to_string(), self.log_file.clone().unwrap_or_else(unset)),
            (
                "device_id".to_string(),
                self.node.device_id.clone().unwrap_or_else(|| "(generated)".to_string()),
            ),
            ("max_hops".to_string(), self.node.max_hops.to_string()),
            ("ttl_secs".to_string(), format!("{}s", self.node.ttl_secs)),
            ("seen_capacity".to_string(), self.node.seen_capacity.to_string()),
            (
                "retry_interval_secs".to_string(),
                format!("{}s", self.node.retry_interval_secs),
            ),
            (
                "give_up_after_secs".to_string(),
                format!("{}s", self.node.give_up_after_secs),
            ),
            (
                "delivered_retention_secs".to_string(),
                format!("{}s", self.node.delivered_retention_secs),
            ),
            ("auto_read".to_string(), self.node.auto_read.to_string()),
            ("peers".to_string(), self.peers.len().to_string()),
        ]
    }
}

fn non_empty(value: &str) -> Option<String> {
    if value.is_empty() {
        None
    } else {
        Some(value.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.listen_port, DEFAULT_LISTEN_PORT);
        assert!(config.peers.is_empty());
        assert_eq!(config.node, NodeConfig::default());
    }

    #[test]
    fn test_load_creates_and_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");

        let mut config = Config::load_from(&path).unwrap();
        assert!(path.exists());

        config.set("max_hops", "4").unwrap();
        config.set("auto_read", "false").unwrap();
        assert!(config.add_peer("127.0.0.1:7401".into()));
        assert!(!config.add_peer("127.0.0.1:7401".into()));
        config.save_to(&path).unwrap();

        let loaded = Config::load_from(&path).unwrap();
        assert_eq!(loaded, config);
        assert_eq!(loaded.get("max_hops").as_deref(), Some("4"));
    }

    #[test]
    fn test_set_rejects_bad_values() {
        let mut config = Config::default();
        assert!(config.set("listen_port", "not-a-port").is_err());
        assert!(config.set("no_such_key", "1").is_err());
        assert!(config.set("max_hops", "0").is_err());
    }

    #[test]
    fn test_passphrase_is_masked() {
        let mut config = Config::default();
        config.set("passphrase", "hunter2").unwrap();
        assert_eq!(config.get("passphrase").as_deref(), Some("(set)"));
        assert!(!config.remove_peer("nowhere"));
    }
}
