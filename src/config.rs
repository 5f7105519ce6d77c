//! Configuration loading and persistence.
//!
//! The hub library never reads configuration itself; the binary loads a
//! [`HubConfig`] and hands the values to the builder and the transport.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
#[cfg(unix)]
use std::os::unix::fs::PermissionsExt;
use std::path::Path;
use std::time::Duration;
use std::{fs, path::PathBuf};

const CONFIG_FILE: &str = "config.json";

/// Names of the four well-known channels, i.e. the WebSocket subprotocols
/// peers must ask for.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
#[serde(default)]
pub struct ChannelNames {
    /// External control tools.
    pub command: String,
    /// Status bar process.
    pub status: String,
    /// On-screen dialog process.
    pub dialog: String,
    /// Native applications.
    pub application: String,
}

impl Default for ChannelNames {
    fn default() -> Self {
        Self {
            command: "command".to_string(),
            status: "status".to_string(),
            dialog: "dialog".to_string(),
            application: "application".to_string(),
        }
    }
}

/// Configuration for the hub binary.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
#[serde(default)]
pub struct HubConfig {
    /// Address the WebSocket listener binds to.
    pub bind_address: String,
    /// Listener port.
    pub port: u16,
    /// Channel (subprotocol) names.
    pub channels: ChannelNames,
    /// Bound on the transport wait inside one service step. Zero because the
    /// event loop has already waited for readiness.
    pub service_timeout_ms: u64,
    /// How long the event loop sleeps when nothing is ready.
    pub idle_wait_ms: u64,
    /// Refuse a second session on an already bound channel instead of
    /// accepting it unrouted.
    pub reject_duplicate_connections: bool,
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            bind_address: "127.0.0.1".to_string(),
            port: 18630,
            channels: ChannelNames::default(),
            service_timeout_ms: 0,
            idle_wait_ms: 1000,
            reject_duplicate_connections: false,
        }
    }
}

impl HubConfig {
    /// Returns the configuration directory path.
    ///
    /// `HOMESCREEN_HUB_CONFIG_DIR` if set, otherwise the platform config
    /// directory (e.g. `~/.config/homescreen-hub`).
    pub fn config_dir() -> Result<PathBuf> {
        if let Ok(dir) = std::env::var("HOMESCREEN_HUB_CONFIG_DIR") {
            return Ok(PathBuf::from(dir));
        }
        Ok(dirs::config_dir()
            .context("Could not determine config directory")?
            .join("homescreen-hub"))
    }

    /// Loads configuration from file, with environment variable overrides.
    pub fn load() -> Result<Self> {
        let mut config = Self::load_from(&Self::config_dir()?)?;
        config.apply_overrides(|key| std::env::var(key).ok());
        Ok(config)
    }

    /// Loads `config.json` from `dir`. A missing file yields the defaults.
    pub fn load_from(dir: &Path) -> Result<Self> {
        let path = dir.join(CONFIG_FILE);
        if !path.exists() {
            return Ok(Self::default());
        }
        let content = fs::read_to_string(&path)
            .with_context(|| format!("Failed to read {}", path.display()))?;
        serde_json::from_str(&content).with_context(|| format!("Invalid config {}", path.display()))
    }

    /// Apply `HOMESCREEN_HUB_*` overrides looked up through `var`.
    /// Values that do not parse are ignored.
    pub fn apply_overrides(&mut self, var: impl Fn(&str) -> Option<String>) {
        if let Some(bind) = var("HOMESCREEN_HUB_BIND") {
            self.bind_address = bind;
        }

        if let Some(port) = var("HOMESCREEN_HUB_PORT") {
            if let Ok(port) = port.parse::<u16>() {
                self.port = port;
            }
        }

        if let Some(timeout) = var("HOMESCREEN_HUB_SERVICE_TIMEOUT_MS") {
            if let Ok(timeout) = timeout.parse::<u64>() {
                self.service_timeout_ms = timeout;
            }
        }

        if let Some(idle) = var("HOMESCREEN_HUB_IDLE_WAIT_MS") {
            if let Ok(idle) = idle.parse::<u64>() {
                self.idle_wait_ms = idle;
            }
        }

        if let Some(reject) = var("HOMESCREEN_HUB_REJECT_DUPLICATES") {
            match reject.as_str() {
                "1" | "true" | "yes" => self.reject_duplicate_connections = true,
                "0" | "false" | "no" => self.reject_duplicate_connections = false,
                _ => {}
            }
        }
    }

    /// Persists the configuration to the config directory.
    pub fn save(&self) -> Result<()> {
        self.save_to(&Self::config_dir()?)
    }

    /// Persists the configuration as `config.json` in `dir`, creating it.
    pub fn save_to(&self, dir: &Path) -> Result<()> {
        fs::create_dir_all(dir)?;
        let path = dir.join(CONFIG_FILE);
        fs::write(&path, serde_json::to_string_pretty(self)?)?;

        // Owner read/write only
        #[cfg(unix)]
        fs::set_permissions(&path, fs::Permissions::from_mode(0o600))?;

        Ok(())
    }

    /// `bind_address:port`.
    #[must_use]
    pub fn listen_addr(&self) -> String {
        format!("{}:{}", self.bind_address, self.port)
    }

    /// Wait bound for one service step.
    #[must_use]
    pub fn service_timeout(&self) -> Duration {
        Duration::from_millis(self.service_timeout_ms)
    }

    /// Event loop wait when idle.
    #[must_use]
    pub fn idle_wait(&self) -> Duration {
        Duration::from_millis(self.idle_wait_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_default_config() {
        let config = HubConfig::default();
        assert_eq!(config.bind_address, "127.0.0.1");
        assert_eq!(config.port, 18630);
        assert_eq!(config.channels.command, "command");
        assert_eq!(config.service_timeout(), Duration::ZERO);
        assert_eq!(config.idle_wait(), Duration::from_secs(1));
        assert!(!config.reject_duplicate_connections);
        assert_eq!(config.listen_addr(), "127.0.0.1:18630");
    }

    #[test]
    fn test_missing_file_gives_defaults() {
        let dir = tempfile::tempdir().unwrap();
        assert_eq!(HubConfig::load_from(dir.path()).unwrap(), HubConfig::default());
    }

    #[test]
    fn test_partial_file_fills_defaults() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(
            dir.path().join(CONFIG_FILE),
            r#"{"port": 9000, "channels": {"status": "statusbar"}}"#,
        )
        .unwrap();

        let config = HubConfig::load_from(dir.path()).unwrap();
        assert_eq!(config.port, 9000);
        assert_eq!(config.channels.status, "statusbar");
        assert_eq!(config.channels.dialog, "dialog");
        assert_eq!(config.bind_address, "127.0.0.1");
    }

    #[test]
    fn test_invalid_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join(CONFIG_FILE), "{ not json").unwrap();
        assert!(HubConfig::load_from(dir.path()).is_err());
    }

    #[test]
    fn test_save_round_trips_with_private_permissions() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("nested");
        let mut config = HubConfig::default();
        config.port = 4242;
        config.reject_duplicate_connections = true;
        config.save_to(&target).unwrap();

        assert_eq!(HubConfig::load_from(&target).unwrap(), config);
        #[cfg(unix)]
        {
            let mode = fs::metadata(target.join(CONFIG_FILE)).unwrap().permissions().mode();
            assert_eq!(mode & 0o777, 0o600);
        }
    }

    #[test]
    fn test_env_overrides() {
        let vars: HashMap<&str, &str> = [
            ("HOMESCREEN_HUB_BIND", "0.0.0.0"),
            ("HOMESCREEN_HUB_PORT", "not-a-port"),
            ("HOMESCREEN_HUB_SERVICE_TIMEOUT_MS", "5"),
            ("HOMESCREEN_HUB_IDLE_WAIT_MS", "250"),
            ("HOMESCREEN_HUB_REJECT_DUPLICATES", "true"),
        ]
        .into_iter()
        .collect();

        let mut config = HubConfig::default();
        config.apply_overrides(|key| vars.get(key).map(|v| (*v).to_string()));

        assert_eq!(config.bind_address, "0.0.0.0");
        assert_eq!(config.port, 18630);
        assert_eq!(config.service_timeout_ms, 5);
        assert_eq!(config.idle_wait_ms, 250);
        assert!(config.reject_duplicate_connections);
    }
}
