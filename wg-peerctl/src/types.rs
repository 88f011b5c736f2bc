// Configuration types

//! Shared data structures
//!
//! Configuration structures deserialized from the TOML config file.

use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Main configuration structure
#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    /// Files, interface and timing
    pub general: GeneralConfig,
    /// External binaries and scripts
    #[serde(default)]
    pub tools: ToolsConfig,
    /// Operator notification hook
    #[serde(default)]
    pub notify: NotifyConfig,
}

/// General configuration options
#[derive(Debug, Deserialize, Clone)]
pub struct GeneralConfig {
    /// WireGuard config holding the peer blocks
    pub wg_config_file: PathBuf,
    /// Interface name; defaults to the config file stem (`wg0.conf` -> `wg0`)
    #[serde(default)]
    pub interface: Option<String>,
    /// Public endpoint handed to the provisioning script
    pub endpoint: String,
    /// JSON expiration ledger
    #[serde(default = "default_expirations_file")]
    pub expirations_file: PathBuf,
    /// env_logger filter used when `RUST_LOG` is unset
    #[serde(default = "default_log_level")]
    pub log_level: String,
    /// Seconds an external command may run
    #[serde(default = "default_command_timeout")]
    pub command_timeout: u64,
    /// Seconds between ledger resyncs in the daemon
    #[serde(default = "default_resync_interval")]
    pub resync_interval: u64,
    /// Seconds since the latest handshake for a peer to count as online
    #[serde(default = "default_online_threshold")]
    pub online_threshold: u64,
}

impl GeneralConfig {
    /// Interface to reload and query
    pub fn interface_name(&self) -> String {
        if let Some(name) = &self.interface {
            return name.clone();
        }
        interface_from_path(&self.wg_config_file)
    }

    /// `command_timeout` as a Duration
    pub fn command_timeout(&self) -> Duration {
        Duration::from_secs(self.command_timeout)
    }

    /// `resync_interval` as a Duration
    pub fn resync_interval(&self) -> Duration {
        Duration::from_secs(self.resync_interval)
    }

    /// `online_threshold` as a Duration
    pub fn online_threshold(&self) -> Duration {
        Duration::from_secs(self.online_threshold)
    }
}

/// `/etc/wireguard/wg0.conf` -> `wg0`
fn interface_from_path(path: &Path) -> String {
    path.file_name()
        .map(|name| name.to_string_lossy())
        .and_then(|name| name.split('.').next().map(str::to_string))
        .unwrap_or_default()
}

/// Where live session data comes from
#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum StatusSource {
    /// Parse `wg show <iface>` output
    #[default]
    Command,
    /// Query the kernel over netlink
    Kernel,
}

/// External tools
#[derive(Debug, Deserialize, Clone)]
pub struct ToolsConfig {
    /// `wg` binary (or `awg` for AmneziaWG)
    #[serde(default = "default_wg")]
    pub wg: String,
    /// `wg-quick` binary (or `awg-quick`)
    #[serde(default = "default_wg_quick")]
    pub wg_quick: String,
    /// Provisioning script creating a peer
    #[serde(default = "default_add_script")]
    pub add_script: String,
    /// Provisioning script deleting a peer
    #[serde(default = "default_remove_script")]
    pub remove_script: String,
    /// Where live session data comes from
    #[serde(default)]
    pub status_source: StatusSource,
}

impl Default for ToolsConfig {
    fn default() -> Self {
        Self {
            wg: default_wg(),
            wg_quick: default_wg_quick(),
            add_script: default_add_script(),
            remove_script: default_remove_script(),
            status_source: StatusSource::default(),
        }
    }
}

/// Operator notification hook
#[derive(Debug, Deserialize, Clone, Default)]
pub struct NotifyConfig {
    /// Command receiving each notification as its only argument
    #[serde(default)]
    pub command: Option<String>,
}

// Default values for configuration
fn default_expirations_file() -> PathBuf {
    PathBuf::from("/var/lib/wg-peerctl/expirations.json")
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_command_timeout() -> u64 {
    30
}

fn default_resync_interval() -> u64 {
    30
}

fn default_online_threshold() -> u64 {
    5 * 24 * 3600 // 5 days
}

fn default_wg() -> String {
    "wg".to_string()
}

fn default_wg_quick() -> String {
    "wg-quick".to_string()
}

fn default_add_script() -> String {
    "./newclient.sh".to_string()
}

fn default_remove_script() -> String {
    "./removeclient.sh".to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_minimal_config_defaults() {
        let config: Config = toml::from_str(
            r#"
            [general]
            wg_config_file = "/etc/wireguard/wg0.conf"
            endpoint = "203.0.113.10"
            "#,
        )
        .unwrap();

        assert_eq!(config.general.interface_name(), "wg0");
        assert_eq!(config.general.command_timeout(), Duration::from_secs(30));
        assert_eq!(config.general.online_threshold(), Duration::from_secs(432000));
        assert_eq!(config.general.log_level, "info");
        assert_eq!(config.tools.wg, "wg");
        assert_eq!(config.tools.wg_quick, "wg-quick");
        assert_eq!(config.tools.status_source, StatusSource::Command);
        assert!(config.notify.command.is_none());
    }

    #[test]
    fn test_full_config() {
        let config: Config = toml::from_str(
            r#"
            [general]
            wg_config_file = "/etc/amnezia/amneziawg/awg0.conf"
            interface = "awg0"
            endpoint = "vpn.example.com"
            expirations_file = "/tmp/exp.json"
            resync_interval = 10

            [tools]
            wg = "awg"
            wg_quick = "awg-quick"
            status_source = "kernel"

            [notify]
            command = "/usr/local/bin/notify-admin"
            "#,
        )
        .unwrap();

        assert_eq!(config.general.interface_name(), "awg0");
        assert_eq!(config.general.resync_interval(), Duration::from_secs(10));
        assert_eq!(config.tools.wg, "awg");
        assert_eq!(config.tools.add_script, "./newclient.sh");
        assert_eq!(config.tools.status_source, StatusSource::Kernel);
        assert_eq!(
            config.notify.command.as_deref(),
            Some("/usr/local/bin/notify-admin")
        );
    }

    #[test]
    fn test_interface_from_path() {
        assert_eq!(interface_from_path(Path::new("/etc/wireguard/wg0.conf")), "wg0");
        assert_eq!(interface_from_path(Path::new("wg1")), "wg1");
        assert_eq!(interface_from_path(Path::new("/")), "");
    }
}
