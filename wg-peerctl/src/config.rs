// Configuration file parser

//! Configuration file parsing and validation
//!
//! This module handles loading the TOML configuration file and validating its
//! contents, plus the name checks applied to anything that ends up on an
//! external command line.

use crate::error::{PeerError, Result as PeerResult};
use crate::types::Config;
use anyhow::{Context, Result};
use std::fs;
use std::path::Path;

/// Validates that a name is safe to use as a command argument and block label.
/// Only allows alphanumeric characters, hyphens, and underscores to prevent command injection.
fn validate_name(name: &str, field: &'static str) -> PeerResult<()> {
    if name.is_empty()
        || !name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
    {
        return Err(PeerError::InvalidName {
            field,
            value: name.to_string(),
        });
    }

    Ok(())
}

/// Validate a peer username
///
/// # Errors
///
/// Returns [`PeerError::InvalidName`] if the name is empty or contains
/// anything besides ASCII alphanumerics, hyphens, and underscores.
pub fn validate_username(name: &str) -> PeerResult<()> {
    validate_name(name, "Username")
}

/// Validate a WireGuard interface name
pub fn validate_interface_name(name: &str) -> PeerResult<()> {
    validate_name(name, "Interface name")
}

/// Load configuration from TOML file
pub fn load_config<P: AsRef<Path>>(path: P) -> Result<Config> {
    let contents = fs::read_to_string(path.as_ref()).context("Failed to read config file")?;

    let config: Config = toml::from_str(&contents).context("Failed to parse config file")?;

    validate_config(&config)?;
    Ok(config)
}

/// Validate configuration values
fn validate_config(config: &Config) -> Result<()> {
    if config.general.wg_config_file.as_os_str().is_empty() {
        anyhow::bail!("wg_config_file cannot be empty");
    }

    if config.general.expirations_file.as_os_str().is_empty() {
        anyhow::bail!("expirations_file cannot be empty");
    }

    if config.general.endpoint.trim().is_empty() {
        anyhow::bail!("endpoint cannot be empty");
    }

    validate_interface_name(&config.general.interface_name())
        .context("Invalid WireGuard interface")?;

    if config.general.command_timeout == 0 {
        anyhow::bail!("command_timeout must be > 0");
    }

    if config.general.resync_interval == 0 {
        anyhow::bail!("resync_interval must be > 0");
    }

    for (field, value) in [
        ("tools.wg", &config.tools.wg),
        ("tools.wg_quick", &config.tools.wg_quick),
        ("tools.add_script", &config.tools.add_script),
        ("tools.remove_script", &config.tools.remove_script),
    ] {
        if value.trim().is_empty() {
            anyhow::bail!("{} cannot be empty", field);
        }
    }

    Ok(())
}
