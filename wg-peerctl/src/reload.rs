// WireGuard interface reload

//! Interface reload protocol
//!
//! Applies an edited config to the running interface without bouncing it:
//! `wg-quick strip <iface>` renders the config in `wg` syntax, the output is
//! written to a private temporary file and `wg syncconf <iface> <file>`
//! reconciles the kernel peer table with it. Peers whose lines did not change
//! keep their sessions.

use crate::command;
use crate::config::validate_interface_name;
use crate::error::{PeerError, Result};
use std::ffi::OsStr;
use std::future::Future;
use std::io::Write;
use std::path::PathBuf;
use std::time::Duration;
use tempfile::NamedTempFile;

/// Something that can push the on-disk config to the live interface
pub trait Reload {
    /// Apply the current config file to the running interface
    fn reload(&self) -> impl Future<Output = Result<()>> + Send;
}

/// Reloads a WireGuard (or AmneziaWG) interface with strip + syncconf
#[derive(Debug, Clone)]
pub struct WgReloader {
    interface: String,
    wg: String,
    wg_quick: String,
    timeout: Duration,
    temp_dir: Option<PathBuf>,
}

impl WgReloader {
    /// Create a reloader for `interface`
    ///
    /// # Errors
    ///
    /// Returns an error if the interface name contains characters other than
    /// alphanumerics, hyphens, and underscores.
    pub fn new(interface: String, wg: String, wg_quick: String, timeout: Duration) -> Result<Self> {
        validate_interface_name(&interface)?;

        Ok(Self {
            interface,
            wg,
            wg_quick,
            timeout,
            temp_dir: None,
        })
    }

    /// Place the intermediate config in `dir` instead of the system temp dir
    pub fn with_temp_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.temp_dir = Some(dir.into());
        self
    }

    /// Get the interface name
    pub fn interface(&self) -> &str {
        &self.interface
    }

    /// Render the interface config in the format `wg syncconf` accepts
    pub async fn strip(&self) -> Result<Vec<u8>> {
        let output = command::run(
            &self.wg_quick,
            &["strip", self.interface.as_str()],
            self.timeout,
        )
        .await?;
        Ok(output.stdout)
    }

    /// Reconcile the live peer table with `stripped`
    ///
    /// The temporary file is removed when this returns, whatever the outcome.
    pub async fn sync_config(&self, stripped: &[u8]) -> Result<()> {
        let dir = self.temp_dir.clone().unwrap_or_else(std::env::temp_dir);
        let mut tmp = NamedTempFile::new_in(&dir)
            .map_err(|e| PeerError::io("Failed to create temporary config", &dir, e))?;
        tmp.write_all(stripped)
            .and_then(|_| tmp.flush())
            .map_err(|e| PeerError::io("Failed to write temporary config", tmp.path(), e))?;

        let args = [
            OsStr::new("syncconf"),
            OsStr::new(&self.interface),
            tmp.path().as_os_str(),
        ];
        command::run(&self.wg, &args, self.timeout).await?;

        Ok(())
    }
}

impl Reload for WgReloader {
    async fn reload(&self) -> Result<()> {
        log::info!("Reloading WireGuard interface: {}", self.interface);

        let stripped = self.strip().await?;
        self.sync_config(&stripped).await?;

        log::info!("WireGuard interface {} reloaded", self.interface);
        Ok(())
    }
}
