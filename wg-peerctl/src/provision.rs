// Peer provisioning scripts

//! Creation and deletion of peers
//!
//! Key generation, address allocation and client config rendering belong to
//! external scripts. They edit the WireGuard config in place; the exit status
//! is the only result.

use crate::command;
use crate::error::Result;
use std::ffi::OsStr;
use std::future::Future;
use std::path::Path;
use std::time::Duration;

/// Something that can create and delete peer blocks in the config
pub trait Provision {
    /// Generate keys and addresses for `username` and append its block to `config`
    fn add_peer(
        &self,
        username: &str,
        endpoint: &str,
        config: &Path,
        ipv6: bool,
    ) -> impl Future<Output = Result<()>> + Send;

    /// Delete the block and client artifacts of `username`
    fn remove_peer(&self, username: &str, config: &Path)
        -> impl Future<Output = Result<()>> + Send;
}

/// Runs the configured add/remove scripts
#[derive(Debug, Clone)]
pub struct ScriptProvisioner {
    add_script: String,
    remove_script: String,
    timeout: Duration,
}

impl ScriptProvisioner {
    /// Provisioner running the given add and remove scripts with `timeout`
    pub fn new(add_script: String, remove_script: String, timeout: Duration) -> Self {
        Self {
            add_script,
            remove_script,
            timeout,
        }
    }
}

impl Provision for ScriptProvisioner {
    async fn add_peer(&self, username: &str, endpoint: &str, config: &Path, ipv6: bool) -> Result<()> {
        let mut args = vec![
            OsStr::new(username),
            OsStr::new(endpoint),
            config.as_os_str(),
        ];
        if ipv6 {
            args.push(OsStr::new("ipv6"));
        }

        command::run(&self.add_script, &args, self.timeout).await?;
        log::info!("Provisioned peer {}", username);
        Ok(())
    }

    async fn remove_peer(&self, username: &str, config: &Path) -> Result<()> {
        let args = [OsStr::new(username), config.as_os_str()];

        command::run(&self.remove_script, &args, self.timeout).await?;
        log::info!("Deprovisioned peer {}", username);
        Ok(())
    }
}
