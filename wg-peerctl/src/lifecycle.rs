// Peer lifecycle manager

//! Add, block, unblock, remove and expire peers
//!
//! Every mutation follows the same order: validate the username, take the
//! lifecycle lock, change the config file, then reload the interface. The lock
//! is an in-process mutex plus an advisory lock on `<config>.lock`, so the
//! daemon and CLI invocations never interleave their whole-file rewrites. It
//! covers the reload and any rollback too.
//!
//! Block and unblock keep the previous config text and restore it when the
//! reload fails. Add and remove go through the provisioning scripts, which
//! cannot be undone from here, so a failed reload after them is reported with
//! `rolled_back = false`.

use crate::config::validate_username;
use crate::error::{PeerError, Result};
use crate::ledger::{ExpirationLedger, Expiry};
use crate::peer_store::{Peer, PeerState, PeerStore};
use crate::provision::Provision;
use crate::reload::Reload;
use crate::session::{SessionObserver, SessionSnapshot};
use crate::state_file::FileLock;
use chrono::{DateTime, Utc};
use tokio::sync::{Mutex, MutexGuard};

/// Result of [`PeerLifecycle::expire`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExpireOutcome {
    /// The peer was blocked and its record dropped
    Deactivated,
    /// The peer no longer exists; only the stale record was dropped
    AlreadyRemoved,
}

/// Proof that the caller owns the config and ledger for one operation
struct Exclusive<'a> {
    _local: MutexGuard<'a, ()>,
    _file: FileLock,
}

/// Facade over the config store, the expiration ledger and the interface
pub struct PeerLifecycle<R, P> {
    store: PeerStore,
    ledger: ExpirationLedger,
    reloader: R,
    provisioner: P,
    observer: SessionObserver,
    endpoint: String,
    lock: Mutex<()>,
}

impl<R: Reload, P: Provision> PeerLifecycle<R, P> {
    /// Assemble a lifecycle from its collaborators
    pub fn new(
        store: PeerStore,
        ledger: ExpirationLedger,
        reloader: R,
        provisioner: P,
        observer: SessionObserver,
        endpoint: String,
    ) -> Self {
        Self {
            store,
            ledger,
            reloader,
            provisioner,
            observer,
            endpoint,
            lock: Mutex::new(()),
        }
    }

    /// Config store the lifecycle mutates
    pub fn store(&self) -> &PeerStore {
        &self.store
    }

    /// Expiration records of every peer
    pub fn ledger(&self) -> &ExpirationLedger {
        &self.ledger
    }

    #[cfg(test)]
    pub(crate) fn reloader(&self) -> &R {
        &self.reloader
    }

    /// Create a peer through the provisioning script and record its grant
    ///
    /// `ipv6` defaults to whether the interface has an IPv6 address.
    /// `expires_at = None` means the peer never expires.
    pub async fn add(
        &self,
        username: &str,
        ipv6: Option<bool>,
        expires_at: Option<DateTime<Utc>>,
    ) -> Result<()> {
        validate_username(username)?;
        let _guard = self.exclusive().await?;

        let config = self.store.load()?;
        if config.status(username).is_some() {
            return Err(PeerError::AlreadyExists(username.to_string()));
        }
        let ipv6 = ipv6.unwrap_or_else(|| config.ipv6_subnet().is_some());

        self.provisioner
            .add_peer(username, &self.endpoint, self.store.path(), ipv6)
            .await?;

        if self.store.status(username)?.is_none() {
            log::error!("Provisioning reported success but no block for {} was written", username);
            return Err(PeerError::NotFound(username.to_string()));
        }

        self.ledger.set(username, expires_at)?;
        match expires_at {
            Some(at) => log::info!("Peer {} added, expires at {}", username, at),
            None => log::info!("Peer {} added without expiration", username),
        }

        self.reload_unrecoverable(username).await
    }

    /// Disable a peer; a no-op if it is already disabled
    pub async fn block(&self, username: &str) -> Result<()> {
        validate_username(username)?;
        let _guard = self.exclusive().await?;
        self.set_blocked_locked(username, true).await
    }

    /// Re-enable a disabled peer
    pub async fn unblock(&self, username: &str) -> Result<()> {
        validate_username(username)?;
        let _guard = self.exclusive().await?;
        self.set_blocked_locked(username, false).await
    }

    /// Delete a peer and its expiration record
    pub async fn remove(&self, username: &str) -> Result<()> {
        validate_username(username)?;
        let _guard = self.exclusive().await?;

        if self.store.status(username)?.is_none() {
            return Err(PeerError::NotFound(username.to_string()));
        }

        self.provisioner
            .remove_peer(username, self.store.path())
            .await?;
        if self.ledger.remove(username)? {
            log::info!("Dropped expiration record of {}", username);
        }
        log::info!("Peer {} removed", username);

        self.reload_unrecoverable(username).await
    }

    /// Deactivate a peer whose grant ran out
    ///
    /// A peer that is already gone counts as done. The ledger record is only
    /// dropped once the interface no longer accepts the peer.
    pub async fn expire(&self, username: &str) -> Result<ExpireOutcome> {
        validate_username(username)?;
        let _guard = self.exclusive().await?;
        self.expire_locked(username).await
    }

    async fn expire_locked(&self, username: &str) -> Result<ExpireOutcome> {
        let outcome = match self.store.status(username)? {
            None => {
                log::warn!("Expired peer {} is not in the config any more", username);
                ExpireOutcome::AlreadyRemoved
            }
            Some(_) => {
                self.set_blocked_locked(username, true).await?;
                ExpireOutcome::Deactivated
            }
        };

        self.ledger.remove(username)?;
        Ok(outcome)
    }

    /// Set a new expiration for an existing peer
    ///
    /// An instant at or before `now` deactivates the peer right away and
    /// returns the outcome.
    pub async fn set_expiration(
        &self,
        username: &str,
        expires_at: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<Option<ExpireOutcome>> {
        validate_username(username)?;
        let _guard = self.exclusive().await?;
        if self.store.status(username)?.is_none() {
            return Err(PeerError::NotFound(username.to_string()));
        }

        if expires_at <= now {
            log::info!("Expiration of {} is already due, deactivating", username);
            return self.expire_locked(username).await.map(Some);
        }

        self.ledger.set(username, Some(expires_at))?;
        log::info!("Peer {} now expires at {}", username, expires_at);
        Ok(None)
    }

    /// Make a peer's access unlimited
    pub async fn clear_expiration(&self, username: &str) -> Result<()> {
        validate_username(username)?;
        let _guard = self.exclusive().await?;
        if self.store.status(username)?.is_none() {
            return Err(PeerError::NotFound(username.to_string()));
        }
        self.ledger.set(username, None)?;
        log::info!("Peer {} no longer expires", username);
        Ok(())
    }

    /// `None` if the user has no record
    pub fn get_expiration(&self, username: &str) -> Option<Expiry> {
        self.ledger.get(username)
    }

    /// All peers in config order
    pub fn list_peers(&self) -> Result<Vec<Peer>> {
        self.store.list_peers()
    }

    /// One peer, `None` if it does not exist
    pub fn peer(&self, username: &str) -> Result<Option<Peer>> {
        validate_username(username)?;
        Ok(self.store.load()?.peer(username))
    }

    /// `None` if the peer does not exist
    pub fn status(&self, username: &str) -> Result<Option<PeerState>> {
        validate_username(username)?;
        self.store.status(username)
    }

    /// Live sessions of configured peers
    pub async fn list_sessions(&self) -> Result<Vec<SessionSnapshot>> {
        let key_map = self.store.load()?.key_map();
        self.observer.sessions(&key_map).await
    }

    /// Take the in-process lock, then the cross-process one
    async fn exclusive(&self) -> Result<Exclusive<'_>> {
        let local = self.lock.lock().await;
        let file = FileLock::acquire_async(self.store.path()).await?;
        Ok(Exclusive {
            _local: local,
            _file: file,
        })
    }

    /// Toggle a block and reload, restoring the old text if the reload fails
    ///
    /// Caller must hold the lifecycle lock.
    async fn set_blocked_locked(&self, username: &str, blocked: bool) -> Result<()> {
        let mutation = self.store.set_blocked(username, blocked)?;
        if !mutation.changed {
            return Ok(());
        }

        let Err(e) = self.reloader.reload().await else {
            return Ok(());
        };

        let rolled_back = match self.store.write_text(&mutation.previous) {
            Ok(()) => {
                log::warn!("Reload failed, restored previous config for {}", username);
                true
            }
            Err(restore) => {
                log::error!("Reload failed and config for {} could not be restored: {}", username, restore);
                false
            }
        };

        Err(PeerError::PartialApply {
            username: username.to_string(),
            rolled_back,
            source: Box::new(e),
        })
    }

    /// Reload after a change that cannot be rolled back
    async fn reload_unrecoverable(&self, username: &str) -> Result<()> {
        self.reloader.reload().await.map_err(|e| PeerError::PartialApply {
            username: username.to_string(),
            rolled_back: false,
            source: Box::new(e),
        })
    }
}

/// In-process stand-ins for the interface and the provisioning scripts
#[cfg(test)]
pub(crate) mod fakes {
    use super::*;
    use crate::types::StatusSource;
    use std::path::Path;
    use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
    use std::time::Duration;

    #[derive(Default)]
    pub struct FakeReloader {
        pub calls: AtomicUsize,
        pub fail: AtomicBool,
        pub delay_ms: AtomicU64,
    }

    impl FakeReloader {
        pub fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }

        pub fn set_fail(&self, fail: bool) {
            self.fail.store(fail, Ordering::SeqCst);
        }

        /// Make every reload take `delay` before it completes
        pub fn set_delay(&self, delay: Duration) {
            self.delay_ms.store(delay.as_millis() as u64, Ordering::SeqCst);
        }
    }

    impl Reload for FakeReloader {
        async fn reload(&self) -> Result<()> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let delay = self.delay_ms.load(Ordering::SeqCst);
            if delay > 0 {
                tokio::time::sleep(Duration::from_millis(delay)).await;
            }
            if self.fail.load(Ordering::SeqCst) {
                return Err(PeerError::CommandFailed {
                    command: "wg syncconf wg0".to_string(),
                    status: "exit status: 1".to_string(),
                    stderr: "Unable to modify interface".to_string(),
                });
            }
            Ok(())
        }
    }

    /// Appends and deletes blocks the way the provisioning scripts do
    #[derive(Default)]
    pub struct FakeProvisioner {
        pub added: std::sync::Mutex<Vec<(String, bool)>>,
    }

    impl Provision for FakeProvisioner {
        async fn add_peer(&self, username: &str, _endpoint: &str, config: &Path, ipv6: bool) -> Result<()> {
            let mut text = std::fs::read_to_string(config).unwrap();
            text.push_str(&format!(
                "\n# BEGIN_PEER {u}\n[Peer]\nPublicKey = PK_{u}\nAllowedIPs = 10.7.0.9/32\n# END_PEER {u}\n",
                u = username
            ));
            std::fs::write(config, text).unwrap();
            self.added
                .lock()
                .unwrap()
                .push((username.to_string(), ipv6));
            Ok(())
        }

        async fn remove_peer(&self, username: &str, config: &Path) -> Result<()> {
            let text = std::fs::read_to_string(config).unwrap();
            let begin = format!("# BEGIN_PEER {}", username);
            let end = format!("# END_PEER {}", username);
            let mut inside = false;
            let kept: String = text
                .split_inclusive('\n')
                .filter(|line| {
                    if line.trim_end() == begin {
                        inside = true;
                        return false;
                    }
                    if line.trim_end() == end {
                        inside = false;
                        return false;
                    }
                    !inside
                })
                .collect();
            std::fs::write(config, kept).unwrap();
            Ok(())
        }
    }

    pub const CONFIG: &str = "\
[Interface]
Address = 10.7.0.1/24, fddd:2c4:2c4:2c4::1/64
PrivateKey = SERVER
ListenPort = 51820

# BEGIN_PEER alice
[Peer]
PublicKey = KA
AllowedIPs = 10.7.0.2/32, fddd:2c4:2c4:2c4::2/128
# END_PEER alice

# BEGIN_PEER bob
[Peer]
PublicKey = KB
AllowedIPs = 10.7.0.3/32
# END_PEER bob
";

    pub type FakeLifecycle = PeerLifecycle<FakeReloader, FakeProvisioner>;

    /// Lifecycle over a scratch copy of [`CONFIG`]
    pub fn lifecycle(dir: &Path) -> FakeLifecycle {
        std::fs::write(dir.join("wg0.conf"), CONFIG).unwrap();
        open_lifecycle(dir)
    }

    /// Another lifecycle over the files already in `dir`, like a second process
    pub fn open_lifecycle(dir: &Path) -> FakeLifecycle {
        PeerLifecycle::new(
            PeerStore::new(dir.join("wg0.conf")),
            ExpirationLedger::new(dir.join("expirations.json")),
            FakeReloader::default(),
            FakeProvisioner::default(),
            SessionObserver::new(
                "wg0".to_string(),
                "echo".to_string(),
                Duration::from_secs(5),
                StatusSource::Command,
            ),
            "203.0.113.10".to_string(),
        )
    }
}
