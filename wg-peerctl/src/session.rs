// Live session observer

//! Read-only view of connected peers
//!
//! Joins the peers declared in the config (public key -> username) with the
//! runtime state reported for the interface (public key -> handshake,
//! transfer, endpoint). Runtime data comes either from the human-readable
//! `wg show <iface>` output or straight from the kernel over netlink.

use crate::command;
use crate::error::{PeerError, Result};
use crate::types::StatusSource;
use std::collections::HashMap;
use std::time::{Duration, SystemTime};
use wireguard_control::{Backend, Device, InterfaceName};

/// Runtime state of one peer as reported for the interface
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RuntimePeer {
    /// Base64 public key
    pub public_key: String,
    /// Last known remote address
    pub endpoint: Option<String>,
    /// Time since the latest handshake
    pub latest_handshake: Option<Duration>,
    /// Bytes received from the peer
    pub rx_bytes: u64,
    /// Bytes sent to the peer
    pub tx_bytes: u64,
}

impl RuntimePeer {
    /// Peers that never completed a handshake or moved data have no session
    fn has_session(&self) -> bool {
        self.latest_handshake.is_some() || self.rx_bytes > 0 || self.tx_bytes > 0
    }
}

/// Live session of a configured peer
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionSnapshot {
    /// Owner of the peer block
    pub username: String,
    /// Time since the latest handshake, `None` if there was none
    pub latest_handshake: Option<Duration>,
    /// Bytes received from the peer
    pub rx_bytes: u64,
    /// Bytes sent to the peer
    pub tx_bytes: u64,
    /// Last known remote address
    pub endpoint: Option<String>,
}

impl SessionSnapshot {
    /// True if the peer completed a handshake within `threshold`
    pub fn is_online(&self, threshold: Duration) -> bool {
        self.latest_handshake.is_some_and(|age| age <= threshold)
    }
}

/// Parse a `wg show` age such as `1 day, 2 hours, 5 seconds ago`
pub fn parse_handshake_age(text: &str) -> Option<Duration> {
    let text = text.trim();
    if text.eq_ignore_ascii_case("now") {
        return Some(Duration::ZERO);
    }

    let text = text.strip_suffix("ago").unwrap_or(text);
    let mut total = 0u64;
    let mut matched = false;

    for part in text.split(',') {
        let mut words = part.split_whitespace();
        let (Some(value), Some(unit)) = (words.next(), words.next()) else {
            continue;
        };
        let Ok(value) = value.parse::<u64>() else {
            continue;
        };
        let seconds = match unit.trim_end_matches('s') {
            "year" => 365 * 24 * 3600,
            "day" => 24 * 3600,
            "hour" => 3600,
            "minute" => 60,
            "second" => 1,
            _ => continue,
        };
        total = total.saturating_add(value.saturating_mul(seconds));
        matched = true;
    }

    matched.then(|| Duration::from_secs(total))
}

/// Parse a `wg show` size such as `1.23 MiB`
fn parse_size(text: &str) -> Option<u64> {
    let mut words = text.split_whitespace();
    let value: f64 = words.next()?.parse().ok()?;
    let multiplier: f64 = match words.next()? {
        "B" => 1.0,
        "KiB" => 1024.0,
        "MiB" => 1024.0 * 1024.0,
        "GiB" => 1024.0 * 1024.0 * 1024.0,
        "TiB" => 1024.0 * 1024.0 * 1024.0 * 1024.0,
        _ => return None,
    };
    Some((value * multiplier).round() as u64)
}

/// Parse `1.23 MiB received, 4.56 MiB sent` into (rx, tx) bytes
pub fn parse_transfer(text: &str) -> Option<(u64, u64)> {
    let (received, sent) = text.split_once(',')?;
    let rx = parse_size(received.trim().strip_suffix("received")?)?;
    let tx = parse_size(sent.trim().strip_suffix("sent")?)?;
    Some((rx, tx))
}

/// Parse the human-readable `wg show <iface>` output
///
/// Only `peer:` sections are considered; unknown or malformed lines are
/// ignored.
pub fn parse_wg_show(output: &str) -> Vec<RuntimePeer> {
    let mut peers = Vec::new();
    let mut current: Option<RuntimePeer> = None;

    for line in output.lines() {
        let line = line.trim();
        let Some((key, value)) = line.split_once(':') else {
            continue;
        };
        let value = value.trim();

        match key {
            "peer" => {
                if let Some(done) = current.take() {
                    peers.push(done);
                }
                if !value.is_empty() {
                    current = Some(RuntimePeer {
                        public_key: value.to_string(),
                        ..Default::default()
                    });
                }
            }
            "interface" => {
                if let Some(done) = current.take() {
                    peers.push(done);
                }
            }
            _ => {
                let Some(peer) = current.as_mut() else {
                    continue;
                };
                match key {
                    "endpoint" => peer.endpoint = Some(value.to_string()),
                    "latest handshake" => peer.latest_handshake = parse_handshake_age(value),
                    "transfer" => {
                        if let Some((rx, tx)) = parse_transfer(value) {
                            peer.rx_bytes = rx;
                            peer.tx_bytes = tx;
                        }
                    }
                    _ => {}
                }
            }
        }
    }

    if let Some(done) = current {
        peers.push(done);
    }
    peers
}

/// Join declared keys with runtime peers, ordered by username
///
/// Configured peers without a runtime session and runtime peers unknown to
/// the config are left out.
pub fn join_sessions(
    key_map: &HashMap<String, String>,
    runtime: Vec<RuntimePeer>,
) -> Vec<SessionSnapshot> {
    let mut sessions: Vec<SessionSnapshot> = runtime
        .into_iter()
        .filter(RuntimePeer::has_session)
        .filter_map(|peer| {
            let username = key_map.get(&peer.public_key)?;
            Some(SessionSnapshot {
                username: username.clone(),
                latest_handshake: peer.latest_handshake,
                rx_bytes: peer.rx_bytes,
                tx_bytes: peer.tx_bytes,
                endpoint: peer.endpoint,
            })
        })
        .collect();
    sessions.sort_by(|a, b| a.username.cmp(&b.username));
    sessions
}

/// Collects runtime peer state for one interface
#[derive(Debug, Clone)]
pub struct SessionObserver {
    interface: String,
    wg: String,
    timeout: Duration,
    source: StatusSource,
}

impl SessionObserver {
    /// Observer of `interface`, querying through `wg` or netlink per `source`
    pub fn new(interface: String, wg: String, timeout: Duration, source: StatusSource) -> Self {
        Self {
            interface,
            wg,
            timeout,
            source,
        }
    }

    /// Current runtime peers of the interface
    pub async fn runtime_peers(&self) -> Result<Vec<RuntimePeer>> {
        match self.source {
            StatusSource::Command => {
                let output =
                    command::run(&self.wg, &["show", self.interface.as_str()], self.timeout)
                        .await?;
                Ok(parse_wg_show(&String::from_utf8_lossy(&output.stdout)))
            }
            StatusSource::Kernel => self.kernel_peers().await,
        }
    }

    /// Read peer stats over netlink
    async fn kernel_peers(&self) -> Result<Vec<RuntimePeer>> {
        let iface_name: InterfaceName =
            self.interface
                .parse()
                .map_err(|e| PeerError::InvalidName {
                    field: "Interface name",
                    value: format!("{} ({})", self.interface, e),
                })?;
        let command = format!("netlink get {}", self.interface);

        // Netlink calls are blocking
        let device = tokio::task::spawn_blocking(move || Device::get(&iface_name, Backend::Kernel))
            .await
            .map_err(|e| PeerError::CommandSpawn {
                command: command.clone(),
                source: std::io::Error::other(e),
            })?
            .map_err(|source| PeerError::CommandSpawn { command, source })?;

        let now = SystemTime::now();
        Ok(device
            .peers
            .into_iter()
            .map(|peer| RuntimePeer {
                public_key: peer.config.public_key.to_base64(),
                endpoint: peer.config.endpoint.map(|addr| addr.to_string()),
                latest_handshake: peer
                    .stats
                    .last_handshake_time
                    .and_then(|at| now.duration_since(at).ok()),
                rx_bytes: peer.stats.rx_bytes,
                tx_bytes: peer.stats.tx_bytes,
            })
            .collect())
    }

    /// Snapshots for every configured peer with a live session
    pub async fn sessions(&self, key_map: &HashMap<String, String>) -> Result<Vec<SessionSnapshot>> {
        let runtime = self.runtime_peers().await?;
        Ok(join_sessions(key_map, runtime))
    }
}
