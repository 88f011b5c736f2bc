// Peer block parser and rewriter

//! Peer config store
//!
//! Peers live in the WireGuard config as blocks bounded by marker lines:
//!
//! ```text
//! # BEGIN_PEER alice
//! [Peer]
//! PublicKey = K
//! AllowedIPs = 10.0.0.2/32
//! # END_PEER alice
//! ```
//!
//! A blocked peer keeps its block with every body line prefixed by `# `, so
//! WireGuard ignores it while the keys and addresses stay recoverable.
//!
//! [`PeerConfig`] keeps the raw lines (terminators included) and the marker
//! line indices per username, so a rewrite only touches the body lines of one
//! block and everything else renders back byte-for-byte.

use crate::error::{PeerError, Result};
use crate::state_file;
use std::collections::HashMap;
use std::path::{Path, PathBuf};

/// Prefix of the line opening a peer block
pub const BEGIN_MARKER: &str = "# BEGIN_PEER ";
/// Prefix of the line closing a peer block
pub const END_MARKER: &str = "# END_PEER ";
/// Prefix added to every body line of a blocked peer
pub const DISABLED_PREFIX: &str = "# ";

/// Enablement of an existing peer block
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerState {
    /// No body line is commented out
    Enabled,
    /// Every non-blank body line is commented out (or the body is empty)
    Disabled,
    /// Some body lines are commented out, e.g. by hand
    PartiallyDisabled,
}

/// One peer block as declared in the config
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Peer {
    /// Block label, unique per config
    pub username: String,
    /// `PublicKey` declared in the block, if any
    pub public_key: Option<String>,
    /// `AllowedIPs` entries in declaration order
    pub allowed_ips: Vec<String>,
    /// Derived from the body lines
    pub state: PeerState,
}

impl Peer {
    /// True if no body line carries the disabled marker
    pub fn enabled(&self) -> bool {
        self.state == PeerState::Enabled
    }
}

/// Marker line indices of one well-formed block
#[derive(Debug, Clone)]
struct BlockSpan {
    username: String,
    begin: usize,
    end: usize,
}

impl BlockSpan {
    fn body(&self) -> std::ops::Range<usize> {
        self.begin + 1..self.end
    }
}

/// Strip the line terminator (`\n` or `\r\n`)
fn content(line: &str) -> &str {
    line.trim_end_matches(['\n', '\r'])
}

/// Username carried by a marker line, if `line` is one
fn marker_username<'a>(line: &'a str, marker: &str) -> Option<&'a str> {
    let rest = content(line).strip_prefix(marker)?.trim();
    if rest.is_empty() || rest.contains(char::is_whitespace) {
        return None;
    }
    Some(rest)
}

fn is_blank(line: &str) -> bool {
    line.trim().is_empty()
}

fn is_disabled_line(line: &str) -> bool {
    line.trim_start().starts_with('#')
}

/// Remove exactly one disabled marker from the start of `line`
fn strip_disabled(line: &str) -> Option<&str> {
    line.strip_prefix(DISABLED_PREFIX)
        .or_else(|| line.strip_prefix('#'))
}

/// Split a `Key = Value` body line, looking through a disabled marker
fn key_value(line: &str) -> Option<(&str, &str)> {
    let text = content(line).trim_start_matches(|c: char| c == '#' || c.is_whitespace());
    let (key, value) = text.split_once('=')?;
    Some((key.trim(), value.trim()))
}

/// Parsed view of the config text
#[derive(Debug, Clone)]
pub struct PeerConfig {
    lines: Vec<String>,
    blocks: Vec<BlockSpan>,
    index: HashMap<String, usize>,
}

impl PeerConfig {
    /// Scan the text for paired peer markers
    ///
    /// Unterminated, mismatched and duplicate blocks are skipped with a
    /// warning. Their lines stay in the text untouched.
    pub fn parse(text: &str) -> Self {
        let lines: Vec<String> = text.split_inclusive('\n').map(str::to_string).collect();
        let mut blocks = Vec::new();
        let mut index = HashMap::new();
        let mut open: Option<(String, usize)> = None;

        for (i, line) in lines.iter().enumerate() {
            if let Some(user) = marker_username(line, BEGIN_MARKER) {
                if let Some((prev, at)) = open.replace((user.to_string(), i)) {
                    log::warn!(
                        "Skipping unterminated peer block '{}' at line {}",
                        prev,
                        at + 1
                    );
                }
            } else if let Some(user) = marker_username(line, END_MARKER) {
                match open.take() {
                    Some((name, begin)) if name == user => {
                        if index.contains_key(&name) {
                            log::warn!(
                                "Skipping duplicate peer block '{}' at line {}",
                                name,
                                begin + 1
                            );
                        } else {
                            index.insert(name.clone(), blocks.len());
                            blocks.push(BlockSpan {
                                username: name,
                                begin,
                                end: i,
                            });
                        }
                    }
                    Some((name, begin)) => {
                        log::warn!(
                            "Skipping peer block '{}' at line {}: closed by END_PEER {} at line {}",
                            name,
                            begin + 1,
                            user,
                            i + 1
                        );
                    }
                    None => {
                        log::warn!("Skipping stray END_PEER {} at line {}", user, i + 1);
                    }
                }
            }
        }

        if let Some((name, at)) = open {
            log::warn!("Skipping unterminated peer block '{}' at line {}", name, at + 1);
        }

        Self {
            lines,
            blocks,
            index,
        }
    }

    /// Reassemble the text
    pub fn render(&self) -> String {
        self.lines.concat()
    }

    fn span(&self, username: &str) -> Option<&BlockSpan> {
        self.index.get(username).map(|&i| &self.blocks[i])
    }

    fn body(&self, span: &BlockSpan) -> &[String] {
        &self.lines[span.body()]
    }

    fn state_of(&self, span: &BlockSpan) -> PeerState {
        let (mut total, mut disabled) = (0usize, 0usize);
        for line in self.body(span).iter().filter(|l| !is_blank(l)) {
            total += 1;
            if is_disabled_line(line) {
                disabled += 1;
            }
        }

        if disabled == total {
            PeerState::Disabled
        } else if disabled == 0 {
            PeerState::Enabled
        } else {
            PeerState::PartiallyDisabled
        }
    }

    fn peer_of(&self, span: &BlockSpan) -> Peer {
        let mut public_key = None;
        let mut allowed_ips = Vec::new();

        for line in self.body(span) {
            let Some((key, value)) = key_value(line) else {
                continue;
            };
            if key.eq_ignore_ascii_case("PublicKey") && public_key.is_none() {
                public_key = Some(value.to_string());
            } else if key.eq_ignore_ascii_case("AllowedIPs") {
                allowed_ips.extend(
                    value
                        .split(',')
                        .map(str::trim)
                        .filter(|ip| !ip.is_empty())
                        .map(str::to_string),
                );
            }
        }

        Peer {
            username: span.username.clone(),
            public_key,
            allowed_ips,
            state: self.state_of(span),
        }
    }

    /// All well-formed peer blocks in file order
    pub fn peers(&self) -> Vec<Peer> {
        self.blocks.iter().map(|span| self.peer_of(span)).collect()
    }

    /// Look up a single peer
    pub fn peer(&self, username: &str) -> Option<Peer> {
        self.span(username).map(|span| self.peer_of(span))
    }

    /// `None` if no block exists, otherwise its enablement
    pub fn status(&self, username: &str) -> Option<PeerState> {
        self.span(username).map(|span| self.state_of(span))
    }

    /// True only if the block exists and every non-blank body line is disabled
    ///
    /// A missing peer reports `false`; use [`PeerConfig::status`] to tell the
    /// two apart.
    pub fn is_blocked(&self, username: &str) -> bool {
        self.status(username) == Some(PeerState::Disabled)
    }

    /// Comment out or restore the body of `username`'s block
    ///
    /// Returns whether any line changed. Blocking an already disabled block and
    /// unblocking a block that is not fully disabled are no-ops.
    ///
    /// # Errors
    ///
    /// [`PeerError::NotFound`] if no block matches.
    pub fn set_blocked(&mut self, username: &str, blocked: bool) -> Result<bool> {
        let span = self
            .span(username)
            .cloned()
            .ok_or_else(|| PeerError::NotFound(username.to_string()))?;
        let state = self.state_of(&span);

        if blocked && state == PeerState::Disabled {
            log::debug!("Peer {} already blocked", username);
            return Ok(false);
        }
        if !blocked && state != PeerState::Disabled {
            if state == PeerState::PartiallyDisabled {
                log::warn!(
                    "Peer {} is only partially disabled, leaving its lines untouched",
                    username
                );
            }
            return Ok(false);
        }

        let mut changed = false;
        for line in &mut self.lines[span.body()] {
            if is_blank(line) {
                continue;
            }
            if blocked {
                line.insert_str(0, DISABLED_PREFIX);
                changed = true;
            } else if let Some(rest) = strip_disabled(line) {
                *line = rest.to_string();
                changed = true;
            }
        }

        Ok(changed)
    }

    /// Map of declared public key to username
    pub fn key_map(&self) -> HashMap<String, String> {
        self.peers()
            .into_iter()
            .filter_map(|peer| peer.public_key.map(|key| (key, peer.username)))
            .collect()
    }

    /// IPv6 subnet of the `[Interface]` section as a `/64`, if it has one
    ///
    /// `Address = 10.7.0.1/24, fddd:2c4:2c4:2c4::1/64` yields
    /// `fddd:2c4:2c4:2c4::/64`.
    pub fn ipv6_subnet(&self) -> Option<String> {
        let mut in_interface = false;

        for line in &self.lines {
            let line = content(line).trim();
            if line.starts_with('[') {
                if in_interface {
                    break;
                }
                in_interface = line.eq_ignore_ascii_case("[Interface]");
                continue;
            }
            if !in_interface {
                continue;
            }
            let Some((key, value)) = line.split_once('=') else {
                continue;
            };
            if !key.trim().eq_ignore_ascii_case("Address") {
                continue;
            }
            for addr in value.split(',').map(str::trim) {
                let Some((ip, _mask)) = addr.split_once('/') else {
                    continue;
                };
                if !ip.contains(':') {
                    continue;
                }
                let prefix = match ip.rfind("::") {
                    Some(pos)
                        if pos + 2 < ip.len()
                            && ip[pos + 2..].chars().all(|c| c.is_ascii_hexdigit()) =>
                    {
                        &ip[..pos + 2]
                    }
                    _ => ip,
                };
                return Some(format!("{}/64", prefix));
            }
        }

        None
    }
}

/// Outcome of a block/unblock rewrite
#[derive(Debug, Clone)]
pub struct Mutation {
    /// Config text before the rewrite, for rollback
    pub previous: String,
    /// Whether the file was rewritten
    pub changed: bool,
}

/// File-backed access to the peer config
#[derive(Debug, Clone)]
pub struct PeerStore {
    path: PathBuf,
}

impl PeerStore {
    /// Create a store for the config at `path`
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Path of the config file
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Read the raw config text
    pub fn read_text(&self) -> Result<String> {
        state_file::read_optional(&self.path)?.ok_or_else(|| {
            PeerError::io(
                "Failed to read WireGuard config",
                &self.path,
                std::io::Error::from(std::io::ErrorKind::NotFound),
            )
        })
    }

    /// Replace the config text atomically
    pub fn write_text(&self, text: &str) -> Result<()> {
        state_file::write_atomically(&self.path, text.as_bytes())
    }

    /// Read and parse the config
    pub fn load(&self) -> Result<PeerConfig> {
        Ok(PeerConfig::parse(&self.read_text()?))
    }

    /// All peers in file order
    pub fn list_peers(&self) -> Result<Vec<Peer>> {
        Ok(self.load()?.peers())
    }

    /// See [`PeerConfig::is_blocked`]
    pub fn is_blocked(&self, username: &str) -> Result<bool> {
        Ok(self.load()?.is_blocked(username))
    }

    /// See [`PeerConfig::status`]
    pub fn status(&self, username: &str) -> Result<Option<PeerState>> {
        Ok(self.load()?.status(username))
    }

    /// Read, toggle one block, write back if anything changed
    pub fn set_blocked(&self, username: &str, blocked: bool) -> Result<Mutation> {
        let previous = self.read_text()?;
        let mut config = PeerConfig::parse(&previous);
        let changed = config.set_blocked(username, blocked)?;

        if changed {
            self.write_text(&config.render())?;
            log::info!(
                "Peer {} {} in {}",
                username,
                if blocked { "blocked" } else { "unblocked" },
                self.path.display()
            );
        }

        Ok(Mutation { previous, changed })
    }
}
