// WireGuard Peer Lifecycle Library
// Shared modules for the daemon, the CLI and tests

#![warn(missing_docs)]

//! WireGuard Peer Lifecycle Library
//!
//! This library manages per-user peers of a WireGuard (or AmneziaWG) server:
//! it enables and disables peer blocks in the interface config, applies the
//! change to the running interface, and enforces time-limited access grants
//! that survive restarts.
//!
//! # Main Components
//!
//! - [`peer_store`]: Peer block parsing and in-place rewriting of the config
//! - [`reload`]: Applying the config to the live interface (strip + syncconf)
//! - [`ledger`]: Durable username -> expiration records
//! - [`scheduler`]: In-memory expiration timers
//! - [`session`]: Live handshake and transfer snapshots
//! - [`lifecycle`]: Facade tying store, ledger, reload and provisioning together
//! - [`daemon`]: Expiration enforcement loop
//! - [`config`]: Configuration file parsing and validation
//! - [`types`]: Configuration data structures

pub mod command;
pub mod config;
pub mod daemon;
pub mod error;
pub mod grant;
pub mod ledger;
pub mod lifecycle;
pub mod notify;
pub mod peer_store;
pub mod provision;
pub mod reload;
pub mod scheduler;
pub mod session;
pub mod state_file;
pub mod types;
