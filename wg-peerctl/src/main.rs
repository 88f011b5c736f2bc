// WireGuard Peer Lifecycle Manager

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::time::Duration;
use tokio::signal;
use wg_peerctl::{
    config::load_config,
    daemon::Daemon,
    grant::Grant,
    ledger::{ExpirationLedger, Expiry},
    lifecycle::{ExpireOutcome, PeerLifecycle},
    notify::OperatorNotifier,
    peer_store::{PeerState, PeerStore},
    provision::ScriptProvisioner,
    reload::WgReloader,
    session::{SessionObserver, SessionSnapshot},
    types::Config,
};

type Lifecycle = PeerLifecycle<WgReloader, ScriptProvisioner>;

#[derive(Parser)]
#[command(name = "wg-peerctl")]
#[command(about = "WireGuard peer lifecycle and expiration manager", long_about = None)]
struct Args {
    /// Path to configuration file
    #[arg(short, long, default_value = "/etc/wg-peerctl/config.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Enforce expirations until stopped
    Daemon,
    /// List all peers
    List,
    /// Show one peer and its live session
    Show { username: String },
    /// List live sessions
    Sessions,
    /// Create a peer through the provisioning script
    Add {
        username: String,
        /// Give the peer an IPv6 address
        #[arg(long, conflicts_with = "no_ipv6")]
        ipv6: bool,
        /// Do not give the peer an IPv6 address
        #[arg(long)]
        no_ipv6: bool,
        /// Access duration: 1h, 1d, 1w, 1m or unlimited
        #[arg(long, default_value = "unlimited")]
        grant: Grant,
    },
    /// Disable a peer
    Block { username: String },
    /// Re-enable a disabled peer
    Unblock { username: String },
    /// Delete a peer
    Remove { username: String },
    /// Manage expirations
    Expire {
        #[command(subcommand)]
        action: ExpireCommand,
    },
}

#[derive(Subcommand)]
enum ExpireCommand {
    /// Set when a peer loses access (RFC 3339 instant or a grant like 1w)
    Set { username: String, when: String },
    /// Make a peer's access unlimited
    Clear { username: String },
    /// List all expiration records
    Show,
}

/// Parse an absolute RFC 3339 instant or a grant relative to `now`
///
/// `None` means unlimited.
fn parse_when(text: &str, now: DateTime<Utc>) -> Result<Option<DateTime<Utc>>> {
    if let Ok(at) = DateTime::parse_from_rfc3339(text) {
        return Ok(Some(at.with_timezone(&Utc)));
    }
    let grant: Grant = text
        .parse()
        .with_context(|| format!("'{}' is neither an RFC 3339 instant nor a grant", text))?;
    Ok(grant.expires_at(now)?)
}

fn build_lifecycle(config: &Config) -> Result<Lifecycle> {
    let general = &config.general;
    let tools = &config.tools;
    let interface = general.interface_name();
    let timeout = general.command_timeout();

    let reloader = WgReloader::new(
        interface.clone(),
        tools.wg.clone(),
        tools.wg_quick.clone(),
        timeout,
    )
    .context("Failed to create interface reloader")?;
    let provisioner = ScriptProvisioner::new(
        tools.add_script.clone(),
        tools.remove_script.clone(),
        timeout,
    );
    let observer = SessionObserver::new(interface, tools.wg.clone(), timeout, tools.status_source);

    Ok(PeerLifecycle::new(
        PeerStore::new(&general.wg_config_file),
        ExpirationLedger::new(&general.expirations_file),
        reloader,
        provisioner,
        observer,
        general.endpoint.clone(),
    ))
}

fn state_label(state: PeerState) -> &'static str {
    match state {
        PeerState::Enabled => "enabled",
        PeerState::Disabled => "blocked",
        PeerState::PartiallyDisabled => "partially-blocked",
    }
}

fn expiry_label(expiry: Option<Expiry>) -> String {
    match expiry {
        None => "-".to_string(),
        Some(Expiry::Never) => "never".to_string(),
        Some(Expiry::At(at)) => at.to_rfc3339(),
    }
}

fn age_label(age: Option<Duration>) -> String {
    let Some(age) = age else {
        return "never".to_string();
    };
    let secs = age.as_secs();
    match secs {
        0..=59 => format!("{}s ago", secs),
        60..=3599 => format!("{}m ago", secs / 60),
        3600..=86399 => format!("{}h ago", secs / 3600),
        _ => format!("{}d ago", secs / 86400),
    }
}

fn bytes_label(bytes: u64) -> String {
    const UNITS: [&str; 5] = ["B", "KiB", "MiB", "GiB", "TiB"];
    let mut value = bytes as f64;
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    if unit == 0 {
        format!("{} B", bytes)
    } else {
        format!("{:.2} {}", value, UNITS[unit])
    }
}

fn print_session(session: &SessionSnapshot) {
    println!(
        "{:<20} handshake {:<10} rx {:<12} tx {:<12} {}",
        session.username,
        age_label(session.latest_handshake),
        bytes_label(session.rx_bytes),
        bytes_label(session.tx_bytes),
        session.endpoint.as_deref().unwrap_or("-")
    );
}

/// Live sessions, or none if the interface cannot be queried
async fn sessions_or_empty(lifecycle: &Lifecycle) -> Vec<SessionSnapshot> {
    match lifecycle.list_sessions().await {
        Ok(sessions) => sessions,
        Err(e) => {
            log::warn!("Failed to query live sessions: {}", e);
            Vec::new()
        }
    }
}

async fn list(lifecycle: &Lifecycle, config: &Config) -> Result<()> {
    let peers = lifecycle.list_peers().context("Failed to list peers")?;
    let sessions = sessions_or_empty(lifecycle).await;
    let threshold = config.general.online_threshold();

    for peer in peers {
        let online = sessions
            .iter()
            .any(|s| s.username == peer.username && s.is_online(threshold));
        println!(
            "{:<20} {:<18} {:<40} expires {:<26} {}",
            peer.username,
            state_label(peer.state),
            peer.allowed_ips.join(", "),
            expiry_label(lifecycle.get_expiration(&peer.username)),
            if online { "online" } else { "offline" }
        );
    }
    Ok(())
}

async fn show(lifecycle: &Lifecycle, username: &str) -> Result<()> {
    let peer = lifecycle
        .peer(username)?
        .with_context(|| format!("Peer '{}' not found", username))?;

    println!("user:        {}", peer.username);
    println!("state:       {}", state_label(peer.state));
    println!(
        "public key:  {}",
        peer.public_key.as_deref().unwrap_or("-")
    );
    println!("allowed ips: {}", peer.allowed_ips.join(", "));
    println!(
        "expires:     {}",
        expiry_label(lifecycle.get_expiration(username))
    );

    match sessions_or_empty(lifecycle)
        .await
        .iter()
        .find(|s| s.username == username)
    {
        Some(session) => print_session(session),
        None => println!("no live session"),
    }
    Ok(())
}

async fn run_daemon(config: &Config) -> Result<()> {
    log::info!("Starting wg-peerctl daemon");
    log::info!("WireGuard config: {}", config.general.wg_config_file.display());
    log::info!("Interface: {}", config.general.interface_name());
    log::info!(
        "Expiration ledger: {}",
        config.general.expirations_file.display()
    );

    let lifecycle = build_lifecycle(config)?;
    let notifier = OperatorNotifier::new(
        config.notify.command.clone(),
        config.general.command_timeout(),
    );
    let daemon = Daemon::new(lifecycle, notifier, config.general.resync_interval());

    // Set up signal handlers for graceful shutdown
    let mut sigterm = signal::unix::signal(signal::unix::SignalKind::terminate())
        .context("Failed to set up SIGTERM handler")?;
    let mut sigint = signal::unix::signal(signal::unix::SignalKind::interrupt())
        .context("Failed to set up SIGINT handler")?;

    let shutdown = async move {
        tokio::select! {
            _ = sigterm.recv() => {
                log::info!("Received SIGTERM");
            }
            _ = sigint.recv() => {
                log::info!("Received SIGINT");
            }
        }
    };

    daemon.run(shutdown).await;
    Ok(())
}

fn main() -> Result<()> {
    // Timers, signals and short-lived child processes; two workers are plenty
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(2)
        .thread_name("wg-peerctl")
        .enable_time()
        .enable_io()
        .build()?;

    runtime.block_on(async_main())
}

async fn async_main() -> Result<()> {
    let args = Args::parse();

    let config = load_config(&args.config)
        .with_context(|| format!("Failed to load config from {:?}", args.config))?;

    env_logger::Builder::from_env(
        env_logger::Env::default().default_filter_or(&config.general.log_level),
    )
    .init();

    if let Command::Daemon = args.command {
        return run_daemon(&config).await;
    }

    let lifecycle = build_lifecycle(&config)?;
    let now = Utc::now();

    match args.command {
        Command::Daemon => {}
        Command::List => list(&lifecycle, &config).await?,
        Command::Show { username } => show(&lifecycle, &username).await?,
        Command::Sessions => {
            let sessions = lifecycle
                .list_sessions()
                .await
                .context("Failed to query live sessions")?;
            for session in &sessions {
                print_session(session);
            }
        }
        Command::Add {
            username,
            ipv6,
            no_ipv6,
            grant,
        } => {
            let ipv6 = match (ipv6, no_ipv6) {
                (true, _) => Some(true),
                (_, true) => Some(false),
                _ => None,
            };
            lifecycle
                .add(&username, ipv6, grant.expires_at(now)?)
                .await
                .with_context(|| format!("Failed to add peer '{}'", username))?;
            println!("Peer {} added", username);
        }
        Command::Block { username } => {
            lifecycle
                .block(&username)
                .await
                .with_context(|| format!("Failed to block peer '{}'", username))?;
            println!("Peer {} blocked", username);
        }
        Command::Unblock { username } => {
            lifecycle
                .unblock(&username)
                .await
                .with_context(|| format!("Failed to unblock peer '{}'", username))?;
            match lifecycle.status(&username)? {
                Some(PeerState::PartiallyDisabled) => println!(
                    "Peer {} is partially blocked by hand and was left unchanged",
                    username
                ),
                _ => println!("Peer {} unblocked", username),
            }
        }
        Command::Remove { username } => {
            lifecycle
                .remove(&username)
                .await
                .with_context(|| format!("Failed to remove peer '{}'", username))?;
            println!("Peer {} removed", username);
        }
        Command::Expire { action } => match action {
            ExpireCommand::Set { username, when } => match parse_when(&when, now)? {
                Some(at) => {
                    let outcome = lifecycle
                        .set_expiration(&username, at, now)
                        .await
                        .with_context(|| format!("Failed to set expiration of '{}'", username))?;
                    match outcome {
                        None => println!("Peer {} expires at {}", username, at.to_rfc3339()),
                        Some(ExpireOutcome::Deactivated) => {
                            println!("Peer {} expired and was deactivated", username)
                        }
                        Some(ExpireOutcome::AlreadyRemoved) => {
                            println!("Peer {} no longer exists", username)
                        }
                    }
                }
                None => {
                    lifecycle.clear_expiration(&username).await?;
                    println!("Peer {} no longer expires", username);
                }
            },
            ExpireCommand::Clear { username } => {
                lifecycle
                    .clear_expiration(&username)
                    .await
                    .with_context(|| format!("Failed to clear expiration of '{}'", username))?;
                println!("Peer {} no longer expires", username);
            }
            ExpireCommand::Show => {
                for (username, expiry) in lifecycle.ledger().list_all() {
                    println!("{:<20} {}", username, expiry_label(Some(expiry)));
                }
            }
        },
    }

    Ok(())
}
