// Error types for peer lifecycle operations

//! Typed failures surfaced by the store, reload and lifecycle layers
//!
//! The daemon and CLI wrap these in `anyhow` for reporting; library code
//! keeps them typed so callers can tell a missing peer from a failed reload.

use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Result alias used across the library
pub type Result<T> = std::result::Result<T, PeerError>;

/// Errors produced while managing peers
#[derive(Debug, Error)]
pub enum PeerError {
    /// A username or interface name failed boundary validation
    #[error("{field} contains invalid characters: '{value}'. Only alphanumeric, hyphens, and underscores are allowed")]
    InvalidName {
        /// Which kind of name was rejected
        field: &'static str,
        /// The rejected value
        value: String,
    },

    /// No `BEGIN_PEER`/`END_PEER` block matches the username
    #[error("peer '{0}' not found in config")]
    NotFound(String),

    /// A block for the username is already present
    #[error("peer '{0}' already exists")]
    AlreadyExists(String),

    /// Reading or writing a file failed
    #[error("{context} ({path}): {source}")]
    Io {
        /// What was being done
        context: &'static str,
        /// File involved
        path: PathBuf,
        /// Underlying error
        #[source]
        source: std::io::Error,
    },

    /// An external command could not be started
    #[error("failed to execute {command}: {source}")]
    CommandSpawn {
        /// Command line that failed to start
        command: String,
        /// Underlying error
        #[source]
        source: std::io::Error,
    },

    /// An external command exited unsuccessfully
    #[error("{command} failed ({status}): {stderr}")]
    CommandFailed {
        /// Command line that failed
        command: String,
        /// Exit status description
        status: String,
        /// Captured standard error, trimmed
        stderr: String,
    },

    /// An external command did not finish in time and was killed
    #[error("{command} timed out after {}s", timeout.as_secs())]
    CommandTimedOut {
        /// Command line that hung
        command: String,
        /// Deadline that was exceeded
        timeout: Duration,
    },

    /// The config was changed on disk but the live interface was not updated
    #[error("config for '{username}' changed but interface reload failed (rolled back: {rolled_back}): {source}")]
    PartialApply {
        /// Peer whose change did not take effect
        username: String,
        /// Whether the previous config text was restored
        rolled_back: bool,
        /// Reload failure
        #[source]
        source: Box<PeerError>,
    },
}

impl PeerError {
    pub(crate) fn io(context: &'static str, path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            context,
            path: path.into(),
            source,
        }
    }

    /// True for failures of the external commands themselves
    pub fn is_command_failure(&self) -> bool {
        matches!(
            self,
            Self::CommandSpawn { .. } | Self::CommandFailed { .. } | Self::CommandTimedOut { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partial_apply_message_mentions_rollback() {
        let err = PeerError::PartialApply {
            username: "alice".to_string(),
            rolled_back: true,
            source: Box::new(PeerError::CommandFailed {
                command: "wg syncconf wg0".to_string(),
                status: "exit status: 1".to_string(),
                stderr: "Unable to modify interface".to_string(),
            }),
        };
        let msg = err.to_string();
        assert!(msg.contains("alice"));
        assert!(msg.contains("rolled back: true"));
        assert!(msg.contains("Unable to modify interface"));
    }

    #[test]
    fn test_command_failure_classification() {
        let timed_out = PeerError::CommandTimedOut {
            command: "wg-quick strip wg0".to_string(),
            timeout: Duration::from_secs(5),
        };
        assert!(timed_out.is_command_failure());
        assert_eq!(timed_out.to_string(), "wg-quick strip wg0 timed out after 5s");
        assert!(!PeerError::NotFound("bob".to_string()).is_command_failure());
    }
}
