// Operator notifications

//! Messages for the operator about automatic deactivations
//!
//! Every notification goes to the log. When a hook command is configured it
//! also receives the rendered message as its only argument, so it can be
//! forwarded to chat, mail or a pager.

use crate::command;
use std::fmt;
use std::time::Duration;

/// Event worth telling the operator about
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Notification {
    /// A peer's grant ran out and it was blocked
    Deactivated(String),
    /// A due deactivation did not take effect; the peer stays enabled
    DeactivationFailed { username: String, reason: String },
}

impl Notification {
    /// Whether the operator should treat this as an error
    pub fn is_failure(&self) -> bool {
        matches!(self, Notification::DeactivationFailed { .. })
    }
}

impl fmt::Display for Notification {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Notification::Deactivated(username) => {
                write!(f, "Access for {} expired, peer deactivated", username)
            }
            Notification::DeactivationFailed { username, reason } => {
                write!(f, "Failed to deactivate expired peer {}: {}", username, reason)
            }
        }
    }
}

/// Delivers notifications to the log and the optional hook
#[derive(Debug, Clone)]
pub struct OperatorNotifier {
    command: Option<String>,
    timeout: Duration,
}

impl OperatorNotifier {
    /// Notifier that runs `command`, if any, with `timeout`
    pub fn new(command: Option<String>, timeout: Duration) -> Self {
        Self { command, timeout }
    }

    /// Log `notification` and hand it to the hook, if any
    ///
    /// A failing hook is logged and otherwise ignored.
    pub async fn notify(&self, notification: &Notification) {
        let message = notification.to_string();
        if notification.is_failure() {
            log::error!("{}", message);
        } else {
            log::info!("{}", message);
        }

        let Some(hook) = &self.command else {
            return;
        };
        if let Err(e) = command::run(hook, &[message.as_str()], self.timeout).await {
            log::warn!("Notification hook failed: {}", e);
        }
    }
}
