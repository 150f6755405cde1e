//! Notification sinks and the message tables that feed them.

use crate::types::{Notification, NotificationKind};
use crossbeam_channel::{Sender, TrySendError};
use parking_lot::Mutex;

/// Fire-and-forget presentation surface for user-facing notifications.
pub trait NotificationSink: Send + Sync {
    fn notify(&self, notification: Notification);
}

/// Message for a watched entity entering `status`.
pub fn status_notification(status: &str) -> Notification {
    let (kind, title, body) = match status {
        "active" => (
            NotificationKind::Info,
            "Swarm activated",
            "Your swarm is now active and processing tasks.",
        ),
        "paused" => (
            NotificationKind::Info,
            "Swarm paused",
            "Your swarm has been paused. Resume it to continue.",
        ),
        "completed" => (
            NotificationKind::Info,
            "Swarm completed",
            "Your swarm has finished its work.",
        ),
        "failed" | "error" => (
            NotificationKind::Error,
            "Swarm failed",
            "Your swarm stopped because of an error.",
        ),
        "archived" => (
            NotificationKind::Info,
            "Swarm archived",
            "Your swarm has been archived.",
        ),
        "draft" => (
            NotificationKind::Info,
            "Swarm moved to draft",
            "Your swarm is back in draft.",
        ),
        other => {
            return Notification {
                kind: NotificationKind::Info,
                title: "Swarm status updated".to_string(),
                body: format!("Status changed to {}", other),
            }
        }
    };

    Notification {
        kind,
        title: title.to_string(),
        body: body.to_string(),
    }
}

/// Terminal message once automatic reconnects are exhausted.
pub fn connection_lost_notification() -> Notification {
    Notification {
        kind: NotificationKind::Error,
        title: "Connection lost".to_string(),
        body: "Realtime updates stopped. Please refresh the page.".to_string(),
    }
}

/// Writes notifications to the log.
#[derive(Clone, Copy, Debug, Default)]
pub struct TracingSink;

impl NotificationSink for TracingSink {
    fn notify(&self, notification: Notification) {
        match notification.kind {
            NotificationKind::Info => {
                tracing::info!(title = %notification.title, "{}", notification.body)
            }
            NotificationKind::Error => {
                tracing::error!(title = %notification.title, "{}", notification.body)
            }
        }
    }
}

/// Forwards notifications over a channel. Full or closed channels drop them.
#[derive(Clone, Debug)]
pub struct ChannelSink {
    sender: Sender<Notification>,
}

impl ChannelSink {
    /// Wraps the sending half of a channel.
    pub fn new(sender: Sender<Notification>) -> Self {
        Self { sender }
    }
}

impl NotificationSink for ChannelSink {
    fn notify(&self, notification: Notification) {
        match self.sender.try_send(notification) {
            Ok(()) => {}
            Err(TrySendError::Full(n)) => {
                tracing::debug!(title = %n.title, "notification channel full, dropping")
            }
            Err(TrySendError::Disconnected(_)) => {}
        }
    }
}

/// Keeps every notification in memory.
#[derive(Debug, Default)]
pub struct CollectingSink {
    notifications: Mutex<Vec<Notification>>,
}

impl CollectingSink {
    /// Creates an empty sink.
    pub fn new() -> Self {
        Self::default()
    }

    /// Copies of everything received so far.
    pub fn notifications(&self) -> Vec<Notification> {
        self.notifications.lock().clone()
    }

    /// Number of notifications received.
    pub fn len(&self) -> usize {
        self.notifications.lock().len()
    }

    /// Whether nothing has been received.
    pub fn is_empty(&self) -> bool {
        self.notifications.lock().is_empty()
    }

    /// Drains the received notifications.
    pub fn take(&self) -> Vec<Notification> {
        std::mem::take(&mut *self.notifications.lock())
    }
}

impl NotificationSink for CollectingSink {
    fn notify(&self, notification: Notification) {
        self.notifications.lock().push(notification);
    }
}
