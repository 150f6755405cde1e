//! In-process change feed.

use super::{ConnectionHandle, Transport, TransportSink};
use crate::config::FeedConfig;
use crate::error::{RealtimeError, Result};
use crate::types::{FailureKind, RawChange, TransportStatus, WatchFilter};
use crossbeam_channel::{bounded, Sender};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

enum FeedMessage {
    Status(TransportStatus),
    Change(RawChange),
}

/// Internal connection state.
struct FeedConnection {
    channel: String,
    filters: Vec<WatchFilter>,
    sender: Sender<FeedMessage>,
    /// Changes allowed in the buffer; one extra slot is kept for a status.
    capacity: usize,
}

impl FeedConnection {
    /// Try to queue a change. Returns false if the buffer is full.
    fn try_send_change(&self, change: RawChange) -> bool {
        if self.sender.len() >= self.capacity {
            return false;
        }
        self.sender.try_send(FeedMessage::Change(change)).is_ok()
    }

    fn send_status(&self, status: TransportStatus) {
        let _ = self.sender.try_send(FeedMessage::Status(status));
    }

    fn matches(&self, change: &RawChange) -> bool {
        self.filters.iter().any(|f| f.matches(change))
    }
}

/// Pub/sub change feed living in the same process.
///
/// Every connection owns a bounded buffer drained by its own delivery
/// thread. A connection whose buffer overflows is dropped with a
/// `channel_error`, the same way a remote feed drops a slow client.
pub struct ChangeFeed {
    /// Open connections by handle.
    connections: RwLock<HashMap<ConnectionHandle, FeedConnection>>,
    /// Counter for generating handles.
    next_id: AtomicU64,
    config: FeedConfig,
}

impl ChangeFeed {
    /// Creates a feed with the default buffer size.
    pub fn new() -> Self {
        Self::with_config(FeedConfig::default())
    }

    /// Creates a feed with custom buffering.
    pub fn with_config(config: FeedConfig) -> Self {
        Self {
            connections: RwLock::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            config,
        }
    }

    /// Number of open connections.
    pub fn connection_count(&self) -> usize {
        self.connections.read().len()
    }

    /// Channels with an open connection, sorted.
    pub fn channels(&self) -> Vec<String> {
        let mut channels: Vec<String> = self
            .connections
            .read()
            .values()
            .map(|c| c.channel.clone())
            .collect();
        channels.sort();
        channels
    }

    /// Publish a change to every matching connection.
    /// Returns the number of connections it was queued for.
    pub fn publish(&self, change: &RawChange) -> usize {
        let mut delivered = 0;
        let mut overflowed = Vec::new();

        {
            let connections = self.connections.read();
            for (handle, conn) in connections.iter() {
                if !conn.matches(change) {
                    continue;
                }
                if conn.try_send_change(change.clone()) {
                    delivered += 1;
                } else {
                    overflowed.push(*handle);
                }
            }
        }

        if !overflowed.is_empty() {
            let mut connections = self.connections.write();
            for handle in overflowed {
                if let Some(conn) = connections.remove(&handle) {
                    tracing::warn!(channel = %conn.channel, ?handle, "feed buffer overflow, dropping connection");
                    conn.send_status(TransportStatus::Failed(FailureKind::ChannelError));
                }
            }
        }

        delivered
    }

    /// Drop every connection on `channel` with the given failure.
    pub fn fail_channel(&self, channel: &str, kind: FailureKind) -> usize {
        self.fail_where(kind, |conn| conn.channel == channel)
    }

    /// Drop every connection with the given failure (server went away).
    pub fn fail_all(&self, kind: FailureKind) -> usize {
        self.fail_where(kind, |_| true)
    }

    fn fail_where<F>(&self, kind: FailureKind, filter: F) -> usize
    where
        F: Fn(&FeedConnection) -> bool,
    {
        let mut connections = self.connections.write();
        let doomed: Vec<ConnectionHandle> = connections
            .iter()
            .filter(|(_, conn)| filter(conn))
            .map(|(handle, _)| *handle)
            .collect();

        for handle in &doomed {
            if let Some(conn) = connections.remove(handle) {
                conn.send_status(TransportStatus::Failed(kind));
            }
        }
        doomed.len()
    }
}

impl Default for ChangeFeed {
    fn default() -> Self {
        Self::new()
    }
}

impl Transport for ChangeFeed {
    fn connect(
        &self,
        channel: &str,
        filters: &[WatchFilter],
        sink: TransportSink,
    ) -> Result<ConnectionHandle> {
        let handle = ConnectionHandle(self.next_id.fetch_add(1, Ordering::SeqCst));
        let capacity = self.config.buffer_size.max(1);
        let (sender, receiver) = bounded(capacity + 1);

        std::thread::Builder::new()
            .name(format!("hive-feed-{}", handle.0))
            .spawn(move || {
                for message in receiver.iter() {
                    match message {
                        FeedMessage::Status(status) => sink.status(status),
                        FeedMessage::Change(change) => sink.change(change),
                    }
                }
            })
            .map_err(|e| RealtimeError::Transport(e.to_string()))?;

        let conn = FeedConnection {
            channel: channel.to_string(),
            filters: filters.to_vec(),
            sender,
            capacity,
        };
        conn.send_status(TransportStatus::Subscribed);
        self.connections.write().insert(handle, conn);

        tracing::debug!(%channel, ?handle, "feed connection opened");
        Ok(handle)
    }

    fn close(&self, handle: ConnectionHandle) {
        // Dropping the sender ends the delivery thread.
        if self.connections.write().remove(&handle).is_some() {
            tracing::debug!(?handle, "feed connection closed");
        }
    }
}
