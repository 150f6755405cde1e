//! Change feed transport boundary.
//!
//! A [`Transport`] opens one connection per subscribe attempt and reports
//! back through the [`TransportSink`] it was handed. Each sink is tagged
//! with the epoch of the attempt that created it, so the manager can tell a
//! live connection's callbacks from those of one it already abandoned.

mod feed;

pub use feed::ChangeFeed;

use crate::error::Result;
use crate::types::{RawChange, TransportStatus, WatchFilter};
use std::fmt;
use std::sync::Weak;

/// Identifier of one transport connection.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnectionHandle(pub u64);

impl fmt::Debug for ConnectionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Conn({})", self.0)
    }
}

/// A pub/sub change feed.
pub trait Transport: Send + Sync {
    /// Open a connection watching `filters` on `channel`.
    ///
    /// Success only means the attempt started; the subscription is live once
    /// the sink receives [`TransportStatus::Subscribed`].
    fn connect(
        &self,
        channel: &str,
        filters: &[WatchFilter],
        sink: TransportSink,
    ) -> Result<ConnectionHandle>;

    /// Close a connection. Closing twice or closing an unknown handle is a no-op.
    fn close(&self, handle: ConnectionHandle);
}

/// Receiver of connection callbacks.
pub trait ConnectionObserver: Send + Sync {
    fn on_status(&self, epoch: u64, status: TransportStatus);
    fn on_change(&self, epoch: u64, change: RawChange);
}

/// Callback handle given to a transport for a single connection.
#[derive(Clone)]
pub struct TransportSink {
    epoch: u64,
    observer: Weak<dyn ConnectionObserver>,
}

impl TransportSink {
    /// Creates a sink for the connection opened at `epoch`.
    pub fn new(epoch: u64, observer: Weak<dyn ConnectionObserver>) -> Self {
        Self { epoch, observer }
    }

    /// Connection sequence number this sink reports under.
    pub fn epoch(&self) -> u64 {
        self.epoch
    }

    /// Whether anything is still listening.
    pub fn is_attached(&self) -> bool {
        self.observer.strong_count() > 0
    }

    /// Reports a connection status change.
    pub fn status(&self, status: TransportStatus) {
        if let Some(observer) = self.observer.upgrade() {
            observer.on_status(self.epoch, status);
        }
    }

    /// Forwards a raw change.
    pub fn change(&self, change: RawChange) {
        if let Some(observer) = self.observer.upgrade() {
            observer.on_change(self.epoch, change);
        }
    }
}

impl fmt::Debug for TransportSink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransportSink")
            .field("epoch", &self.epoch)
            .field("attached", &self.is_attached())
            .finish()
    }
}
