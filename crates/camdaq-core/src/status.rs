//! Connection state and the one-way status stream.
//!
//! Observers (status displays, the CLI) hold a `watch::Receiver` and only ever
//! read. Publishing never blocks and never fails, even with no receivers.

use serde::{Deserialize, Serialize};
use tokio::sync::watch;

/// Phase of the reconnection state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConnectionState {
    /// Normal operation.
    Connected,
    /// A connection-loss error was classified; recovery not started yet.
    LostPending,
    /// Blocking recovery in progress.
    Reconnecting,
}

/// Status published to observers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConnectionStatus {
    Connected,
    Disconnected,
    Reconnecting,
}

impl std::fmt::Display for ConnectionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let label = match self {
            ConnectionStatus::Connected => "device running",
            ConnectionStatus::Disconnected => "device disconnected",
            ConnectionStatus::Reconnecting => "reconnecting",
        };
        write!(f, "{}", label)
    }
}

/// Publishing side of the status stream.
#[derive(Debug, Clone)]
pub struct StatusPublisher {
    tx: watch::Sender<ConnectionStatus>,
}

impl Default for StatusPublisher {
    fn default() -> Self {
        Self::new()
    }
}

impl StatusPublisher {
    pub fn new() -> Self {
        let (tx, _) = watch::channel(ConnectionStatus::Connected);
        Self { tx }
    }

    pub fn publish(&self, status: ConnectionStatus) {
        let previous = self.tx.send_replace(status);
        if previous != status {
            tracing::info!(status = %status, "Connection status changed");
        }
    }

    pub fn current(&self) -> ConnectionStatus {
        *self.tx.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<ConnectionStatus> {
        self.tx.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_publish_without_receivers() {
        let publisher = StatusPublisher::new();
        publisher.publish(ConnectionStatus::Disconnected);
        assert_eq!(publisher.current(), ConnectionStatus::Disconnected);
    }

    #[tokio::test]
    async fn test_receiver_observes_changes() {
        let publisher = StatusPublisher::new();
        let mut rx = publisher.subscribe();
        assert_eq!(*rx.borrow(), ConnectionStatus::Connected);

        publisher.publish(ConnectionStatus::Reconnecting);
        rx.changed().await.unwrap();
        assert_eq!(*rx.borrow_and_update(), ConnectionStatus::Reconnecting);
    }
}
