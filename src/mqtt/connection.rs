//! Last-known broker connectivity
//!
//! Only the event loop writes the state. Readers either sample it or wait on the
//! underlying watch channel instead of sleep-polling.

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::debug;

#[derive(Clone, Copy, Default, Debug, PartialEq, Eq)]
pub enum ConnectionState {
    /// Nothing heard from the broker since startup
    #[default]
    Unknown,
    Connected,
    Disconnected,
}

impl ConnectionState {
    pub fn is_connected(self) -> bool {
        self == ConnectionState::Connected
    }
}

/// Shared handle to the process-wide [`ConnectionState`]
#[derive(Clone, Debug)]
pub struct ConnectionFlag {
    tx: Arc<watch::Sender<ConnectionState>>,
}

impl Default for ConnectionFlag {
    fn default() -> Self {
        Self::new()
    }
}

impl ConnectionFlag {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(ConnectionState::Unknown);
        ConnectionFlag { tx: Arc::new(tx) }
    }

    /// Returns the state that was replaced
    pub fn set_connected(&self, connected: bool) -> ConnectionState {
        let next = if connected {
            ConnectionState::Connected
        } else {
            ConnectionState::Disconnected
        };
        let previous = self.tx.send_replace(next);
        if previous != next {
            debug!("Connection state {:?} -> {:?}", previous, next);
        }
        previous
    }

    pub fn state(&self) -> ConnectionState {
        *self.tx.borrow()
    }

    pub fn is_connected(&self) -> bool {
        self.state().is_connected()
    }

    pub fn subscribe(&self) -> watch::Receiver<ConnectionState> {
        self.tx.subscribe()
    }

    /// Waits until the state becomes `Connected` or the timeout elapses
    pub async fn wait_connected(&self, timeout: Duration) -> bool {
        let mut rx = self.subscribe();
        let connected = matches!(
            tokio::time::timeout(timeout, rx.wait_for(|s| s.is_connected())).await,
            Ok(Ok(_))
        );
        connected
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn starts_unknown_and_not_connected() {
        let flag = ConnectionFlag::new();
        assert_eq!(flag.state(), ConnectionState::Unknown);
        assert!(!flag.is_connected());
    }

    #[test]
    fn follows_connect_and_disconnect() {
        let flag = ConnectionFlag::new();
        assert_eq!(flag.set_connected(true), ConnectionState::Unknown);
        assert!(flag.is_connected());
        assert_eq!(flag.set_connected(false), ConnectionState::Connected);
        assert_eq!(flag.state(), ConnectionState::Disconnected);
        flag.set_connected(true);
        assert!(flag.clone().is_connected());
    }

    #[tokio::test]
    async fn wait_connected_times_out() {
        let flag = ConnectionFlag::new();
        assert!(!flag.wait_connected(Duration::from_millis(20)).await);
    }

    #[tokio::test]
    async fn wait_connected_wakes_on_connect() {
        let flag = ConnectionFlag::new();
        let writer = flag.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            writer.set_connected(true);
        });
        assert!(flag.wait_connected(Duration::from_secs(2)).await);
    }

    #[tokio::test]
    async fn wait_connected_returns_at_once_when_already_connected() {
        let flag = ConnectionFlag::new();
        flag.set_connected(true);
        assert!(flag.wait_connected(Duration::ZERO).await);
    }
}
