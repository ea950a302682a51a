//! Transport seams
//!
//! Dispatchers write serialized frames through these traits and never await
//! the network: implementations hand the bytes to a connection task (for
//! example over an mpsc channel) and report only immediate failures.

use std::collections::HashMap;

use parking_lot::RwLock;
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::debug;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    #[error("Not connected")]
    NotConnected,

    #[error("Connection closed")]
    Closed,

    #[error("Unknown peer: {0}")]
    UnknownPeer(String),

    #[error("I/O error: {0}")]
    Io(String),
}

/// Connection to a single server
pub trait ClientTransport: Send + Sync {
    fn write(&self, data: &[u8]) -> Result<(), TransportError>;
}

/// Connections to many peers, addressed by peer ID
pub trait ServerTransport: Send + Sync {
    fn write(&self, peer_id: &str, data: &[u8]) -> Result<(), TransportError>;
}

/// Client-side connection lifecycle
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionEvent {
    Connected,
    /// Lost the connection, with the reason when known
    Disconnected(Option<String>),
    Reconnected,
}

/// Client transport backed by an unbounded channel
///
/// Each `connect` opens a fresh channel whose receiver is drained by the
/// connection task; writes fail while disconnected.
#[derive(Debug, Default)]
pub struct ChannelTransport {
    outbound: RwLock<Option<mpsc::UnboundedSender<Vec<u8>>>>,
}

impl ChannelTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn connect(&self) -> mpsc::UnboundedReceiver<Vec<u8>> {
        let (tx, rx) = mpsc::unbounded_channel();
        *self.outbound.write() = Some(tx);
        rx
    }

    pub fn disconnect(&self) {
        *self.outbound.write() = None;
    }

    pub fn is_connected(&self) -> bool {
        self.outbound
            .read()
            .as_ref()
            .map(|tx| !tx.is_closed())
            .unwrap_or(false)
    }
}

impl ClientTransport for ChannelTransport {
    fn write(&self, data: &[u8]) -> Result<(), TransportError> {
        let outbound = self.outbound.read();
        let tx = outbound.as_ref().ok_or(TransportError::NotConnected)?;
        tx.send(data.to_vec()).map_err(|_| TransportError::Closed)
    }
}

/// Server transport with one channel per registered peer
#[derive(Debug, Default)]
pub struct ChannelServerTransport {
    peers: RwLock<HashMap<String, mpsc::UnboundedSender<Vec<u8>>>>,
}

impl ChannelServerTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `peer_id`, replacing any previous connection
    pub fn register(&self, peer_id: &str) -> mpsc::UnboundedReceiver<Vec<u8>> {
        let (tx, rx) = mpsc::unbounded_channel();
        if self.peers.write().insert(peer_id.to_string(), tx).is_some() {
            debug!("Replaced outbound channel for {}", peer_id);
        }
        rx
    }

    pub fn unregister(&self, peer_id: &str) {
        self.peers.write().remove(peer_id);
    }

    pub fn peers(&self) -> Vec<String> {
        self.peers.read().keys().cloned().collect()
    }
}

impl ServerTransport for ChannelServerTransport {
    fn write(&self, peer_id: &str, data: &[u8]) -> Result<(), TransportError> {
        let peers = self.peers.read();
        let tx = peers
            .get(peer_id)
            .ok_or_else(|| TransportError::UnknownPeer(peer_id.to_string()))?;
        tx.send(data.to_vec()).map_err(|_| TransportError::Closed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_client_channel_lifecycle() {
        let transport = ChannelTransport::new();
        assert_eq!(transport.write(b"x"), Err(TransportError::NotConnected));

        let mut rx = transport.connect();
        assert!(transport.is_connected());
        transport.write(b"[2]").unwrap();
        assert_eq!(rx.try_recv().unwrap(), b"[2]".to_vec());

        drop(rx);
        assert_eq!(transport.write(b"x"), Err(TransportError::Closed));

        transport.disconnect();
        assert!(!transport.is_connected());
    }

    #[test]
    fn test_server_channel_routes_by_peer() {
        let transport = ChannelServerTransport::new();
        let mut a = transport.register("cs-1");
        let mut b = transport.register("cs-2");

        transport.write("cs-2", b"hello").unwrap();
        assert!(a.try_recv().is_err());
        assert_eq!(b.try_recv().unwrap(), b"hello".to_vec());

        transport.unregister("cs-1");
        assert_eq!(
            transport.write("cs-1", b"x"),
            Err(TransportError::UnknownPeer("cs-1".into()))
        );
        assert_eq!(transport.peers(), vec!["cs-2".to_string()]);
    }
}
