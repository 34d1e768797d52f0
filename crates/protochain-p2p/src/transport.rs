// Transport seam and the in-process hub used by tests and single-host devnets.

use crate::message::Envelope;
use async_trait::async_trait;
use log::{debug, warn};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{mpsc, Mutex};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    #[error("Transport closed")]
    Closed,

    #[error("Codec error: {0}")]
    Codec(String),

    #[error("Unsupported protocol version {0}")]
    UnsupportedVersion(u32),

    #[error("Network operation timed out after {0} ms")]
    Timeout(u64),
}

/// Outbound and inbound halves of the peer network as the consensus core sees them.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Deliver an envelope to every other peer.
    async fn broadcast(&self, envelope: Envelope) -> Result<(), TransportError>;

    /// Next inbound envelope, or `None` once the transport is closed.
    async fn recv(&self) -> Option<Envelope>;
}

type Mailbox = mpsc::UnboundedSender<Vec<u8>>;

/// Fan-out switch connecting in-process peers.
#[derive(Default)]
pub struct MemoryHub {
    peers: RwLock<HashMap<String, Mailbox>>,
}

impl MemoryHub {
    pub fn new() -> Arc<Self> {
        Arc::new(MemoryHub::default())
    }

    /// Attach a peer. Reconnecting under the same key replaces the old mailbox.
    pub fn connect(self: &Arc<Self>, peer: &str) -> MemoryTransport {
        let (tx, rx) = mpsc::unbounded_channel();
        self.peers.write().insert(peer.to_string(), tx);
        MemoryTransport {
            peer: peer.to_string(),
            hub: Arc::clone(self),
            inbox: Mutex::new(rx),
        }
    }

    pub fn disconnect(&self, peer: &str) {
        self.peers.write().remove(peer);
    }

    pub fn peer_count(&self) -> usize {
        self.peers.read().len()
    }

    fn deliver(&self, from: &str, bytes: Vec<u8>) {
        let mut gone = Vec::new();
        {
            let peers = self.peers.read();
            for (key, mailbox) in peers.iter() {
                if key == from {
                    continue;
                }
                if mailbox.send(bytes.clone()).is_err() {
                    gone.push(key.clone());
                }
            }
        }
        if !gone.is_empty() {
            let mut peers = self.peers.write();
            for key in gone {
                warn!("Dropping unreachable peer {}", key);
                peers.remove(&key);
            }
        }
    }
}

pub struct MemoryTransport {
    peer: String,
    hub: Arc<MemoryHub>,
    inbox: Mutex<mpsc::UnboundedReceiver<Vec<u8>>>,
}

impl MemoryTransport {
    pub fn peer(&self) -> &str {
        &self.peer
    }
}

#[async_trait]
impl Transport for MemoryTransport {
    async fn broadcast(&self, envelope: Envelope) -> Result<(), TransportError> {
        let bytes = envelope.encode()?;
        self.hub.deliver(&self.peer, bytes);
        Ok(())
    }

    async fn recv(&self) -> Option<Envelope> {
        let mut inbox = self.inbox.lock().await;
        loop {
            let bytes = inbox.recv().await?;
            match Envelope::decode(&bytes) {
                Ok(envelope) => return Some(envelope),
                Err(e) => debug!("{} discarded undecodable envelope: {}", self.peer, e),
            }
        }
    }
}

impl Drop for MemoryTransport {
    fn drop(&mut self) {
        self.hub.disconnect(&self.peer);
    }
}
