use dashmap::DashMap;
use std::fmt;
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{debug, info};
use uuid::Uuid;

/// Identity of one transport connection, independent of whatever identity
/// the client registers under.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnectionId(Uuid);

impl ConnectionId {
    pub fn generate() -> Self {
        Self(Uuid::new_v4())
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

#[derive(Debug, Error)]
#[error("connection {0} is not open")]
pub struct PeerClosed(pub ConnectionId);

/// Send side of a live connection. Frames pushed here are written to the
/// socket by the connection's writer task.
#[derive(Debug, Clone)]
pub struct PeerHandle {
    id: ConnectionId,
    tx: mpsc::UnboundedSender<String>,
}

impl PeerHandle {
    pub fn new(tx: mpsc::UnboundedSender<String>) -> Self {
        Self {
            id: ConnectionId::generate(),
            tx,
        }
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    /// False once the writer task has stopped
    pub fn is_open(&self) -> bool {
        !self.tx.is_closed()
    }

    pub fn send(&self, frame: String) -> Result<(), PeerClosed> {
        self.tx.send(frame).map_err(|_| PeerClosed(self.id))
    }
}

/// Identity -> connection bindings for this process
#[derive(Debug, Default)]
pub struct Registry {
    bindings: DashMap<String, PeerHandle>,
}

impl Registry {
    /// Bind `identity` to `peer`, returning the handle it superseded
    pub fn bind(&self, identity: &str, peer: PeerHandle) -> Option<PeerHandle> {
        let connection = peer.id();
        let previous = self.bindings.insert(identity.to_string(), peer);
        match &previous {
            Some(old) if old.id() != connection => info!(
                "User {} already registered, updating socket ({} -> {})",
                identity,
                old.id(),
                connection
            ),
            _ => debug!("Bound {} to connection {}", identity, connection),
        }
        previous
    }

    pub fn get(&self, identity: &str) -> Option<PeerHandle> {
        self.bindings.get(identity).map(|entry| entry.value().clone())
    }

    /// Drop every binding still held by `connection`. Bindings that were
    /// superseded by another connection are left alone.
    pub fn release(&self, connection: ConnectionId) -> Vec<String> {
        let mut released = Vec::new();
        self.bindings.retain(|identity, peer| {
            if peer.id() == connection {
                released.push(identity.clone());
                false
            } else {
                true
            }
        });
        released
    }

    pub fn identities(&self) -> Vec<String> {
        let mut identities: Vec<String> = self
            .bindings
            .iter()
            .map(|entry| entry.key().clone())
            .collect();
        identities.sort();
        identities
    }

    pub fn len(&self) -> usize {
        self.bindings.len()
    }
}
