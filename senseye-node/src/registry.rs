//! Service registry collaborator contract.
//!
//! mDNS registration/browsing is platform territory; the mesh only needs
//! a stream of peer join/leave events and a way to publish itself.

use std::net::SocketAddr;

use async_trait::async_trait;
use tokio::sync::mpsc;

use senseye_common::{NodeId, NodeRole, Point};

/// Peer membership change reported by the registry.
#[derive(Debug, Clone, PartialEq)]
pub enum DiscoveryEvent {
    /// A peer appeared (or refreshed its registration).
    Joined {
        /// Peer node id
        node_id: NodeId,
        /// Peer mesh address
        addr: SocketAddr,
    },
    /// A peer's registration disappeared.
    Left {
        /// Peer node id
        node_id: NodeId,
    },
}

/// Publishes this node and browses for peers.
#[async_trait]
pub trait ServiceRegistry: Send {
    /// Registers this node's service instance.
    async fn register(
        &mut self,
        node_id: &str,
        port: u16,
        role: NodeRole,
        position: Option<Point>,
    ) -> std::io::Result<()>;

    /// Returns the stream of membership events. Called once.
    fn events(&mut self) -> mpsc::Receiver<DiscoveryEvent>;

    /// Withdraws the registration.
    async fn shutdown(&mut self) -> std::io::Result<()>;
}

/// Fixed peer list from configuration; emits one `Joined` per peer.
///
/// Stands in for mDNS in tests and static deployments.
#[derive(Debug)]
pub struct StaticRegistry {
    peers: Vec<(NodeId, SocketAddr)>,
}

impl StaticRegistry {
    /// Creates a registry over a fixed peer list.
    pub fn new(peers: Vec<(NodeId, SocketAddr)>) -> Self {
        Self { peers }
    }
}

#[async_trait]
impl ServiceRegistry for StaticRegistry {
    async fn register(
        &mut self,
        _node_id: &str,
        _port: u16,
        _role: NodeRole,
        _position: Option<Point>,
    ) -> std::io::Result<()> {
        Ok(())
    }

    fn events(&mut self) -> mpsc::Receiver<DiscoveryEvent> {
        let (tx, rx) = mpsc::channel(self.peers.len().max(1));
        for (node_id, addr) in self.peers.drain(..) {
            // Capacity covers every peer, so try_send cannot fail here.
            let _ = tx.try_send(DiscoveryEvent::Joined { node_id, addr });
        }
        rx
    }

    async fn shutdown(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}
