//! Peer registry
//!
//! The authoritative set of connected peers, keyed by remote address.
//! Access goes through `add`, `remove` and `broadcast` only; the map itself
//! never leaves this module.

use std::collections::HashMap;
use std::sync::Arc;

use futures_util::future::join_all;
use tokio::io::AsyncWrite;
use tokio::sync::RwLock;
use tracing::{debug, warn};

use crate::peer::PeerConnection;
use crate::types::PeerAddr;

/// Outcome of one delivery pass
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DeliveryReport {
    /// Peers the frame was written to
    pub delivered: usize,
    /// Peers whose write failed (logged and skipped)
    pub failed: usize,
}

/// Thread-safe registry of connected peers
///
/// Guarded by a `RwLock`: any number of broadcasts may read the membership
/// at once, while `add` and `remove` take it exclusively.
#[derive(Debug)]
pub struct PeerRegistry<W> {
    peers: RwLock<HashMap<PeerAddr, Arc<PeerConnection<W>>>>,
}

impl<W> Default for PeerRegistry<W> {
    fn default() -> Self {
        Self {
            peers: RwLock::new(HashMap::new()),
        }
    }
}

impl<W> PeerRegistry<W>
where
    W: AsyncWrite + Unpin + Send,
{
    /// Create an empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a peer under its address
    ///
    /// An entry from a different session under the same address is
    /// superseded: it is dropped from the map and its writer is shut down.
    /// Returns true if that happened.
    pub async fn add(&self, peer: Arc<PeerConnection<W>>) -> bool {
        let previous = {
            let mut peers = self.peers.write().await;
            peers.insert(peer.addr, Arc::clone(&peer))
        };

        let Some(stale) = previous else {
            debug!(peer = %peer.addr, session = %peer.session, "Peer registered");
            return false;
        };

        if stale.session == peer.session {
            return false;
        }

        warn!(
            peer = %peer.addr,
            stale_session = %stale.session,
            session = %peer.session,
            "Superseding existing registration for address"
        );

        // Closed outside the map lock; a pass may still hold the stale Arc.
        if let Err(e) = stale.close().await {
            debug!(peer = %stale.addr, error = %e, "Failed to close superseded peer");
        }

        true
    }

    /// Deregister a peer
    ///
    /// The entry is only removed if it still belongs to `peer`'s session, so a
    /// superseded connection's teardown cannot evict its replacement.
    /// Removing an absent peer is a no-op. Returns true if an entry was removed.
    pub async fn remove(&self, peer: &PeerConnection<W>) -> bool {
        let mut peers = self.peers.write().await;

        match peers.get(&peer.addr) {
            Some(entry) if entry.session == peer.session => {
                peers.remove(&peer.addr);
                debug!(peer = %peer.addr, remaining = peers.len(), "Peer deregistered");
                true
            }
            _ => false,
        }
    }

    /// Write `frame` to every registered peer except `exclude`
    ///
    /// Membership is snapshotted under the read lock; writes then run
    /// concurrently without holding it. A failed write is logged and counted,
    /// and never removes the peer or stops delivery to the others.
    pub async fn broadcast(&self, exclude: PeerAddr, frame: &[u8]) -> DeliveryReport {
        let targets: Vec<Arc<PeerConnection<W>>> = {
            let peers = self.peers.read().await;
            peers
                .values()
                .filter(|peer| peer.addr != exclude)
                .cloned()
                .collect()
        };

        let results = join_all(targets.iter().map(|peer| async move {
            (peer.addr, peer.send(frame).await)
        }))
        .await;

        let mut report = DeliveryReport::default();
        for (addr, result) in results {
            match result {
                Ok(()) => report.delivered += 1,
                Err(e) => {
                    warn!(peer = %addr, error = %e, "Failed to write to peer");
                    report.failed += 1;
                }
            }
        }
        report
    }

    /// Number of registered peers
    pub async fn len(&self) -> usize {
        self.peers.read().await.len()
    }

    /// Check if no peers are registered
    pub async fn is_empty(&self) -> bool {
        self.peers.read().await.is_empty()
    }

    /// Check if a peer is registered under `addr`
    pub async fn contains(&self, addr: PeerAddr) -> bool {
        self.peers.read().await.contains_key(&addr)
    }

    /// Addresses of all registered peers, in no particular order
    pub async fn addresses(&self) -> Vec<PeerAddr> {
        self.peers.read().await.keys().copied().collect()
    }
}
