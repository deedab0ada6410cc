//! Peer connection definition
//!
//! Represents the writable side of a connected peer as stored in the registry.

use std::io;
use std::time::Duration;

use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::Mutex;
use tokio::time::timeout;

use crate::config::DEFAULT_WRITE_TIMEOUT;
use crate::types::{PeerAddr, SessionId};

/// Connected peer information
///
/// Holds the peer's address, the session it belongs to, and the write half
/// of its transport. The writer sits behind its own lock so two delivery
/// passes never interleave bytes within one frame.
///
/// Every write and close is bounded by `write_timeout`, lock wait included,
/// so a peer that stops reading cannot hold the lock indefinitely.
#[derive(Debug)]
pub struct PeerConnection<W> {
    /// Remote address, the registry key
    pub addr: PeerAddr,
    /// Connection instance this entry belongs to
    pub session: SessionId,
    write_timeout: Duration,
    /// Relay → peer byte stream
    writer: Mutex<W>,
}

impl<W> PeerConnection<W>
where
    W: AsyncWrite + Unpin + Send,
{
    /// Create a new peer with a fresh session ID
    pub fn new(addr: PeerAddr, writer: W) -> Self {
        Self::with_session(addr, SessionId::new(), writer)
    }

    /// Create a peer for an existing session
    pub fn with_session(addr: PeerAddr, session: SessionId, writer: W) -> Self {
        Self {
            addr,
            session,
            write_timeout: DEFAULT_WRITE_TIMEOUT,
            writer: Mutex::new(writer),
        }
    }

    /// Set the limit on a single write or close
    pub fn write_timeout(mut self, limit: Duration) -> Self {
        self.write_timeout = limit;
        self
    }

    /// Write one frame to this peer
    ///
    /// A zero-length write surfaces as `WriteZero`, so any `Ok` means the
    /// whole frame was handed to the transport. Running past the write
    /// timeout fails with `TimedOut`; the frame may then be cut short.
    pub async fn send(&self, frame: &[u8]) -> io::Result<()> {
        self.bounded(async {
            let mut writer = self.writer.lock().await;
            writer.write_all(frame).await?;
            writer.flush().await
        })
        .await
    }

    /// Shut down the write half of the transport
    pub async fn close(&self) -> io::Result<()> {
        self.bounded(async { self.writer.lock().await.shutdown().await })
            .await
    }

    async fn bounded<F>(&self, op: F) -> io::Result<()>
    where
        F: std::future::Future<Output = io::Result<()>>,
    {
        timeout(self.write_timeout, op).await.unwrap_or_else(|_| {
            Err(io::Error::new(
                io::ErrorKind::TimedOut,
                format!("peer write exceeded {:?}", self.write_timeout),
            ))
        })
    }
}
