//! Connection handler
//!
//! Drives one peer through its lifecycle: register, read chunks and submit
//! them for broadcast, then close the transport and deregister.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite};
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::broadcaster::Broadcaster;
use crate::message::{is_blank, Message};
use crate::peer::PeerConnection;
use crate::registry::PeerRegistry;
use crate::types::PeerAddr;

/// Connection lifecycle states
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// Accepted, not yet in the registry
    Connecting,
    /// In the registry, read loop not started
    Registered,
    /// Read loop running
    Reading,
    /// Transport closed and deregistered
    Closed,
}

/// Why a connection's read loop ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    /// Peer closed its side of the stream
    Eof,
    /// Server shutdown cancelled the read loop
    Shutdown,
    /// Too many consecutive read errors
    ReadErrors,
}

/// What a finished connection did
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnectionSummary {
    /// Messages accepted by the broadcaster
    pub submitted: u64,
    /// Blank reads and refused submissions
    pub discarded: u64,
    /// Read errors seen over the whole connection
    pub read_errors: u64,
    /// How the read loop ended
    pub reason: CloseReason,
}

/// Settings a handler reads from the relay config
#[derive(Debug, Clone, Copy)]
pub struct HandlerSettings {
    /// Capacity of one read
    pub read_buffer_size: usize,
    /// Consecutive read errors before giving up (0 = never)
    pub max_consecutive_read_errors: u32,
    /// Stop reading when shutdown fires
    pub close_on_shutdown: bool,
    /// Limit on one write or close to this peer
    pub write_timeout: Duration,
}

/// Per-connection handler
///
/// Owns the read half of the transport; the write half lives in the
/// registry entry created on `run`.
pub struct ConnectionHandler<R, W> {
    addr: PeerAddr,
    reader: R,
    peer: Arc<PeerConnection<W>>,
    registry: Arc<PeerRegistry<W>>,
    broadcaster: Broadcaster,
    shutdown: watch::Receiver<bool>,
    settings: HandlerSettings,
    state: ConnectionState,
}

impl<R, W> ConnectionHandler<R, W>
where
    R: AsyncRead + Unpin + Send,
    W: AsyncWrite + Unpin + Send,
{
    /// Create a handler for a freshly accepted connection
    pub fn new(
        addr: PeerAddr,
        reader: R,
        writer: W,
        registry: Arc<PeerRegistry<W>>,
        broadcaster: Broadcaster,
        shutdown: watch::Receiver<bool>,
        settings: HandlerSettings,
    ) -> Self {
        Self {
            addr,
            reader,
            peer: Arc::new(PeerConnection::new(addr, writer).write_timeout(settings.write_timeout)),
            registry,
            broadcaster,
            shutdown,
            settings,
            state: ConnectionState::Connecting,
        }
    }

    /// Current lifecycle state
    pub fn state(&self) -> ConnectionState {
        self.state
    }

    /// Run the connection to completion
    ///
    /// Teardown always runs once the read loop returns, whatever ended it.
    pub async fn run(mut self) -> ConnectionSummary {
        self.registry.add(Arc::clone(&self.peer)).await;
        self.transition(ConnectionState::Registered);
        info!(peer = %self.addr, session = %self.peer.session, "Client connected");

        let summary = self.read_loop().await;

        if let Err(e) = self.peer.close().await {
            debug!(peer = %self.addr, error = %e, "Failed to close transport");
        }
        self.registry.remove(&self.peer).await;
        self.transition(ConnectionState::Closed);
        info!(
            peer = %self.addr,
            submitted = summary.submitted,
            reason = ?summary.reason,
            "Client disconnected"
        );

        summary
    }

    async fn read_loop(&mut self) -> ConnectionSummary {
        self.transition(ConnectionState::Reading);

        let mut buf = vec![0u8; self.settings.read_buffer_size.max(1)];
        let mut submitted = 0u64;
        let mut discarded = 0u64;
        let mut read_errors = 0u64;
        let mut consecutive_errors = 0u32;

        let reason = loop {
            let read = tokio::select! {
                read = self.reader.read(&mut buf) => read,
                _ = wait_for_shutdown(&mut self.shutdown), if self.settings.close_on_shutdown => {
                    break CloseReason::Shutdown;
                }
            };

            let n = match read {
                // A zero-length read into a non-empty buffer is end of stream
                Ok(0) => break CloseReason::Eof,
                Ok(n) => {
                    consecutive_errors = 0;
                    n
                }
                Err(e) => {
                    read_errors += 1;
                    consecutive_errors += 1;
                    warn!(peer = %self.addr, error = %e, "Failed to read from connection");

                    let limit = self.settings.max_consecutive_read_errors;
                    if limit > 0 && consecutive_errors >= limit {
                        break CloseReason::ReadErrors;
                    }
                    continue;
                }
            };

            let chunk = &buf[..n];
            if is_blank(chunk) {
                discarded += 1;
                debug!(peer = %self.addr, bytes = n, "Discarding blank read");
                continue;
            }

            let message = Message::new(self.addr, Bytes::copy_from_slice(chunk));
            match self.broadcaster.submit(message).await {
                Ok(()) => submitted += 1,
                Err(e) => {
                    discarded += 1;
                    debug!(peer = %self.addr, error = %e, "Message not accepted");
                }
            }
        };

        ConnectionSummary {
            submitted,
            discarded,
            read_errors,
            reason,
        }
    }

    fn transition(&mut self, next: ConnectionState) {
        debug!(peer = %self.addr, from = ?self.state, to = ?next, "Connection state");
        self.state = next;
    }
}

/// Resolve once the shutdown flag is set or its sender is gone
async fn wait_for_shutdown(shutdown: &mut watch::Receiver<bool>) {
    // Err means the server dropped the sender, which is shutdown too
    let _ = shutdown.wait_for(|stopped| *stopped).await;
}
