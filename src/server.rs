//! Relay server
//!
//! Owns the listener, the peer registry and the message queue. Runs two
//! activities side by side: accepting connections and dispatching queued
//! messages to peers. Shutdown is driven by a caller-supplied future.

use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::AsyncWrite;
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{watch, OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinSet;
use tokio::time::timeout;
use tracing::{debug, error, info, warn};

use crate::broadcaster::{self, Broadcaster, MessageQueue};
use crate::config::RelayConfig;
use crate::error::RelayError;
use crate::handler::{ConnectionHandler, HandlerSettings};
use crate::message::Message;
use crate::registry::PeerRegistry;

/// Registry type used by the TCP server
pub type TcpPeerRegistry = PeerRegistry<OwnedWriteHalf>;

/// Server lifecycle states
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerState {
    /// Constructed, `serve` not called yet
    Idle,
    /// Accepting connections and dispatching messages
    Serving,
    /// Shutdown observed; queue closed and draining
    ShuttingDown,
    /// `serve` has returned
    Stopped,
}

/// Result of a clean stop
///
/// Returned by `serve` once shutdown has been observed. This is the
/// expected outcome of a stop request, not a failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Stopped {
    /// Connections handed to a handler over the server's lifetime
    pub connections_accepted: u64,
    /// Messages taken off the queue and delivered
    pub messages_dispatched: u64,
}

impl std::fmt::Display for Stopped {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "shutting down server ({} connections accepted, {} messages dispatched)",
            self.connections_accepted, self.messages_dispatched
        )
    }
}

/// TCP chat relay server
pub struct RelayServer {
    listener: TcpListener,
    config: RelayConfig,
    registry: Arc<TcpPeerRegistry>,
    broadcaster: Broadcaster,
    queue: MessageQueue,
    state: watch::Sender<ServerState>,
}

impl RelayServer {
    /// Create a server around an already bound listener
    pub fn new(listener: TcpListener, config: RelayConfig) -> Self {
        let (broadcaster, queue) = broadcaster::channel(config.queue_capacity.max(1));
        let (state, _) = watch::channel(ServerState::Idle);

        Self {
            listener,
            config,
            registry: Arc::new(PeerRegistry::new()),
            broadcaster,
            queue,
            state,
        }
    }

    /// Validate the config, bind its address and create a server
    pub async fn bind(config: RelayConfig) -> Result<Self, RelayError> {
        config.validate()?;
        let listener = TcpListener::bind(config.bind_addr).await?;
        Ok(Self::new(listener, config))
    }

    /// Address the listener is bound to
    pub fn local_addr(&self) -> Result<SocketAddr, RelayError> {
        Ok(self.listener.local_addr()?)
    }

    /// Shared handle to the peer registry
    pub fn registry(&self) -> Arc<TcpPeerRegistry> {
        Arc::clone(&self.registry)
    }

    /// Submit side of the message queue
    ///
    /// Messages submitted here are delivered to every peer except the
    /// message's sender, like any message read from a connection.
    pub fn broadcaster(&self) -> Broadcaster {
        self.broadcaster.clone()
    }

    /// Watch the server's lifecycle state
    pub fn subscribe_state(&self) -> watch::Receiver<ServerState> {
        self.state.subscribe()
    }

    /// Serve until `shutdown` resolves
    ///
    /// On shutdown the accept loop stops, the queue is closed to new
    /// messages, and queued and in-flight deliveries are finished within
    /// the drain timeout. Only then are connections told to end, if the
    /// config asks for it.
    pub async fn serve<F>(self, shutdown: F) -> Stopped
    where
        F: Future<Output = ()> + Send,
    {
        let RelayServer {
            listener,
            config,
            registry,
            broadcaster,
            queue,
            state,
        } = self;

        let (stop_tx, stop_rx) = watch::channel(false);
        // Connections are told to end only once queued messages are out
        let (disconnect_tx, disconnect_rx) = watch::channel(false);
        state.send_replace(ServerState::Serving);
        if let Ok(addr) = listener.local_addr() {
            info!(addr = %addr, "Relay serving");
        }

        let accept_task = tokio::spawn(accept_loop(
            listener,
            config.clone(),
            Arc::clone(&registry),
            broadcaster,
            stop_rx.clone(),
            disconnect_rx,
        ));
        let dispatch_task = tokio::spawn(dispatch_loop(
            queue,
            Arc::clone(&registry),
            limiter(config.max_inflight_deliveries),
            config.shutdown_drain_timeout(),
            stop_rx,
        ));

        shutdown.await;
        info!("Shutdown signal received");
        state.send_replace(ServerState::ShuttingDown);
        stop_tx.send_replace(true);

        let connections_accepted = accept_task.await.unwrap_or_else(|e| {
            error!(error = %e, "Accept task failed");
            0
        });
        let messages_dispatched = dispatch_task.await.unwrap_or_else(|e| {
            error!(error = %e, "Dispatch task failed");
            0
        });
        disconnect_tx.send_replace(true);

        let remaining_peers = registry.len().await;
        state.send_replace(ServerState::Stopped);
        info!(
            connections_accepted,
            messages_dispatched,
            remaining_peers,
            "Relay stopped"
        );

        Stopped {
            connections_accepted,
            messages_dispatched,
        }
    }
}

fn limiter(max: usize) -> Option<Arc<Semaphore>> {
    (max > 0).then(|| Arc::new(Semaphore::new(max)))
}

async fn wait_for_stop(stop: &mut watch::Receiver<bool>) {
    let _ = stop.wait_for(|stopped| *stopped).await;
}

/// Accept connections until stopped; returns how many were handed off
async fn accept_loop(
    listener: TcpListener,
    config: RelayConfig,
    registry: Arc<TcpPeerRegistry>,
    broadcaster: Broadcaster,
    mut stop: watch::Receiver<bool>,
    disconnect: watch::Receiver<bool>,
) -> u64 {
    let connection_limit = limiter(config.max_connections);
    let settings = HandlerSettings {
        read_buffer_size: config.read_buffer_size,
        max_consecutive_read_errors: config.max_consecutive_read_errors,
        close_on_shutdown: config.close_connections_on_shutdown,
        write_timeout: config.write_timeout(),
    };
    let mut accepted = 0u64;

    loop {
        tokio::select! {
            biased;
            _ = wait_for_stop(&mut stop) => break,
            result = listener.accept() => match result {
                Ok((stream, addr)) => {
                    let permit = match &connection_limit {
                        Some(sem) => match Arc::clone(sem).try_acquire_owned() {
                            Ok(permit) => Some(permit),
                            Err(_) => {
                                warn!(peer = %addr, "Connection rejected: limit reached");
                                continue;
                            }
                        },
                        None => None,
                    };

                    if config.tcp_nodelay {
                        if let Err(e) = stream.set_nodelay(true) {
                            debug!(peer = %addr, error = %e, "Failed to set TCP_NODELAY");
                        }
                    }

                    accepted += 1;
                    spawn_handler(
                        stream,
                        addr,
                        Arc::clone(&registry),
                        broadcaster.clone(),
                        disconnect.clone(),
                        settings,
                        permit,
                    );
                }
                Err(e) => {
                    error!(error = %e, "Failed to accept connection");
                }
            }
        }
    }

    debug!(accepted, "Accept loop ended");
    accepted
}

fn spawn_handler(
    stream: TcpStream,
    addr: SocketAddr,
    registry: Arc<TcpPeerRegistry>,
    broadcaster: Broadcaster,
    disconnect: watch::Receiver<bool>,
    settings: HandlerSettings,
    permit: Option<OwnedSemaphorePermit>,
) {
    let (reader, writer) = stream.into_split();
    let handler =
        ConnectionHandler::new(addr, reader, writer, registry, broadcaster, disconnect, settings);

    tokio::spawn(async move {
        let summary = handler.run().await;
        debug!(peer = %addr, ?summary, "Connection handler finished");
        drop(permit);
    });
}

/// Deliver queued messages until stopped, then drain
///
/// Each message gets its own delivery task so a slow pass does not hold
/// up the next dequeue. After stop, whatever is still queued or in flight
/// gets `drain_timeout` to finish; deliveries left after that are aborted.
/// Returns the number of messages dispatched.
async fn dispatch_loop<W>(
    mut queue: MessageQueue,
    registry: Arc<PeerRegistry<W>>,
    limit: Option<Arc<Semaphore>>,
    drain_timeout: Duration,
    mut stop: watch::Receiver<bool>,
) -> u64
where
    W: AsyncWrite + Unpin + Send + 'static,
{
    let mut deliveries = JoinSet::new();
    let mut dispatched = 0u64;

    loop {
        tokio::select! {
            biased;
            _ = wait_for_stop(&mut stop) => {
                queue.close();
                break;
            }
            message = queue.recv() => match message {
                Some(message) => {
                    spawn_delivery(&mut deliveries, &registry, &limit, message).await;
                    dispatched += 1;
                }
                None => break,
            },
            Some(result) = deliveries.join_next(), if !deliveries.is_empty() => {
                log_delivery_result(result);
            }
        }
    }

    // Closed to new submissions; finish what was already queued
    let drained = timeout(drain_timeout, async {
        while let Some(message) = queue.recv().await {
            spawn_delivery(&mut deliveries, &registry, &limit, message).await;
            dispatched += 1;
        }
        while let Some(result) = deliveries.join_next().await {
            log_delivery_result(result);
        }
    })
    .await;

    if drained.is_err() {
        warn!(
            pending = deliveries.len(),
            timeout = ?drain_timeout,
            "Shutdown drain timed out, aborting remaining deliveries"
        );
        deliveries.shutdown().await;
    }

    debug!(dispatched, "Dispatch loop ended");
    dispatched
}

async fn spawn_delivery<W>(
    deliveries: &mut JoinSet<()>,
    registry: &Arc<PeerRegistry<W>>,
    limit: &Option<Arc<Semaphore>>,
    message: Message,
) where
    W: AsyncWrite + Unpin + Send + 'static,
{
    let permit = match limit {
        Some(sem) => Arc::clone(sem).acquire_owned().await.ok(),
        None => None,
    };
    let registry = Arc::clone(registry);

    deliveries.spawn(async move {
        deliver(&registry, &message).await;
        drop(permit);
    });
}

async fn deliver<W>(registry: &PeerRegistry<W>, message: &Message)
where
    W: AsyncWrite + Unpin + Send,
{
    info!(
        sender = %message.sender(),
        at = %message.time_of_day(),
        content = %String::from_utf8_lossy(message.payload()).trim_end(),
        "Message broadcast"
    );

    let frame = message.render();
    let report = registry.broadcast(message.sender(), &frame).await;
    debug!(
        sender = %message.sender(),
        delivered = report.delivered,
        failed = report.failed,
        "Delivery pass complete"
    );
}

fn log_delivery_result(result: Result<(), tokio::task::JoinError>) {
    if let Err(e) = result {
        error!(error = %e, "Delivery task failed");
    }
}
