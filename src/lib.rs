//! TCP Chat Relay Library
//!
//! A relay built on tokio: every chunk one client sends is written to all
//! other connected clients, tagged with the sender's address and the time
//! of day.
//!
//! # Features
//! - Concurrent peer registry with readers-writer locking
//! - One handler task per connection
//! - Queued fan-out with concurrent delivery passes
//! - Clean shutdown that drains queued messages
//!
//! # Architecture
//! - `PeerRegistry` holds the write half of every connection, keyed by address
//! - Each connection's `ConnectionHandler` reads chunks and submits them
//!   to the shared `Broadcaster` queue
//! - `RelayServer` runs the accept loop and the dispatch loop, which writes
//!   each message to every peer except its sender
//!
//! There is no framing: one read is one message, so a line split across
//! two reads arrives at peers as two messages.
//!
//! # Example
//! ```ignore
//! use chat_relay::{RelayConfig, RelayServer};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), chat_relay::RelayError> {
//!     let server = RelayServer::bind(RelayConfig::default()).await?;
//!     let stopped = server
//!         .serve(async {
//!             let _ = tokio::signal::ctrl_c().await;
//!         })
//!         .await;
//!     println!("{stopped}");
//!     Ok(())
//! }
//! ```

pub mod broadcaster;
pub mod config;
pub mod error;
pub mod handler;
pub mod message;
pub mod peer;
pub mod registry;
pub mod server;
pub mod types;

// Re-export main types for convenience
pub use broadcaster::{Broadcaster, MessageQueue};
pub use config::RelayConfig;
pub use error::{RelayError, SubmitError};
pub use handler::{CloseReason, ConnectionHandler, ConnectionState, ConnectionSummary};
pub use message::Message;
pub use peer::PeerConnection;
pub use registry::{DeliveryReport, PeerRegistry};
pub use server::{RelayServer, ServerState, Stopped};
pub use types::{PeerAddr, SessionId};
