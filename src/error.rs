//! Error types for the relay
//!
//! Defines crate-level errors and queue submission errors.
//! Uses thiserror for ergonomic error definitions.

use thiserror::Error;

/// Relay-level errors
///
/// Only raised outside the serve loop (binding, configuration). Failures
/// inside a running relay are contained and logged where they happen.
#[derive(Debug, Error)]
pub enum RelayError {
    /// IO error (bind, local address lookup, config file read)
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Configuration file could not be parsed
    #[error("Config parse error: {0}")]
    Config(#[from] serde_json::Error),

    /// Configuration parsed but holds an unusable value
    #[error("Invalid config: {0}")]
    InvalidConfig(String),
}

/// Message submission errors
///
/// Occurs when a connection hands a message to a broadcaster whose
/// queue has been closed for shutdown.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum SubmitError {
    /// The message queue no longer accepts submissions
    #[error("Message queue closed")]
    QueueClosed,
}
