//! Relay message definition
//!
//! A `Message` is one chunk read from a peer, stamped with its sender and
//! arrival time. There is no framing: the payload is exactly the bytes a
//! single read returned, and it is written to peers verbatim.

use bytes::Bytes;
use time::macros::format_description;
use time::OffsetDateTime;

use crate::types::PeerAddr;

/// Immutable relay message
///
/// Created by a connection handler for each non-blank read and consumed
/// once by the dispatch loop.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    timestamp: OffsetDateTime,
    sender: PeerAddr,
    payload: Bytes,
}

impl Message {
    /// Create a message stamped with the current time
    ///
    /// Uses local time when the offset can be determined, UTC otherwise.
    pub fn new(sender: PeerAddr, payload: Bytes) -> Self {
        let timestamp = OffsetDateTime::now_local().unwrap_or_else(|_| OffsetDateTime::now_utc());
        Self::with_timestamp(timestamp, sender, payload)
    }

    /// Create a message with an explicit timestamp
    pub fn with_timestamp(timestamp: OffsetDateTime, sender: PeerAddr, payload: Bytes) -> Self {
        Self {
            timestamp,
            sender,
            payload,
        }
    }

    /// When the message was read
    pub fn timestamp(&self) -> OffsetDateTime {
        self.timestamp
    }

    /// Address of the peer that sent the message
    pub fn sender(&self) -> PeerAddr {
        self.sender
    }

    /// Raw bytes as read from the sender
    pub fn payload(&self) -> &Bytes {
        &self.payload
    }

    /// Time of day in 12-hour kitchen form, e.g. `3:04PM`
    pub fn time_of_day(&self) -> String {
        self.timestamp
            .format(format_description!(
                "[hour repr:12 padding:none]:[minute][period]"
            ))
            .unwrap_or_else(|_| String::from("--:--"))
    }

    /// Render the frame written to every other peer
    ///
    /// Format: `[<time-of-day>] (<sender>) > <payload>`, no escaping and
    /// no length prefix.
    pub fn render(&self) -> Bytes {
        let prefix = format!("[{}] ({}) > ", self.time_of_day(), self.sender);
        let mut out = Vec::with_capacity(prefix.len() + self.payload.len());
        out.extend_from_slice(prefix.as_bytes());
        out.extend_from_slice(&self.payload);
        Bytes::from(out)
    }
}

/// Check whether a read carries nothing but whitespace
///
/// Such reads (a bare newline, stray spaces) are dropped instead of being
/// broadcast. An empty slice counts as blank.
pub fn is_blank(payload: &[u8]) -> bool {
    payload.iter().all(u8::is_ascii_whitespace)
}
