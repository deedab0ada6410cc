//! Broadcaster queue
//!
//! Decouples "a message arrived" from "deliver it to peers". Connection
//! handlers submit through cloned `Broadcaster` handles; the server's
//! dispatch loop owns the single `MessageQueue` end.

use tokio::sync::mpsc;

use crate::error::SubmitError;
use crate::message::Message;

/// Create a broadcaster and its queue with the given capacity
pub fn channel(capacity: usize) -> (Broadcaster, MessageQueue) {
    let (tx, rx) = mpsc::channel(capacity);
    (Broadcaster { tx }, MessageQueue { rx })
}

/// Submission side of the message queue
///
/// Cheap to clone; every connection handler holds one.
#[derive(Debug, Clone)]
pub struct Broadcaster {
    tx: mpsc::Sender<Message>,
}

impl Broadcaster {
    /// Hand a message to the dispatch loop
    ///
    /// Waits while the queue is full. Fails once the queue has been closed.
    pub async fn submit(&self, message: Message) -> Result<(), SubmitError> {
        self.tx
            .send(message)
            .await
            .map_err(|_| SubmitError::QueueClosed)
    }

    /// Check if the queue stopped accepting messages
    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

/// Consumption side of the message queue
#[derive(Debug)]
pub struct MessageQueue {
    rx: mpsc::Receiver<Message>,
}

impl MessageQueue {
    /// Receive the next message
    ///
    /// Returns `None` once the queue is closed and drained, or every
    /// broadcaster has been dropped.
    pub async fn recv(&mut self) -> Option<Message> {
        self.rx.recv().await
    }

    /// Stop accepting submissions
    ///
    /// Messages already queued stay receivable so they can be drained.
    pub fn close(&mut self) {
        self.rx.close();
    }
}
