//! In-process message fan-out.
//!
//! Embedders subscribe to delivered messages without touching the log
//! files. The dispatcher publishes after a message is committed to stable
//! state; slow subscribers lose oldest messages rather than blocking the
//! pipeline.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio::sync::broadcast;

use pulse_types::message::StoredMessage;

/// Broadcast bus for delivered messages.
#[derive(Clone)]
pub struct MessageBus {
    sender: broadcast::Sender<StoredMessage>,
    sequence: Arc<AtomicU64>,
}

impl MessageBus {
    /// Create a bus with the given per-subscriber buffer capacity.
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self {
            sender,
            sequence: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Publish a committed message to all subscribers.
    pub fn publish(&self, message: StoredMessage) {
        self.sequence.fetch_add(1, Ordering::SeqCst);
        // No subscribers is fine.
        let _ = self.sender.send(message);
    }

    /// Subscribe to future messages.
    pub fn subscribe(&self) -> broadcast::Receiver<StoredMessage> {
        self.sender.subscribe()
    }

    /// Messages published over the bus lifetime.
    pub fn sequence(&self) -> u64 {
        self.sequence.load(Ordering::SeqCst)
    }
}

impl Default for MessageBus {
    fn default() -> Self {
        Self::new(256)
    }
}
