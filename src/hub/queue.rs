//! FIFO of pooled message handles.
//!
//! Used for the single shared inbound queue and for each connection's
//! outbound queue. The queue owns handles, never payloads; whoever dequeues a
//! handle becomes responsible for releasing it back to the pool.

use std::collections::VecDeque;

use super::message::MessageId;

/// First-in first-out queue of [`MessageId`]s.
#[derive(Debug, Default)]
pub struct MessageQueue {
    items: VecDeque<MessageId>,
}

impl MessageQueue {
    /// Create an empty queue.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Append to the tail.
    pub fn enqueue(&mut self, id: MessageId) {
        self.items.push_back(id);
    }

    /// Remove the head, if any.
    pub fn dequeue(&mut self) -> Option<MessageId> {
        self.items.pop_front()
    }

    /// Head of the queue without removing it.
    #[must_use]
    pub fn peek(&self) -> Option<MessageId> {
        self.items.front().copied()
    }

    /// Number of queued handles.
    #[must_use]
    pub fn len(&self) -> usize {
        self.items.len()
    }

    /// True if nothing is queued.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Remove every handle, oldest first. Capacity is kept for reuse.
    pub fn drain(&mut self) -> impl Iterator<Item = MessageId> + '_ {
        self.items.drain(..)
    }
}
