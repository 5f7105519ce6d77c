//! Recyclable message storage.
//!
//! Every payload that crosses the hub (inbound from a transport session or
//! outbound to one) lives in a slot of the [`MessagePool`]. Queues only hold
//! [`MessageId`]s, so a message has exactly one owner at a time and moving it
//! between queues never copies the payload.
//!
//! Released slots go onto a free stack and are handed out again by the next
//! [`MessagePool::acquire`]. The buffer keeps its capacity across reuse but is
//! cleared first, so a recycled slot can never expose bytes from its previous
//! occupant.

// Rust guideline compliant 2026-02

use std::collections::TryReserveError;

use super::channel::ChannelTag;
use super::connection::ConnectionId;

/// Handle to a message slot in a [`MessagePool`].
///
/// Carries the slot generation so a handle that outlived its message is
/// rejected instead of aliasing whatever now occupies the slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct MessageId {
    index: u32,
    generation: u32,
}

impl MessageId {
    /// Slot index, stable across reuse of the slot.
    #[must_use]
    pub fn index(self) -> usize {
        self.index as usize
    }
}

/// Failure to obtain storage for a message.
#[derive(Debug)]
pub enum PoolError {
    /// The allocator could not grow the slot table or the payload buffer.
    Exhausted(TryReserveError),
}

impl std::fmt::Display for PoolError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Exhausted(e) => write!(f, "Message pool exhausted: {e}"),
        }
    }
}

impl std::error::Error for PoolError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Exhausted(e) => Some(e),
        }
    }
}

impl From<TryReserveError> for PoolError {
    fn from(e: TryReserveError) -> Self {
        Self::Exhausted(e)
    }
}

#[derive(Debug, Default)]
struct Slot {
    generation: u32,
    live: bool,
    channel: Option<ChannelTag>,
    connection: Option<ConnectionId>,
    data: Vec<u8>,
}

/// Slot array plus free-index stack for message payloads.
///
/// The pool bounds reuse, not the number of outstanding messages: when the
/// free stack is empty a new slot is appended.
#[derive(Debug, Default)]
pub struct MessagePool {
    slots: Vec<Slot>,
    free: Vec<u32>,
}

impl MessagePool {
    /// Create an empty pool.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Copy `payload` into pool-owned storage.
    ///
    /// `channel` is the target (outbound) or source (inbound) channel;
    /// `connection` is the session an inbound message arrived on.
    ///
    /// # Errors
    ///
    /// Returns [`PoolError::Exhausted`] if the allocator refuses to grow the
    /// slot table or the payload buffer. The pool is left unchanged.
    pub fn acquire(
        &mut self,
        channel: ChannelTag,
        connection: Option<ConnectionId>,
        payload: &[u8],
    ) -> Result<MessageId, PoolError> {
        let index = match self.free.pop() {
            Some(index) => index,
            None => {
                self.slots.try_reserve(1)?;
                self.slots.push(Slot::default());
                (self.slots.len() - 1) as u32
            }
        };

        let slot = &mut self.slots[index as usize];
        slot.data.clear();
        if let Err(e) = slot.data.try_reserve(payload.len()) {
            self.free.push(index);
            return Err(e.into());
        }
        slot.data.extend_from_slice(payload);
        slot.channel = Some(channel);
        slot.connection = connection;
        slot.live = true;

        Ok(MessageId {
            index,
            generation: slot.generation,
        })
    }

    /// Return a message's slot to the free stack.
    ///
    /// Returns `false` (and changes nothing) if the handle is stale or was
    /// already released.
    pub fn release(&mut self, id: MessageId) -> bool {
        let Some(slot) = self.slot_mut(id) else {
            log::warn!("[Pool] Ignoring release of stale message slot {}", id.index);
            return false;
        };
        slot.live = false;
        slot.generation = slot.generation.wrapping_add(1);
        slot.channel = None;
        slot.connection = None;
        slot.data.clear();
        self.free.push(id.index);
        true
    }

    /// Payload bytes of a live message.
    #[must_use]
    pub fn payload(&self, id: MessageId) -> Option<&[u8]> {
        self.slot(id).map(|slot| slot.data.as_slice())
    }

    /// Channel a live message targets or came from.
    #[must_use]
    pub fn channel(&self, id: MessageId) -> Option<ChannelTag> {
        self.slot(id).and_then(|slot| slot.channel)
    }

    /// Connection an inbound message arrived on.
    #[must_use]
    pub fn connection(&self, id: MessageId) -> Option<ConnectionId> {
        self.slot(id).and_then(|slot| slot.connection)
    }

    /// Number of messages currently owned by some queue or caller.
    #[must_use]
    pub fn live(&self) -> usize {
        self.slots.len() - self.free.len()
    }

    /// Number of slots waiting on the free stack.
    #[must_use]
    pub fn free(&self) -> usize {
        self.free.len()
    }

    /// Total slots ever allocated.
    #[must_use]
    pub fn slots(&self) -> usize {
        self.slots.len()
    }

    fn slot(&self, id: MessageId) -> Option<&Slot> {
        self.slots
            .get(id.index as usize)
            .filter(|slot| slot.live && slot.generation == id.generation)
    }

    fn slot_mut(&mut self, id: MessageId) -> Option<&mut Slot> {
        self.slots
            .get_mut(id.index as usize)
            .filter(|slot| slot.live && slot.generation == id.generation)
    }
}
