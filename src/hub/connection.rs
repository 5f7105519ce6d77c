//! Live transport sessions, one per channel.
//!
//! Connections live in an index-addressed slot array. Closing a connection
//! bumps its slot generation and pushes the index onto a free stack, so the
//! next [`ConnectionTable::open`] reuses the slot (and its queue capacity)
//! while every handle to the old session goes stale. A stale handle makes
//! [`ConnectionTable::close`] a no-op, which is what keeps close idempotent.
//!
//! # State machine
//!
//! ```text
//! open ──► AwaitingHandshake ──(hello reply)──► Established
//!  └─────────────────(no handshake)──────────► Established
//! AwaitingHandshake | Established ──close──► Closed (slot recycled)
//! ```

use std::os::fd::RawFd;

use super::channel::ChannelTag;
use super::message::MessageId;
use super::queue::MessageQueue;

/// Handle to a connection slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnectionId {
    index: u32,
    generation: u32,
}

impl ConnectionId {
    /// Slot index. Reused after the connection closes.
    #[must_use]
    pub fn index(self) -> usize {
        self.index as usize
    }

    /// Slot generation this handle was issued for.
    #[must_use]
    pub fn generation(self) -> u32 {
        self.generation
    }
}

impl std::fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "conn:{}.{}", self.index, self.generation)
    }
}

/// Lifecycle state of a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// Transport connected, hello exchange not finished. Inbound traffic is
    /// consumed as the handshake reply and never routed.
    AwaitingHandshake,
    /// Ready for application traffic.
    Established,
    /// Terminal. The slot is on the free stack.
    Closed,
}

/// One transport session bound to a channel.
#[derive(Debug)]
pub struct Connection {
    /// Transport descriptor.
    pub fd: RawFd,
    /// Owning channel.
    pub channel: ChannelTag,
    /// Identifier learned from the peer.
    pub session_id: Option<String>,
    /// Lifecycle state.
    pub state: ConnectionState,
    /// Pending writes, oldest first.
    pub outbound: MessageQueue,
    /// The transport reported the descriptor writable since the last write.
    pub writable: bool,
    /// A handler asked to close once `outbound` drains.
    pub closing: bool,
    /// The transport still holds bytes it could not write and needs
    /// `WRITABLE` kept in the watch set.
    pub transport_backlog: bool,
}

impl Connection {
    fn reset(&mut self, fd: RawFd, channel: ChannelTag) {
        self.fd = fd;
        self.channel = channel;
        self.session_id = None;
        self.state = if channel.requires_handshake() {
            ConnectionState::AwaitingHandshake
        } else {
            ConnectionState::Established
        };
        self.writable = false;
        self.closing = false;
        self.transport_backlog = false;
    }

    /// Whether the connection is past the hello exchange.
    #[must_use]
    pub fn is_established(&self) -> bool {
        self.state == ConnectionState::Established
    }
}

/// Why [`ConnectionTable::open`] refused a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpenError {
    /// The channel is not part of the fixed channel set.
    UnknownChannel(ChannelTag),
    /// The channel already has a live connection.
    ChannelBusy(ChannelTag),
}

impl std::fmt::Display for OpenError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::UnknownChannel(tag) => write!(f, "Unknown channel {tag}"),
            Self::ChannelBusy(tag) => write!(f, "Channel {tag} already has a live connection"),
        }
    }
}

impl std::error::Error for OpenError {}

/// What [`ConnectionTable::close`] hands back to the caller.
#[derive(Debug)]
pub struct ClosedConnection {
    /// Descriptor of the closed session.
    pub fd: RawFd,
    /// Channel it was bound to.
    pub channel: ChannelTag,
    /// Session id it had learned.
    pub session_id: Option<String>,
    /// Undelivered outbound messages; the caller must release them.
    pub undelivered: Vec<MessageId>,
}

#[derive(Debug)]
struct Slot {
    generation: u32,
    conn: Connection,
}

/// Slot array of connections with a free-index stack.
#[derive(Debug)]
pub struct ConnectionTable {
    channels: Vec<ChannelTag>,
    slots: Vec<Slot>,
    free: Vec<u32>,
}

impl ConnectionTable {
    /// Create a table accepting sessions for the given channels.
    #[must_use]
    pub fn new(channels: &[ChannelTag]) -> Self {
        Self {
            channels: channels.to_vec(),
            slots: Vec::with_capacity(channels.len()),
            free: Vec::new(),
        }
    }

    /// Bind a new session on `fd` to `channel`.
    pub fn open(&mut self, channel: ChannelTag, fd: RawFd) -> Result<ConnectionId, OpenError> {
        if !self.channels.contains(&channel) {
            return Err(OpenError::UnknownChannel(channel));
        }
        if self.lookup_by_channel(channel).is_some() {
            return Err(OpenError::ChannelBusy(channel));
        }

        let index = match self.free.pop() {
            Some(index) => {
                self.slots[index as usize].conn.reset(fd, channel);
                index
            }
            None => {
                let mut conn = Connection {
                    fd,
                    channel,
                    session_id: None,
                    state: ConnectionState::Closed,
                    outbound: MessageQueue::new(),
                    writable: false,
                    closing: false,
                    transport_backlog: false,
                };
                conn.reset(fd, channel);
                self.slots.push(Slot { generation: 0, conn });
                (self.slots.len() - 1) as u32
            }
        };

        Ok(ConnectionId {
            index,
            generation: self.slots[index as usize].generation,
        })
    }

    /// Close a session and recycle its slot.
    ///
    /// Returns `None` if `id` is stale (already closed), in which case nothing
    /// changes.
    pub fn close(&mut self, id: ConnectionId) -> Option<ClosedConnection> {
        let slot = self.slot_mut(id)?;
        let undelivered = slot.conn.outbound.drain().collect();
        slot.conn.state = ConnectionState::Closed;
        slot.conn.writable = false;
        slot.conn.closing = false;
        slot.generation = slot.generation.wrapping_add(1);
        let closed = ClosedConnection {
            fd: slot.conn.fd,
            channel: slot.conn.channel,
            session_id: slot.conn.session_id.take(),
            undelivered,
        };
        self.free.push(id.index);
        Some(closed)
    }

    /// Live connection behind `id`.
    #[must_use]
    pub fn get(&self, id: ConnectionId) -> Option<&Connection> {
        self.slots
            .get(id.index as usize)
            .filter(|slot| slot.generation == id.generation && is_live(&slot.conn))
            .map(|slot| &slot.conn)
    }

    /// Mutable live connection behind `id`.
    pub fn get_mut(&mut self, id: ConnectionId) -> Option<&mut Connection> {
        self.slot_mut(id).map(|slot| &mut slot.conn)
    }

    /// Live connection using descriptor `fd`.
    #[must_use]
    pub fn lookup(&self, fd: RawFd) -> Option<ConnectionId> {
        self.find(|conn| conn.fd == fd)
    }

    /// Live connection bound to `channel`.
    #[must_use]
    pub fn lookup_by_channel(&self, channel: ChannelTag) -> Option<ConnectionId> {
        self.find(|conn| conn.channel == channel)
    }

    /// Handles of all live connections, in slot order.
    #[must_use]
    pub fn live_ids(&self) -> Vec<ConnectionId> {
        self.slots
            .iter()
            .enumerate()
            .filter(|(_, slot)| is_live(&slot.conn))
            .map(|(index, slot)| ConnectionId {
                index: index as u32,
                generation: slot.generation,
            })
            .collect()
    }

    /// Number of live connections.
    #[must_use]
    pub fn len(&self) -> usize {
        self.slots.len() - self.free.len()
    }

    /// True if no connection is live.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Slots on the free stack.
    #[must_use]
    pub fn free(&self) -> usize {
        self.free.len()
    }

    fn find(&self, pred: impl Fn(&Connection) -> bool) -> Option<ConnectionId> {
        self.slots
            .iter()
            .enumerate()
            .find(|(_, slot)| is_live(&slot.conn) && pred(&slot.conn))
            .map(|(index, slot)| ConnectionId {
                index: index as u32,
                generation: slot.generation,
            })
    }

    fn slot_mut(&mut self, id: ConnectionId) -> Option<&mut Slot> {
        self.slots
            .get_mut(id.index as usize)
            .filter(|slot| slot.generation == id.generation && is_live(&slot.conn))
    }
}

fn is_live(conn: &Connection) -> bool {
    conn.state != ConnectionState::Closed
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hub::message::MessagePool;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    const ALL: [ChannelTag; 4] = [
        ChannelTag::COMMAND,
        ChannelTag::STATUS,
        ChannelTag::DIALOG,
        ChannelTag::APPLICATION,
    ];

    #[test]
    fn test_open_sets_initial_state_per_channel() {
        let mut table = ConnectionTable::new(&ALL);
        let cmd = table.open(ChannelTag::COMMAND, 10).unwrap();
        let status = table.open(ChannelTag::STATUS, 11).unwrap();

        assert_eq!(table.get(cmd).unwrap().state, ConnectionState::AwaitingHandshake);
        assert_eq!(table.get(status).unwrap().state, ConnectionState::Established);
        assert!(!table.get(cmd).unwrap().is_established());
        assert!(table.get(status).unwrap().is_established());
        assert_eq!(table.len(), 2);
    }

    #[test]
    fn test_open_unknown_channel_fails() {
        let mut table = ConnectionTable::new(&[ChannelTag::STATUS]);
        assert_eq!(
            table.open(ChannelTag::DIALOG, 3),
            Err(OpenError::UnknownChannel(ChannelTag::DIALOG))
        );
        assert!(table.is_empty());
    }

    #[test]
    fn test_second_open_on_bound_channel_is_refused() {
        let mut table = ConnectionTable::new(&ALL);
        table.open(ChannelTag::DIALOG, 5).unwrap();
        assert_eq!(
            table.open(ChannelTag::DIALOG, 6),
            Err(OpenError::ChannelBusy(ChannelTag::DIALOG))
        );
        assert_eq!(table.lookup(6), None);
    }

    #[test]
    fn test_close_twice_is_noop() {
        let mut table = ConnectionTable::new(&ALL);
        let id = table.open(ChannelTag::STATUS, 9).unwrap();

        let first = table.close(id).unwrap();
        assert_eq!(first.fd, 9);
        assert_eq!(table.free(), 1);

        assert!(table.close(id).is_none());
        assert_eq!(table.free(), 1);
        assert_eq!(table.len(), 0);
    }

    #[test]
    fn test_closed_slot_is_reused_with_new_generation() {
        let mut table = ConnectionTable::new(&ALL);
        let old = table.open(ChannelTag::STATUS, 9).unwrap();
        table.close(old);

        let new = table.open(ChannelTag::DIALOG, 12).unwrap();
        assert_eq!(new.index(), old.index());
        assert_ne!(new.generation(), old.generation());
        assert!(table.get(old).is_none());
        assert_eq!(table.get(new).unwrap().fd, 12);
        // Stale handle must not close the new occupant.
        assert!(table.close(old).is_none());
        assert!(table.get(new).is_some());
    }

    #[test]
    fn test_close_returns_undelivered_messages() {
        let mut pool = MessagePool::new();
        let mut table = ConnectionTable::new(&ALL);
        let id = table.open(ChannelTag::STATUS, 4).unwrap();
        for payload in [&b"one"[..], b"two"] {
            let msg = pool.acquire(ChannelTag::STATUS, None, payload).unwrap();
            table.get_mut(id).unwrap().outbound.enqueue(msg);
        }

        let closed = table.close(id).unwrap();
        assert_eq!(closed.undelivered.len(), 2);
        assert_eq!(pool.payload(closed.undelivered[0]).unwrap(), b"one");
    }

    #[test]
    fn test_lookup_by_fd_and_channel() {
        let mut table = ConnectionTable::new(&ALL);
        let app = table.open(ChannelTag::APPLICATION, 21).unwrap();
        assert_eq!(table.lookup(21), Some(app));
        assert_eq!(table.lookup_by_channel(ChannelTag::APPLICATION), Some(app));
        assert_eq!(table.lookup_by_channel(ChannelTag::STATUS), None);
        table.close(app);
        assert_eq!(table.lookup(21), None);
    }

    #[test]
    fn test_random_open_close_keeps_one_live_connection_per_channel() {
        let mut rng = StdRng::seed_from_u64(0x5eed);
        let mut table = ConnectionTable::new(&ALL);
        let mut handles: Vec<ConnectionId> = Vec::new();

        for step in 0..2_000 {
            if rng.random_bool(0.55) {
                let channel = ALL[rng.random_range(0..ALL.len())];
                if let Ok(id) = table.open(channel, step) {
                    handles.push(id);
                }
            } else if !handles.is_empty() {
                let id = handles[rng.random_range(0..handles.len())];
                table.close(id);
            }

            for channel in ALL {
                let live = table
                    .live_ids()
                    .into_iter()
                    .filter(|id| table.get(*id).is_some_and(|c| c.channel == channel))
                    .count();
                assert!(live <= 1, "channel {channel} has {live} live connections");
            }
        }
    }
}
