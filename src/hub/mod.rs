//! The IPC hub: channel routing, connection lifecycle and the service loop.
//!
//! # Architecture
//!
//! ```text
//! external event loop ──ready──► Hub::service_once(max_wait)
//!                                   │
//!                                   ├─ (a) Transport::service ──events──► HubCore
//!                                   │        accept filter / established / receive
//!                                   │        writable / closed / watch changes
//!                                   │
//!                                   ├─ (b) drain inbound FIFO ──► ChannelRouter
//!                                   │        handlers record replies / sends / close
//!                                   │
//!                                   └─ (c) one write per writable connection
//!                                            WRITABLE interest cleared when drained
//! ```
//!
//! `WRITABLE` stays in a connection's watch set while either side has
//! something to write: the hub's outbound queue, or bytes the transport
//! buffered after a short write (announced with
//! [`TransportEvent::ChangeWatch`]).
//!
//! Everything runs on the caller's thread. The hub never sleeps or blocks on
//! its own; the only wait is the `max_wait` bound handed to the transport.
//!
//! # Ownership
//!
//! Payloads live in the [`MessagePool`]. A message handle is owned by exactly
//! one queue (the shared inbound FIFO or one connection's outbound FIFO) and
//! is released back to the pool as soon as it is delivered or dropped.

// Rust guideline compliant 2026-02

pub mod channel;
pub mod connection;
pub mod message;
pub mod poll_loop;
pub mod queue;
pub mod readiness;

use std::os::fd::RawFd;
use std::time::Duration;

use anyhow::{Context, Result};

use crate::transport::{Transport, TransportContext, TransportEvent, Verdict};
use channel::{ChannelHandler, ChannelRouter, ChannelTag, ConnectionInfo, HandlerContext, RegisterError};
use connection::{ConnectionId, ConnectionState, ConnectionTable, OpenError};
use message::{MessageId, MessagePool};
use queue::MessageQueue;
use readiness::{EventLoop, Interest, ReadinessRegistry};

/// Greeting the hub sends on a fresh command-channel connection.
pub const HANDSHAKE_REQUEST: &[u8] = b"REQ_ANS_HELLO";

/// Reply expected from the peer before its commands are trusted.
pub const HANDSHAKE_REPLY: &[u8] = b"ANS HELLO";

/// Why an outbound message was not queued.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SendError {
    /// No channel with that name or tag is registered.
    UnknownChannel(String),
    /// The channel exists but has no live connection. Expected and frequent:
    /// peers come and go.
    ChannelUnavailable(ChannelTag),
    /// No storage for the message.
    PoolExhausted,
}

impl std::fmt::Display for SendError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::UnknownChannel(name) => write!(f, "Unknown channel: {name}"),
            Self::ChannelUnavailable(tag) => write!(f, "Channel {tag} has no live connection"),
            Self::PoolExhausted => write!(f, "Message pool exhausted"),
        }
    }
}

impl std::error::Error for SendError {}

/// What one [`Hub::service_once`] call did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ServiceReport {
    /// Transport events handled.
    pub events: usize,
    /// Inbound messages delivered to channel handlers.
    pub routed: usize,
    /// Outbound messages written to the transport.
    pub written: usize,
    /// Connections the hub closed itself (handler request or write error).
    pub closed: usize,
}

/// Snapshot of hub counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct HubStats {
    /// Connections bound to a channel.
    pub live_connections: usize,
    /// Accepted sessions that are not routed (channel already bound).
    pub orphaned_connections: usize,
    /// Messages currently held by a queue.
    pub messages_live: usize,
    /// Recycled message slots waiting for reuse.
    pub messages_free: usize,
    /// Messages waiting in the inbound FIFO.
    pub inbound_queued: usize,
    /// Inbound messages dropped (orphaned session, closed connection, pool exhaustion).
    pub dropped_inbound: usize,
    /// Outbound messages dropped (no live connection, connection closed first).
    pub dropped_outbound: usize,
}

/// Collects channels and options, then produces a [`Hub`].
pub struct HubBuilder {
    router: ChannelRouter,
    reject_duplicates: bool,
    error: Option<RegisterError>,
}

impl std::fmt::Debug for HubBuilder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HubBuilder")
            .field("router", &self.router)
            .field("reject_duplicates", &self.reject_duplicates)
            .field("error", &self.error)
            .finish()
    }
}

impl Default for HubBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl HubBuilder {
    /// Start with no channels.
    #[must_use]
    pub fn new() -> Self {
        Self {
            router: ChannelRouter::new(),
            reject_duplicates: false,
            error: None,
        }
    }

    /// Register a channel. The first registration error is kept and reported
    /// by [`HubBuilder::build`].
    pub fn channel(
        mut self,
        tag: ChannelTag,
        name: impl Into<String>,
        handler: Box<dyn ChannelHandler>,
    ) -> Self {
        if self.error.is_none() {
            if let Err(e) = self.router.register(tag, name, handler) {
                self.error = Some(e);
            }
        }
        self
    }

    /// Refuse a second session for an already bound channel at the accept
    /// filter instead of accepting it unrouted.
    pub fn reject_duplicates(mut self, reject: bool) -> Self {
        self.reject_duplicates = reject;
        self
    }

    /// Channel names registered so far, in order. Hand these to the
    /// transport as its protocol list.
    #[must_use]
    pub fn protocols(&self) -> Vec<String> {
        self.router.protocols()
    }

    /// Seal the channel set and assemble the hub.
    pub fn build<T, L>(mut self, transport: T, event_loop: L) -> Result<Hub<T, L>, RegisterError>
    where
        T: Transport,
        L: EventLoop,
    {
        if let Some(e) = self.error {
            return Err(e);
        }
        let tags = self.router.tags();
        if tags.is_empty() {
            return Err(RegisterError::NoChannels);
        }
        self.router.seal();
        log::info!("[Hub] Channels: {}", self.router.protocols().join(", "));

        Ok(Hub {
            transport,
            core: HubCore {
                router: self.router,
                connections: ConnectionTable::new(&tags),
                readiness: ReadinessRegistry::new(event_loop),
                pool: MessagePool::new(),
                inbound: MessageQueue::new(),
                orphans: Vec::new(),
                pending_close: Vec::new(),
                reject_duplicates: self.reject_duplicates,
                events: 0,
                dropped_inbound: 0,
                dropped_outbound: 0,
            },
            scratch: Vec::new(),
        })
    }
}

/// The hub: one transport, a fixed channel set, and the queues between them.
pub struct Hub<T, L> {
    transport: T,
    core: HubCore<L>,
    /// Copy of the payload being written, so the transport can report back
    /// into `core` during the write.
    scratch: Vec<u8>,
}

impl<T, L> std::fmt::Debug for Hub<T, L> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Hub")
            .field("router", &self.core.router)
            .field("live_connections", &self.core.connections.len())
            .field("inbound_queued", &self.core.inbound.len())
            .finish_non_exhaustive()
    }
}

impl<T: Transport, L: EventLoop> Hub<T, L> {
    /// Queue `payload` for the channel named `channel`.
    ///
    /// Never blocks. If the channel has no live connection the message is
    /// dropped at once and [`SendError::ChannelUnavailable`] returned.
    pub fn send(&mut self, channel: &str, payload: &[u8]) -> Result<(), SendError> {
        let tag = self
            .core
            .router
            .tag_for(channel)
            .ok_or_else(|| SendError::UnknownChannel(channel.to_string()))?;
        self.core.send_bytes(tag, payload)
    }

    /// Queue `payload` for the channel with tag `tag`.
    pub fn send_to(&mut self, tag: ChannelTag, payload: &[u8]) -> Result<(), SendError> {
        if self.core.router.channel(tag).is_none() {
            return Err(SendError::UnknownChannel(tag.to_string()));
        }
        self.core.send_bytes(tag, payload)
    }

    /// Run one service step.
    ///
    /// (a) one transport I/O round bounded by `max_wait`, (b) the whole
    /// inbound FIFO through the channel handlers, (c) at most one write per
    /// writable connection, then any closes requested along the way.
    ///
    /// # Errors
    ///
    /// Only if the transport round itself fails. Session-level failures are
    /// handled by closing the affected connection.
    pub fn service_once(&mut self, max_wait: Duration) -> Result<ServiceReport> {
        let events_before = self.core.events;
        self.transport
            .service(max_wait, &mut self.core)
            .context("Transport service round failed")?;

        let routed = self.core.drain_inbound();
        let written = self.flush_writable();
        let closed = self.run_pending_closes();

        Ok(ServiceReport {
            events: self.core.events - events_before,
            routed,
            written,
            closed,
        })
    }

    /// Close the live connection of `tag`, dropping anything still queued.
    ///
    /// Returns `false` if the channel had no live connection.
    pub fn close_channel(&mut self, tag: ChannelTag) -> bool {
        let Some(id) = self.core.connections.lookup_by_channel(tag) else {
            return false;
        };
        self.close_connection(id)
    }

    /// Close every connection and orphaned session and release every queued
    /// message.
    pub fn shutdown(&mut self) {
        for id in self.core.connections.live_ids() {
            self.close_connection(id);
        }
        for fd in std::mem::take(&mut self.core.orphans) {
            self.core.readiness.unwatch(fd);
            self.transport.close(fd, &mut self.core);
        }
        let pending: Vec<MessageId> = self.core.inbound.drain().collect();
        for msg in pending {
            self.core.pool.release(msg);
        }
        log::info!("[Hub] Shut down");
    }

    /// Counters and queue sizes.
    #[must_use]
    pub fn stats(&self) -> HubStats {
        HubStats {
            live_connections: self.core.connections.len(),
            orphaned_connections: self.core.orphans.len(),
            messages_live: self.core.pool.live(),
            messages_free: self.core.pool.free(),
            inbound_queued: self.core.inbound.len(),
            dropped_inbound: self.core.dropped_inbound,
            dropped_outbound: self.core.dropped_outbound,
        }
    }

    /// State of the connection bound to `tag`, if any.
    #[must_use]
    pub fn connection_state(&self, tag: ChannelTag) -> Option<ConnectionState> {
        let id = self.core.connections.lookup_by_channel(tag)?;
        self.core.connections.get(id).map(|conn| conn.state)
    }

    /// Live connection handle bound to `tag`.
    #[must_use]
    pub fn connection(&self, tag: ChannelTag) -> Option<ConnectionId> {
        self.core.connections.lookup_by_channel(tag)
    }

    /// Session id learned on the connection bound to `tag`.
    #[must_use]
    pub fn session_id(&self, tag: ChannelTag) -> Option<&str> {
        let id = self.core.connections.lookup_by_channel(tag)?;
        self.core.connections.get(id)?.session_id.as_deref()
    }

    /// Messages waiting to be written on the connection bound to `tag`.
    #[must_use]
    pub fn outbound_len(&self, tag: ChannelTag) -> usize {
        self.core
            .connections
            .lookup_by_channel(tag)
            .and_then(|id| self.core.connections.get(id))
            .map_or(0, |conn| conn.outbound.len())
    }

    /// Channel names in registration order.
    #[must_use]
    pub fn protocols(&self) -> Vec<String> {
        self.core.router.protocols()
    }

    /// The readiness registry.
    #[must_use]
    pub fn readiness(&self) -> &ReadinessRegistry<L> {
        &self.core.readiness
    }

    /// The embedding event loop.
    #[must_use]
    pub fn event_loop(&self) -> &L {
        self.core.readiness.event_loop()
    }

    /// Mutable access to the embedding event loop, e.g. to wait on it.
    pub fn event_loop_mut(&mut self) -> &mut L {
        self.core.readiness.event_loop_mut()
    }

    /// The transport.
    #[must_use]
    pub fn transport(&self) -> &T {
        &self.transport
    }

    /// Mutable access to the transport.
    pub fn transport_mut(&mut self) -> &mut T {
        &mut self.transport
    }

    /// Write one queued message on every connection the transport reported
    /// writable. Returns the number written.
    fn flush_writable(&mut self) -> usize {
        let mut written = 0;
        for id in self.core.connections.live_ids() {
            let Some(conn) = self.core.connections.get_mut(id) else {
                continue;
            };
            if !conn.writable {
                continue;
            }
            conn.writable = false;
            let fd = conn.fd;
            let closing = conn.closing;

            let Some(msg) = conn.outbound.dequeue() else {
                // Writable with nothing to say: stop asking.
                if !conn.transport_backlog {
                    self.core.readiness.clear_flags(fd, Interest::WRITABLE);
                }
                continue;
            };
            let remaining = conn.outbound.len();

            self.scratch.clear();
            let result = match self.core.pool.payload(msg) {
                Some(payload) => {
                    self.scratch.extend_from_slice(payload);
                    self.transport.write(fd, &self.scratch, &mut self.core)
                }
                None => Ok(()),
            };
            self.core.pool.release(msg);

            match result {
                Ok(()) => {
                    written += 1;
                    log::trace!("[Hub] Wrote message on fd {fd}, {remaining} left");
                    if remaining == 0 {
                        let backlog = self
                            .core
                            .connections
                            .get(id)
                            .is_some_and(|conn| conn.transport_backlog);
                        if !backlog {
                            self.core.readiness.clear_flags(fd, Interest::WRITABLE);
                        }
                        if closing {
                            self.core.pending_close.push(id);
                        }
                    }
                }
                Err(e) => {
                    log::warn!("[Hub] Write failed on fd {fd}, closing connection: {e:#}");
                    self.core.pending_close.push(id);
                }
            }
        }
        written
    }

    fn run_pending_closes(&mut self) -> usize {
        let mut closed = 0;
        for id in std::mem::take(&mut self.core.pending_close) {
            if self.close_connection(id) {
                closed += 1;
            }
        }
        closed
    }

    fn close_connection(&mut self, id: ConnectionId) -> bool {
        match self.core.close_connection(id) {
            Some(fd) => {
                self.transport.close(fd, &mut self.core);
                true
            }
            None => false,
        }
    }
}

/// Hub state reachable from transport callbacks. Split from [`Hub`] so the
/// transport can be borrowed mutably while it reports into this.
struct HubCore<L> {
    router: ChannelRouter,
    connections: ConnectionTable,
    readiness: ReadinessRegistry<L>,
    pool: MessagePool,
    inbound: MessageQueue,
    orphans: Vec<RawFd>,
    pending_close: Vec<ConnectionId>,
    reject_duplicates: bool,
    events: usize,
    dropped_inbound: usize,
    dropped_outbound: usize,
}

impl<L: EventLoop> HubCore<L> {
    fn filter(&self, fd: RawFd, protocol: &str) -> Verdict {
        let Some(tag) = self.router.tag_for(protocol) else {
            log::warn!("[Hub] Rejecting fd {fd}: unknown protocol '{protocol}'");
            return Verdict::Reject;
        };
        if self.reject_duplicates && self.connections.lookup_by_channel(tag).is_some() {
            log::info!("[Hub] Rejecting fd {fd}: channel '{protocol}' already bound");
            return Verdict::Reject;
        }
        Verdict::Accept
    }

    fn on_established(&mut self, fd: RawFd, protocol: &str) {
        let Some(tag) = self.router.tag_for(protocol) else {
            log::error!("[Hub] Session on fd {fd} established for unknown protocol '{protocol}'");
            self.orphans.push(fd);
            return;
        };

        match self.connections.open(tag, fd) {
            Ok(id) => {
                self.readiness.bind_connection(fd, id);
                log::info!("[Hub] Channel '{protocol}' connected on fd {fd} ({id})");
                if tag.requires_handshake() {
                    if let Err(e) = self.send_bytes(tag, HANDSHAKE_REQUEST) {
                        log::warn!("[Hub] Could not queue greeting on fd {fd}: {e}");
                    }
                } else {
                    self.notify_open(id);
                }
            }
            Err(OpenError::ChannelBusy(_)) => {
                log::warn!(
                    "[Hub] Channel '{protocol}' already bound; session on fd {fd} will not be routed"
                );
                self.orphans.push(fd);
            }
            Err(e) => {
                log::error!("[Hub] Cannot bind fd {fd}: {e}");
                self.orphans.push(fd);
            }
        }
    }

    fn on_receive(&mut self, fd: RawFd, data: &[u8]) {
        if self.orphans.contains(&fd) {
            log::debug!("[Hub] Dropping {} bytes from unrouted session on fd {fd}", data.len());
            self.dropped_inbound += 1;
            return;
        }
        let Some(id) = self.connections.lookup(fd) else {
            log::debug!("[Hub] Dropping {} bytes for unknown fd {fd}", data.len());
            self.dropped_inbound += 1;
            return;
        };
        let Some(tag) = self.connections.get(id).map(|conn| conn.channel) else {
            return;
        };
        match self.pool.acquire(tag, Some(id), data) {
            Ok(msg) => self.inbound.enqueue(msg),
            Err(e) => {
                log::warn!("[Hub] Dropping inbound message on fd {fd}: {e}");
                self.dropped_inbound += 1;
            }
        }
    }

    fn on_closed(&mut self, fd: RawFd) {
        if let Some(pos) = self.orphans.iter().position(|&o| o == fd) {
            self.orphans.swap_remove(pos);
            self.readiness.unwatch(fd);
            log::debug!("[Hub] Unrouted session on fd {fd} closed");
            return;
        }
        match self.connections.lookup(fd) {
            Some(id) => {
                self.close_connection(id);
            }
            None => {
                self.readiness.unwatch(fd);
            }
        }
    }

    /// Apply a watch change requested by the transport. `WRITABLE` requested
    /// for a connection is remembered as a transport backlog; clearing it
    /// leaves the flag in place while the hub's own queue is non-empty.
    fn on_change_watch(&mut self, fd: RawFd, set: Interest, mut clear: Interest) {
        if self.readiness.entry(fd).is_none() {
            log::trace!("[Hub] Watch change for unwatched fd {fd} ignored");
            return;
        }
        let conn = self
            .connections
            .lookup(fd)
            .and_then(|id| self.connections.get_mut(id));
        if let Some(conn) = conn {
            if set.contains(Interest::WRITABLE) {
                conn.transport_backlog = true;
            }
            if clear.contains(Interest::WRITABLE) {
                conn.transport_backlog = false;
                if !conn.outbound.is_empty() {
                    clear.remove(Interest::WRITABLE);
                }
            }
        }
        let mut interest = self.readiness.interest(fd);
        interest.insert(set);
        interest.remove(clear);
        self.readiness.watch(fd, interest);
    }

    /// Deliver every queued inbound message. Returns how many reached a handler.
    fn drain_inbound(&mut self) -> usize {
        let mut routed = 0;
        while let Some(msg) = self.inbound.dequeue() {
            let conn = self
                .pool
                .connection(msg)
                .and_then(|id| self.connections.get(id).map(|conn| (id, conn)));
            let Some((id, conn)) = conn else {
                log::debug!("[Hub] Connection closed before delivery, dropping message");
                self.pool.release(msg);
                self.dropped_inbound += 1;
                continue;
            };

            if !conn.is_established() {
                let fd = conn.fd;
                if !self.pool.payload(msg).is_some_and(is_handshake_reply) {
                    log::warn!("[Hub] Unexpected handshake reply on fd {fd}, accepting peer anyway");
                }
                self.pool.release(msg);
                if let Some(conn) = self.connections.get_mut(id) {
                    conn.state = ConnectionState::Established;
                }
                log::info!("[Hub] Handshake complete on fd {fd}");
                self.notify_open(id);
                continue;
            }

            let info = ConnectionInfo {
                id,
                channel: self.pool.channel(msg).unwrap_or(conn.channel),
                session_id: conn.session_id.clone(),
            };
            let mut ctx = HandlerContext::new(&info);
            let payload = self.pool.payload(msg).unwrap_or_default();
            if self.router.route_inbound(&mut ctx, payload) {
                routed += 1;
            }
            let actions = ctx.into_actions();
            self.pool.release(msg);
            self.apply_actions(id, info.channel, actions);
        }
        routed
    }

    fn notify_open(&mut self, id: ConnectionId) {
        let Some(conn) = self.connections.get(id) else {
            return;
        };
        let info = ConnectionInfo {
            id,
            channel: conn.channel,
            session_id: conn.session_id.clone(),
        };
        let mut ctx = HandlerContext::new(&info);
        self.router.notify_open(&mut ctx);
        let actions = ctx.into_actions();
        self.apply_actions(id, info.channel, actions);
    }

    fn apply_actions(&mut self, id: ConnectionId, tag: ChannelTag, actions: channel::HandlerActions) {
        if let Some(session_id) = actions.session_id {
            if let Some(conn) = self.connections.get_mut(id) {
                log::debug!("[Hub] {id} identified as '{session_id}'");
                conn.session_id = Some(session_id);
            }
        }
        for reply in actions.replies {
            if let Err(e) = self.send_bytes(tag, &reply) {
                log::debug!("[Hub] Reply on {tag} dropped: {e}");
            }
        }
        for (target, payload) in actions.sends {
            if let Err(e) = self.send_bytes(target, &payload) {
                log::debug!("[Hub] Message for {target} dropped: {e}");
            }
        }
        if actions.close {
            if let Some(conn) = self.connections.get_mut(id) {
                if conn.outbound.is_empty() {
                    self.pending_close.push(id);
                } else {
                    conn.closing = true;
                }
            }
        }
    }

    fn send_bytes(&mut self, tag: ChannelTag, payload: &[u8]) -> Result<(), SendError> {
        let msg = self.pool.acquire(tag, None, payload).map_err(|e| {
            log::warn!("[Hub] Dropping outbound message for {tag}: {e}");
            self.dropped_outbound += 1;
            SendError::PoolExhausted
        })?;
        self.enqueue_outbound(tag, msg)
    }

    /// Append `msg` to the outbound queue of `tag`'s connection, or release it
    /// immediately if the channel has none.
    fn enqueue_outbound(&mut self, tag: ChannelTag, msg: MessageId) -> Result<(), SendError> {
        let conn = self
            .connections
            .lookup_by_channel(tag)
            .and_then(|id| self.connections.get_mut(id));
        let Some(conn) = conn else {
            self.pool.release(msg);
            self.dropped_outbound += 1;
            return Err(SendError::ChannelUnavailable(tag));
        };

        let was_empty = conn.outbound.is_empty();
        conn.outbound.enqueue(msg);
        if was_empty {
            let fd = conn.fd;
            self.readiness.set_flags(fd, Interest::WRITABLE);
        }
        Ok(())
    }

    /// Tear down a connection: release its queue, unwatch its descriptor and
    /// tell its handler. Returns the descriptor, or `None` if already closed.
    fn close_connection(&mut self, id: ConnectionId) -> Option<RawFd> {
        let closed = self.connections.close(id)?;
        let dropped = closed.undelivered.len();
        for msg in closed.undelivered {
            self.pool.release(msg);
        }
        self.dropped_outbound += dropped;
        self.readiness.unwatch(closed.fd);
        self.router
            .notify_close(closed.channel, closed.session_id.as_deref());
        log::info!(
            "[Hub] Channel {} disconnected on fd {} ({} queued message(s) dropped)",
            closed.channel,
            closed.fd,
            dropped
        );
        Some(closed.fd)
    }
}

impl<L: EventLoop> TransportContext for HubCore<L> {
    fn on_transport_event(&mut self, event: TransportEvent<'_>) -> Verdict {
        self.events += 1;
        match event {
            TransportEvent::AddWatch { fd, interest } => self.readiness.watch(fd, interest),
            TransportEvent::RemoveWatch { fd } => {
                self.readiness.unwatch(fd);
            }
            TransportEvent::ChangeWatch { fd, set, clear } => self.on_change_watch(fd, set, clear),
            TransportEvent::FilterConnection { fd, protocol } => return self.filter(fd, protocol),
            TransportEvent::Established { fd, protocol } => self.on_established(fd, protocol),
            TransportEvent::Receive { fd, data } => self.on_receive(fd, data),
            TransportEvent::Writable { fd } => {
                if let Some(conn) = self
                    .connections
                    .lookup(fd)
                    .and_then(|id| self.connections.get_mut(id))
                {
                    conn.writable = true;
                }
            }
            TransportEvent::Closed { fd } => self.on_closed(fd),
        }
        Verdict::Accept
    }

    fn interest(&self, fd: RawFd) -> Interest {
        self.readiness.interest(fd)
    }
}

/// Strip the trailing NULs and whitespace peers tend to append to text
/// messages.
#[must_use]
pub fn trim_text(payload: &[u8]) -> &[u8] {
    let end = payload
        .iter()
        .rposition(|b| *b != 0 && !b.is_ascii_whitespace())
        .map_or(0, |pos| pos + 1);
    &payload[..end]
}

fn is_handshake_reply(payload: &[u8]) -> bool {
    trim_text(payload) == HANDSHAKE_REPLY
}
