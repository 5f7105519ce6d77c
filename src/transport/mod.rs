//! Boundary between the hub and the non-blocking transport library.
//!
//! A transport owns the listener and the sessions. During one service round
//! it reports what happened as [`TransportEvent`]s, delivered synchronously
//! to a [`TransportContext`] (the hub), using the same reason vocabulary a
//! callback-per-reason C library would: watch add/remove/change, accept
//! filter, established, receive, writable, closed.
//!
//! # Implementations
//!
//! - [`websocket::WsTransport`] - TCP listener speaking WebSocket, the
//!   negotiated subprotocol names the channel.
//! - [`loopback::LoopbackTransport`] - scripted in-memory transport for tests
//!   and for embedders that bring their own I/O.

// Rust guideline compliant 2026-02

pub mod loopback;
pub mod websocket;

use std::os::fd::RawFd;
use std::time::Duration;

use anyhow::Result;

use crate::hub::readiness::Interest;

/// Something that happened in the transport during a service round.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportEvent<'a> {
    /// Start watching a new descriptor (listener or accepted socket).
    AddWatch {
        /// Descriptor to watch.
        fd: RawFd,
        /// Initial interest.
        interest: Interest,
    },
    /// Stop watching a descriptor.
    RemoveWatch {
        /// Descriptor to forget.
        fd: RawFd,
    },
    /// Adjust the interest of a watched descriptor.
    ChangeWatch {
        /// Watched descriptor.
        fd: RawFd,
        /// Flags to add.
        set: Interest,
        /// Flags to remove.
        clear: Interest,
    },
    /// A new session asks to join `protocol`. Must be answered immediately.
    FilterConnection {
        /// Session descriptor.
        fd: RawFd,
        /// Negotiated protocol (channel name).
        protocol: &'a str,
    },
    /// The session is open for traffic.
    Established {
        /// Session descriptor.
        fd: RawFd,
        /// Negotiated protocol (channel name).
        protocol: &'a str,
    },
    /// One complete message arrived.
    Receive {
        /// Session descriptor.
        fd: RawFd,
        /// Message bytes. Valid only for the duration of the callback.
        data: &'a [u8],
    },
    /// The session can take another write.
    Writable {
        /// Session descriptor.
        fd: RawFd,
    },
    /// The session is gone.
    Closed {
        /// Session descriptor.
        fd: RawFd,
    },
}

/// Answer to [`TransportEvent::FilterConnection`]. Other events are always
/// answered with [`Verdict::Accept`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    /// Let the session proceed.
    Accept,
    /// Drop the session.
    Reject,
}

/// Receiver of transport events; implemented by the hub.
pub trait TransportContext {
    /// Handle one event. Must not block.
    fn on_transport_event(&mut self, event: TransportEvent<'_>) -> Verdict;

    /// Interest currently registered for `fd`. Transports use this to decide
    /// whether to poll a session for writability.
    fn interest(&self, fd: RawFd) -> Interest;
}

/// A non-blocking, readiness-driven message transport.
pub trait Transport {
    /// Run one round of I/O, waiting at most `max_wait` for readiness, and
    /// report everything that happened to `ctx`.
    ///
    /// # Errors
    ///
    /// Returns an error only for failures of the round as a whole (e.g. the
    /// poll call itself failing). Per-session failures are reported as
    /// [`TransportEvent::Closed`].
    fn service(&mut self, max_wait: Duration, ctx: &mut dyn TransportContext) -> Result<()>;

    /// Write one complete message to the session on `fd`.
    ///
    /// A message the socket cannot take yet stays buffered in the transport,
    /// which then reports [`TransportEvent::ChangeWatch`] setting
    /// [`Interest::WRITABLE`] on `ctx`, and clears it again once the buffer
    /// has drained.
    ///
    /// # Errors
    ///
    /// Any error means the session is unusable; the caller treats it as
    /// closed.
    fn write(&mut self, fd: RawFd, payload: &[u8], ctx: &mut dyn TransportContext) -> Result<()>;

    /// Close the session on `fd`. No [`TransportEvent::Closed`] follows.
    ///
    /// Buffered writes are still delivered: a session that cannot flush yet
    /// may be re-announced with [`TransportEvent::AddWatch`] and is withdrawn
    /// with [`TransportEvent::RemoveWatch`] once drained.
    fn close(&mut self, fd: RawFd, ctx: &mut dyn TransportContext);
}
