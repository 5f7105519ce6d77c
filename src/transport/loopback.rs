//! Scripted in-memory transport.
//!
//! Peers are simulated by queuing connects, messages and disconnects; the
//! next [`Transport::service`] round replays them to the hub in order,
//! followed by a writable notification for every open session whose
//! descriptor is watched for writes. Writes are captured instead of sent.
//! A session can be put in backlog mode, where writes are held back and
//! reported through watch changes the way a full socket buffer would be.
//!
//! [`RecordingLoop`] is the matching [`EventLoop`]: it records every watch
//! change so the mirrored watch set can be checked against the hub's.

use std::collections::{HashMap, VecDeque};
use std::os::fd::RawFd;
use std::time::Duration;

use anyhow::{bail, Result};

use super::{Transport, TransportContext, TransportEvent, Verdict};
use crate::hub::readiness::{EventLoop, Interest};

#[derive(Debug, Clone)]
enum Scripted {
    Connect { fd: RawFd, protocol: String },
    Receive { fd: RawFd, data: Vec<u8> },
    Disconnect { fd: RawFd },
    ChangeWatch { fd: RawFd, set: Interest, clear: Interest },
}

#[derive(Debug, Clone, Default)]
struct Session {
    protocol: String,
    open: bool,
    stalled: bool,
    fail_writes: bool,
    backlogged: bool,
    held: Vec<Vec<u8>>,
    closing: bool,
}

/// Transport whose peers are driven by the caller.
#[derive(Debug, Default)]
pub struct LoopbackTransport {
    script: VecDeque<Scripted>,
    sessions: HashMap<RawFd, Session>,
    writes: Vec<(RawFd, Vec<u8>)>,
    rejected: Vec<RawFd>,
    closed_by_hub: Vec<RawFd>,
}

impl LoopbackTransport {
    /// Create a transport with no peers.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// A peer connects on `fd` asking for `protocol`.
    pub fn connect(&mut self, fd: RawFd, protocol: &str) {
        self.script.push_back(Scripted::Connect {
            fd,
            protocol: protocol.to_string(),
        });
    }

    /// The peer on `fd` sends one message.
    pub fn receive(&mut self, fd: RawFd, data: &[u8]) {
        self.script.push_back(Scripted::Receive {
            fd,
            data: data.to_vec(),
        });
    }

    /// The peer on `fd` hangs up.
    pub fn disconnect(&mut self, fd: RawFd) {
        self.script.push_back(Scripted::Disconnect { fd });
    }

    /// The transport asks the hub to adjust the watch on `fd`.
    pub fn change_watch(&mut self, fd: RawFd, set: Interest, clear: Interest) {
        self.script.push_back(Scripted::ChangeWatch { fd, set, clear });
    }

    /// Hold writes to `fd` back (or let them through again), like a socket
    /// whose send buffer is full. While writes are held the session is not
    /// reported writable; they are delivered by the first service round
    /// after the backlog is lifted.
    pub fn backlog(&mut self, fd: RawFd, backlogged: bool) {
        self.sessions.entry(fd).or_default().backlogged = backlogged;
    }

    /// Writes to `fd` accepted but not delivered yet.
    #[must_use]
    pub fn held(&self, fd: RawFd) -> usize {
        self.sessions.get(&fd).map_or(0, |s| s.held.len())
    }

    /// Make every later write to `fd` fail.
    pub fn fail_writes(&mut self, fd: RawFd) {
        self.sessions.entry(fd).or_default().fail_writes = true;
    }

    /// Stop (or resume) reporting `fd` as writable, like a peer that stopped
    /// reading.
    pub fn stall(&mut self, fd: RawFd, stalled: bool) {
        self.sessions.entry(fd).or_default().stalled = stalled;
    }

    /// Every write so far, in order.
    #[must_use]
    pub fn writes(&self) -> &[(RawFd, Vec<u8>)] {
        &self.writes
    }

    /// Writes to one descriptor, in order.
    #[must_use]
    pub fn writes_to(&self, fd: RawFd) -> Vec<Vec<u8>> {
        self.writes
            .iter()
            .filter(|(target, _)| *target == fd)
            .map(|(_, data)| data.clone())
            .collect()
    }

    /// Take and clear the captured writes.
    pub fn take_writes(&mut self) -> Vec<(RawFd, Vec<u8>)> {
        std::mem::take(&mut self.writes)
    }

    /// Descriptors the accept filter turned away.
    #[must_use]
    pub fn rejected(&self) -> &[RawFd] {
        &self.rejected
    }

    /// Descriptors the hub closed itself.
    #[must_use]
    pub fn closed_by_hub(&self) -> &[RawFd] {
        &self.closed_by_hub
    }

    /// Whether the session on `fd` is open.
    #[must_use]
    pub fn is_open(&self, fd: RawFd) -> bool {
        self.sessions.get(&fd).is_some_and(|s| s.open)
    }

    fn replay(&mut self, step: Scripted, ctx: &mut dyn TransportContext) {
        match step {
            Scripted::Connect { fd, protocol } => {
                ctx.on_transport_event(TransportEvent::AddWatch {
                    fd,
                    interest: Interest::READABLE,
                });
                let verdict =
                    ctx.on_transport_event(TransportEvent::FilterConnection { fd, protocol: &protocol });
                if verdict == Verdict::Reject {
                    ctx.on_transport_event(TransportEvent::RemoveWatch { fd });
                    self.rejected.push(fd);
                    return;
                }
                ctx.on_transport_event(TransportEvent::Established { fd, protocol: &protocol });
                let session = self.sessions.entry(fd).or_default();
                session.protocol = protocol;
                session.open = true;
            }
            Scripted::Receive { fd, data } => {
                if self.is_open(fd) {
                    ctx.on_transport_event(TransportEvent::Receive { fd, data: &data });
                } else {
                    log::debug!("[Loopback] fd {fd} is not open, {} bytes discarded", data.len());
                }
            }
            Scripted::Disconnect { fd } => {
                if let Some(session) = self.sessions.get_mut(&fd).filter(|s| s.open) {
                    session.open = false;
                    session.held.clear();
                    ctx.on_transport_event(TransportEvent::Closed { fd });
                    ctx.on_transport_event(TransportEvent::RemoveWatch { fd });
                }
            }
            Scripted::ChangeWatch { fd, set, clear } => {
                ctx.on_transport_event(TransportEvent::ChangeWatch { fd, set, clear });
            }
        }
    }

    /// Deliver held writes of sessions no longer backlogged.
    fn drain_held(&mut self, ctx: &mut dyn TransportContext) {
        let mut drained: Vec<RawFd> = self
            .sessions
            .iter()
            .filter(|(_, s)| !s.backlogged && !s.held.is_empty())
            .map(|(fd, _)| *fd)
            .collect();
        drained.sort_unstable();

        for fd in drained {
            let Some(session) = self.sessions.get_mut(&fd) else {
                continue;
            };
            let held = std::mem::take(&mut session.held);
            let closing = std::mem::take(&mut session.closing);
            self.writes.extend(held.into_iter().map(|data| (fd, data)));
            if closing {
                ctx.on_transport_event(TransportEvent::RemoveWatch { fd });
            } else {
                ctx.on_transport_event(TransportEvent::ChangeWatch {
                    fd,
                    set: Interest::NONE,
                    clear: Interest::WRITABLE,
                });
            }
        }
    }
}

impl Transport for LoopbackTransport {
    fn service(&mut self, _max_wait: Duration, ctx: &mut dyn TransportContext) -> Result<()> {
        while let Some(step) = self.script.pop_front() {
            self.replay(step, ctx);
        }
        self.drain_held(ctx);

        let mut ready: Vec<RawFd> = self
            .sessions
            .iter()
            .filter(|(fd, s)| {
                s.open && !s.stalled && s.held.is_empty() && ctx.interest(**fd).contains(Interest::WRITABLE)
            })
            .map(|(fd, _)| *fd)
            .collect();
        ready.sort_unstable();
        for fd in ready {
            ctx.on_transport_event(TransportEvent::Writable { fd });
        }
        Ok(())
    }

    fn write(&mut self, fd: RawFd, payload: &[u8], ctx: &mut dyn TransportContext) -> Result<()> {
        let Some(session) = self.sessions.get_mut(&fd).filter(|s| s.open) else {
            bail!("fd {fd} is not open");
        };
        if session.fail_writes {
            bail!("write to fd {fd} ({}) failed", session.protocol);
        }
        if session.backlogged {
            if session.held.is_empty() {
                ctx.on_transport_event(TransportEvent::ChangeWatch {
                    fd,
                    set: Interest::WRITABLE,
                    clear: Interest::NONE,
                });
            }
            session.held.push(payload.to_vec());
            return Ok(());
        }
        self.writes.push((fd, payload.to_vec()));
        Ok(())
    }

    fn close(&mut self, fd: RawFd, ctx: &mut dyn TransportContext) {
        if let Some(session) = self.sessions.get_mut(&fd) {
            session.open = false;
            if !session.held.is_empty() {
                session.closing = true;
                ctx.on_transport_event(TransportEvent::AddWatch {
                    fd,
                    interest: Interest::WRITABLE,
                });
            }
        }
        self.closed_by_hub.push(fd);
    }
}

/// One change forwarded to a [`RecordingLoop`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatchCall {
    /// `watch(fd, interest)`
    Watch(RawFd, Interest),
    /// `unwatch(fd)`
    Unwatch(RawFd),
    /// `modify(fd, interest)`
    Modify(RawFd, Interest),
}

/// Event loop that records watch changes and keeps the resulting watch set.
#[derive(Debug, Default)]
pub struct RecordingLoop {
    /// Every call, oldest first.
    pub calls: Vec<WatchCall>,
    watched: HashMap<RawFd, Interest>,
}

impl RecordingLoop {
    /// Interest currently watched for `fd`.
    #[must_use]
    pub fn interest(&self, fd: RawFd) -> Option<Interest> {
        self.watched.get(&fd).copied()
    }

    /// Number of watched descriptors.
    #[must_use]
    pub fn watched(&self) -> usize {
        self.watched.len()
    }
}

impl EventLoop for RecordingLoop {
    fn watch(&mut self, fd: RawFd, interest: Interest) {
        self.calls.push(WatchCall::Watch(fd, interest));
        self.watched.insert(fd, interest);
    }

    fn unwatch(&mut self, fd: RawFd) {
        self.calls.push(WatchCall::Unwatch(fd));
        self.watched.remove(&fd);
    }

    fn modify(&mut self, fd: RawFd, interest: Interest) {
        self.calls.push(WatchCall::Modify(fd, interest));
        self.watched.insert(fd, interest);
    }
}
