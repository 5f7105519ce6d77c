//! Descriptor watch bookkeeping shared with the embedding event loop.
//!
//! The registry records, per transport descriptor, which readiness events
//! are of interest and which connection (if any) owns the descriptor. Every
//! change is forwarded to the [`EventLoop`] before the call returns, so the
//! loop's watch set never lags behind what the transport expects.

use std::ops::{BitOr, BitOrAssign};
use std::os::fd::RawFd;

use super::connection::ConnectionId;

/// Set of readiness events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Hash)]
pub struct Interest(u8);

impl Interest {
    /// No events.
    pub const NONE: Self = Self(0);
    /// Data can be read.
    pub const READABLE: Self = Self(0b01);
    /// Data can be written.
    pub const WRITABLE: Self = Self(0b10);

    /// True if every flag in `other` is set.
    #[must_use]
    pub fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    /// Add the flags in `other`.
    pub fn insert(&mut self, other: Self) {
        self.0 |= other.0;
    }

    /// Remove the flags in `other`.
    pub fn remove(&mut self, other: Self) {
        self.0 &= !other.0;
    }

    /// True if no flag is set.
    #[must_use]
    pub fn is_empty(self) -> bool {
        self.0 == 0
    }

    /// Equivalent `poll(2)` event mask.
    #[must_use]
    pub fn to_poll_events(self) -> libc::c_short {
        let mut events = 0;
        if self.contains(Self::READABLE) {
            events |= libc::POLLIN;
        }
        if self.contains(Self::WRITABLE) {
            events |= libc::POLLOUT;
        }
        events
    }
}

impl BitOr for Interest {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

impl BitOrAssign for Interest {
    fn bitor_assign(&mut self, rhs: Self) {
        self.0 |= rhs.0;
    }
}

/// The externally owned loop that watches descriptors and calls
/// [`Hub::service_once`](crate::hub::Hub::service_once) when one is ready.
pub trait EventLoop {
    /// Start watching `fd`.
    fn watch(&mut self, fd: RawFd, interest: Interest);

    /// Stop watching `fd`.
    fn unwatch(&mut self, fd: RawFd);

    /// Replace the interest set of an already watched `fd`.
    fn modify(&mut self, fd: RawFd, interest: Interest);
}

/// Event loop that ignores watch changes, for embedders that only drive the
/// hub by calling `service_once` on a timer.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullEventLoop;

impl EventLoop for NullEventLoop {
    fn watch(&mut self, _fd: RawFd, _interest: Interest) {}
    fn unwatch(&mut self, _fd: RawFd) {}
    fn modify(&mut self, _fd: RawFd, _interest: Interest) {}
}

/// One watched descriptor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReadinessEntry {
    /// Watched descriptor.
    pub fd: RawFd,
    /// Events of interest.
    pub interest: Interest,
    /// Connection sharing the descriptor, once the session is bound.
    pub connection: Option<ConnectionId>,
}

/// Descriptor → interest map, mirrored into an [`EventLoop`].
#[derive(Debug)]
pub struct ReadinessRegistry<L> {
    entries: Vec<ReadinessEntry>,
    event_loop: L,
}

impl<L: EventLoop> ReadinessRegistry<L> {
    /// Create an empty registry forwarding to `event_loop`.
    pub fn new(event_loop: L) -> Self {
        Self {
            entries: Vec::new(),
            event_loop,
        }
    }

    /// Watch `fd` for `interest`. An already watched descriptor has its
    /// interest replaced in place.
    pub fn watch(&mut self, fd: RawFd, interest: Interest) {
        if let Some(entry) = self.entry_mut(fd) {
            if entry.interest != interest {
                entry.interest = interest;
                self.event_loop.modify(fd, interest);
            }
            return;
        }
        self.entries.push(ReadinessEntry {
            fd,
            interest,
            connection: None,
        });
        self.event_loop.watch(fd, interest);
    }

    /// Stop watching `fd`. Returns `false` if it was not watched.
    pub fn unwatch(&mut self, fd: RawFd) -> bool {
        let Some(pos) = self.entries.iter().position(|e| e.fd == fd) else {
            return false;
        };
        self.entries.swap_remove(pos);
        self.event_loop.unwatch(fd);
        true
    }

    /// Add `flags` to the interest of `fd`.
    pub fn set_flags(&mut self, fd: RawFd, flags: Interest) {
        self.update(fd, |interest| interest.insert(flags));
    }

    /// Remove `flags` from the interest of `fd`.
    pub fn clear_flags(&mut self, fd: RawFd, flags: Interest) {
        self.update(fd, |interest| interest.remove(flags));
    }

    /// Record which connection owns `fd`, watching it for reads if the
    /// transport has not announced it yet.
    pub fn bind_connection(&mut self, fd: RawFd, connection: ConnectionId) {
        if self.entry_mut(fd).is_none() {
            self.watch(fd, Interest::READABLE);
        }
        if let Some(entry) = self.entry_mut(fd) {
            entry.connection = Some(connection);
        }
    }

    /// Current interest of `fd`; empty if unwatched.
    #[must_use]
    pub fn interest(&self, fd: RawFd) -> Interest {
        self.entry(fd).map_or(Interest::NONE, |e| e.interest)
    }

    /// Entry for `fd`.
    #[must_use]
    pub fn entry(&self, fd: RawFd) -> Option<&ReadinessEntry> {
        self.entries.iter().find(|e| e.fd == fd)
    }

    /// All watched entries.
    #[must_use]
    pub fn entries(&self) -> &[ReadinessEntry] {
        &self.entries
    }

    /// Number of watched descriptors.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// True if nothing is watched.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// The event loop receiving watch changes.
    pub fn event_loop(&self) -> &L {
        &self.event_loop
    }

    /// Mutable access to the event loop, e.g. to wait on it.
    pub fn event_loop_mut(&mut self) -> &mut L {
        &mut self.event_loop
    }

    fn update(&mut self, fd: RawFd, change: impl FnOnce(&mut Interest)) {
        let Some(entry) = self.entry_mut(fd) else {
            log::trace!("[Readiness] Flag change for unwatched fd {fd} ignored");
            return;
        };
        let before = entry.interest;
        change(&mut entry.interest);
        let after = entry.interest;
        if after != before {
            self.event_loop.modify(fd, after);
        }
    }

    fn entry_mut(&mut self, fd: RawFd) -> Option<&mut ReadinessEntry> {
        self.entries.iter_mut().find(|e| e.fd == fd)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::loopback::{RecordingLoop, WatchCall};

    #[test]
    fn test_interest_flag_ops() {
        let mut interest = Interest::READABLE;
        assert!(interest.contains(Interest::READABLE));
        assert!(!interest.contains(Interest::WRITABLE));
        interest.insert(Interest::WRITABLE);
        assert_eq!(interest, Interest::READABLE | Interest::WRITABLE);
        interest.remove(Interest::READABLE);
        assert_eq!(interest, Interest::WRITABLE);
        interest.remove(Interest::WRITABLE);
        assert!(interest.is_empty());
    }

    #[test]
    fn test_poll_event_mapping() {
        assert_eq!(Interest::READABLE.to_poll_events(), libc::POLLIN);
        assert_eq!(
            (Interest::READABLE | Interest::WRITABLE).to_poll_events(),
            libc::POLLIN | libc::POLLOUT
        );
        assert_eq!(Interest::NONE.to_poll_events(), 0);
    }

    #[test]
    fn test_watch_twice_updates_in_place() {
        let mut registry = ReadinessRegistry::new(RecordingLoop::default());
        registry.watch(3, Interest::READABLE);
        registry.watch(3, Interest::READABLE | Interest::WRITABLE);

        assert_eq!(registry.len(), 1);
        assert_eq!(registry.interest(3), Interest::READABLE | Interest::WRITABLE);
        assert_eq!(
            registry.event_loop().calls,
            vec![
                WatchCall::Watch(3, Interest::READABLE),
                WatchCall::Modify(3, Interest::READABLE | Interest::WRITABLE),
            ]
        );
    }

    #[test]
    fn test_set_and_clear_flags_propagate_only_changes() {
        let mut registry = ReadinessRegistry::new(RecordingLoop::default());
        registry.watch(4, Interest::READABLE);
        registry.set_flags(4, Interest::WRITABLE);
        registry.set_flags(4, Interest::WRITABLE);
        registry.clear_flags(4, Interest::WRITABLE);
        registry.clear_flags(4, Interest::WRITABLE);

        assert_eq!(
            registry.event_loop().calls,
            vec![
                WatchCall::Watch(4, Interest::READABLE),
                WatchCall::Modify(4, Interest::READABLE | Interest::WRITABLE),
                WatchCall::Modify(4, Interest::READABLE),
            ]
        );
        assert_eq!(registry.event_loop().interest(4), Some(registry.interest(4)));
    }

    #[test]
    fn test_unwatch_removes_entry() {
        let mut registry = ReadinessRegistry::new(RecordingLoop::default());
        registry.watch(5, Interest::READABLE);
        assert!(registry.unwatch(5));
        assert!(!registry.unwatch(5));
        assert!(registry.is_empty());
        assert_eq!(registry.interest(5), Interest::NONE);
        assert_eq!(registry.event_loop().interest(5), None);
    }

    #[test]
    fn test_flag_change_on_unwatched_fd_is_ignored() {
        let mut registry = ReadinessRegistry::new(RecordingLoop::default());
        registry.set_flags(8, Interest::WRITABLE);
        assert!(registry.is_empty());
        assert!(registry.event_loop().calls.is_empty());
    }
}
