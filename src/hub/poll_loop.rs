//! A minimal `poll(2)` event loop.
//!
//! Stands in for the GUI toolkit's main loop when the hub runs standalone:
//! it mirrors the readiness registry's watch set and blocks until one of the
//! watched descriptors is ready, after which the caller runs a service step.

use std::io;
use std::os::fd::RawFd;
use std::time::Duration;

use super::readiness::{EventLoop, Interest};

/// Watch set mirrored from the hub, waited on with `poll(2)`.
#[derive(Default)]
pub struct PollLoop {
    fds: Vec<libc::pollfd>,
}

impl std::fmt::Debug for PollLoop {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PollLoop")
            .field("watched", &self.fds.len())
            .finish()
    }
}

impl PollLoop {
    /// Create an empty loop.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Block until a watched descriptor is ready or `timeout` elapses.
    ///
    /// Returns the number of ready descriptors (0 on timeout or when
    /// interrupted by a signal).
    ///
    /// # Errors
    ///
    /// Returns the OS error if `poll(2)` fails for any reason other than
    /// `EINTR`.
    pub fn wait(&mut self, timeout: Duration) -> io::Result<usize> {
        poll_fds(&mut self.fds, timeout)
    }

    /// Interest currently mirrored for `fd`.
    #[must_use]
    pub fn interest(&self, fd: RawFd) -> Option<libc::c_short> {
        self.fds.iter().find(|p| p.fd == fd).map(|p| p.events)
    }

    /// Number of watched descriptors.
    #[must_use]
    pub fn len(&self) -> usize {
        self.fds.len()
    }

    /// True if nothing is watched.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.fds.is_empty()
    }
}

impl EventLoop for PollLoop {
    fn watch(&mut self, fd: RawFd, interest: Interest) {
        if let Some(pfd) = self.fds.iter_mut().find(|p| p.fd == fd) {
            pfd.events = interest.to_poll_events();
            return;
        }
        self.fds.push(libc::pollfd {
            fd,
            events: interest.to_poll_events(),
            revents: 0,
        });
    }

    fn unwatch(&mut self, fd: RawFd) {
        self.fds.retain(|p| p.fd != fd);
    }

    fn modify(&mut self, fd: RawFd, interest: Interest) {
        self.watch(fd, interest);
    }
}

/// Call `poll(2)` on `fds`, clearing stale `revents` first.
///
/// Returns the number of ready descriptors; an `EINTR` counts as a timeout.
pub(crate) fn poll_fds(fds: &mut [libc::pollfd], timeout: Duration) -> io::Result<usize> {
    for pfd in fds.iter_mut() {
        pfd.revents = 0;
    }
    let timeout_ms = i32::try_from(timeout.as_millis()).unwrap_or(i32::MAX);

    // SAFETY: `fds` is an exclusively borrowed slice of initialised `pollfd`
    // structs and the length passed matches it.
    let rc = unsafe { libc::poll(fds.as_mut_ptr(), fds.len() as libc::nfds_t, timeout_ms) };
    if rc < 0 {
        let err = io::Error::last_os_error();
        if err.kind() == io::ErrorKind::Interrupted {
            return Ok(0);
        }
        return Err(err);
    }
    Ok(rc as usize)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use std::os::fd::AsRawFd;
    use std::os::unix::net::UnixStream;

    #[test]
    fn test_mirrors_watch_changes() {
        let mut lp = PollLoop::new();
        lp.watch(7, Interest::READABLE);
        lp.modify(7, Interest::READABLE | Interest::WRITABLE);
        assert_eq!(lp.len(), 1);
        assert_eq!(lp.interest(7), Some(libc::POLLIN | libc::POLLOUT));
        lp.unwatch(7);
        assert!(lp.is_empty());
    }

    #[test]
    fn test_wait_times_out_without_activity() {
        let (a, _b) = UnixStream::pair().unwrap();
        let mut lp = PollLoop::new();
        lp.watch(a.as_raw_fd(), Interest::READABLE);
        assert_eq!(lp.wait(Duration::from_millis(10)).unwrap(), 0);
    }

    #[test]
    fn test_wait_reports_readable_descriptor() {
        let (a, mut b) = UnixStream::pair().unwrap();
        let mut lp = PollLoop::new();
        lp.watch(a.as_raw_fd(), Interest::READABLE);
        b.write_all(b"ping").unwrap();
        assert_eq!(lp.wait(Duration::from_secs(1)).unwrap(), 1);
    }
}
