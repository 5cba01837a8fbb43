//! Portable fd readiness notification.
//!
//! This module hides the platform event API behind the [`Poller`] trait with
//! three interchangeable backends: epoll on Linux, kqueue on macOS and the
//! BSDs, and a select-based fallback that works on any Unix. The kernel event
//! structure carries a plain [`Token`] (an index chosen by the caller), never
//! a pointer — dispatch looks the token up in the caller's own slot table.
//!
//! Add, modify, and remove are O(1) on the primary backends. One [`wait`]
//! iteration surfaces at most `max_events` ready descriptors; interruption by
//! a signal is reported as zero events so the caller's loop can observe its
//! signal flags.
//!
//! [`wait`]: Poller::wait

use std::io;
use std::ops::BitOr;
use std::os::unix::io::RawFd;
use std::time::Duration;

#[cfg(target_os = "linux")]
mod epoll;
#[cfg(any(
    target_os = "macos",
    target_os = "freebsd",
    target_os = "openbsd",
    target_os = "netbsd"
))]
mod kqueue;
mod select;

#[cfg(target_os = "linux")]
pub use epoll::Epoll;
#[cfg(any(
    target_os = "macos",
    target_os = "freebsd",
    target_os = "openbsd",
    target_os = "netbsd"
))]
pub use kqueue::Kqueue;
pub use select::Select;

/// Default capacity of the ready-event buffer per wait iteration.
pub const DEFAULT_MAX_EVENTS: usize = 1024;

/// Caller-chosen identifier attached to a registered fd.
///
/// Carried through the kernel event structure verbatim and handed back in
/// [`Event`]; the reactor attaches no meaning to it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Token(pub usize);

/// Interest mask for a registration: read, write, both, or neither.
///
/// `Interest::NONE` keeps the fd registered while reporting nothing, which
/// is how the relay suspends reads from a source whose destination is
/// backed up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Interest(u8);

impl Interest {
    pub const NONE: Interest = Interest(0);
    pub const READ: Interest = Interest(0b01);
    pub const WRITE: Interest = Interest(0b10);

    pub fn is_readable(self) -> bool {
        self.0 & Self::READ.0 != 0
    }

    pub fn is_writable(self) -> bool {
        self.0 & Self::WRITE.0 != 0
    }
}

impl BitOr for Interest {
    type Output = Interest;

    fn bitor(self, rhs: Interest) -> Interest {
        Interest(self.0 | rhs.0)
    }
}

/// Readiness reported for a registered fd.
///
/// Error and hangup are always reported when the kernel observes them,
/// whether or not they were asked for.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Readiness(u8);

impl Readiness {
    const READ: u8 = 0b0001;
    const WRITE: u8 = 0b0010;
    const ERROR: u8 = 0b0100;
    const HANGUP: u8 = 0b1000;

    pub(crate) fn new(read: bool, write: bool, error: bool, hangup: bool) -> Self {
        let mut bits = 0;
        if read {
            bits |= Self::READ;
        }
        if write {
            bits |= Self::WRITE;
        }
        if error {
            bits |= Self::ERROR;
        }
        if hangup {
            bits |= Self::HANGUP;
        }
        Readiness(bits)
    }

    pub fn is_readable(self) -> bool {
        self.0 & Self::READ != 0
    }

    pub fn is_writable(self) -> bool {
        self.0 & Self::WRITE != 0
    }

    pub fn is_error(self) -> bool {
        self.0 & Self::ERROR != 0
    }

    pub fn is_hangup(self) -> bool {
        self.0 & Self::HANGUP != 0
    }

    /// Error or hangup with no readable data to drain.
    pub fn is_closed(self) -> bool {
        (self.is_error() || self.is_hangup()) && !self.is_readable()
    }
}

/// One readiness notification.
#[derive(Debug, Clone, Copy)]
pub struct Event {
    pub token: Token,
    pub readiness: Readiness,
}

/// The backend contract. All three implementations share it.
pub trait Poller: Send {
    /// Register `fd` with the given interest. Registering an fd that is
    /// already present modifies it in place.
    fn add(&mut self, fd: RawFd, token: Token, interest: Interest) -> io::Result<()>;

    /// Change the interest mask (and token) of a registered fd.
    fn modify(&mut self, fd: RawFd, token: Token, interest: Interest) -> io::Result<()>;

    /// Remove an fd. Removing an fd that is unknown or already closed is
    /// not an error.
    fn remove(&mut self, fd: RawFd) -> io::Result<()>;

    /// Block up to `timeout` (forever when `None`) and append ready events.
    /// Returns the number of events appended; a signal interruption yields
    /// `Ok(0)`.
    fn wait(&mut self, events: &mut Vec<Event>, timeout: Option<Duration>) -> io::Result<usize>;

    /// Backend name for logging.
    fn name(&self) -> &'static str;
}

/// The platform-selected poller behind a uniform handle.
pub struct Reactor {
    poller: Box<dyn Poller>,
}

impl Reactor {
    /// Create a reactor on the platform's primary backend.
    pub fn new() -> io::Result<Self> {
        Self::with_max_events(DEFAULT_MAX_EVENTS)
    }

    pub fn with_max_events(max_events: usize) -> io::Result<Self> {
        #[cfg(target_os = "linux")]
        let poller: Box<dyn Poller> = Box::new(Epoll::new(max_events)?);
        #[cfg(any(
            target_os = "macos",
            target_os = "freebsd",
            target_os = "openbsd",
            target_os = "netbsd"
        ))]
        let poller: Box<dyn Poller> = Box::new(Kqueue::new(max_events)?);
        #[cfg(not(any(
            target_os = "linux",
            target_os = "macos",
            target_os = "freebsd",
            target_os = "openbsd",
            target_os = "netbsd"
        )))]
        let poller: Box<dyn Poller> = Box::new(Select::new(max_events)?);

        Ok(Self { poller })
    }

    /// Create a reactor on the portable select backend regardless of
    /// platform.
    pub fn portable() -> io::Result<Self> {
        Ok(Self {
            poller: Box::new(Select::new(DEFAULT_MAX_EVENTS)?),
        })
    }

    pub fn backend_name(&self) -> &'static str {
        self.poller.name()
    }

    pub fn add(&mut self, fd: RawFd, token: Token, interest: Interest) -> io::Result<()> {
        self.poller.add(fd, token, interest)
    }

    pub fn modify(&mut self, fd: RawFd, token: Token, interest: Interest) -> io::Result<()> {
        self.poller.modify(fd, token, interest)
    }

    pub fn remove(&mut self, fd: RawFd) -> io::Result<()> {
        self.poller.remove(fd)
    }

    pub fn wait(
        &mut self,
        events: &mut Vec<Event>,
        timeout: Option<Duration>,
    ) -> io::Result<usize> {
        self.poller.wait(events, timeout)
    }
}

pub(crate) fn duration_to_ms(timeout: Option<Duration>) -> i32 {
    match timeout {
        // Saturate instead of wrapping for absurdly large timeouts.
        Some(d) => d.as_millis().min(i32::MAX as u128) as i32,
        None => -1,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use std::net::{TcpListener, TcpStream};
    use std::os::unix::io::AsRawFd;
    use std::time::Instant;

    fn connected_pair() -> (TcpStream, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").expect("bind");
        let addr = listener.local_addr().expect("local addr");
        let a = TcpStream::connect(addr).expect("connect");
        let (b, _) = listener.accept().expect("accept");
        (a, b)
    }

    fn check_poller(mut reactor: Reactor) {
        let (mut a, b) = connected_pair();
        let mut events = Vec::new();

        reactor
            .add(b.as_raw_fd(), Token(7), Interest::READ)
            .expect("add");

        // Nothing written yet: the wait must time out empty.
        let n = reactor
            .wait(&mut events, Some(Duration::from_millis(10)))
            .expect("wait");
        assert_eq!(n, 0);

        a.write_all(b"ping").expect("write");
        let n = reactor
            .wait(&mut events, Some(Duration::from_millis(500)))
            .expect("wait");
        assert_eq!(n, 1);
        assert_eq!(events[0].token, Token(7));
        assert!(events[0].readiness.is_readable());

        // A connected socket with empty send buffer is writable.
        events.clear();
        reactor
            .add(b.as_raw_fd(), Token(9), Interest::READ | Interest::WRITE)
            .expect("re-add modifies in place");
        let n = reactor
            .wait(&mut events, Some(Duration::from_millis(500)))
            .expect("wait");
        assert!(n >= 1);
        assert!(events.iter().all(|e| e.token == Token(9)));
        assert!(events.iter().any(|e| e.readiness.is_writable()));

        reactor.remove(b.as_raw_fd()).expect("remove");
        // Idempotent: removing again succeeds.
        reactor.remove(b.as_raw_fd()).expect("remove twice");

        events.clear();
        a.write_all(b"more").expect("write");
        let n = reactor
            .wait(&mut events, Some(Duration::from_millis(10)))
            .expect("wait");
        assert_eq!(n, 0, "removed fd must not report readiness");
    }

    #[test]
    fn platform_backend_reports_readiness() {
        check_poller(Reactor::new().expect("reactor"));
    }

    #[test]
    fn select_backend_reports_readiness() {
        check_poller(Reactor::portable().expect("reactor"));
    }

    #[test]
    fn wait_honors_timeout() {
        let mut reactor = Reactor::new().expect("reactor");
        let mut events = Vec::new();
        let start = Instant::now();
        let n = reactor
            .wait(&mut events, Some(Duration::from_millis(50)))
            .expect("wait");
        assert_eq!(n, 0);
        assert!(start.elapsed() >= Duration::from_millis(40));
    }

    #[test]
    fn none_interest_reports_nothing() {
        let mut reactor = Reactor::new().expect("reactor");
        let (mut a, b) = connected_pair();
        let mut events = Vec::new();

        reactor
            .add(b.as_raw_fd(), Token(1), Interest::READ)
            .expect("add");
        reactor
            .modify(b.as_raw_fd(), Token(1), Interest::NONE)
            .expect("modify");

        a.write_all(b"ping").expect("write");
        let n = reactor
            .wait(&mut events, Some(Duration::from_millis(20)))
            .expect("wait");
        assert_eq!(n, 0, "suspended fd must stay silent");

        reactor
            .modify(b.as_raw_fd(), Token(1), Interest::READ)
            .expect("resume");
        let n = reactor
            .wait(&mut events, Some(Duration::from_millis(500)))
            .expect("wait");
        assert_eq!(n, 1);
        assert!(events[0].readiness.is_readable());
    }
}
