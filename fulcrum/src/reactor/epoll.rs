//! epoll backend (Linux primary).
//!
//! The kernel maintains the interest set, so add/modify/remove are single
//! O(1) syscalls and wait cost scales with readiness, not registrations.
//! The token rides in `epoll_data.u64`.

use std::io;
use std::os::unix::io::RawFd;
use std::time::Duration;

use super::{duration_to_ms, Event, Interest, Poller, Readiness, Token};

pub struct Epoll {
    epfd: RawFd,
    buf: Vec<libc::epoll_event>,
}

impl Epoll {
    pub fn new(max_events: usize) -> io::Result<Self> {
        let epfd = unsafe { libc::epoll_create1(libc::EPOLL_CLOEXEC) };
        if epfd < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(Self {
            epfd,
            buf: Vec::with_capacity(max_events.max(1)),
        })
    }

    fn ctl(&self, op: libc::c_int, fd: RawFd, event: *mut libc::epoll_event) -> io::Result<()> {
        if unsafe { libc::epoll_ctl(self.epfd, op, fd, event) } < 0 {
            Err(io::Error::last_os_error())
        } else {
            Ok(())
        }
    }
}

fn interest_bits(interest: Interest) -> u32 {
    let mut bits = 0;
    if interest.is_readable() {
        bits |= libc::EPOLLIN as u32;
    }
    if interest.is_writable() {
        bits |= libc::EPOLLOUT as u32;
    }
    // EPOLLERR and EPOLLHUP are implicit; the kernel reports them always.
    bits
}

fn make_event(token: Token, interest: Interest) -> libc::epoll_event {
    libc::epoll_event {
        events: interest_bits(interest),
        u64: token.0 as u64,
    }
}

impl Poller for Epoll {
    fn add(&mut self, fd: RawFd, token: Token, interest: Interest) -> io::Result<()> {
        let mut event = make_event(token, interest);
        match self.ctl(libc::EPOLL_CTL_ADD, fd, &mut event) {
            Ok(()) => Ok(()),
            Err(e) if e.raw_os_error() == Some(libc::EEXIST) => {
                self.ctl(libc::EPOLL_CTL_MOD, fd, &mut event)
            }
            Err(e) => Err(e),
        }
    }

    fn modify(&mut self, fd: RawFd, token: Token, interest: Interest) -> io::Result<()> {
        let mut event = make_event(token, interest);
        match self.ctl(libc::EPOLL_CTL_MOD, fd, &mut event) {
            Ok(()) => Ok(()),
            Err(e) if e.raw_os_error() == Some(libc::ENOENT) => {
                self.ctl(libc::EPOLL_CTL_ADD, fd, &mut event)
            }
            Err(e) => Err(e),
        }
    }

    fn remove(&mut self, fd: RawFd) -> io::Result<()> {
        let mut event = make_event(Token(0), Interest::NONE);
        match self.ctl(libc::EPOLL_CTL_DEL, fd, &mut event) {
            Ok(()) => Ok(()),
            Err(e)
                if matches!(
                    e.raw_os_error(),
                    Some(libc::ENOENT) | Some(libc::EBADF) | Some(libc::EPERM)
                ) =>
            {
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    fn wait(&mut self, events: &mut Vec<Event>, timeout: Option<Duration>) -> io::Result<usize> {
        let n = unsafe {
            libc::epoll_wait(
                self.epfd,
                self.buf.as_mut_ptr(),
                self.buf.capacity() as libc::c_int,
                duration_to_ms(timeout),
            )
        };
        if n < 0 {
            let e = io::Error::last_os_error();
            if e.kind() == io::ErrorKind::Interrupted {
                return Ok(0);
            }
            return Err(e);
        }
        unsafe { self.buf.set_len(n as usize) };

        for raw in &self.buf {
            let bits = raw.events;
            let readiness = Readiness::new(
                bits & libc::EPOLLIN as u32 != 0,
                bits & libc::EPOLLOUT as u32 != 0,
                bits & libc::EPOLLERR as u32 != 0,
                bits & libc::EPOLLHUP as u32 != 0,
            );
            events.push(Event {
                token: Token(raw.u64 as usize),
                readiness,
            });
        }
        Ok(n as usize)
    }

    fn name(&self) -> &'static str {
        "epoll"
    }
}

impl Drop for Epoll {
    fn drop(&mut self) {
        unsafe { libc::close(self.epfd) };
    }
}
