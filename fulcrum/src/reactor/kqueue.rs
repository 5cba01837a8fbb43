//! kqueue backend (macOS and the BSDs).
//!
//! kqueue has no combined read/write mask: read and write interest are two
//! distinct filter registrations on the same ident. EV_ADD doubles as
//! modify, EV_DELETE on an absent filter is tolerated, and EV_EOF/EV_ERROR
//! are folded back into the unified readiness mask.

use std::io;
use std::os::unix::io::RawFd;
use std::ptr;
use std::time::Duration;

use super::{Event, Interest, Poller, Readiness, Token};

pub struct Kqueue {
    kq: RawFd,
    buf: Vec<libc::kevent>,
}

impl Kqueue {
    pub fn new(max_events: usize) -> io::Result<Self> {
        let kq = unsafe { libc::kqueue() };
        if kq < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(Self {
            kq,
            buf: Vec::with_capacity(max_events.max(1)),
        })
    }

    fn apply(&self, fd: RawFd, filter: i16, flags: u16, token: Token) -> io::Result<()> {
        let change = libc::kevent {
            ident: fd as libc::uintptr_t,
            filter,
            flags,
            fflags: 0,
            data: 0,
            udata: token.0 as *mut libc::c_void,
        };
        let rc = unsafe { libc::kevent(self.kq, &change, 1, ptr::null_mut(), 0, ptr::null()) };
        if rc < 0 {
            let e = io::Error::last_os_error();
            // Deleting a filter that was never registered, or whose fd is
            // already closed, is a no-op.
            if flags & libc::EV_DELETE != 0
                && matches!(e.raw_os_error(), Some(libc::ENOENT) | Some(libc::EBADF))
            {
                return Ok(());
            }
            return Err(e);
        }
        Ok(())
    }

    fn set_filters(&self, fd: RawFd, token: Token, interest: Interest) -> io::Result<()> {
        if interest.is_readable() {
            self.apply(fd, libc::EVFILT_READ, libc::EV_ADD | libc::EV_ENABLE, token)?;
        } else {
            self.apply(fd, libc::EVFILT_READ, libc::EV_DELETE, token)?;
        }
        if interest.is_writable() {
            self.apply(fd, libc::EVFILT_WRITE, libc::EV_ADD | libc::EV_ENABLE, token)?;
        } else {
            self.apply(fd, libc::EVFILT_WRITE, libc::EV_DELETE, token)?;
        }
        Ok(())
    }
}

impl Poller for Kqueue {
    fn add(&mut self, fd: RawFd, token: Token, interest: Interest) -> io::Result<()> {
        // EV_ADD modifies in place when the filter already exists.
        self.set_filters(fd, token, interest)
    }

    fn modify(&mut self, fd: RawFd, token: Token, interest: Interest) -> io::Result<()> {
        self.set_filters(fd, token, interest)
    }

    fn remove(&mut self, fd: RawFd) -> io::Result<()> {
        self.apply(fd, libc::EVFILT_READ, libc::EV_DELETE, Token(0))?;
        self.apply(fd, libc::EVFILT_WRITE, libc::EV_DELETE, Token(0))
    }

    fn wait(&mut self, events: &mut Vec<Event>, timeout: Option<Duration>) -> io::Result<usize> {
        let ts;
        let ts_ptr = match timeout {
            Some(d) => {
                ts = libc::timespec {
                    tv_sec: d.as_secs() as libc::time_t,
                    tv_nsec: d.subsec_nanos() as libc::c_long,
                };
                &ts as *const libc::timespec
            }
            None => ptr::null(),
        };

        let n = unsafe {
            libc::kevent(
                self.kq,
                ptr::null(),
                0,
                self.buf.as_mut_ptr(),
                self.buf.capacity() as libc::c_int,
                ts_ptr,
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

        // A fd with both filters ready produces two kevents and therefore
        // two dispatches; callers treat each independently.
        for raw in &self.buf {
            let readiness = Readiness::new(
                raw.filter == libc::EVFILT_READ,
                raw.filter == libc::EVFILT_WRITE,
                raw.flags & libc::EV_ERROR != 0,
                raw.flags & libc::EV_EOF != 0,
            );
            events.push(Event {
                token: Token(raw.udata as usize),
                readiness,
            });
        }
        Ok(n as usize)
    }

    fn name(&self) -> &'static str {
        "kqueue"
    }
}

impl Drop for Kqueue {
    fn drop(&mut self) {
        unsafe { libc::close(self.kq) };
    }
}
