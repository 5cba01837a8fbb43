//! select backend (portable fallback).
//!
//! Rebuilds the read/write/error bitmaps on every wait and scans all
//! registered fds afterwards, so wait is O(registrations). Descriptors are
//! hard-capped at FD_SETSIZE; the primary backends carry production loads.

use std::io;
use std::os::unix::io::RawFd;
use std::ptr;
use std::time::Duration;

use super::{Event, Interest, Poller, Readiness, Token};

const FD_SETSIZE: usize = libc::FD_SETSIZE as usize;

#[derive(Clone, Copy)]
struct Registration {
    token: Token,
    interest: Interest,
}

pub struct Select {
    slots: Vec<Option<Registration>>,
    max_fd: RawFd,
}

impl Select {
    pub fn new(_max_events: usize) -> io::Result<Self> {
        Ok(Self {
            slots: vec![None; FD_SETSIZE],
            max_fd: -1,
        })
    }

    fn check_fd(fd: RawFd) -> io::Result<usize> {
        if fd < 0 || fd as usize >= FD_SETSIZE {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("fd {fd} outside FD_SETSIZE ({FD_SETSIZE})"),
            ));
        }
        Ok(fd as usize)
    }

    fn recompute_max_fd(&mut self) {
        self.max_fd = -1;
        for (fd, slot) in self.slots.iter().enumerate() {
            if slot.is_some() {
                self.max_fd = fd as RawFd;
            }
        }
    }
}

impl Poller for Select {
    fn add(&mut self, fd: RawFd, token: Token, interest: Interest) -> io::Result<()> {
        let idx = Self::check_fd(fd)?;
        // Overwrites any existing registration, which is the modify case.
        self.slots[idx] = Some(Registration { token, interest });
        if fd > self.max_fd {
            self.max_fd = fd;
        }
        Ok(())
    }

    fn modify(&mut self, fd: RawFd, token: Token, interest: Interest) -> io::Result<()> {
        self.add(fd, token, interest)
    }

    fn remove(&mut self, fd: RawFd) -> io::Result<()> {
        let idx = Self::check_fd(fd)?;
        if self.slots[idx].take().is_some() && fd == self.max_fd {
            self.recompute_max_fd();
        }
        Ok(())
    }

    fn wait(&mut self, events: &mut Vec<Event>, timeout: Option<Duration>) -> io::Result<usize> {
        let mut read_set: libc::fd_set = unsafe { std::mem::zeroed() };
        let mut write_set: libc::fd_set = unsafe { std::mem::zeroed() };
        let mut error_set: libc::fd_set = unsafe { std::mem::zeroed() };
        unsafe {
            libc::FD_ZERO(&mut read_set);
            libc::FD_ZERO(&mut write_set);
            libc::FD_ZERO(&mut error_set);
        }

        for (fd, slot) in self.slots.iter().enumerate() {
            let Some(reg) = slot else { continue };
            let fd = fd as RawFd;
            unsafe {
                if reg.interest.is_readable() {
                    libc::FD_SET(fd, &mut read_set);
                }
                if reg.interest.is_writable() {
                    libc::FD_SET(fd, &mut write_set);
                }
                libc::FD_SET(fd, &mut error_set);
            }
        }

        let mut tv;
        let tv_ptr = match timeout {
            Some(d) => {
                tv = libc::timeval {
                    tv_sec: d.as_secs() as libc::time_t,
                    tv_usec: d.subsec_micros() as libc::suseconds_t,
                };
                &mut tv as *mut libc::timeval
            }
            None => ptr::null_mut(),
        };

        let rc = unsafe {
            libc::select(
                self.max_fd + 1,
                &mut read_set,
                &mut write_set,
                &mut error_set,
                tv_ptr,
            )
        };
        if rc < 0 {
            let e = io::Error::last_os_error();
            if e.kind() == io::ErrorKind::Interrupted {
                return Ok(0);
            }
            return Err(e);
        }
        if rc == 0 {
            return Ok(0);
        }

        let mut dispatched = 0;
        for (fd, slot) in self.slots.iter().enumerate() {
            let Some(reg) = slot else { continue };
            let fd = fd as RawFd;
            let (readable, writable, errored) = unsafe {
                (
                    libc::FD_ISSET(fd, &read_set),
                    libc::FD_ISSET(fd, &write_set),
                    libc::FD_ISSET(fd, &error_set),
                )
            };
            if !(readable || writable || errored) {
                continue;
            }
            events.push(Event {
                token: reg.token,
                readiness: Readiness::new(readable, writable, errored, errored),
            });
            dispatched += 1;
        }
        Ok(dispatched)
    }

    fn name(&self) -> &'static str {
        "select"
    }
}
