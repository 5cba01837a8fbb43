//! Periodic backend health probing.
//!
//! A probe is a non-blocking TCP connect with a bounded wait for
//! writability, then a read of SO_ERROR. The probe socket is closed
//! immediately and never enters the connection pool. Reactive marking (a
//! failed dial at lease time) complements this by flipping a backend
//! unhealthy between ticks.

use std::io;
use std::os::unix::io::AsRawFd;
use std::time::{Duration, Instant};

use socket2::{Domain, Protocol, Socket, Type};
use tracing::{debug, info, warn};

use crate::backend::Roster;
use crate::pool;

/// How often the housekeeping tick probes the roster.
pub const HEALTH_CHECK_INTERVAL: Duration = Duration::from_secs(5);

/// How long a probe waits for the connect to become writable.
const PROBE_TIMEOUT: Duration = Duration::from_secs(2);

/// Probe every backend and flip health flags, logging transitions.
pub fn check_roster(roster: &mut Roster) {
    for backend in roster.iter_mut() {
        let healthy = probe(&backend.host, backend.port);
        if healthy != backend.is_healthy {
            if healthy {
                info!(backend = %backend.address(), "backend recovered");
            } else {
                warn!(backend = %backend.address(), "backend unhealthy");
            }
        }
        backend.is_healthy = healthy;
        backend.last_health_check = Some(Instant::now());
    }
}

/// One probe: true iff a TCP connect completes cleanly within the window.
pub fn probe(host: &str, port: u16) -> bool {
    match try_probe(host, port) {
        Ok(healthy) => healthy,
        Err(e) => {
            debug!(host, port, error = %e, "health probe error");
            false
        }
    }
}

fn try_probe(host: &str, port: u16) -> io::Result<bool> {
    let addr = pool::resolve(host, port)?;
    let socket = Socket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))?;
    socket.set_nonblocking(true)?;

    match socket.connect(&addr.into()) {
        // Loopback connects can complete synchronously.
        Ok(()) => return Ok(true),
        Err(e) if e.raw_os_error() == Some(libc::EINPROGRESS) => {}
        Err(e) if e.kind() == io::ErrorKind::WouldBlock => {}
        Err(_) => return Ok(false),
    }

    if !wait_writable(socket.as_raw_fd(), PROBE_TIMEOUT) {
        return Ok(false);
    }

    // Writable after a non-blocking connect means the handshake finished;
    // SO_ERROR says whether it finished well.
    Ok(socket.take_error()?.is_none())
}

fn wait_writable(fd: std::os::unix::io::RawFd, timeout: Duration) -> bool {
    let mut pfd = libc::pollfd {
        fd,
        events: libc::POLLOUT,
        revents: 0,
    };
    let rc = unsafe { libc::poll(&mut pfd, 1, timeout.as_millis() as libc::c_int) };
    rc > 0 && pfd.revents & libc::POLLOUT != 0
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{BackendConfig, Config};
    use std::net::TcpListener;

    #[test]
    fn probe_succeeds_against_a_listener() {
        let listener = TcpListener::bind("127.0.0.1:0").expect("bind");
        let port = listener.local_addr().expect("addr").port();
        assert!(probe("127.0.0.1", port));
    }

    #[test]
    fn probe_fails_against_a_closed_port() {
        let listener = TcpListener::bind("127.0.0.1:0").expect("bind");
        let port = listener.local_addr().expect("addr").port();
        drop(listener);
        assert!(!probe("127.0.0.1", port));
    }

    #[test]
    fn check_roster_flips_health_both_ways() {
        let listener = TcpListener::bind("127.0.0.1:0").expect("bind");
        let live_port = listener.local_addr().expect("addr").port();
        let dead = TcpListener::bind("127.0.0.1:0").expect("bind");
        let dead_port = dead.local_addr().expect("addr").port();
        drop(dead);

        let mut roster = Roster::from_config(&Config {
            backends: vec![
                BackendConfig {
                    host: "127.0.0.1".to_string(),
                    port: live_port,
                    weight: 1,
                    max_connections: 100,
                },
                BackendConfig {
                    host: "127.0.0.1".to_string(),
                    port: dead_port,
                    weight: 1,
                    max_connections: 100,
                },
            ],
            ..Config::default()
        });
        roster.get_mut(0).expect("live").is_healthy = false;

        check_roster(&mut roster);

        assert!(roster.get(0).expect("live").is_healthy);
        assert!(!roster.get(1).expect("dead").is_healthy);
        assert!(roster.get(0).expect("live").last_health_check.is_some());
    }
}
