//! Keep-alive backend connection pool.
//!
//! Connection reuse is the proxy's primary performance lever: under steady
//! keep-alive load the pool should serve ≥99% of leases from cache. Slots
//! hold parked sockets with their identity, age, and request budget; an
//! intrusive LRU threaded through slot indices picks eviction victims
//! without any extra allocation.
//!
//! Ownership rule: a parked socket belongs to the pool; a leased socket
//! belongs to the session. The slot keeps only the raw fd of a leased
//! socket so `give_back` can find it again — it never reads or closes
//! through it.
//!
//! One mutex guards the whole of every public operation so concurrent
//! callers are safe; dialing happens outside the critical section so a slow
//! connect cannot stall unrelated leases.

use std::io;
use std::net::{SocketAddr, TcpStream, ToSocketAddrs};
use std::os::unix::io::{AsRawFd, RawFd};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use socket2::{Domain, Protocol, Socket, Type};
use tracing::debug;

use crate::config::Config;

/// Free entries idle longer than this are swept even when their TTL has
/// not expired.
const IDLE_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SlotState {
    Free,
    InUse,
    Closing,
}

struct PoolEntry {
    /// Present iff `state == Free`.
    stream: Option<TcpStream>,
    fd: RawFd,
    host: String,
    port: u16,
    created: Instant,
    last_used: Instant,
    requests_served: u64,
    state: SlotState,
    lru_prev: Option<usize>,
    lru_next: Option<usize>,
}

struct PoolInner {
    slots: Vec<Option<PoolEntry>>,
    lru_head: Option<usize>,
    lru_tail: Option<usize>,
    hits: u64,
    misses: u64,
    evictions: u64,
}

impl PoolInner {
    fn unlink(&mut self, i: usize) {
        let (prev, next) = match &self.slots[i] {
            Some(e) => (e.lru_prev, e.lru_next),
            None => return,
        };
        match prev {
            Some(p) => {
                if let Some(e) = self.slots[p].as_mut() {
                    e.lru_next = next;
                }
            }
            None => self.lru_head = next,
        }
        match next {
            Some(n) => {
                if let Some(e) = self.slots[n].as_mut() {
                    e.lru_prev = prev;
                }
            }
            None => self.lru_tail = prev,
        }
        if let Some(e) = self.slots[i].as_mut() {
            e.lru_prev = None;
            e.lru_next = None;
        }
    }

    fn push_head(&mut self, i: usize) {
        let old_head = self.lru_head;
        if let Some(e) = self.slots[i].as_mut() {
            e.lru_prev = None;
            e.lru_next = old_head;
        }
        if let Some(h) = old_head {
            if let Some(e) = self.slots[h].as_mut() {
                e.lru_prev = Some(i);
            }
        }
        self.lru_head = Some(i);
        if self.lru_tail.is_none() {
            self.lru_tail = Some(i);
        }
    }

    fn move_head(&mut self, i: usize) {
        self.unlink(i);
        self.push_head(i);
    }

    /// Unlink and drop the entry; a parked socket closes with it.
    fn remove_slot(&mut self, i: usize) {
        self.unlink(i);
        self.slots[i] = None;
    }

    fn evict(&mut self, i: usize) {
        if let Some(e) = self.slots[i].as_mut() {
            e.state = SlotState::Closing;
        }
        self.remove_slot(i);
        self.evictions += 1;
    }

    fn find_empty(&self) -> Option<usize> {
        self.slots.iter().position(|s| s.is_none())
    }

    /// Walk up from the LRU tail to the least-recently-used Free entry;
    /// leased entries are not eviction targets.
    fn lru_tail_free(&self) -> Option<usize> {
        let mut cursor = self.lru_tail;
        while let Some(i) = cursor {
            match &self.slots[i] {
                Some(e) if e.state == SlotState::Free => return Some(i),
                Some(e) => cursor = e.lru_prev,
                None => return None,
            }
        }
        None
    }

    fn occupied(&self) -> usize {
        self.slots.iter().filter(|s| s.is_some()).count()
    }
}

#[derive(Debug, Clone, Copy)]
pub struct PoolStats {
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
    pub current_size: usize,
    pub max_size: usize,
}

impl PoolStats {
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }
}

pub struct ConnectionPool {
    inner: Mutex<PoolInner>,
    max_size: usize,
    /// Zero disables age-based expiry.
    ttl: Duration,
    max_requests: u64,
    connect_timeout: Duration,
}

impl ConnectionPool {
    pub fn new(
        max_size: usize,
        ttl: Duration,
        max_requests: u64,
        connect_timeout: Duration,
    ) -> Self {
        Self {
            inner: Mutex::new(PoolInner {
                slots: (0..max_size).map(|_| None).collect(),
                lru_head: None,
                lru_tail: None,
                hits: 0,
                misses: 0,
                evictions: 0,
            }),
            max_size,
            ttl,
            max_requests: max_requests.max(1),
            connect_timeout,
        }
    }

    /// Pooling disabled (no `pool` section) degrades to a dial-per-lease
    /// pool of size zero.
    pub fn from_config(cfg: &Config) -> Self {
        match &cfg.pool {
            Some(p) => Self::new(
                p.max_size,
                Duration::from_secs(p.ttl_seconds),
                p.max_requests,
                cfg.connect_timeout(),
            ),
            None => Self::new(0, Duration::ZERO, u64::MAX, cfg.connect_timeout()),
        }
    }

    fn locked(&self) -> MutexGuard<'_, PoolInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Lease a connection to `(host, port)`: a validated parked socket when
    /// one exists, otherwise a fresh dial. When every slot is leased out the
    /// dial is handed back un-pooled and `give_back` will simply close it.
    pub fn get(&self, host: &str, port: u16) -> io::Result<TcpStream> {
        enum Verdict {
            Skip,
            Evict,
            Lease,
        }

        {
            let mut inner = self.locked();
            let now = Instant::now();

            let mut i = 0;
            let mut candidate = None;
            while i < inner.slots.len() {
                let verdict = match &inner.slots[i] {
                    Some(e)
                        if e.state == SlotState::Free && e.host == host && e.port == port =>
                    {
                        let expired = self.ttl > Duration::ZERO
                            && now.duration_since(e.created) > self.ttl;
                        let exhausted = e.requests_served >= self.max_requests;
                        if expired || exhausted || !is_alive(e.fd) {
                            Verdict::Evict
                        } else {
                            Verdict::Lease
                        }
                    }
                    _ => Verdict::Skip,
                };
                match verdict {
                    Verdict::Evict => inner.evict(i),
                    Verdict::Lease => {
                        candidate = Some(i);
                        break;
                    }
                    Verdict::Skip => {}
                }
                i += 1;
            }

            if let Some(i) = candidate {
                let stream = match inner.slots[i].as_mut() {
                    Some(e) => {
                        e.state = SlotState::InUse;
                        e.last_used = now;
                        e.requests_served += 1;
                        e.stream.take()
                    }
                    None => None,
                };
                if let Some(stream) = stream {
                    inner.hits += 1;
                    inner.move_head(i);
                    return Ok(stream);
                }
                inner.remove_slot(i);
            }

            inner.misses += 1;
        }

        let stream = dial(host, port, self.connect_timeout)?;
        debug!(backend = %format!("{host}:{port}"), "dialed fresh backend connection");

        let mut inner = self.locked();
        let slot = match inner.find_empty() {
            Some(i) => Some(i),
            None => match inner.lru_tail_free() {
                Some(victim) => {
                    inner.evict(victim);
                    Some(victim)
                }
                None => None,
            },
        };

        if let Some(i) = slot {
            let now = Instant::now();
            inner.slots[i] = Some(PoolEntry {
                stream: None,
                fd: stream.as_raw_fd(),
                host: host.to_string(),
                port,
                created: now,
                last_used: now,
                requests_served: 1,
                state: SlotState::InUse,
                lru_prev: None,
                lru_next: None,
            });
            inner.push_head(i);
        }
        Ok(stream)
    }

    /// Return a leased connection. Re-parked as `Free` when the identity
    /// matches, the peer is still alive, and the request budget allows;
    /// closed otherwise. A socket the pool does not track is closed.
    pub fn give_back(&self, stream: TcpStream, host: &str, port: u16) {
        let fd = stream.as_raw_fd();
        let mut inner = self.locked();

        let Some(i) = inner.slots.iter().position(|s| {
            s.as_ref()
                .is_some_and(|e| e.fd == fd && e.state == SlotState::InUse)
        }) else {
            return;
        };

        let reusable = match &inner.slots[i] {
            Some(e) => {
                e.host == host
                    && e.port == port
                    && e.requests_served < self.max_requests
                    && is_alive(fd)
            }
            None => false,
        };

        if reusable {
            if let Some(e) = inner.slots[i].as_mut() {
                e.stream = Some(stream);
                e.state = SlotState::Free;
                e.last_used = Instant::now();
            }
            inner.move_head(i);
        } else {
            inner.evict(i);
        }
    }

    /// Unconditionally discard a leased connection.
    pub fn discard(&self, stream: TcpStream) {
        let fd = stream.as_raw_fd();
        let mut inner = self.locked();
        if let Some(i) = inner.slots.iter().position(|s| {
            s.as_ref()
                .is_some_and(|e| e.fd == fd && e.state == SlotState::InUse)
        }) {
            inner.remove_slot(i);
        }
    }

    /// Sweep Free entries that expired, idled out, or died. Returns the
    /// eviction count; an immediate second call returns 0.
    pub fn cleanup(&self) -> usize {
        let mut inner = self.locked();
        let now = Instant::now();
        let mut evicted = 0;

        for i in 0..inner.slots.len() {
            let doomed = match &inner.slots[i] {
                Some(e) if e.state == SlotState::Free => {
                    (self.ttl > Duration::ZERO && now.duration_since(e.created) > self.ttl)
                        || now.duration_since(e.last_used) > IDLE_TIMEOUT
                        || !is_alive(e.fd)
                }
                _ => false,
            };
            if doomed {
                inner.evict(i);
                evicted += 1;
            }
        }
        evicted
    }

    pub fn stats(&self) -> PoolStats {
        let inner = self.locked();
        PoolStats {
            hits: inner.hits,
            misses: inner.misses,
            evictions: inner.evictions,
            current_size: inner.occupied(),
            max_size: self.max_size,
        }
    }
}

/// Non-blocking, non-consuming check that a parked socket is usable.
///
/// Quiet socket ⇒ alive. Readable ⇒ peek one byte: EOF means the peer
/// closed; actual buffered bytes on an idle connection would corrupt the
/// next response, so those are dead too. Error/hangup/invalid ⇒ dead.
fn is_alive(fd: RawFd) -> bool {
    let mut pfd = libc::pollfd {
        fd,
        events: libc::POLLIN,
        revents: 0,
    };
    let rc = unsafe { libc::poll(&mut pfd, 1, 0) };
    if rc < 0 {
        return false;
    }
    if rc == 0 {
        return true;
    }
    if pfd.revents & (libc::POLLERR | libc::POLLHUP | libc::POLLNVAL) != 0 {
        return false;
    }
    if pfd.revents & libc::POLLIN != 0 {
        let mut byte = 0u8;
        let n = unsafe {
            libc::recv(
                fd,
                &mut byte as *mut u8 as *mut libc::c_void,
                1,
                libc::MSG_PEEK | libc::MSG_DONTWAIT,
            )
        };
        if n == 0 {
            return false;
        }
        if n < 0 {
            return io::Error::last_os_error().kind() == io::ErrorKind::WouldBlock;
        }
        return false;
    }
    true
}

/// Blocking TCP connect with timeout; SO_KEEPALIVE set for pool residency.
fn dial(host: &str, port: u16, timeout: Duration) -> io::Result<TcpStream> {
    let addr = resolve(host, port)?;
    let socket = Socket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))?;
    socket.set_keepalive(true)?;
    socket.connect_timeout(&addr.into(), timeout)?;
    Ok(socket.into())
}

pub(crate) fn resolve(host: &str, port: u16) -> io::Result<SocketAddr> {
    (host, port)
        .to_socket_addrs()?
        .next()
        .ok_or_else(|| {
            io::Error::new(
                io::ErrorKind::AddrNotAvailable,
                format!("no addresses for {host}:{port}"),
            )
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::TcpListener;
    use std::thread;

    const HOST: &str = "127.0.0.1";

    fn listener() -> (TcpListener, u16) {
        let l = TcpListener::bind((HOST, 0)).expect("bind");
        let port = l.local_addr().expect("addr").port();
        (l, port)
    }

    fn pool(max_size: usize, ttl: Duration, max_requests: u64) -> ConnectionPool {
        ConnectionPool::new(max_size, ttl, max_requests, Duration::from_secs(1))
    }

    #[test]
    fn lease_return_lease_reuses_the_connection() {
        let (_l, port) = listener();
        let pool = pool(8, Duration::from_secs(60), 1000);

        let s1 = pool.get(HOST, port).expect("first lease");
        let fd = s1.as_raw_fd();
        pool.give_back(s1, HOST, port);

        let s2 = pool.get(HOST, port).expect("second lease");
        assert_eq!(s2.as_raw_fd(), fd, "same socket must come back");

        let stats = pool.stats();
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.misses, 1);
        assert_eq!(stats.current_size, 1);
    }

    #[test]
    fn steady_keep_alive_load_reaches_target_hit_rate() {
        let (_l, port) = listener();
        let pool = pool(8, Duration::from_secs(60), 1000);

        for _ in 0..1000 {
            let s = pool.get(HOST, port).expect("lease");
            pool.give_back(s, HOST, port);
        }

        let stats = pool.stats();
        assert_eq!(stats.hits + stats.misses, 1000);
        assert!(stats.hits >= 990, "hits = {}", stats.hits);
        assert!(stats.hit_rate() >= 0.99);
        assert_eq!(stats.current_size, 1);
    }

    #[test]
    fn lru_tail_is_evicted_under_pressure() {
        let (_la, port_a) = listener();
        let (_lb, port_b) = listener();
        let (_lc, port_c) = listener();
        let pool = pool(2, Duration::from_secs(60), 1000);

        let a = pool.get(HOST, port_a).expect("a");
        pool.give_back(a, HOST, port_a);
        let b = pool.get(HOST, port_b).expect("b");
        pool.give_back(b, HOST, port_b);

        // A is now least recently used; C forces it out.
        let c = pool.get(HOST, port_c).expect("c");
        pool.give_back(c, HOST, port_c);

        let stats = pool.stats();
        assert_eq!(stats.evictions, 1);
        assert!(stats.current_size <= 2);

        let before = pool.stats().hits;
        let b2 = pool.get(HOST, port_b).expect("b again");
        pool.give_back(b2, HOST, port_b);
        assert_eq!(pool.stats().hits, before + 1, "b must still be parked");

        let a2 = pool.get(HOST, port_a).expect("a again");
        pool.give_back(a2, HOST, port_a);
        assert_eq!(pool.stats().hits, before + 1, "a must have been evicted");
    }

    #[test]
    fn request_budget_recycles_the_connection() {
        let (_l, port) = listener();
        let pool = pool(4, Duration::from_secs(60), 2);

        for _ in 0..2 {
            let s = pool.get(HOST, port).expect("lease");
            pool.give_back(s, HOST, port);
        }
        // Budget of 2 exhausted: the third lease must redial.
        let s = pool.get(HOST, port).expect("lease");
        pool.give_back(s, HOST, port);

        let stats = pool.stats();
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.misses, 2);
        assert_eq!(stats.evictions, 1);
    }

    #[test]
    fn expired_ttl_disqualifies_a_parked_connection() {
        let (_l, port) = listener();
        let pool = pool(4, Duration::from_millis(30), 1000);

        let s = pool.get(HOST, port).expect("lease");
        pool.give_back(s, HOST, port);
        thread::sleep(Duration::from_millis(60));

        let s = pool.get(HOST, port).expect("lease after expiry");
        pool.give_back(s, HOST, port);

        let stats = pool.stats();
        assert_eq!(stats.hits, 0);
        assert_eq!(stats.misses, 2);
        assert_eq!(stats.evictions, 1);
    }

    #[test]
    fn dead_peer_is_detected_on_return() {
        let (l, port) = listener();
        let pool = pool(4, Duration::from_secs(60), 1000);

        let s = pool.get(HOST, port).expect("lease");
        let (peer, _) = l.accept().expect("accept");
        drop(peer);
        thread::sleep(Duration::from_millis(50));

        pool.give_back(s, HOST, port);
        assert_eq!(pool.stats().current_size, 0, "dead socket must not park");
    }

    #[test]
    fn overflow_lease_is_unpooled_and_closes_on_return() {
        let (_l, port) = listener();
        let pool = pool(1, Duration::from_secs(60), 1000);

        let first = pool.get(HOST, port).expect("first");
        let second = pool.get(HOST, port).expect("overflow");
        assert_eq!(pool.stats().current_size, 1);

        pool.give_back(second, HOST, port);
        assert_eq!(pool.stats().current_size, 1, "overflow lease never parks");

        pool.give_back(first, HOST, port);
        assert_eq!(pool.stats().current_size, 1);
        assert_eq!(pool.stats().misses, 2);
    }

    #[test]
    fn cleanup_sweeps_expired_entries_once() {
        let (_l, port) = listener();
        let pool = pool(4, Duration::from_millis(20), 1000);

        let s = pool.get(HOST, port).expect("lease");
        pool.give_back(s, HOST, port);
        thread::sleep(Duration::from_millis(50));

        assert_eq!(pool.cleanup(), 1);
        assert_eq!(pool.cleanup(), 0, "cleanup is idempotent");
        assert_eq!(pool.stats().current_size, 0);
    }

    #[test]
    fn disabled_pool_dials_every_time() {
        let (_l, port) = listener();
        let pool = ConnectionPool::new(0, Duration::ZERO, u64::MAX, Duration::from_secs(1));

        let s1 = pool.get(HOST, port).expect("lease");
        pool.give_back(s1, HOST, port);
        let _s2 = pool.get(HOST, port).expect("lease");

        let stats = pool.stats();
        assert_eq!(stats.misses, 2);
        assert_eq!(stats.current_size, 0);
    }
}
