//! The proxy server: accept loop, byte relay, and housekeeping.
//!
//! One reactor thread owns every socket. Sessions live in a slab; the token
//! registered for each fd encodes the slot index and which half of the pipe
//! it is, so dispatch is a lookup, never a pointer. A terminated session is
//! only marked dead during a dispatch batch and swept afterwards, so a
//! stale event later in the same batch can never touch a recycled slot.
//!
//! A coarse once-per-second tick drives health probes, pool and rate-limiter
//! sweeps, and the config-file mtime poll. The pool and the rate limiter
//! are internally locked; everything else is touched only from this thread.

use std::io::{self, Read, Write};
use std::net::{Shutdown, SocketAddr, TcpListener, TcpStream};
use std::os::unix::io::AsRawFd;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Context;
use arc_swap::ArcSwap;
use slab::Slab;
use socket2::{Domain, Protocol, Socket, Type};
use tracing::{debug, error, info, warn};

use crate::backend::Roster;
use crate::balance::Balancer;
use crate::config::Config;
use crate::health::{self, HEALTH_CHECK_INTERVAL};
use crate::http;
use crate::metrics::Registry;
use crate::pool::{self, ConnectionPool};
use crate::ratelimit::{RateLimitAlgorithm, RateLimiter};
use crate::reactor::{Event, Interest, Reactor, Readiness, Token, DEFAULT_MAX_EVENTS};
use crate::session::{Session, Side, MAX_CLIENTS, SCRATCH_BUFFER_SIZE};
use crate::signals::{self, SignalFlags};

const LISTENER_TOKEN: Token = Token(0);
const ADMIN_TOKEN: Token = Token(1);
const TOKEN_BASE: usize = 4;

/// Reactor wait bound; housekeeping runs at this cadence when idle.
const WAIT_TIMEOUT: Duration = Duration::from_millis(1000);
const TICK_INTERVAL: Duration = Duration::from_secs(1);

/// Consecutive wait failures tolerated before giving up.
const MAX_WAIT_ERRORS: u32 = 3;

fn conn_token(slot: usize, side: Side) -> Token {
    Token(TOKEN_BASE + slot * 2 + matches!(side, Side::Backend) as usize)
}

fn token_target(token: Token) -> Option<(usize, Side)> {
    if token.0 < TOKEN_BASE {
        return None;
    }
    let offset = token.0 - TOKEN_BASE;
    let side = if offset % 2 == 0 {
        Side::Client
    } else {
        Side::Backend
    };
    Some((offset / 2, side))
}

enum Conn {
    Proxy(Session),
    Admin(AdminConn),
}

impl Conn {
    fn is_dead(&self) -> bool {
        match self {
            Conn::Proxy(s) => s.dead,
            Conn::Admin(a) => a.dead,
        }
    }
}

/// A connection on the admin listener: one request, one response, close.
struct AdminConn {
    stream: TcpStream,
    request: Vec<u8>,
    response: Vec<u8>,
    written: usize,
    dead: bool,
}

pub struct ProxyServer {
    reactor: Reactor,
    listener: TcpListener,
    admin: Option<TcpListener>,
    conns: Slab<Conn>,
    roster: Roster,
    balancer: Balancer,
    pool: ConnectionPool,
    limiter: Option<RateLimiter>,
    metrics: Arc<Registry>,
    config: ArcSwap<Config>,
    flags: SignalFlags,
    shutdown: Arc<AtomicBool>,
    draining: bool,
    drain_started: Option<Instant>,
    last_tick: Instant,
    last_health_check: Instant,
    exported_pool_hits: u64,
    exported_pool_misses: u64,
    wait_errors: u32,
}

impl ProxyServer {
    pub fn new(
        config: Config,
        metrics: Arc<Registry>,
        flags: SignalFlags,
    ) -> anyhow::Result<Self> {
        let listener = bind_listener(&config.bind_address, config.listen_port, config.backlog)
            .with_context(|| {
                format!(
                    "failed to bind listener {}:{}",
                    config.bind_address, config.listen_port
                )
            })?;

        let admin = match config.metrics_port {
            Some(port) => Some(
                bind_listener(&config.bind_address, port, config.backlog)
                    .with_context(|| format!("failed to bind admin listener on port {port}"))?,
            ),
            None => None,
        };

        let mut reactor = Reactor::new().context("failed to create event reactor")?;
        reactor.add(listener.as_raw_fd(), LISTENER_TOKEN, Interest::READ)?;
        if let Some(admin) = &admin {
            reactor.add(admin.as_raw_fd(), ADMIN_TOKEN, Interest::READ)?;
        }

        let roster = Roster::from_config(&config);
        let balancer = Balancer::new(config.algorithm);
        let pool = ConnectionPool::from_config(&config);
        let limiter = build_limiter(&config);

        Ok(Self {
            reactor,
            listener,
            admin,
            conns: Slab::new(),
            roster,
            balancer,
            pool,
            limiter,
            metrics,
            config: ArcSwap::from_pointee(config),
            flags,
            shutdown: Arc::new(AtomicBool::new(false)),
            draining: false,
            drain_started: None,
            last_tick: Instant::now(),
            last_health_check: Instant::now(),
            exported_pool_hits: 0,
            exported_pool_misses: 0,
            wait_errors: 0,
        })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    pub fn admin_addr(&self) -> Option<SocketAddr> {
        self.admin.as_ref().and_then(|l| l.local_addr().ok())
    }

    /// Flip to request a drain from another thread (tests, embedding).
    pub fn shutdown_handle(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.shutdown)
    }

    pub fn reactor_backend(&self) -> &'static str {
        self.reactor.backend_name()
    }

    /// Drive the reactor until drained.
    pub fn run(&mut self) -> anyhow::Result<()> {
        let mut events: Vec<Event> = Vec::with_capacity(DEFAULT_MAX_EVENTS);
        info!(
            addr = %self.listener.local_addr()?,
            reactor = self.reactor.backend_name(),
            backends = self.roster.len(),
            "proxy running"
        );

        loop {
            events.clear();
            match self.reactor.wait(&mut events, Some(WAIT_TIMEOUT)) {
                Ok(_) => {
                    self.wait_errors = 0;
                    for i in 0..events.len() {
                        self.dispatch(events[i]);
                    }
                }
                Err(e) => {
                    self.wait_errors += 1;
                    error!(error = %e, "reactor wait failed");
                    if self.wait_errors >= MAX_WAIT_ERRORS {
                        return Err(e).context("reactor wait failing persistently");
                    }
                }
            }

            self.sweep_dead();
            self.observe_signals();
            if self.shutdown.load(Ordering::Relaxed) && !self.draining {
                self.begin_drain("shutdown requested");
            }
            if self.last_tick.elapsed() >= TICK_INTERVAL {
                self.housekeeping();
            }
            if self.draining && self.drain_complete() {
                break;
            }
        }

        if let Some(path) = self.config.load().pid_file.clone() {
            signals::remove_pid_file(&path);
        }
        info!("drained; exiting");
        Ok(())
    }

    fn dispatch(&mut self, event: Event) {
        match event.token {
            LISTENER_TOKEN => self.accept_clients(),
            ADMIN_TOKEN => self.accept_admin(),
            token => {
                let Some((slot, side)) = token_target(token) else {
                    return;
                };
                match self.conns.get(slot) {
                    Some(Conn::Proxy(_)) => self.drive_session(slot, side, event.readiness),
                    Some(Conn::Admin(_)) => self.drive_admin(slot, event.readiness),
                    None => {}
                }
            }
        }
    }

    fn accept_clients(&mut self) {
        loop {
            if self.draining {
                return;
            }
            match self.listener.accept() {
                Ok((stream, peer)) => self.start_session(stream, peer),
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    warn!(error = %e, "accept failed");
                    break;
                }
            }
        }
    }

    fn start_session(&mut self, stream: TcpStream, peer: SocketAddr) {
        let client_ip = peer.ip().to_string();

        if let Some(limiter) = &self.limiter {
            if !limiter.allow(&client_ip) {
                debug!(client = %client_ip, "rate limit exceeded");
                self.metrics.counter_inc("lb_ratelimit_denied_total", &[]);
                respond_and_drop(stream, &http::too_many_requests());
                return;
            }
        }

        let live_sessions = self
            .conns
            .iter()
            .filter(|(_, c)| matches!(c, Conn::Proxy(_)))
            .count();
        if live_sessions >= MAX_CLIENTS {
            warn!(client = %client_ip, "session table full; dropping client");
            return;
        }

        let (index, backend_stream) = match self.lease_backend(&client_ip) {
            Ok(lease) => lease,
            Err(response) => {
                respond_and_drop(stream, &response);
                return;
            }
        };
        let (host, port) = match self.roster.get(index) {
            Some(b) => (b.host.clone(), b.port),
            None => return,
        };

        if stream.set_nonblocking(true).is_err() || backend_stream.set_nonblocking(true).is_err() {
            self.pool.discard(backend_stream);
            return;
        }

        let client_fd = stream.as_raw_fd();
        let backend_fd = backend_stream.as_raw_fd();
        let entry = self.conns.vacant_entry();
        let slot = entry.key();

        let mut registered = self
            .reactor
            .add(client_fd, conn_token(slot, Side::Client), Interest::READ);
        if registered.is_ok() {
            registered = self
                .reactor
                .add(backend_fd, conn_token(slot, Side::Backend), Interest::READ);
        }
        if let Err(e) = registered {
            warn!(error = %e, "failed to register session with the reactor");
            let _ = self.reactor.remove(client_fd);
            self.pool.discard(backend_stream);
            return;
        }

        entry.insert(Conn::Proxy(Session::new(
            stream,
            backend_stream,
            index,
            host,
            port,
            client_ip.clone(),
        )));

        if let Some(b) = self.roster.get_mut(index) {
            b.active_connections += 1;
        }
        self.metrics.gauge_inc("lb_connections_active", &[]);
        debug!(client = %client_ip, slot, "session started");
    }

    /// Select and dial a backend, retrying once with a fresh selection
    /// after a dial failure. A failed dial marks the backend unhealthy on
    /// the spot, faster than the probe tick. The error value is the
    /// response the client should see.
    fn lease_backend(&mut self, client_ip: &str) -> Result<(usize, TcpStream), Vec<u8>> {
        if self.roster.is_empty() {
            return Err(http::service_unavailable());
        }

        for _ in 0..2 {
            let Some(index) = self.balancer.select(&mut self.roster, client_ip) else {
                return Err(http::service_unavailable());
            };
            let (host, port, addr) = match self.roster.get(index) {
                Some(b) => (b.host.clone(), b.port, b.address()),
                None => continue,
            };
            match self.pool.get(&host, port) {
                Ok(stream) => return Ok((index, stream)),
                Err(e) => {
                    warn!(backend = %addr, error = %e, "backend dial failed");
                    if let Some(b) = self.roster.get_mut(index) {
                        b.failed_requests += 1;
                        b.is_healthy = false;
                    }
                    self.metrics
                        .counter_inc("lb_requests_failed_total", &[("backend", addr.as_str())]);
                }
            }
        }

        if self.roster.healthy_count() == 0 {
            Err(http::service_unavailable())
        } else {
            Err(http::bad_gateway())
        }
    }

    fn drive_session(&mut self, slot: usize, side: Side, readiness: Readiness) {
        if readiness.is_writable() {
            self.flush_pending(slot, side);
        }
        if readiness.is_readable() {
            self.relay_from(slot, side);
        } else if readiness.is_closed() {
            self.fail_session(slot);
        }
    }

    /// Read from one side and forward to the other until the socket runs
    /// dry or the destination backs up.
    fn relay_from(&mut self, slot: usize, from: Side) {
        let Self {
            conns,
            reactor,
            pool,
            roster,
            metrics,
            ..
        } = self;
        let Some(Conn::Proxy(session)) = conns.get_mut(slot) else {
            return;
        };

        loop {
            if session.dead || !session.pending(from.opposite()).is_empty() {
                return;
            }

            let read_result = match from {
                Side::Client => session.client.read(&mut session.scratch[..]),
                Side::Backend => match session.backend.as_mut() {
                    Some(s) => s.read(&mut session.scratch[..]),
                    None => return,
                },
            };

            let n = match read_result {
                Ok(0) => {
                    // Clean EOF. Only a client-side close leaves the backend
                    // reusable.
                    let reusable = from == Side::Client;
                    finish_session(session, reactor, pool, roster, metrics, reusable);
                    return;
                }
                Ok(n) => n,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    debug!(client = %session.client_ip, error = %e, "session read error");
                    session.keep_alive = false;
                    finish_session(session, reactor, pool, roster, metrics, false);
                    return;
                }
            };

            let relay_result = if from == Side::Client && !session.request_forwarded {
                let mut data = session.scratch[..n].to_vec();
                session.keep_alive = http::wants_keep_alive(&data);
                http::inject_forwarded_headers(&mut data, &session.client_ip, SCRATCH_BUFFER_SIZE);
                session.request_forwarded = true;

                let addr = format!("{}:{}", session.backend_host, session.backend_port);
                if let Some(b) = roster.get_mut(session.backend_index) {
                    if b.matches(&session.backend_host, session.backend_port) {
                        b.total_requests += 1;
                    }
                }
                metrics.counter_inc("lb_requests_total", &[("backend", addr.as_str())]);

                let len = data.len() as u64;
                write_relay(session, reactor, slot, Side::Backend, &data)
                    .map(|_| (Side::Backend, len))
            } else {
                let scratch = std::mem::take(&mut session.scratch);
                let result = write_relay(session, reactor, slot, from.opposite(), &scratch[..n]);
                session.scratch = scratch;
                result.map(|_| (from.opposite(), n as u64))
            };

            match relay_result {
                Ok((to, len)) => {
                    account_bytes(session, roster, metrics, to, len);
                }
                Err(e) => {
                    debug!(client = %session.client_ip, error = %e, "session write error");
                    session.keep_alive = false;
                    finish_session(session, reactor, pool, roster, metrics, false);
                    return;
                }
            }
        }
    }

    /// The destination of a backed-up direction became writable.
    fn flush_pending(&mut self, slot: usize, to: Side) {
        let Self {
            conns,
            reactor,
            pool,
            roster,
            metrics,
            ..
        } = self;
        let Some(Conn::Proxy(session)) = conns.get_mut(slot) else {
            return;
        };
        if session.dead || session.pending(to).is_empty() {
            return;
        }

        let mut pending = std::mem::take(session.pending_mut(to));
        let mut written = 0;
        let result = loop {
            if written == pending.len() {
                break Ok(());
            }
            let write_result = match to {
                Side::Client => session.client.write(&pending[written..]),
                Side::Backend => match session.backend.as_mut() {
                    Some(s) => s.write(&pending[written..]),
                    None => break Err(io::Error::from(io::ErrorKind::NotConnected)),
                },
            };
            match write_result {
                Ok(0) => break Err(io::Error::from(io::ErrorKind::WriteZero)),
                Ok(k) => written += k,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break Ok(()),
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => break Err(e),
            }
        };
        pending.drain(..written);
        *session.pending_mut(to) = pending;

        match result {
            Ok(()) => {
                if session.pending(to).is_empty() {
                    if let Err(e) = sync_interest(session, reactor, slot) {
                        debug!(error = %e, "failed to restore interest after flush");
                        session.keep_alive = false;
                        finish_session(session, reactor, pool, roster, metrics, false);
                    }
                }
            }
            Err(e) => {
                debug!(client = %session.client_ip, error = %e, "session flush error");
                session.keep_alive = false;
                finish_session(session, reactor, pool, roster, metrics, false);
            }
        }
    }

    fn fail_session(&mut self, slot: usize) {
        let Self {
            conns,
            reactor,
            pool,
            roster,
            metrics,
            ..
        } = self;
        if let Some(Conn::Proxy(session)) = conns.get_mut(slot) {
            session.keep_alive = false;
            finish_session(session, reactor, pool, roster, metrics, false);
        }
    }

    fn accept_admin(&mut self) {
        loop {
            let Some(listener) = &self.admin else { return };
            match listener.accept() {
                Ok((stream, _peer)) => {
                    if stream.set_nonblocking(true).is_err() {
                        continue;
                    }
                    let entry = self.conns.vacant_entry();
                    let slot = entry.key();
                    if self
                        .reactor
                        .add(
                            stream.as_raw_fd(),
                            conn_token(slot, Side::Client),
                            Interest::READ,
                        )
                        .is_ok()
                    {
                        entry.insert(Conn::Admin(AdminConn {
                            stream,
                            request: Vec::new(),
                            response: Vec::new(),
                            written: 0,
                            dead: false,
                        }));
                    }
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    warn!(error = %e, "admin accept failed");
                    break;
                }
            }
        }
    }

    fn drive_admin(&mut self, slot: usize, readiness: Readiness) {
        let Self {
            conns,
            reactor,
            metrics,
            ..
        } = self;
        let Some(Conn::Admin(conn)) = conns.get_mut(slot) else {
            return;
        };
        if conn.dead {
            return;
        }

        if readiness.is_readable() && conn.response.is_empty() {
            let mut buf = [0u8; 4096];
            loop {
                match conn.stream.read(&mut buf) {
                    Ok(0) => {
                        admin_close(conn, reactor);
                        return;
                    }
                    Ok(n) => {
                        conn.request.extend_from_slice(&buf[..n]);
                        if conn.request.len() > SCRATCH_BUFFER_SIZE {
                            admin_close(conn, reactor);
                            return;
                        }
                    }
                    Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                    Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                    Err(_) => {
                        admin_close(conn, reactor);
                        return;
                    }
                }
            }
            if conn.request.windows(4).any(|w| w == b"\r\n\r\n") {
                conn.response = admin_response(&conn.request, metrics);
                let _ = reactor.modify(
                    conn.stream.as_raw_fd(),
                    conn_token(slot, Side::Client),
                    Interest::WRITE,
                );
            }
        }

        if !conn.response.is_empty() {
            loop {
                match conn.stream.write(&conn.response[conn.written..]) {
                    Ok(0) => {
                        admin_close(conn, reactor);
                        return;
                    }
                    Ok(n) => {
                        conn.written += n;
                        if conn.written == conn.response.len() {
                            admin_close(conn, reactor);
                            return;
                        }
                    }
                    Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                    Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                    Err(_) => {
                        admin_close(conn, reactor);
                        return;
                    }
                }
            }
        }
    }

    fn sweep_dead(&mut self) {
        self.conns.retain(|_, conn| !conn.is_dead());
    }

    fn observe_signals(&mut self) {
        if self.flags.reload.swap(false, Ordering::Relaxed) {
            info!("reload signal received");
            self.reload_config();
        }
        if self.flags.stats.swap(false, Ordering::Relaxed) {
            self.log_stats();
        }
        if self.flags.drain.swap(false, Ordering::Relaxed) {
            self.begin_drain("signal");
        }
    }

    fn housekeeping(&mut self) {
        self.last_tick = Instant::now();

        if self.last_health_check.elapsed() >= HEALTH_CHECK_INTERVAL {
            self.last_health_check = Instant::now();
            health::check_roster(&mut self.roster);
            self.metrics
                .gauge_set("lb_backends_healthy", self.roster.healthy_count() as f64, &[]);
        }

        let evicted = self.pool.cleanup();
        if evicted > 0 {
            debug!(evicted, "pool sweep evicted idle connections");
        }
        self.export_pool_stats();

        if let Some(limiter) = &self.limiter {
            let reclaimed = limiter.cleanup();
            if reclaimed > 0 {
                debug!(reclaimed, "rate limiter reclaimed idle entries");
            }
        }

        let config = self.config.load();
        if config.changed() {
            info!("configuration file changed on disk");
            drop(config);
            self.reload_config();
        }
    }

    /// Counters in the registry are monotonic adds, so export pool stats as
    /// deltas against the last tick.
    fn export_pool_stats(&mut self) {
        let stats = self.pool.stats();
        let hits = stats.hits.saturating_sub(self.exported_pool_hits);
        if hits > 0 {
            self.metrics
                .counter_add("lb_pool_hits_total", hits as f64, &[]);
        }
        self.exported_pool_hits = stats.hits;

        let misses = stats.misses.saturating_sub(self.exported_pool_misses);
        if misses > 0 {
            self.metrics
                .counter_add("lb_pool_misses_total", misses as f64, &[]);
        }
        self.exported_pool_misses = stats.misses;
    }

    fn reload_config(&mut self) {
        let current = self.config.load_full();
        let next = match Config::reload(&current.config_file) {
            Ok(next) => next,
            Err(e) => {
                warn!(error = %e, "configuration reload failed; keeping current configuration");
                return;
            }
        };

        let semantic_change = !next.equivalent(&current)
            || next.pool != current.pool
            || next.rate_limit != current.rate_limit;
        if !semantic_change {
            // Only the file metadata moved; remember the new mtime.
            self.config.store(Arc::new(next));
            return;
        }

        if next.listen_port != current.listen_port || next.bind_address != current.bind_address {
            warn!(
                current = %format!("{}:{}", current.bind_address, current.listen_port),
                requested = %format!("{}:{}", next.bind_address, next.listen_port),
                "listener address change requires a restart; keeping the current listener"
            );
        }

        // Live sessions keep running; the new roster applies to new
        // sessions, carrying counters over for surviving backends.
        self.roster.apply(&next);
        self.balancer.set_algorithm(next.algorithm);

        if next.pool != current.pool || next.connect_timeout_ms != current.connect_timeout_ms {
            self.pool = ConnectionPool::from_config(&next);
            self.exported_pool_hits = 0;
            self.exported_pool_misses = 0;
            info!("connection pool rebuilt");
        }
        if next.rate_limit != current.rate_limit {
            self.limiter = build_limiter(&next);
            info!("rate limiter rebuilt");
        }

        info!(
            backends = next.backends.len(),
            algorithm = next.algorithm.as_str(),
            "configuration reloaded"
        );
        self.config.store(Arc::new(next));
    }

    fn begin_drain(&mut self, reason: &str) {
        if self.draining {
            return;
        }
        self.draining = true;
        self.drain_started = Some(Instant::now());
        let _ = self.reactor.remove(self.listener.as_raw_fd());
        if let Some(admin) = &self.admin {
            let _ = self.reactor.remove(admin.as_raw_fd());
        }
        info!(reason, active = self.active_sessions(), "draining");
    }

    fn active_sessions(&self) -> usize {
        self.conns
            .iter()
            .filter(|(_, c)| matches!(c, Conn::Proxy(s) if !s.dead))
            .count()
    }

    fn drain_complete(&self) -> bool {
        self.active_sessions() == 0
            || self
                .drain_started
                .is_some_and(|t| t.elapsed() >= self.config.load().drain_timeout())
    }

    fn log_stats(&self) {
        let pool = self.pool.stats();
        info!(
            hits = pool.hits,
            misses = pool.misses,
            evictions = pool.evictions,
            current_size = pool.current_size,
            hit_rate = format!("{:.4}", pool.hit_rate()),
            "pool statistics"
        );
        for b in self.roster.iter() {
            info!(
                backend = %b.address(),
                healthy = b.is_healthy,
                active = b.active_connections,
                requests = b.total_requests,
                failed = b.failed_requests,
                bytes_in = b.bytes_in,
                bytes_out = b.bytes_out,
                "backend statistics"
            );
        }
        if let Some(limiter) = &self.limiter {
            let s = limiter.stats();
            info!(
                allowed = s.allowed,
                denied = s.denied,
                denial_rate = format!("{:.2}", s.denial_rate),
                active_keys = s.active_keys,
                "rate limiter statistics"
            );
        }
    }
}

/// Close out a session on any exit path: deregister both fds, re-pool or
/// close the backend, release the roster claim. The slab slot is swept
/// after the current dispatch batch.
fn finish_session(
    session: &mut Session,
    reactor: &mut Reactor,
    pool: &ConnectionPool,
    roster: &mut Roster,
    metrics: &Registry,
    reusable: bool,
) {
    if session.dead {
        return;
    }
    session.dead = true;

    let _ = reactor.remove(session.client.as_raw_fd());
    if let Some(backend) = session.backend.take() {
        let _ = reactor.remove(backend.as_raw_fd());
        if reusable && session.keep_alive {
            pool.give_back(backend, &session.backend_host, session.backend_port);
        } else {
            pool.discard(backend);
        }
    }

    roster.release(
        session.backend_index,
        &session.backend_host,
        session.backend_port,
    );
    metrics.gauge_dec("lb_connections_active", &[]);
    metrics.histogram_observe(
        "lb_request_duration_seconds",
        session.started.elapsed().as_secs_f64(),
        &[],
    );
    debug!(
        client = %session.client_ip,
        bytes_in = session.bytes_in,
        bytes_out = session.bytes_out,
        "session closed"
    );
}

/// Write towards one side, buffering the remainder and flipping interest
/// when the destination blocks. Bytes are never reordered: while a pending
/// buffer exists the source is not read.
fn write_relay(
    session: &mut Session,
    reactor: &mut Reactor,
    slot: usize,
    to: Side,
    data: &[u8],
) -> io::Result<()> {
    if data.is_empty() {
        return Ok(());
    }
    if !session.pending(to).is_empty() {
        session.pending_mut(to).extend_from_slice(data);
        return Ok(());
    }

    let mut written = 0;
    loop {
        if written == data.len() {
            return Ok(());
        }
        let write_result = match to {
            Side::Client => session.client.write(&data[written..]),
            Side::Backend => match session.backend.as_mut() {
                Some(s) => s.write(&data[written..]),
                None => return Err(io::Error::from(io::ErrorKind::NotConnected)),
            },
        };
        match write_result {
            Ok(0) => return Err(io::Error::from(io::ErrorKind::WriteZero)),
            Ok(k) => written += k,
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                session.pending_mut(to).extend_from_slice(&data[written..]);
                sync_interest(session, reactor, slot)?;
                return Ok(());
            }
            Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
            Err(e) => return Err(e),
        }
    }
}

/// Re-derive both fds' interest masks from session state: a side is read
/// from only while its destination's pending buffer is empty, and written
/// to only while its own pending buffer is not. Both directions can be
/// backed up at once, so the masks are always computed together.
fn sync_interest(session: &Session, reactor: &mut Reactor, slot: usize) -> io::Result<()> {
    for side in [Side::Client, Side::Backend] {
        let fd = match side {
            Side::Client => session.client.as_raw_fd(),
            Side::Backend => match session.backend.as_ref() {
                Some(s) => s.as_raw_fd(),
                None => continue,
            },
        };
        let mut interest = Interest::NONE;
        if session.pending(side.opposite()).is_empty() {
            interest = interest | Interest::READ;
        }
        if !session.pending(side).is_empty() {
            interest = interest | Interest::WRITE;
        }
        reactor.modify(fd, conn_token(slot, side), interest)?;
    }
    Ok(())
}

fn account_bytes(
    session: &mut Session,
    roster: &mut Roster,
    metrics: &Registry,
    to: Side,
    len: u64,
) {
    match to {
        // Client → backend traffic.
        Side::Backend => {
            session.bytes_out += len;
            metrics.counter_add("lb_bytes_sent_total", len as f64, &[]);
        }
        // Backend → client traffic.
        Side::Client => {
            session.bytes_in += len;
            metrics.counter_add("lb_bytes_received_total", len as f64, &[]);
        }
    }
    if let Some(b) = roster.get_mut(session.backend_index) {
        if b.matches(&session.backend_host, session.backend_port) {
            match to {
                Side::Backend => b.bytes_out += len,
                Side::Client => b.bytes_in += len,
            }
        }
    }
}

fn admin_close(conn: &mut AdminConn, reactor: &mut Reactor) {
    conn.dead = true;
    let _ = reactor.remove(conn.stream.as_raw_fd());
}

fn admin_response(request: &[u8], metrics: &Registry) -> Vec<u8> {
    let is_metrics = request.starts_with(b"GET /metrics ") || request.starts_with(b"GET /metrics\r");
    if is_metrics {
        let body = metrics.render();
        format!(
            "HTTP/1.1 200 OK\r\n\
             Content-Type: text/plain; version=0.0.4\r\n\
             Content-Length: {}\r\n\
             Connection: close\r\n\
             \r\n\
             {body}",
            body.len()
        )
        .into_bytes()
    } else {
        b"HTTP/1.1 404 Not Found\r\nContent-Length: 0\r\nConnection: close\r\n\r\n".to_vec()
    }
}

fn respond_and_drop(mut stream: TcpStream, response: &[u8]) {
    let _ = stream.write_all(response);
    let _ = stream.shutdown(Shutdown::Both);
}

fn build_limiter(config: &Config) -> Option<RateLimiter> {
    config.rate_limit.as_ref().map(|rl| {
        RateLimiter::new(
            RateLimitAlgorithm::TokenBucket,
            rl.per_ip_rate,
            rl.burst_size as f64,
        )
        .with_global_limit(rl.global_rate as u64)
    })
}

fn bind_listener(host: &str, port: u16, backlog: i32) -> io::Result<TcpListener> {
    let addr = pool::resolve(host, port)?;
    let socket = Socket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))?;
    socket.set_reuse_address(true)?;
    socket.bind(&addr.into())?;
    socket.listen(backlog)?;
    socket.set_nonblocking(true)?;
    Ok(socket.into())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::BackendConfig;
    use std::net::TcpListener as StdListener;

    fn backend_config(host: &str, port: u16) -> BackendConfig {
        BackendConfig {
            host: host.to_string(),
            port,
            weight: 1,
            max_connections: 100,
        }
    }

    fn server_with_backends(backends: Vec<BackendConfig>) -> ProxyServer {
        let config = Config {
            listen_port: 0,
            bind_address: "127.0.0.1".to_string(),
            backends,
            ..Config::default()
        };
        let metrics = Arc::new(Registry::new());
        metrics.register_defaults();
        ProxyServer::new(config, metrics, SignalFlags::disconnected()).expect("server")
    }

    fn dead_port() -> u16 {
        let listener = StdListener::bind("127.0.0.1:0").expect("bind");
        let port = listener.local_addr().expect("addr").port();
        drop(listener);
        port
    }

    #[test]
    fn token_round_trip() {
        for slot in [0, 1, 7, 500] {
            for side in [Side::Client, Side::Backend] {
                assert_eq!(token_target(conn_token(slot, side)), Some((slot, side)));
            }
        }
        assert_eq!(token_target(LISTENER_TOKEN), None);
        assert_eq!(token_target(ADMIN_TOKEN), None);
    }

    #[test]
    fn dial_failure_marks_backend_and_retries_to_the_healthy_one() {
        let live = StdListener::bind("127.0.0.1:0").expect("bind");
        let live_port = live.local_addr().expect("addr").port();
        let dead = dead_port();

        let mut server = server_with_backends(vec![
            backend_config("127.0.0.1", live_port),
            backend_config("127.0.0.1", dead),
        ]);

        // Round-robin starts at the second backend, which refuses; the
        // retry must land on the live one.
        let (index, stream) = server.lease_backend("10.0.0.1").expect("lease");
        assert_eq!(index, 0);
        drop(stream);

        let b = server.roster.get(1).expect("dead backend");
        assert!(!b.is_healthy);
        assert_eq!(b.failed_requests, 1);
    }

    #[test]
    fn all_dials_failing_yields_service_unavailable() {
        let mut server = server_with_backends(vec![
            backend_config("127.0.0.1", dead_port()),
            backend_config("127.0.0.1", dead_port()),
        ]);

        let response = server.lease_backend("10.0.0.1").expect_err("no lease");
        assert!(response.starts_with(b"HTTP/1.1 503"));
        assert_eq!(server.roster.healthy_count(), 0);
    }

    #[test]
    fn empty_roster_yields_service_unavailable() {
        let config = Config {
            listen_port: 0,
            bind_address: "127.0.0.1".to_string(),
            ..Config::default()
        };
        let metrics = Arc::new(Registry::new());
        let mut server =
            ProxyServer::new(config, metrics, SignalFlags::disconnected()).expect("server");

        let response = server.lease_backend("10.0.0.1").expect_err("no lease");
        assert!(response.starts_with(b"HTTP/1.1 503"));
    }

    #[test]
    fn bind_failure_is_an_error() {
        let taken = StdListener::bind("127.0.0.1:0").expect("bind");
        let port = taken.local_addr().expect("addr").port();

        // SO_REUSEADDR does not allow two live listeners on one port.
        let config = Config {
            listen_port: port,
            bind_address: "127.0.0.1".to_string(),
            backends: vec![backend_config("127.0.0.1", 1)],
            ..Config::default()
        };
        let result = ProxyServer::new(
            config,
            Arc::new(Registry::new()),
            SignalFlags::disconnected(),
        );
        assert!(result.is_err());
    }
}
