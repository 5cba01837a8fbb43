//! Per-connection session state.
//!
//! A session couples one accepted client socket with at most one leased
//! backend socket. It owns the scratch read buffer and the per-direction
//! pending-write buffers; the server drives all I/O from reactor dispatch.

use std::net::TcpStream;
use std::time::Instant;

/// Scratch read buffer per session; header injection must fit inside it.
pub const SCRATCH_BUFFER_SIZE: usize = 16384;

/// Upper bound on concurrent proxy sessions.
pub const MAX_CLIENTS: usize = 1024;

/// Which half of the pipe an event belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Side {
    Client,
    Backend,
}

impl Side {
    pub fn opposite(self) -> Side {
        match self {
            Side::Client => Side::Backend,
            Side::Backend => Side::Client,
        }
    }
}

pub struct Session {
    pub client: TcpStream,
    pub backend: Option<TcpStream>,
    /// Roster index at lease time; termination re-checks the identity
    /// because a reload may have rearranged the roster.
    pub backend_index: usize,
    pub backend_host: String,
    pub backend_port: u16,
    pub client_ip: String,
    pub scratch: Vec<u8>,
    /// Bytes accepted from one side but not yet written to the other.
    pub pending_to_backend: Vec<u8>,
    pub pending_to_client: Vec<u8>,
    pub request_forwarded: bool,
    pub keep_alive: bool,
    pub started: Instant,
    /// Backend → client volume for this session.
    pub bytes_in: u64,
    /// Client → backend volume for this session.
    pub bytes_out: u64,
    /// Terminated but not yet swept out of the slab; late events in the
    /// same dispatch batch must be ignored.
    pub dead: bool,
}

impl Session {
    pub fn new(
        client: TcpStream,
        backend: TcpStream,
        backend_index: usize,
        backend_host: String,
        backend_port: u16,
        client_ip: String,
    ) -> Self {
        Self {
            client,
            backend: Some(backend),
            backend_index,
            backend_host,
            backend_port,
            client_ip,
            scratch: vec![0u8; SCRATCH_BUFFER_SIZE],
            pending_to_backend: Vec::new(),
            pending_to_client: Vec::new(),
            request_forwarded: false,
            keep_alive: true,
            started: Instant::now(),
            bytes_in: 0,
            bytes_out: 0,
            dead: false,
        }
    }

    pub fn pending(&self, to: Side) -> &Vec<u8> {
        match to {
            Side::Client => &self.pending_to_client,
            Side::Backend => &self.pending_to_backend,
        }
    }

    pub fn pending_mut(&mut self, to: Side) -> &mut Vec<u8> {
        match to {
            Side::Client => &mut self.pending_to_client,
            Side::Backend => &mut self.pending_to_backend,
        }
    }
}
