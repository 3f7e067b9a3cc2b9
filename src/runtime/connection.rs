//! Accepted connections and the registry that owns them.
//!
//! Each connection owns its stream and a buffer of echo bytes that the
//! socket has not yet accepted. The interest the server registers for a
//! connection is derived from that buffer.

use bytes::{Buf, BytesMut};
use mio::net::TcpStream;
use mio::Interest;
use slab::Slab;
use std::io::{self, Write};
use std::net::SocketAddr;

/// Pending echo bytes above which the server stops reading from a peer
/// until it drains its responses.
pub const PENDING_LIMIT: usize = 64 * 1024;

/// A single accepted client connection.
#[derive(Debug)]
pub struct Connection {
    pub stream: TcpStream,
    /// Peer address, informational only.
    pub peer: SocketAddr,
    /// Bytes received but not yet written back.
    pending: BytesMut,
    /// Total bytes echoed back on this connection.
    echoed: u64,
}

impl Connection {
    pub fn new(stream: TcpStream, peer: SocketAddr) -> Self {
        Self {
            stream,
            peer,
            pending: BytesMut::new(),
            echoed: 0,
        }
    }

    /// Queue received bytes to be echoed.
    pub fn queue(&mut self, data: &[u8]) {
        self.pending.extend_from_slice(data);
    }

    /// Write as much pending data as the socket accepts.
    ///
    /// Returns `Ok(true)` once everything queued has been written.
    pub fn flush(&mut self) -> io::Result<bool> {
        while !self.pending.is_empty() {
            match self.stream.write(&self.pending) {
                Ok(0) => {
                    return Err(io::Error::new(io::ErrorKind::WriteZero, "write returned 0"));
                }
                Ok(n) => {
                    self.pending.advance(n);
                    self.echoed += n as u64;
                }
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(false),
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => return Err(e),
            }
        }
        Ok(true)
    }

    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    pub fn echoed(&self) -> u64 {
        self.echoed
    }

    /// Whether the server should keep reading from this peer.
    pub fn wants_read(&self) -> bool {
        self.pending.len() < PENDING_LIMIT
    }

    /// Interest to register given the current pending buffer.
    pub fn interest(&self) -> Interest {
        match (self.wants_read(), self.pending.is_empty()) {
            (true, true) => Interest::READABLE,
            (true, false) => Interest::READABLE | Interest::WRITABLE,
            (false, _) => Interest::WRITABLE,
        }
    }
}

/// Registry of active connections using slab allocation.
///
/// Slab keys double as multiplexer tokens. Provides O(1) insert, lookup,
/// and remove operations.
pub struct ConnectionRegistry {
    connections: Slab<Connection>,
    max_connections: usize,
}

impl ConnectionRegistry {
    /// Create a new registry with specified maximum capacity.
    pub fn new(max_connections: usize) -> Self {
        Self {
            connections: Slab::with_capacity(max_connections.min(1024)),
            max_connections,
        }
    }

    /// Insert a new connection into the registry.
    ///
    /// Returns the connection back if the registry is at capacity.
    pub fn insert(&mut self, conn: Connection) -> Result<usize, Connection> {
        if self.connections.len() >= self.max_connections {
            return Err(conn);
        }
        Ok(self.connections.insert(conn))
    }

    pub fn get_mut(&mut self, id: usize) -> Option<&mut Connection> {
        self.connections.get_mut(id)
    }

    /// Remove a connection from the registry.
    pub fn remove(&mut self, id: usize) -> Option<Connection> {
        self.connections.try_remove(id)
    }

    #[cfg(test)]
    pub fn contains(&self, id: usize) -> bool {
        self.connections.contains(id)
    }

    /// Number of active connections.
    pub fn len(&self) -> usize {
        self.connections.len()
    }

    /// Remove and return every connection.
    pub fn drain(&mut self) -> impl Iterator<Item = (usize, Connection)> + '_ {
        let ids: Vec<usize> = self.connections.iter().map(|(id, _)| id).collect();
        ids.into_iter()
            .filter_map(move |id| self.connections.try_remove(id).map(|conn| (id, conn)))
    }
}
