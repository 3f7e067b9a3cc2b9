//! Single-threaded echo server loop.
//!
//! Readiness-based model: the multiplexer tells us when the listener or a
//! connection is ready, then we perform non-blocking accept/read/write
//! syscalls until they would block. Every byte read from a connection is
//! written back to it unchanged.
//!
//! A connection's registration and its slot in the registry are created
//! and destroyed together, so the multiplexer never reports readiness for
//! a closed stream.

use crate::config::ServerConfig;
use crate::runtime::connection::{Connection, ConnectionRegistry};
use crate::runtime::endpoint;
use crate::runtime::mux::{Multiplexer, MuxError};
use crate::runtime::MESSAGE_SIZE;
use mio::net::TcpListener;
use mio::{Events, Interest, Token, Waker};
use std::io::{self, Read};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, error, info, trace, warn};

const LISTENER_TOKEN: Token = Token(usize::MAX);
const WAKER_TOKEN: Token = Token(usize::MAX - 1);

#[derive(Debug, Error)]
pub enum ServerError {
    #[error("failed to listen on {addr}: {source}")]
    Bind { addr: SocketAddr, source: io::Error },
    #[error(transparent)]
    Mux(#[from] MuxError),
}

/// Outcome of one pass through the loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flow {
    Continue,
    Shutdown,
}

/// Stops a running [`EchoServer`] from another thread.
#[derive(Clone)]
pub struct ShutdownHandle {
    waker: Arc<Waker>,
}

impl ShutdownHandle {
    pub fn shutdown(&self) -> io::Result<()> {
        self.waker.wake()
    }
}

pub struct EchoServer {
    listener: TcpListener,
    local_addr: SocketAddr,
    mux: Multiplexer,
    events: Events,
    connections: ConnectionRegistry,
    waker: Arc<Waker>,
}

impl EchoServer {
    /// Bind the listening endpoint and register it with a fresh multiplexer.
    pub fn bind(config: &ServerConfig) -> Result<Self, ServerError> {
        let bind_err = |source| ServerError::Bind {
            addr: config.addr,
            source,
        };

        let mut listener = endpoint::listen(config.addr, config.backlog).map_err(bind_err)?;
        let local_addr = listener.local_addr().map_err(bind_err)?;

        let mut mux = Multiplexer::new()?;
        mux.register(&mut listener, LISTENER_TOKEN, Interest::READABLE)?;
        let waker = Arc::new(mux.waker(WAKER_TOKEN)?);

        info!(
            addr = %local_addr,
            max_events = config.max_events,
            max_connections = config.max_connections,
            "Server listening"
        );

        Ok(Self {
            listener,
            local_addr,
            mux,
            events: Multiplexer::events(config.max_events),
            connections: ConnectionRegistry::new(config.max_connections),
            waker,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn shutdown_handle(&self) -> ShutdownHandle {
        ShutdownHandle {
            waker: Arc::clone(&self.waker),
        }
    }

    /// Number of open accepted connections.
    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }

    /// Number of multiplexer registrations, listener included.
    pub fn registration_count(&self) -> usize {
        self.mux.registered_len()
    }

    /// Run until a shutdown request or a fatal multiplexer error.
    pub fn run(mut self) -> Result<(), ServerError> {
        let result = loop {
            match self.turn(None) {
                Ok(Flow::Continue) => {}
                Ok(Flow::Shutdown) => break Ok(()),
                Err(e) => {
                    error!(error = %e, "Event loop failed");
                    break Err(e);
                }
            }
        };

        self.close_all();
        info!(addr = %self.local_addr, "Server stopped");
        result
    }

    /// Wait once and handle every reported event.
    pub fn turn(&mut self, timeout: Option<Duration>) -> Result<Flow, ServerError> {
        self.mux.wait(&mut self.events, timeout)?;

        // Collected so handlers can borrow `self` mutably.
        let ready: Vec<(Token, bool, bool)> = self
            .events
            .iter()
            .map(|e| (e.token(), e.is_readable() || e.is_read_closed(), e.is_writable()))
            .collect();

        let mut flow = Flow::Continue;
        for (token, readable, writable) in ready {
            match token {
                LISTENER_TOKEN => self.accept_connections(),
                WAKER_TOKEN => flow = Flow::Shutdown,
                Token(conn_id) => {
                    if let Err(e) = self.handle_connection_event(conn_id, readable, writable) {
                        debug!(conn_id, error = %e, "Connection error");
                        self.close_connection(conn_id);
                    }
                }
            }
        }

        Ok(flow)
    }

    fn accept_connections(&mut self) {
        loop {
            match self.listener.accept() {
                Ok((stream, peer)) => {
                    let conn_id = match self.connections.insert(Connection::new(stream, peer)) {
                        Ok(id) => id,
                        Err(_) => {
                            warn!(peer = %peer, "Connection limit reached");
                            continue;
                        }
                    };

                    let Some(conn) = self.connections.get_mut(conn_id) else {
                        continue;
                    };
                    if let Err(e) =
                        self.mux
                            .register(&mut conn.stream, Token(conn_id), Interest::READABLE)
                    {
                        error!(peer = %peer, error = %e, "Failed to register connection");
                        self.connections.remove(conn_id);
                        continue;
                    }

                    debug!(conn_id, peer = %peer, "Accepted connection");
                }
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) if accept_error_is_per_connection(e.kind()) => {
                    warn!(error = %e, "Accept failed, skipping connection");
                }
                Err(e) => {
                    error!(error = %e, "Accept failed");
                    break;
                }
            }
        }
    }

    fn handle_connection_event(
        &mut self,
        conn_id: usize,
        readable: bool,
        writable: bool,
    ) -> io::Result<()> {
        let Some(conn) = self.connections.get_mut(conn_id) else {
            return Ok(());
        };
        let before = conn.interest();

        if readable && conn.wants_read() && !read_and_echo(conn_id, conn)? {
            self.close_connection(conn_id);
            return Ok(());
        }

        if writable {
            conn.flush()?;
        }

        let after = conn.interest();
        if after != before {
            self.mux
                .reregister(&mut conn.stream, Token(conn_id), after)
                .map_err(|e| io::Error::new(io::ErrorKind::Other, e))?;
        }

        Ok(())
    }

    /// Deregister and close a connection.
    fn close_connection(&mut self, conn_id: usize) {
        if let Some(mut conn) = self.connections.remove(conn_id) {
            if let Err(e) = self.mux.deregister(&mut conn.stream, Token(conn_id)) {
                debug!(conn_id, error = %e, "Deregister failed");
            }
            debug!(
                conn_id,
                peer = %conn.peer,
                echoed = conn.echoed(),
                unsent = conn.pending_len(),
                "Connection closed"
            );
        }
    }

    fn close_all(&mut self) {
        for (conn_id, mut conn) in self.connections.drain() {
            if let Err(e) = self.mux.deregister(&mut conn.stream, Token(conn_id)) {
                debug!(conn_id, error = %e, "Deregister failed");
            }
        }
        if let Err(e) = self.mux.deregister(&mut self.listener, LISTENER_TOKEN) {
            debug!(error = %e, "Listener deregister failed");
        }
    }
}

/// Accept errors that concern only the connection being accepted. The
/// listener may still hold other pending connections, so accepting goes on.
fn accept_error_is_per_connection(kind: io::ErrorKind) -> bool {
    matches!(
        kind,
        io::ErrorKind::ConnectionAborted
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::PermissionDenied
    )
}

/// Read until the socket would block, echoing each chunk as it arrives.
///
/// Returns `Ok(false)` when the peer has closed the connection.
fn read_and_echo(conn_id: usize, conn: &mut Connection) -> io::Result<bool> {
    let mut buf = [0u8; MESSAGE_SIZE];
    while conn.wants_read() {
        match conn.stream.read(&mut buf) {
            Ok(0) => return Ok(false),
            Ok(n) => {
                trace!(conn_id, bytes = n, "Echoing message");
                conn.queue(&buf[..n]);
                conn.flush()?;
            }
            Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => break,
            Err(ref e) if e.kind() == io::ErrorKind::Interrupted => {}
            Err(e) => return Err(e),
        }
    }
    Ok(true)
}
