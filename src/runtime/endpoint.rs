//! Transport endpoints: listening and connected TCP streams.
//!
//! All endpoints are non-blocking so they can be driven by a
//! [`Multiplexer`]. The blocking helpers here (`send_exact`,
//! `recv_exact`) park on the multiplexer whenever the socket would
//! block, and loop until the whole buffer has been transferred.

use crate::runtime::mux::{Multiplexer, MuxError};
use mio::net::{TcpListener, TcpStream};
use mio::Events;
use socket2::{Domain, Protocol, Socket, Type};
use std::io::{self, Read, Write};
use std::net::SocketAddr;
use thiserror::Error;

/// Create a non-blocking listener with SO_REUSEADDR set.
pub fn listen(addr: SocketAddr, backlog: i32) -> io::Result<TcpListener> {
    let socket = Socket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))?;

    socket.set_reuse_address(true)?;
    socket.set_nonblocking(true)?;
    socket.bind(&addr.into())?;
    socket.listen(backlog)?;

    Ok(TcpListener::from_std(socket.into()))
}

/// Connect to `addr`, blocking until the handshake completes, then switch
/// the stream to non-blocking mode.
pub fn connect(addr: SocketAddr) -> io::Result<TcpStream> {
    let socket = Socket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))?;

    socket.connect(&addr.into())?;
    socket.set_nodelay(true)?;
    socket.set_nonblocking(true)?;

    Ok(TcpStream::from_std(socket.into()))
}

/// Failure of a blocking transfer over a multiplexed stream.
#[derive(Debug, Error)]
pub enum TransferError {
    #[error(transparent)]
    Io(#[from] io::Error),
    #[error(transparent)]
    Mux(#[from] MuxError),
}

/// Write all of `buf`, waiting for readiness when the socket is full.
///
/// `stream` must be registered with `mux` for writable interest.
pub fn send_exact(
    stream: &mut TcpStream,
    mux: &mut Multiplexer,
    events: &mut Events,
    buf: &[u8],
) -> Result<(), TransferError> {
    let mut written = 0;
    while written < buf.len() {
        match stream.write(&buf[written..]) {
            Ok(0) => {
                return Err(io::Error::new(io::ErrorKind::WriteZero, "write returned 0").into());
            }
            Ok(n) => written += n,
            Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => {
                mux.wait(events, None)?;
            }
            Err(ref e) if e.kind() == io::ErrorKind::Interrupted => {}
            Err(e) => return Err(e.into()),
        }
    }
    Ok(())
}

/// Fill all of `buf`, waiting for readiness until enough bytes arrive.
///
/// A peer close before `buf` is full is an `UnexpectedEof` error.
/// `stream` must be registered with `mux` for readable interest.
pub fn recv_exact(
    stream: &mut TcpStream,
    mux: &mut Multiplexer,
    events: &mut Events,
    buf: &mut [u8],
) -> Result<(), TransferError> {
    let mut filled = 0;
    while filled < buf.len() {
        match stream.read(&mut buf[filled..]) {
            Ok(0) => {
                return Err(
                    io::Error::new(io::ErrorKind::UnexpectedEof, "peer closed connection").into(),
                );
            }
            Ok(n) => filled += n,
            Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => {
                mux.wait(events, None)?;
            }
            Err(ref e) if e.kind() == io::ErrorKind::Interrupted => {}
            Err(e) => return Err(e.into()),
        }
    }
    Ok(())
}
