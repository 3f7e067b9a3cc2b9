//! Readiness multiplexer.
//!
//! Thin wrapper over `mio::Poll` (epoll on Linux, kqueue on macOS) that
//! also tracks the set of registered tokens, so that a token is never
//! registered twice and the registration set can be checked against the
//! endpoints its owner still holds open.
//!
//! mio delivers edge-triggered readiness: after an event, callers must
//! perform I/O until `WouldBlock` before waiting again.

use mio::event::Source;
use mio::{Events, Interest, Poll, Token, Waker};
use std::collections::HashSet;
use std::io;
use std::time::Duration;
use thiserror::Error;

/// Default number of readiness events returned by a single wait.
pub const DEFAULT_MAX_EVENTS: usize = 64;

#[derive(Debug, Error)]
pub enum MuxError {
    /// The OS could not allocate the readiness facility.
    #[error("failed to create readiness facility: {0}")]
    Resource(#[source] io::Error),
    /// Invalid handle, duplicate registration, or unknown token.
    #[error("registration of {token:?} failed: {source}")]
    Registration { token: Token, source: io::Error },
    /// A wait failed for a reason other than signal interruption.
    #[error("readiness wait failed: {0}")]
    Wait(#[source] io::Error),
}

pub struct Multiplexer {
    poll: Poll,
    registered: HashSet<Token>,
    waker_token: Option<Token>,
}

impl Multiplexer {
    pub fn new() -> Result<Self, MuxError> {
        let poll = Poll::new().map_err(MuxError::Resource)?;
        Ok(Self {
            poll,
            registered: HashSet::new(),
            waker_token: None,
        })
    }

    /// Allocate an event batch sized for this multiplexer's waits.
    pub fn events(capacity: usize) -> Events {
        Events::with_capacity(capacity.max(1))
    }

    /// Add `source` to the interest set under `token`.
    pub fn register<S>(
        &mut self,
        source: &mut S,
        token: Token,
        interest: Interest,
    ) -> Result<(), MuxError>
    where
        S: Source + ?Sized,
    {
        if self.registered.contains(&token) || self.waker_token == Some(token) {
            return Err(MuxError::Registration {
                token,
                source: io::Error::new(io::ErrorKind::AlreadyExists, "token already registered"),
            });
        }

        self.poll
            .registry()
            .register(source, token, interest)
            .map_err(|source| MuxError::Registration { token, source })?;
        self.registered.insert(token);
        Ok(())
    }

    /// Replace the interest mask of an already registered source.
    pub fn reregister<S>(
        &mut self,
        source: &mut S,
        token: Token,
        interest: Interest,
    ) -> Result<(), MuxError>
    where
        S: Source + ?Sized,
    {
        if !self.registered.contains(&token) {
            return Err(not_registered(token));
        }

        self.poll
            .registry()
            .reregister(source, token, interest)
            .map_err(|source| MuxError::Registration { token, source })
    }

    /// Remove `source` from the interest set.
    ///
    /// The token is released even when the OS call fails, since the caller
    /// is about to close the endpoint either way.
    pub fn deregister<S>(&mut self, source: &mut S, token: Token) -> Result<(), MuxError>
    where
        S: Source + ?Sized,
    {
        if !self.registered.remove(&token) {
            return Err(not_registered(token));
        }

        self.poll
            .registry()
            .deregister(source)
            .map_err(|source| MuxError::Registration { token, source })
    }

    /// Create a waker that makes a blocked `wait` return an event for `token`.
    ///
    /// The waker is not an endpoint and is not counted in `registered_len`.
    pub fn waker(&mut self, token: Token) -> Result<Waker, MuxError> {
        if self.registered.contains(&token) || self.waker_token.is_some() {
            return Err(MuxError::Registration {
                token,
                source: io::Error::new(io::ErrorKind::AlreadyExists, "waker already registered"),
            });
        }

        let waker = Waker::new(self.poll.registry(), token)
            .map_err(|source| MuxError::Registration { token, source })?;
        self.waker_token = Some(token);
        Ok(waker)
    }

    /// Block until at least one registered source is ready, or `timeout`
    /// elapses. Returns the number of events written into `events`.
    ///
    /// At most `events.capacity()` events are returned per call; remaining
    /// readiness is reported by the next wait. Signal interruptions are
    /// retried.
    pub fn wait(
        &mut self,
        events: &mut Events,
        timeout: Option<Duration>,
    ) -> Result<usize, MuxError> {
        loop {
            match self.poll.poll(events, timeout) {
                Ok(()) => return Ok(events.iter().count()),
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(MuxError::Wait(e)),
            }
        }
    }

    #[cfg(test)]
    pub fn is_registered(&self, token: Token) -> bool {
        self.registered.contains(&token)
    }

    /// Number of registered sources, excluding the waker.
    pub fn registered_len(&self) -> usize {
        self.registered.len()
    }
}

fn not_registered(token: Token) -> MuxError {
    MuxError::Registration {
        token,
        source: io::Error::new(io::ErrorKind::NotFound, "token not registered"),
    }
}
