//! Load-generating worker.
//!
//! A worker owns one connection and one private multiplexer. It sends the
//! fixed payload, waits for the echo, and times the interval between the
//! two. The worker's multiplexer only ever holds its own stream, so every
//! wait it performs is on behalf of the round trip being timed.

use crate::runtime::endpoint::{self, TransferError};
use crate::runtime::mux::{Multiplexer, MuxError};
use crate::runtime::stats::WorkerStats;
use crate::runtime::{MESSAGE_SIZE, PAYLOAD};
use mio::{Interest, Token};
use std::io;
use std::net::SocketAddr;
use std::time::Instant;
use thiserror::Error;
use tracing::{debug, trace};

const STREAM_TOKEN: Token = Token(0);

#[derive(Debug, Error)]
pub enum WorkerError {
    #[error("failed to connect to {addr}: {source}")]
    Connect { addr: SocketAddr, source: io::Error },
    #[error(transparent)]
    Mux(#[from] MuxError),
    #[error("send failed after {completed} round trips: {source}")]
    Send {
        completed: u64,
        source: TransferError,
    },
    #[error("receive failed after {completed} round trips: {source}")]
    Receive {
        completed: u64,
        source: TransferError,
    },
}

#[derive(Debug, Clone)]
pub struct Worker {
    pub id: usize,
    pub addr: SocketAddr,
    pub requests: u64,
    pub max_events: usize,
}

impl Worker {
    /// Run the configured number of round trips, accumulating into `stats`.
    ///
    /// On error, `stats` keeps every round trip completed before the
    /// failure. The request rate is derived on every exit path.
    pub fn run(&self, stats: &mut WorkerStats) -> Result<(), WorkerError> {
        let result = self.drive(stats);
        stats.finish();
        result
    }

    fn drive(&self, stats: &mut WorkerStats) -> Result<(), WorkerError> {
        let mut stream = endpoint::connect(self.addr).map_err(|source| WorkerError::Connect {
            addr: self.addr,
            source,
        })?;

        let mut mux = Multiplexer::new()?;
        let mut events = Multiplexer::events(self.max_events);
        mux.register(
            &mut stream,
            STREAM_TOKEN,
            Interest::READABLE | Interest::WRITABLE,
        )?;

        debug!(worker = self.id, addr = %self.addr, "Worker connected");

        let mut response = [0u8; MESSAGE_SIZE];
        for i in 0..self.requests {
            let start = Instant::now();

            endpoint::send_exact(&mut stream, &mut mux, &mut events, PAYLOAD).map_err(
                |source| WorkerError::Send {
                    completed: stats.total_messages,
                    source,
                },
            )?;

            endpoint::recv_exact(&mut stream, &mut mux, &mut events, &mut response).map_err(
                |source| WorkerError::Receive {
                    completed: stats.total_messages,
                    source,
                },
            )?;

            let rtt = start.elapsed();
            stats.record(rtt);
            if &response != PAYLOAD {
                stats.mismatched_responses += 1;
            }

            trace!(
                worker = self.id,
                message = i + 1,
                rtt_us = rtt.as_micros() as u64,
                "Round trip"
            );
        }

        if let Err(e) = mux.deregister(&mut stream, STREAM_TOKEN) {
            debug!(worker = self.id, error = %e, "Deregister failed");
        }
        debug!(
            worker = self.id,
            messages = stats.total_messages,
            "Worker finished"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::mux::DEFAULT_MAX_EVENTS;
    use crate::runtime::testing::{closed_addr, spawn_server};
    use std::time::Duration;

    fn worker(addr: SocketAddr, requests: u64) -> Worker {
        Worker {
            id: 0,
            addr,
            requests,
            max_events: DEFAULT_MAX_EVENTS,
        }
    }

    #[test]
    fn test_single_worker_round_trips() {
        let (addr, handle, join) = spawn_server();

        let mut stats = WorkerStats::new().unwrap();
        worker(addr, 10).run(&mut stats).unwrap();

        assert_eq!(stats.total_messages, 10);
        assert!(stats.total_rtt > Duration::ZERO);
        assert_eq!(stats.latencies.len(), 10);
        assert!(stats.latencies.min() > 0);
        // A loopback round trip takes well over a microsecond.
        assert!(stats.latencies.max() >= 1_000);
        assert!(stats.request_rate > 0.0);
        assert_eq!(stats.mismatched_responses, 0);

        handle.shutdown().unwrap();
        join.join().unwrap().unwrap();
    }

    #[test]
    fn test_zero_requests() {
        let (addr, handle, join) = spawn_server();

        let mut stats = WorkerStats::new().unwrap();
        worker(addr, 0).run(&mut stats).unwrap();
        assert_eq!(stats.total_messages, 0);
        assert_eq!(stats.request_rate, 0.0);

        handle.shutdown().unwrap();
        join.join().unwrap().unwrap();
    }

    #[test]
    fn test_connect_failure_reports_zero() {
        let addr = closed_addr();

        let mut stats = WorkerStats::new().unwrap();
        match worker(addr, 10).run(&mut stats) {
            Err(WorkerError::Connect { addr: failed, .. }) => assert_eq!(failed, addr),
            other => panic!("unexpected: {:?}", other),
        }
        assert_eq!(stats.total_messages, 0);
        assert_eq!(stats.total_rtt, Duration::ZERO);
        assert_eq!(stats.request_rate, 0.0);
        assert!(stats.request_rate.is_finite());
    }

    #[test]
    fn test_peer_close_keeps_partial_stats() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();

        // Echo three messages, then hang up.
        let peer = std::thread::spawn(move || {
            use std::io::{Read, Write};
            let (mut stream, _) = listener.accept().unwrap();
            let mut buf = [0u8; MESSAGE_SIZE];
            for _ in 0..3 {
                stream.read_exact(&mut buf).unwrap();
                stream.write_all(&buf).unwrap();
            }
        });

        let mut stats = WorkerStats::new().unwrap();
        let result = worker(addr, 100).run(&mut stats);
        peer.join().unwrap();

        assert!(matches!(
            result,
            Err(WorkerError::Receive { completed: 3, .. }) | Err(WorkerError::Send { completed: 3, .. })
        ));
        assert_eq!(stats.total_messages, 3);
        assert!(stats.request_rate > 0.0);
    }
}
