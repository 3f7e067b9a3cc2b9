//! Readiness-based networking runtime.
//!
//! Both roles share the same building blocks:
//! - `Multiplexer`: mio `Poll` plus the set of registered tokens
//! - `endpoint`: non-blocking listener/stream construction and exact transfers
//! - `Connection`: accepted stream plus its unsent echo bytes
//!
//! The server drives all of its connections from one thread. The client
//! runs one worker thread per connection, each with a private multiplexer.

mod aggregator;
mod connection;
mod endpoint;
mod mux;
mod server;
mod stats;
mod worker;

pub use aggregator::{ClientError, ClientSummary};
pub use server::ServerError;

use aggregator::run_client;
use server::EchoServer;

use crate::config::{ClientConfig, ServerConfig};
use tracing::info;

/// Size of every request and response on the wire.
pub const MESSAGE_SIZE: usize = 16;

/// Request body sent by every worker.
pub const PAYLOAD: &[u8; MESSAGE_SIZE] = b"ABCDEFGHIJKMLNOP";

/// Run the echo server until it is shut down or fails.
pub fn run_server(config: &ServerConfig) -> Result<(), ServerError> {
    let server = EchoServer::bind(config)?;
    server.run()
}

/// Run the load generator and return its aggregated results.
pub fn run_benchmark(config: &ClientConfig) -> Result<ClientSummary, ClientError> {
    info!(
        addr = %config.addr,
        threads = config.threads,
        requests = config.requests,
        "Starting client"
    );
    let summary = run_client(config)?;
    info!(
        messages = summary.total_messages,
        workers = summary.workers,
        "Client finished"
    );
    Ok(summary)
}
