//! echo-bench: TCP request/response latency and throughput harness
//!
//! Two roles:
//! - `server`: single-threaded echo server driven by readiness polling
//! - `client`: N worker threads, one connection each, timing round trips
//!   of a fixed 16-byte message and reporting average RTT and request rate
//!
//! Configuration via CLI arguments or TOML file.

mod config;
mod runtime;

use config::{ClientConfig, Config, Mode, ServerConfig};
use runtime::{ClientError, ClientSummary, ServerError};
use std::process::ExitCode;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

fn main() -> ExitCode {
    // Load configuration
    let config = match Config::load() {
        Ok(Some(config)) => config,
        Ok(None) => return ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("{e}");
            return ExitCode::FAILURE;
        }
    };

    // Initialize logging
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let result = match config.mode {
        Mode::Server(ref server) => run_server(server).map_err(|e| e.to_string()),
        Mode::Client(ref client) => run_client(client)
            .map(|summary| println!("{summary}"))
            .map_err(|e| e.to_string()),
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!(error = %e, "Fatal error");
            ExitCode::FAILURE
        }
    }
}

/// Run the echo server (single-threaded mio event loop)
fn run_server(config: &ServerConfig) -> Result<(), ServerError> {
    info!(addr = %config.addr, "Starting echo-bench server");
    runtime::run_server(config)
}

/// Run the load generator (one thread per connection)
fn run_client(config: &ClientConfig) -> Result<ClientSummary, ClientError> {
    runtime::run_benchmark(config)
}
