//! Configuration module for echo-bench.
//!
//! Supports both command-line arguments and TOML configuration file.
//! CLI arguments take precedence over config file values, which take
//! precedence over built-in defaults.

use clap::{Parser, Subcommand};
use serde::Deserialize;
use std::net::{AddrParseError, IpAddr, SocketAddr};
use std::path::PathBuf;
use thiserror::Error;

/// Command-line arguments for echo-bench
#[derive(Parser, Debug)]
#[command(name = "echo-bench")]
#[command(author = "echo-bench authors")]
#[command(version = "0.1.0")]
#[command(about = "TCP echo server and RTT/throughput load generator", long_about = None)]
pub struct CliArgs {
    /// Path to TOML configuration file
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, global = true)]
    pub log_level: Option<String>,

    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Run the echo server
    Server {
        /// Address to bind to
        ip: Option<String>,
        /// Port to bind to
        port: Option<u16>,
    },
    /// Run the load-generating client
    Client {
        /// Server address
        ip: Option<String>,
        /// Server port
        port: Option<u16>,
        /// Number of worker threads, one connection each
        num_threads: Option<usize>,
        /// Requests sent by each worker
        num_requests: Option<u64>,
    },
}

/// TOML configuration file structure
#[derive(Debug, Deserialize, Default)]
pub struct TomlConfig {
    #[serde(default)]
    pub server: ServerSection,
    #[serde(default)]
    pub client: ClientSection,
    #[serde(default)]
    pub logging: LoggingSection,
}

/// Server-related configuration. The client also targets this address.
#[derive(Debug, Deserialize)]
pub struct ServerSection {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    /// Readiness events returned per wait call
    #[serde(default = "default_max_events")]
    pub max_events: usize,
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,
    /// Listen backlog
    #[serde(default = "default_backlog")]
    pub backlog: i32,
}

impl Default for ServerSection {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            max_events: default_max_events(),
            max_connections: default_max_connections(),
            backlog: default_backlog(),
        }
    }
}

/// Client-related configuration
#[derive(Debug, Deserialize)]
pub struct ClientSection {
    #[serde(default = "default_threads")]
    pub threads: usize,
    #[serde(default = "default_requests")]
    pub requests: u64,
    #[serde(default = "default_max_events")]
    pub max_events: usize,
}

impl Default for ClientSection {
    fn default() -> Self {
        Self {
            threads: default_threads(),
            requests: default_requests(),
            max_events: default_max_events(),
        }
    }
}

/// Logging configuration
#[derive(Debug, Deserialize)]
pub struct LoggingSection {
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for LoggingSection {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    12345
}

fn default_max_events() -> usize {
    64
}

fn default_max_connections() -> usize {
    10_000
}

fn default_backlog() -> i32 {
    1024
}

fn default_threads() -> usize {
    4
}

fn default_requests() -> u64 {
    1_000_000
}

fn default_log_level() -> String {
    "info".to_string()
}

/// Resolved settings for the echo server loop.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub addr: SocketAddr,
    pub max_events: usize,
    pub max_connections: usize,
    pub backlog: i32,
}

/// Resolved settings for the load-generating client.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub addr: SocketAddr,
    pub threads: usize,
    pub requests: u64,
    pub max_events: usize,
}

#[derive(Debug, Clone)]
pub enum Mode {
    Server(ServerConfig),
    Client(ClientConfig),
}

/// Final resolved configuration
#[derive(Debug, Clone)]
pub struct Config {
    pub mode: Mode,
    pub log_level: String,
}

impl Config {
    /// Load configuration from the process arguments and optional TOML file.
    ///
    /// Returns `Ok(None)` when no runnable command was given; the usage
    /// message has already been printed in that case.
    pub fn load() -> Result<Option<Self>, ConfigError> {
        match CliArgs::try_parse() {
            Ok(cli) => Self::from_args(cli),
            Err(e) => {
                let _ = e.print();
                Ok(None)
            }
        }
    }

    /// Resolve parsed CLI arguments against the TOML file they name, if any.
    pub fn from_args(cli: CliArgs) -> Result<Option<Self>, ConfigError> {
        let Some(command) = cli.command else {
            let _ = <CliArgs as clap::CommandFactory>::command().print_help();
            return Ok(None);
        };

        let toml_config = match cli.config {
            Some(ref config_path) => {
                let contents = std::fs::read_to_string(config_path).map_err(|source| {
                    ConfigError::FileRead {
                        path: config_path.clone(),
                        source,
                    }
                })?;
                toml::from_str(&contents).map_err(|source| ConfigError::TomlParse {
                    path: config_path.clone(),
                    source,
                })?
            }
            None => TomlConfig::default(),
        };

        Self::resolve(command, cli.log_level, toml_config).map(Some)
    }

    /// Merge a subcommand with TOML values (CLI takes precedence).
    pub fn resolve(
        command: Command,
        log_level: Option<String>,
        toml_config: TomlConfig,
    ) -> Result<Self, ConfigError> {
        let TomlConfig {
            server,
            client,
            logging,
        } = toml_config;

        let mode = match command {
            Command::Server { ip, port } => Mode::Server(ServerConfig {
                addr: socket_addr(ip.unwrap_or(server.host), port.unwrap_or(server.port))?,
                max_events: server.max_events,
                max_connections: server.max_connections,
                backlog: server.backlog,
            }),
            Command::Client {
                ip,
                port,
                num_threads,
                num_requests,
            } => Mode::Client(ClientConfig {
                addr: socket_addr(ip.unwrap_or(server.host), port.unwrap_or(server.port))?,
                threads: num_threads.unwrap_or(client.threads),
                requests: num_requests.unwrap_or(client.requests),
                max_events: client.max_events,
            }),
        };

        Ok(Config {
            mode,
            log_level: log_level.unwrap_or(logging.level),
        })
    }
}

fn socket_addr(host: String, port: u16) -> Result<SocketAddr, ConfigError> {
    let ip: IpAddr = host
        .parse()
        .map_err(|e| ConfigError::InvalidAddress(host, e))?;
    Ok(SocketAddr::new(ip, port))
}

/// Configuration loading errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file '{}': {source}", .path.display())]
    FileRead {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("Failed to parse config file '{}': {source}", .path.display())]
    TomlParse {
        path: PathBuf,
        source: toml::de::Error,
    },
    #[error("Invalid IP address '{0}': {1}")]
    InvalidAddress(String, #[source] AddrParseError),
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> CliArgs {
        CliArgs::try_parse_from(args).unwrap()
    }

    #[test]
    fn test_default_config() {
        let config = TomlConfig::default();
        assert_eq!(config.server.host, "127.0.0.1");
        assert_eq!(config.server.port, 12345);
        assert_eq!(config.server.max_events, 64);
        assert_eq!(config.client.threads, 4);
        assert_eq!(config.client.requests, 1_000_000);
        assert_eq!(config.logging.level, "info");
    }

    #[test]
    fn test_toml_parsing() {
        let toml_str = r#"
            [server]
            host = "0.0.0.0"
            port = 7000
            max_connections = 128

            [client]
            threads = 8
            requests = 500

            [logging]
            level = "debug"
        "#;

        let config: TomlConfig = toml::from_str(toml_str).unwrap();
        assert_eq!(config.server.host, "0.0.0.0");
        assert_eq!(config.server.port, 7000);
        assert_eq!(config.server.max_connections, 128);
        assert_eq!(config.server.backlog, 1024);
        assert_eq!(config.client.threads, 8);
        assert_eq!(config.client.requests, 500);
        assert_eq!(config.client.max_events, 64);
        assert_eq!(config.logging.level, "debug");
    }

    #[test]
    fn test_server_defaults() {
        let cli = parse(&["echo-bench", "server"]);
        let config = Config::from_args(cli).unwrap().unwrap();
        match config.mode {
            Mode::Server(server) => {
                assert_eq!(server.addr, "127.0.0.1:12345".parse().unwrap());
                assert_eq!(server.max_events, 64);
            }
            other => panic!("unexpected: {:?}", other),
        }
        assert_eq!(config.log_level, "info");
    }

    #[test]
    fn test_client_positional_args() {
        let cli = parse(&["echo-bench", "client", "10.0.0.1", "9000", "2", "50"]);
        let config = Config::from_args(cli).unwrap().unwrap();
        match config.mode {
            Mode::Client(client) => {
                assert_eq!(client.addr, "10.0.0.1:9000".parse().unwrap());
                assert_eq!(client.threads, 2);
                assert_eq!(client.requests, 50);
            }
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[test]
    fn test_cli_overrides_toml() {
        let toml_config: TomlConfig = toml::from_str(
            r#"
            [server]
            port = 7000
            [client]
            threads = 16
            [logging]
            level = "warn"
        "#,
        )
        .unwrap();

        let command = Command::Client {
            ip: None,
            port: None,
            num_threads: Some(3),
            num_requests: None,
        };
        let config = Config::resolve(command, Some("trace".into()), toml_config).unwrap();
        match config.mode {
            Mode::Client(client) => {
                assert_eq!(client.addr.port(), 7000);
                assert_eq!(client.threads, 3);
                assert_eq!(client.requests, 1_000_000);
            }
            other => panic!("unexpected: {:?}", other),
        }
        assert_eq!(config.log_level, "trace");
    }

    #[test]
    fn test_invalid_address() {
        let command = Command::Server {
            ip: Some("not-an-ip".into()),
            port: None,
        };
        let err = Config::resolve(command, None, TomlConfig::default()).unwrap_err();
        assert!(matches!(err, ConfigError::InvalidAddress(ref host, _) if host == "not-an-ip"));
    }

    #[test]
    fn test_unknown_subcommand_is_parse_error() {
        assert!(CliArgs::try_parse_from(["echo-bench", "bogus"]).is_err());
    }
}
