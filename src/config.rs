use serde::Deserialize;
use std::convert::TryFrom;
use std::net::ToSocketAddrs;
use std::time::Duration;

use crate::error::SocketError;
use crate::socket::Address;

/// Configuration for the HTTP server.
///
/// Can be initialized from environment variables with the "TERN_" prefix,
/// from a `config` file, or built in code starting from [`ServerConfig::default`].
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    /// Server host address. Defaults to "127.0.0.1".
    #[serde(default = "default_host")]
    pub host: String,
    /// Server port number. Defaults to 8080.
    #[serde(default = "default_port")]
    pub port: u16,
    /// Listen on this Unix-domain socket path instead of `host:port`.
    #[serde(default)]
    pub unix_socket_path: Option<String>,
    /// Time allowed for one handler invocation before a 500 is sent. Defaults to 15s.
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
    /// Worker threads for [`HttpServer::run_blocking`](crate::HttpServer::run_blocking).
    /// Defaults to the CPU count.
    #[serde(default = "default_worker_threads")]
    pub worker_threads: usize,
    /// Upper bound on one wait of the socket pool's poll loop.
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    /// Maximum bytes requested from the socket per read.
    #[serde(default = "default_read_chunk_size")]
    pub read_chunk_size: usize,
    /// Longest accepted request or header line.
    #[serde(default = "default_max_header_bytes")]
    pub max_header_bytes: usize,
    #[serde(default = "default_log_category")]
    pub log_category: String,
}

impl TryFrom<config::Config> for ServerConfig {
    type Error = config::ConfigError;

    fn try_from(config: config::Config) -> Result<Self, Self::Error> {
        config.try_deserialize()
    }
}

impl ServerConfig {
    /// Creates a new ServerConfig instance from environment variables and config file.
    ///
    /// This method will:
    /// 1. Load environment variables from a .env file if present
    /// 2. Load configuration from a "config" file (if it exists)
    /// 3. Override with environment variables prefixed with "TERN_"
    ///
    /// # Errors
    /// Returns a ConfigError if configuration loading or parsing fails.
    pub fn new() -> Result<Self, config::ConfigError> {
        dotenv::dotenv().ok();

        let builder = config::Config::builder()
            .add_source(config::File::with_name("config").required(false))
            .add_source(config::Environment::with_prefix("TERN"));

        builder.build()?.try_into()
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    /// Resolves the address the server listens on.
    ///
    /// A configured Unix socket path takes precedence over `host:port`.
    pub fn listen_address(&self) -> Result<Address, SocketError> {
        if let Some(path) = &self.unix_socket_path {
            return Ok(Address::unix(path.clone()));
        }

        (self.host.as_str(), self.port)
            .to_socket_addrs()?
            .next()
            .map(Address::from)
            .ok_or(SocketError::Unsupported("host did not resolve to an address"))
    }
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    8080
}

fn default_timeout_ms() -> u64 {
    15_000
}

fn default_worker_threads() -> usize {
    num_cpus::get()
}

fn default_poll_interval_ms() -> u64 {
    100
}

fn default_read_chunk_size() -> usize {
    8192
}

fn default_max_header_bytes() -> usize {
    65_536
}

fn default_log_category() -> String {
    "tern".to_string()
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            unix_socket_path: None,
            timeout_ms: default_timeout_ms(),
            worker_threads: default_worker_threads(),
            poll_interval_ms: default_poll_interval_ms(),
            read_chunk_size: default_read_chunk_size(),
            max_header_bytes: default_max_header_bytes(),
            log_category: default_log_category(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::env;

    /// Tests that the default configuration values are set correctly.
    #[test]
    fn test_default_config() {
        let config = ServerConfig::default();
        assert_eq!(config.worker_threads, num_cpus::get());
        assert_eq!(config.port, 8080);
        assert_eq!(config.host, "127.0.0.1");
        assert_eq!(config.timeout(), Duration::from_secs(15));
        assert!(config.unix_socket_path.is_none());
    }

    /// Tests configuration loading from environment variables.
    /// Verifies that the ServerConfig correctly reads and applies
    /// values from environment variables with the "TERN_" prefix.
    #[test]
    fn test_config_from_env() {
        env::set_var("TERN_PORT", "9000");
        env::set_var("TERN_HOST", "127.0.0.1");
        env::set_var("TERN_TIMEOUT_MS", "250");

        let config = ServerConfig::new().unwrap();
        assert_eq!(config.port, 9000);
        assert_eq!(config.host, "127.0.0.1");
        assert_eq!(config.timeout(), Duration::from_millis(250));

        env::remove_var("TERN_PORT");
        env::remove_var("TERN_HOST");
        env::remove_var("TERN_TIMEOUT_MS");
    }

    #[test]
    fn test_listen_address() {
        let mut config = ServerConfig::default();
        assert_eq!(
            config.listen_address().unwrap(),
            Address::Ip4 { address: "127.0.0.1".to_string(), port: 8080 }
        );

        config.unix_socket_path = Some("/tmp/tern.sock".to_string());
        assert_eq!(config.listen_address().unwrap(), Address::unix("/tmp/tern.sock"));
    }
}
