//! Relay configuration
//!
//! Values are layered, later sources winning:
//!
//! 1. Built-in defaults ([`RelayConfig::default`])
//! 2. Optional TOML file (`--config bzrelay.toml`)
//! 3. `BZRELAY_*` environment variables (e.g. `BZRELAY_REMOTE_HOST`)
//! 4. Command line flags, applied by the binary on top of [`RelayConfig::load`]
//!
//! ```toml
//! bind_addr = "0.0.0.0"
//! listen_port = 31337
//! remote_host = "storage-1.internal"
//! remote_port = 4000
//! compression_level = 9
//! max_workers = 256
//! ```

use crate::compression::CompressionLevel;
use crate::error::{Error, Result};
use ::config::{Config, Environment, File, FileFormat};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Environment variable prefix
pub const ENV_PREFIX: &str = "BZRELAY";

/// Default port of the inbound listener
pub const DEFAULT_LISTEN_PORT: u16 = 31337;

/// Relay configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RelayConfig {
    /// Local bind address
    pub bind_addr: String,

    /// Local listen port
    pub listen_port: u16,

    /// Storage endpoint host (required)
    pub remote_host: String,

    /// Storage endpoint port (required)
    pub remote_port: u16,

    /// bzip2 level applied to every session
    pub compression_level: CompressionLevel,

    /// OS pending-connection queue depth; does not bound running workers
    pub backlog: u32,

    /// Accept poll and registry sweep cadence (milliseconds)
    pub poll_interval_ms: u64,

    /// Maximum bytes per inbound read
    pub read_chunk_size: usize,

    /// Concurrent worker limit. `None` accepts without bound.
    pub max_workers: Option<usize>,

    /// Abort a worker whose inbound peer stays silent this long (seconds)
    pub idle_timeout_secs: Option<u64>,

    /// Bound on waiting for the storage socket to become writable (seconds)
    pub send_timeout_secs: Option<u64>,

    /// Bound on connecting to the storage endpoint (seconds)
    pub connect_timeout_secs: Option<u64>,

    /// Extra forward attempts after a failed one. 0 keeps fail-fast behaviour.
    pub forward_retries: u32,

    /// How long shutdown waits for in-flight workers (seconds)
    pub shutdown_timeout_secs: u64,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            bind_addr: "0.0.0.0".to_string(),
            listen_port: DEFAULT_LISTEN_PORT,
            remote_host: String::new(),
            remote_port: 0,
            compression_level: CompressionLevel::default(),
            backlog: 10,
            poll_interval_ms: 1000,
            read_chunk_size: 1024,
            max_workers: None,
            idle_timeout_secs: None,
            send_timeout_secs: None,
            connect_timeout_secs: None,
            forward_retries: 0,
            shutdown_timeout_secs: 30,
        }
    }
}

impl RelayConfig {
    /// Config for a given storage endpoint, everything else default
    pub fn new(remote_host: impl Into<String>, remote_port: u16) -> Self {
        Self {
            remote_host: remote_host.into(),
            remote_port,
            ..Default::default()
        }
    }

    /// Load defaults, an optional TOML file and `BZRELAY_*` environment variables.
    ///
    /// The result is not validated yet: the storage endpoint may still be
    /// supplied on the command line. Call [`validate`](Self::validate) once
    /// all overrides are applied.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        Self::load_with_prefix(path, ENV_PREFIX)
    }

    pub(crate) fn load_with_prefix(path: Option<&Path>, prefix: &str) -> Result<Self> {
        let mut builder = Config::builder().add_source(Config::try_from(&Self::default())?);

        if let Some(path) = path {
            let name = path
                .to_str()
                .ok_or_else(|| Error::Config(format!("non UTF-8 config path: {}", path.display())))?;
            builder = builder.add_source(File::new(name, FileFormat::Toml).required(true));
        }

        let config = builder
            .add_source(Environment::with_prefix(prefix).try_parsing(true))
            .build()?;

        Ok(config.try_deserialize()?)
    }

    /// Check required fields and value ranges
    pub fn validate(&self) -> Result<()> {
        if self.remote_host.trim().is_empty() {
            return Err(Error::Config("remote storage host is required".to_string()));
        }
        if self.remote_port == 0 {
            return Err(Error::Config("remote storage port is required".to_string()));
        }
        if self.read_chunk_size == 0 {
            return Err(Error::Config("read_chunk_size must be positive".to_string()));
        }
        if self.poll_interval_ms == 0 {
            return Err(Error::Config("poll_interval_ms must be positive".to_string()));
        }
        if self.backlog == 0 {
            return Err(Error::Config("backlog must be positive".to_string()));
        }
        if self.max_workers == Some(0) {
            return Err(Error::Config("max_workers must be positive when set".to_string()));
        }
        Ok(())
    }

    /// Listen address in `host:port` form
    pub fn listen_addr(&self) -> String {
        join_host_port(&self.bind_addr, self.listen_port)
    }

    /// Storage endpoint in `host:port` form
    pub fn remote_addr(&self) -> String {
        join_host_port(&self.remote_host, self.remote_port)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn idle_timeout(&self) -> Option<Duration> {
        self.idle_timeout_secs.map(Duration::from_secs)
    }

    pub fn send_timeout(&self) -> Option<Duration> {
        self.send_timeout_secs.map(Duration::from_secs)
    }

    pub fn connect_timeout(&self) -> Option<Duration> {
        self.connect_timeout_secs.map(Duration::from_secs)
    }

    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_secs(self.shutdown_timeout_secs)
    }
}

fn join_host_port(host: &str, port: u16) -> String {
    if host.contains(':') && !host.starts_with('[') {
        format!("[{}]:{}", host, port)
    } else {
        format!("{}:{}", host, port)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults() {
        let config = RelayConfig::default();
        assert_eq!(config.bind_addr, "0.0.0.0");
        assert_eq!(config.listen_port, 31337);
        assert_eq!(config.compression_level.get(), 9);
        assert_eq!(config.max_workers, None);
        assert_eq!(config.forward_retries, 0);
        assert_eq!(config.poll_interval(), Duration::from_secs(1));
        assert_eq!(config.listen_addr(), "0.0.0.0:31337");
    }

    #[test]
    fn test_validate_requires_remote() {
        let err = RelayConfig::default().validate().unwrap_err();
        assert!(err.to_string().contains("remote storage host"));

        let mut config = RelayConfig::new("storage", 0);
        assert!(config.validate().is_err());

        config.remote_port = 4000;
        assert!(config.validate().is_ok());

        config.max_workers = Some(0);
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_ipv6_addresses_are_bracketed() {
        let mut config = RelayConfig::new("::1", 4000);
        config.bind_addr = "::".to_string();
        assert_eq!(config.remote_addr(), "[::1]:4000");
        assert_eq!(config.listen_addr(), "[::]:31337");
    }

    #[test]
    fn test_load_layers_file_and_env() {
        let path = std::env::temp_dir().join(format!("bzrelay_config_{}.toml", std::process::id()));
        let mut file = std::fs::File::create(&path).unwrap();
        writeln!(file, "remote_host = \"storage-1\"").unwrap();
        writeln!(file, "remote_port = 4000").unwrap();
        writeln!(file, "compression_level = 3").unwrap();
        writeln!(file, "max_workers = 8").unwrap();
        drop(file);

        std::env::set_var("BZRELAYTEST_REMOTE_PORT", "5000");
        let config = RelayConfig::load_with_prefix(Some(&path), "BZRELAYTEST").unwrap();
        std::env::remove_var("BZRELAYTEST_REMOTE_PORT");
        std::fs::remove_file(&path).ok();

        assert_eq!(config.remote_host, "storage-1");
        assert_eq!(config.remote_port, 5000);
        assert_eq!(config.compression_level.get(), 3);
        assert_eq!(config.max_workers, Some(8));
        assert_eq!(config.listen_port, DEFAULT_LISTEN_PORT);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_load_rejects_bad_level() {
        let path = std::env::temp_dir().join(format!("bzrelay_badlevel_{}.toml", std::process::id()));
        std::fs::write(&path, "compression_level = 12\n").unwrap();

        let result = RelayConfig::load_with_prefix(Some(&path), "BZRELAYBADLEVEL");
        std::fs::remove_file(&path).ok();

        assert!(matches!(result, Err(Error::Config(_))));
    }
}
