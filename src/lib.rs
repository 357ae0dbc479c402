// bzrelay - streaming compression relay
// Compresses inbound TCP sessions in memory and forwards them to storage nodes

#![warn(rust_2018_idioms)]

pub mod compression;
pub mod events;
pub mod metrics;
pub mod network;
pub mod settings;

// Re-exports for convenience
pub use compression::{CompressionLevel, CompressionSession};
pub use events::{RelayEvent, WorkerOutcome};
pub use network::{ConnectionAcceptor, ShutdownReport};
pub use settings::RelayConfig;

/// Relay error types
pub mod error {
    use thiserror::Error;

    #[derive(Error, Debug)]
    pub enum Error {
        /// Inbound accept or outbound connect/send failure
        #[error("Connection error: {0}")]
        Connection(String),

        /// Finalize called twice, feed after finalize, send on a closed link
        #[error("Protocol misuse: {0}")]
        ProtocolMisuse(String),

        /// A caller-requested bounded wait elapsed
        #[error("Timed out: {0}")]
        Timeout(String),

        #[error("Compression error: {0}")]
        Compression(String),

        #[error("Configuration error: {0}")]
        Config(String),

        #[error("I/O error: {0}")]
        Io(#[from] std::io::Error),
    }

    impl Error {
        /// Short machine-friendly name, used as a metric label and in events
        pub fn kind(&self) -> &'static str {
            match self {
                Error::Connection(_) => "connection",
                Error::ProtocolMisuse(_) => "protocol_misuse",
                Error::Timeout(_) => "timeout",
                Error::Compression(_) => "compression",
                Error::Config(_) => "config",
                Error::Io(_) => "io",
            }
        }
    }

    impl From<::config::ConfigError> for Error {
        fn from(err: ::config::ConfigError) -> Self {
            Error::Config(err.to_string())
        }
    }

    pub type Result<T> = std::result::Result<T, Error>;
}

/// Version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version_format() {
        assert!(!VERSION.is_empty());
    }

    #[test]
    fn test_error_kind_labels() {
        let err = error::Error::ProtocolMisuse("finalize called twice".into());
        assert_eq!(err.kind(), "protocol_misuse");
        assert!(err.to_string().contains("finalize called twice"));

        let io = std::io::Error::new(std::io::ErrorKind::BrokenPipe, "gone");
        assert_eq!(error::Error::from(io).kind(), "io");
    }
}
