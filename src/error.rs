//! Error types for cosmicd

use std::time::Duration;

/// Result type alias
pub type Result<T> = std::result::Result<T, Error>;

/// cosmicd error types
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Port already bound by another process
    #[error("Port {port} already in use: {source}")]
    Bind {
        /// Port that failed to bind
        port: u16,
        /// Underlying bind failure
        #[source]
        source: std::io::Error,
    },

    /// Node failed to identify itself in time
    #[error("Handshake timed out after {0:?}")]
    HandshakeTimeout(Duration),

    /// First line on a main connection did not match the powerup grammar
    #[error("Bad handshake: {0}")]
    HandshakeParse(String),

    /// Command line could not be parsed
    #[error("Parse error: {0}")]
    Parse(String),

    /// Peer went away
    #[error("Connection to {0} lost")]
    ConnectionLost(String),

    /// A blocking wait was released because the queue shut down.
    /// Normal termination signal for the waiting thread, not a fault.
    #[error("Queue closed")]
    QueueClosed,

    /// Node registration refused under the configured policy
    #[error("Node {0} is already registered")]
    AlreadyRegistered(u32),

    /// Configuration file could not be parsed
    #[error("Config parse error: {0}")]
    ConfigParse(#[from] toml::de::Error),

    /// Configuration could not be serialized
    #[error("Config write error: {0}")]
    ConfigWrite(#[from] toml::ser::Error),

    /// Invalid configuration value
    #[error("Invalid configuration: {0}")]
    Config(String),

    /// Generic error with message
    #[error("{0}")]
    Other(String),
}
