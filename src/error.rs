//! Error types for Flora

use thiserror::Error;

/// Main error type for Flora
#[derive(Error, Debug)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Handshake error: {0}")]
    Handshake(#[from] HandshakeError),

    /// The action names neither an upstream nor a group with an eligible member
    #[error("No route for action: {0}")]
    NoRoute(String),

    #[error("Rejected by upstream [{0}]")]
    Rejected(String),

    #[error("Dial via [{upstream}] failed: {reason}")]
    Dial { upstream: String, reason: String },

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Invalid address: {0}")]
    InvalidAddress(String),
}

/// Front-end handshake failures. Every variant is terminal for the connection.
#[derive(Error, Debug)]
pub enum HandshakeError {
    #[error("unsupported protocol version: {0}")]
    UnsupportedVersion(u8),

    #[error("no supported authentication method offered")]
    UnsupportedAuth,

    #[error("unsupported command: {0}")]
    UnsupportedCommand(u8),

    #[error("request carries extra data")]
    ExtraData,

    #[error("malformed request: {0}")]
    MalformedRequest(String),

    #[error("client request rejected: {0}")]
    ClientReject(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type alias for Flora
pub type Result<T> = std::result::Result<T, Error>;
