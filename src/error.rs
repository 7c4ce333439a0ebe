//! Error types for the connector bridge

use thiserror::Error;

/// Result type alias for bridge operations
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in the connector bridge
#[derive(Debug, Error)]
pub enum Error {
    /// Configuration error
    #[error("configuration error: {0}")]
    Config(String),

    /// Inbound webhook body could not be parsed
    #[error("malformed payload: {0}")]
    MalformedPayload(String),

    /// No pending operation matches the correlation token
    #[error("unknown async token: {0}")]
    UnknownToken(String),

    /// A pending operation with this token is already live
    #[error("duplicate async token: {0}")]
    DuplicateToken(String),

    /// Endpoint is not present in the registry
    #[error("unknown endpoint: {0}")]
    UnknownEndpoint(String),

    /// A URI-only address matched more than one endpoint
    #[error("ambiguous address: {uri} is exposed by {count} endpoints")]
    AmbiguousAddress {
        /// Resource URI that was looked up
        uri: String,
        /// Number of endpoints exposing it
        count: usize,
    },

    /// Endpoint or resource not found
    #[error("not found: {0}")]
    NotFound(String),

    /// Webhook registration exhausted its attempt budget
    #[error("webhook registration failed after {attempts} attempts: {reason}")]
    RegistrationFailure {
        /// Attempts made before giving up
        attempts: u32,
        /// Last failure reason
        reason: String,
    },

    /// Async device operation was never resolved
    #[error("operation timed out: {0}")]
    OperationTimeout(String),

    /// Peer bus is disconnected
    #[error("peer bus unavailable: {0}")]
    PeerUnavailable(String),

    /// Device-management server rejected a request
    #[error("device server error: {status} - {message}")]
    DeviceServer {
        /// HTTP status returned by the server
        status: u16,
        /// Response body or reason
        message: String,
    },

    /// Peer command could not be understood
    #[error("invalid command: {0}")]
    InvalidCommand(String),

    /// IO error
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// HTTP error
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    /// Serialization error
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// TOML parsing error
    #[error("toml error: {0}")]
    Toml(#[from] toml::de::Error),
}
