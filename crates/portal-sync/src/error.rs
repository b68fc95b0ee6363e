//! Control client error types.

use thiserror::Error;

/// Control client error type.
#[derive(Debug, Error)]
pub enum ControlError {
    #[error("WebSocket error: {0}")]
    WebSocket(String),

    #[error("connection error: {0}")]
    Connection(String),

    #[error("invalid URL: {0}")]
    InvalidUrl(String),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("URL parse error: {0}")]
    UrlParse(#[from] url::ParseError),

    #[error("timeout error: {0}")]
    Timeout(String),

    #[error("authentication rejected: {0}")]
    AuthRejected(String),

    #[error("not connected")]
    NotConnected,

    #[error("invalid command: {0}")]
    InvalidCommand(String),

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("simulation error: {0}")]
    Simulation(String),

    #[error("controller stopped")]
    Stopped,

    #[error("internal error: {0}")]
    Internal(String),
}

impl ControlError {
    /// Authentication failures are permanent; everything else on the
    /// transport path is retried.
    pub fn is_auth_rejection(&self) -> bool {
        matches!(self, Self::AuthRejected(_))
    }
}

/// Control client result type.
pub type Result<T> = std::result::Result<T, ControlError>;
