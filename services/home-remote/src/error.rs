//! Error types for the home remote client

/// Errors that can occur while talking to the remote-control backend
#[derive(Debug, thiserror::Error)]
pub enum RemoteError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("HTTP request failed: {0}")]
    Http(String),

    #[error("WebSocket error: {0}")]
    WebSocket(String),

    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    #[error("Timeout: {0}")]
    Timeout(String),

    #[error("Not connected to the live update socket")]
    NotConnected,

    #[error("Command failed with status {status}: {message}")]
    CommandFailed { status: u16, message: String },

    #[error("Invalid state for operation: {0}")]
    InvalidState(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Result type alias for home remote operations
pub type Result<T> = std::result::Result<T, RemoteError>;
