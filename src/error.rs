use thiserror::Error;

/// Errors surfaced by the client, the codec, and the transport session.
#[derive(Error, Debug)]
pub enum LinkError {
    #[error("DNS resolution failed: {0}")]
    DnsError(String),

    #[error("Connection failed: {0}")]
    ConnectionError(String),

    #[error("Handshake failed: {0}")]
    Handshake(String),

    #[error("Connection lost")]
    ConnectionLost,

    #[error("Request timed out")]
    RequestTimeout,

    #[error("Malformed frame: {0}")]
    MalformedFrame(String),

    #[error("Byte stream corrupted: {0}")]
    StreamCorrupted(String),

    #[error("Remote error [{code}]: {message}")]
    Remote { code: String, message: String },

    #[error("Unexpected response shape: {0}")]
    UnexpectedResponse(String),

    #[error("I/O error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("JSON parsing error: {0}")]
    JsonError(#[from] serde_json::Error),

    #[error("Invalid port: {0}")]
    InvalidPort(String),

    #[error("Invalid address format: {0}")]
    InvalidAddress(String),
}

impl LinkError {
    /// True when the error is scoped to a single request rather than the
    /// connection as a whole.
    pub fn is_request_scoped(&self) -> bool {
        matches!(
            self,
            LinkError::RequestTimeout
                | LinkError::Remote { .. }
                | LinkError::UnexpectedResponse(_)
        )
    }
}
