//! Error types for the signaling relay

/// Result type alias using the relay Error
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in signaling relay operations
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Invalid configuration parameter
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// Inbound message could not be parsed
    #[error("Malformed message: {0}")]
    MalformedMessage(String),

    /// Outbound queue of a connection is closed or full
    #[error("Send failed to {connection}: {reason}")]
    SendFailed {
        /// Destination connection id
        connection: String,
        /// Why the enqueue failed
        reason: String,
    },

    /// WebSocket error
    #[error("WebSocket error: {0}")]
    WebSocketError(String),

    /// Serialization/deserialization error
    #[error("Serialization error: {0}")]
    SerializationError(String),

    /// I/O error
    #[error("I/O error: {0}")]
    IoError(#[from] std::io::Error),
}

impl Error {
    /// Whether this error is reported back to the client that caused it.
    ///
    /// Everything else stays server-side and is only logged.
    pub fn is_client_visible(&self) -> bool {
        matches!(self, Error::MalformedMessage(_))
    }

    /// Check if this error is a configuration error
    pub fn is_config_error(&self) -> bool {
        matches!(self, Error::InvalidConfig(_))
    }

    /// Check if this error is a transport-level error
    pub fn is_transport_error(&self) -> bool {
        matches!(
            self,
            Error::SendFailed { .. } | Error::WebSocketError(_) | Error::IoError(_)
        )
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::SerializationError(err.to_string())
    }
}

impl From<tokio_tungstenite::tungstenite::Error> for Error {
    fn from(err: tokio_tungstenite::tungstenite::Error) -> Self {
        Error::WebSocketError(err.to_string())
    }
}
