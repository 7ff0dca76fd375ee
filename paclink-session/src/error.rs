use thiserror::Error;

/// Errors surfaced by the session layer.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SessionError {
    #[error("Session is not connected")]
    NotConnected,
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),
    #[error("Send failed: {0}")]
    SendFailed(String),
    #[error("Session timed out")]
    Timeout,
    #[error("Payload exceeds maximum message size")]
    PayloadTooLarge,
    #[error("Unknown frame id")]
    UnknownFrame,
}
