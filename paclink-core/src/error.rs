use paclink_proto::error::ProtoError;
use paclink_session::SessionError;
use thiserror::Error;

/// Errors surfaced by the coordinator and transport.
#[derive(Debug, Error)]
pub enum CoreError {
    #[error("Not connected to {0}")]
    NotConnected(String),
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),
    #[error("Send failed: {0}")]
    SendFailed(String),
    #[error("Timed out")]
    Timeout,
    #[error("Unknown transfer")]
    UnknownTransfer,
    #[error("Transfer is not in a state that allows this operation")]
    InvalidTransferState,
    #[error("File hash mismatch")]
    FileHashMismatch,
    #[error("A packet subscriber is already attached")]
    DuplicateSubscription,
    #[error(transparent)]
    Session(#[from] SessionError),
    #[error(transparent)]
    Proto(#[from] ProtoError),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}
