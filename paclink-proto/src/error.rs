use thiserror::Error;

/// Errors produced by the wire codecs.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProtoError {
    #[error("Callsign too long: {0}")]
    CallsignTooLong(String),
    #[error("Callsign is not printable ASCII")]
    CallsignNotAscii,
    #[error("SSID out of range: {0}")]
    SsidOutOfRange(u8),
    #[error("Digipeater path longer than 8 hops")]
    PathTooLong,
    #[error("Invalid frame: {0}")]
    InvalidFrame(&'static str),
    #[error("Malformed NODES broadcast: {0}")]
    MalformedBroadcast(&'static str),
    #[error("Malformed AXDP message: {0}")]
    MalformedMessage(&'static str),
    #[error("Payload CRC mismatch")]
    CrcMismatch,
}
