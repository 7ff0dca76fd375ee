use crate::capability::CapabilityStatus;
use crate::transfer::TransferId;
use paclink_proto::address::Address;
use paclink_session::{SessionKey, SessionState};

/// Everything the engine tells the embedding layer.
///
/// The source exposed these as individual callbacks; here they are one
/// queue the embedder drains after each ingest or timer poll.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CoreEvent {
    /// An AXDP chat message addressed to the local station.
    ChatReceived { from: Address, text: String },
    PeerAxdpEnabled { from: Address },
    PeerAxdpDisabled { from: Address },
    SessionStateChanged {
        key: SessionKey,
        old: SessionState,
        new: SessionState,
    },
    /// In-sequence session bytes, before AXDP extraction.
    DataReceived { key: SessionKey, bytes: Vec<u8> },
    /// A peer announced a file; accept or reject by id.
    IncomingTransferRequest {
        id: TransferId,
        from: Address,
        filename: String,
        size: u64,
    },
    TransferProgress {
        id: TransferId,
        bytes_done: u64,
        bytes_total: u64,
    },
    TransferCompleted { id: TransferId },
    TransferFailed { id: TransferId, reason: String },
    /// A received file passed its hash check.
    InboundFileReady {
        id: TransferId,
        filename: String,
        data: Vec<u8>,
    },
    /// A NODES broadcast was folded into the routing table.
    NodesBroadcastReceived { origin: Address },
    CapabilityChanged {
        peer: Address,
        status: CapabilityStatus,
    },
}
