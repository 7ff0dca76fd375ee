//! File-transfer state, both directions.
//!
//! The sender chunks the (optionally compressed) payload, announces it
//! with a file-meta message, and walks `awaitingAcceptance → sending →
//! awaitingCompletion → completed`. The receiver tracks the received chunk
//! set; the transfer is complete exactly when every index in
//! `0..expected_chunks` is present and the SHA-256 over the reassembled
//! bytes matches the announcement.

use crate::error::CoreError;
use paclink_proto::address::Address;
use paclink_proto::axdp::{AxdpMessage, Compression, FileMeta};
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

/// Coordinator-assigned transfer identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TransferId(pub u64);

impl fmt::Display for TransferId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Lifecycle of a transfer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferStatus {
    AwaitingAcceptance,
    Sending,
    Paused,
    AwaitingCompletion,
    Completed,
    Failed,
    Cancelled,
}

/// An outbound transfer.
#[derive(Debug, Clone)]
pub struct BulkTransfer {
    pub id: TransferId,
    pub file_name: String,
    /// Size of the original (uncompressed) file.
    pub file_size: u64,
    pub destination: Address,
    pub status: TransferStatus,
    pub compression: Compression,
    pub axdp_session_id: u16,
    pub chunk_size: u16,
    pub sha256: [u8; 32],
    chunks: Vec<Vec<u8>>,
    pub bytes_sent: u64,
    pub completed_at_ms: Option<i64>,
}

impl BulkTransfer {
    /// Prepares a transfer: compresses if asked, hashes the wire payload,
    /// and splits it into chunks.
    pub fn prepare(
        id: TransferId,
        axdp_session_id: u16,
        destination: Address,
        file_name: &str,
        data: &[u8],
        compression: Compression,
        chunk_size: u16,
    ) -> Result<Self, CoreError> {
        let chunk_size = chunk_size.max(16);
        let wire: Vec<u8> = match compression {
            Compression::None => data.to_vec(),
            Compression::Lz4 => lz4_flex::compress_prepend_size(data),
        };
        let sha256: [u8; 32] = Sha256::digest(&wire).into();
        let chunks: Vec<Vec<u8>> = wire
            .chunks(chunk_size as usize)
            .map(|c| c.to_vec())
            .collect();
        if chunks.len() > u32::MAX as usize {
            return Err(CoreError::SendFailed("file needs too many chunks".into()));
        }
        Ok(Self {
            id,
            file_name: file_name.to_string(),
            file_size: data.len() as u64,
            destination,
            status: TransferStatus::AwaitingAcceptance,
            compression,
            axdp_session_id,
            chunk_size,
            sha256,
            chunks,
            bytes_sent: 0,
            completed_at_ms: None,
        })
    }

    pub fn total_chunks(&self) -> u32 {
        self.chunks.len() as u32
    }

    pub fn wire_size(&self) -> u64 {
        self.chunks.iter().map(|c| c.len() as u64).sum()
    }

    pub fn file_meta(&self) -> FileMeta {
        FileMeta {
            filename: self.file_name.clone(),
            file_size: self.file_size,
            sha256: self.sha256,
            chunk_size: self.chunk_size,
            compression: self.compression,
        }
    }

    /// The announcement message opening the transfer.
    pub fn meta_message(&self) -> AxdpMessage {
        AxdpMessage::file_meta(self.axdp_session_id, 0, self.file_meta(), self.total_chunks())
    }

    /// The wire message for one chunk (carries a payload CRC).
    pub fn chunk_message(&self, index: u32) -> Option<AxdpMessage> {
        let data = self.chunks.get(index as usize)?.clone();
        Some(AxdpMessage::file_chunk(
            self.axdp_session_id,
            index,
            self.total_chunks(),
            data,
        ))
    }

    pub fn note_chunk_sent(&mut self, index: u32) {
        if let Some(chunk) = self.chunks.get(index as usize) {
            self.bytes_sent += chunk.len() as u64;
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self.status,
            TransferStatus::Completed | TransferStatus::Failed | TransferStatus::Cancelled
        )
    }
}

/// An inbound transfer in progress.
#[derive(Debug, Clone)]
pub struct InboundTransfer {
    pub id: TransferId,
    pub axdp_session_id: u16,
    pub source: Address,
    pub file_name: String,
    pub file_size: u64,
    pub expected_chunks: u32,
    pub chunk_size: u16,
    pub sha256: [u8; 32],
    pub compression: Compression,
    pub status: TransferStatus,
    received: BTreeSet<u32>,
    buffer: BTreeMap<u32, Vec<u8>>,
    pub started_ms: i64,
    pub ended_ms: Option<i64>,
}

impl InboundTransfer {
    pub fn from_meta(
        id: TransferId,
        axdp_session_id: u16,
        source: Address,
        meta: &FileMeta,
        expected_chunks: u32,
        now_ms: i64,
    ) -> Self {
        Self {
            id,
            axdp_session_id,
            source,
            file_name: meta.filename.clone(),
            file_size: meta.file_size,
            expected_chunks,
            chunk_size: meta.chunk_size,
            sha256: meta.sha256,
            compression: meta.compression,
            status: TransferStatus::AwaitingAcceptance,
            received: BTreeSet::new(),
            buffer: BTreeMap::new(),
            started_ms: now_ms,
            ended_ms: None,
        }
    }

    /// Stores one chunk. Duplicate or out-of-range indices are ignored;
    /// returns whether the chunk was new.
    pub fn insert_chunk(&mut self, index: u32, data: Vec<u8>) -> bool {
        if index >= self.expected_chunks || self.received.contains(&index) {
            return false;
        }
        self.received.insert(index);
        self.buffer.insert(index, data);
        true
    }

    /// Complete iff every index in `0..expected_chunks` has arrived.
    pub fn is_complete(&self) -> bool {
        self.received.len() as u32 == self.expected_chunks
    }

    pub fn received_count(&self) -> u32 {
        self.received.len() as u32
    }

    pub fn bytes_received(&self) -> u64 {
        self.buffer.values().map(|c| c.len() as u64).sum()
    }

    /// Chunk indices still outstanding, ascending.
    pub fn missing_chunks(&self) -> Vec<u32> {
        (0..self.expected_chunks)
            .filter(|i| !self.received.contains(i))
            .collect()
    }

    /// Reassembles, verifies the hash, and undoes compression. `None`
    /// until complete; an error if the payload does not match the
    /// announced digest.
    pub fn finish(&self) -> Option<Result<Vec<u8>, CoreError>> {
        if !self.is_complete() {
            return None;
        }
        let mut wire = Vec::new();
        for chunk in self.buffer.values() {
            wire.extend_from_slice(chunk);
        }
        let digest: [u8; 32] = Sha256::digest(&wire).into();
        if digest != self.sha256 {
            return Some(Err(CoreError::FileHashMismatch));
        }
        Some(match self.compression {
            Compression::None => Ok(wire),
            Compression::Lz4 => lz4_flex::decompress_size_prepended(&wire)
                .map_err(|e| CoreError::SendFailed(format!("lz4: {e}"))),
        })
    }
}
