//! NET/ROM NODES broadcast parsing.
//!
//! NODES broadcasts are UI frames with PID 0xCF addressed to `NODES`. The
//! info field starts with the 0xFF signature; two layouts are accepted:
//! the short form (signature + N × 21-byte entries) and the long form
//! (signature + 6-byte origin alias + N × 21-byte entries).

use crate::address::Address;
use crate::error::ProtoError;
use crate::frame::{Ax25Frame, FrameType, PID_NETROM};
use tracing::debug;

/// Signature byte opening a NODES info field.
pub const NODES_SIGNATURE: u8 = 0xFF;
/// Size of one routing entry on the wire.
pub const ENTRY_LEN: usize = 21;

/// One advertised route in a NODES broadcast.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodesEntry {
    pub destination: Address,
    pub alias: String,
    pub best_neighbor: Address,
    pub quality: u8,
}

/// A decoded NODES broadcast.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodesBroadcast {
    pub origin: Address,
    pub origin_alias: Option<String>,
    pub entries: Vec<NodesEntry>,
}

/// True when a frame looks like a NODES broadcast worth decoding.
pub fn is_nodes_broadcast(frame: &Ax25Frame) -> bool {
    frame.frame_type() == FrameType::Ui
        && frame.pid == Some(PID_NETROM)
        && frame.dest.callsign() == "NODES"
        && frame.info.first() == Some(&NODES_SIGNATURE)
}

/// Decodes the info field of a NODES broadcast from `origin`.
///
/// Entries with non-decodable fields are skipped; a broadcast with no valid
/// entries is rejected.
pub fn decode_nodes(origin: &Address, info: &[u8]) -> Result<NodesBroadcast, ProtoError> {
    if info.first() != Some(&NODES_SIGNATURE) {
        return Err(ProtoError::MalformedBroadcast("missing 0xFF signature"));
    }
    let body = &info[1..];
    let (origin_alias, entries_bytes) = match body.len() % ENTRY_LEN {
        0 => (None, body),
        6 => {
            let alias = decode_alias(&body[..6]);
            (alias, &body[6..])
        }
        _ => return Err(ProtoError::MalformedBroadcast("body is not entry-aligned")),
    };

    let mut entries = Vec::with_capacity(entries_bytes.len() / ENTRY_LEN);
    for raw in entries_bytes.chunks_exact(ENTRY_LEN) {
        match decode_entry(raw) {
            Ok(entry) => entries.push(entry),
            Err(err) => {
                debug!(%origin, %err, "skipping undecodable NODES entry");
            }
        }
    }

    if entries.is_empty() {
        return Err(ProtoError::MalformedBroadcast("no valid entries"));
    }

    Ok(NodesBroadcast {
        origin: origin.clone(),
        origin_alias,
        entries,
    })
}

fn decode_entry(raw: &[u8]) -> Result<NodesEntry, ProtoError> {
    let (destination, _) = Address::decode(&raw[0..7])?;
    if destination.callsign().is_empty() {
        return Err(ProtoError::MalformedBroadcast("empty destination callsign"));
    }
    let alias = decode_alias(&raw[7..13]).unwrap_or_default();
    let (best_neighbor, _) = Address::decode(&raw[13..20])?;
    if best_neighbor.callsign().is_empty() {
        return Err(ProtoError::MalformedBroadcast("empty neighbor callsign"));
    }
    Ok(NodesEntry {
        destination,
        alias,
        best_neighbor,
        quality: raw[20],
    })
}

/// Aliases are plain (unshifted) ASCII, space padded.
fn decode_alias(raw: &[u8]) -> Option<String> {
    if !raw.iter().all(|&b| (0x20..=0x7E).contains(&b)) {
        return None;
    }
    let alias: String = raw.iter().map(|&b| b as char).collect();
    let alias = alias.trim_end().to_string();
    if alias.is_empty() {
        None
    } else {
        Some(alias)
    }
}
