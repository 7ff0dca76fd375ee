//! AXDP: the application-level datagram protocol carried in UI and I frames.
//!
//! Every message starts with the 4-byte magic `AXT1`, a fixed header
//! (message kind, session id, message id, chunk index, total chunks), a
//! u16 length for the TLV section, and the TLV section itself. Integers are
//! big-endian throughout. Unknown TLV types are skipped so older peers can
//! talk to newer ones.

use crate::error::ProtoError;
use std::fmt;

/// Wire magic, `AXT1`.
pub const MAGIC: [u8; 4] = *b"AXT1";

/// Fixed header: magic(4) + kind(1) + session(2) + message(4) + chunk(4) +
/// total(4) + tlv length(2).
pub const HEADER_LEN: usize = 21;

/// Reserved message id: transfer-complete handshake.
pub const MSG_ID_TRANSFER_COMPLETE: u32 = 0xFFFF_FFFF;
/// Reserved message id: completion-request probe.
pub const MSG_ID_COMPLETION_REQUEST: u32 = 0xFFFF_FFFE;

mod tlv {
    pub const PAYLOAD: u8 = 0x01;
    pub const PAYLOAD_CRC32: u8 = 0x02;
    pub const FILE_META: u8 = 0x03;
    pub const SACK_BITMAP: u8 = 0x04;
    pub const CAPABILITIES: u8 = 0x05;

    // Nested inside FILE_META.
    pub const FM_FILENAME: u8 = 0x01;
    pub const FM_FILE_SIZE: u8 = 0x02;
    pub const FM_SHA256: u8 = 0x03;
    pub const FM_CHUNK_SIZE: u8 = 0x04;
    pub const FM_COMPRESSION: u8 = 0x05;
}

/// AXDP message kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum MessageKind {
    Chat = 0x01,
    FileMeta = 0x02,
    FileChunk = 0x03,
    Ack = 0x04,
    Nack = 0x05,
    Ping = 0x06,
    Pong = 0x07,
    PeerAxdpEnabled = 0x08,
    PeerAxdpDisabled = 0x09,
    Error = 0x0A,
}

impl MessageKind {
    pub fn from_u8(v: u8) -> Option<Self> {
        match v {
            0x01 => Some(Self::Chat),
            0x02 => Some(Self::FileMeta),
            0x03 => Some(Self::FileChunk),
            0x04 => Some(Self::Ack),
            0x05 => Some(Self::Nack),
            0x06 => Some(Self::Ping),
            0x07 => Some(Self::Pong),
            0x08 => Some(Self::PeerAxdpEnabled),
            0x09 => Some(Self::PeerAxdpDisabled),
            0x0A => Some(Self::Error),
            _ => None,
        }
    }
}

/// File-transfer compression algorithm.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(u8)]
pub enum Compression {
    #[default]
    None = 0,
    Lz4 = 1,
}

impl Compression {
    pub fn from_u8(v: u8) -> Option<Self> {
        match v {
            0 => Some(Self::None),
            1 => Some(Self::Lz4),
            _ => None,
        }
    }
}

/// Metadata announcing a file transfer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileMeta {
    pub filename: String,
    pub file_size: u64,
    pub sha256: [u8; 32],
    pub chunk_size: u16,
    pub compression: Compression,
}

/// Chunk bitmap carried on completion NACKs: bit `i` set means chunk
/// `base_chunk + i` is missing at the receiver. A zero-length bitmap
/// (window 0) signals a hash mismatch after full receipt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SackBitmap {
    pub base_chunk: u32,
    pub window_size: u16,
    pub bits: Vec<u8>,
}

impl SackBitmap {
    pub fn empty() -> Self {
        Self {
            base_chunk: 0,
            window_size: 0,
            bits: Vec::new(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.window_size == 0
    }

    /// Builds a bitmap covering `missing` (must be non-empty and sorted
    /// ascending; callers sort first).
    pub fn from_missing(missing: &[u32]) -> Self {
        let Some(&base) = missing.first() else {
            return Self::empty();
        };
        let last = *missing.last().unwrap_or(&base);
        let window = (last - base + 1).min(u16::MAX as u32) as u16;
        let mut bits = vec![0u8; (window as usize).div_ceil(8)];
        for &chunk in missing {
            let off = (chunk - base) as usize;
            if off < window as usize {
                bits[off / 8] |= 1 << (off % 8);
            }
        }
        Self {
            base_chunk: base,
            window_size: window,
            bits,
        }
    }

    pub fn missing_chunks(&self) -> Vec<u32> {
        let mut out = Vec::new();
        for i in 0..self.window_size as usize {
            if self
                .bits
                .get(i / 8)
                .is_some_and(|byte| byte & (1 << (i % 8)) != 0)
            {
                out.push(self.base_chunk + i as u32);
            }
        }
        out
    }
}

/// Capability advertisement carried on PING/PONG.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Capabilities {
    pub version: u8,
    pub proto_max: u8,
    pub max_frame_len: u16,
    pub max_paclen: u16,
    pub features: u32,
}

impl Default for Capabilities {
    fn default() -> Self {
        Self {
            version: 1,
            proto_max: 1,
            max_frame_len: 2048,
            max_paclen: 256,
            features: 0,
        }
    }
}

/// A decoded AXDP message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AxdpMessage {
    pub kind: MessageKind,
    pub session_id: u16,
    pub message_id: u32,
    pub chunk_index: u32,
    pub total_chunks: u32,
    pub payload: Vec<u8>,
    pub payload_crc: Option<u32>,
    pub file_meta: Option<FileMeta>,
    pub sack: Option<SackBitmap>,
    pub capabilities: Option<Capabilities>,
}

impl AxdpMessage {
    pub fn new(kind: MessageKind, session_id: u16, message_id: u32) -> Self {
        Self {
            kind,
            session_id,
            message_id,
            chunk_index: 0,
            total_chunks: 0,
            payload: Vec::new(),
            payload_crc: None,
            file_meta: None,
            sack: None,
            capabilities: None,
        }
    }

    pub fn chat(session_id: u16, message_id: u32, text: &str) -> Self {
        let mut msg = Self::new(MessageKind::Chat, session_id, message_id);
        msg.payload = text.as_bytes().to_vec();
        msg
    }

    pub fn file_meta(session_id: u16, message_id: u32, meta: FileMeta, total_chunks: u32) -> Self {
        let mut msg = Self::new(MessageKind::FileMeta, session_id, message_id);
        msg.total_chunks = total_chunks;
        msg.file_meta = Some(meta);
        msg
    }

    pub fn file_chunk(session_id: u16, index: u32, total: u32, data: Vec<u8>) -> Self {
        let mut msg = Self::new(MessageKind::FileChunk, session_id, 0);
        msg.chunk_index = index;
        msg.total_chunks = total;
        msg.payload_crc = Some(crc32fast::hash(&data));
        msg.payload = data;
        msg
    }

    pub fn ack(session_id: u16, message_id: u32) -> Self {
        Self::new(MessageKind::Ack, session_id, message_id)
    }

    pub fn nack(session_id: u16, message_id: u32, sack: Option<SackBitmap>) -> Self {
        let mut msg = Self::new(MessageKind::Nack, session_id, message_id);
        msg.sack = sack;
        msg
    }

    pub fn ping(message_id: u32, caps: Capabilities) -> Self {
        let mut msg = Self::new(MessageKind::Ping, 0, message_id);
        msg.capabilities = Some(caps);
        msg
    }

    pub fn pong(message_id: u32, caps: Capabilities) -> Self {
        let mut msg = Self::new(MessageKind::Pong, 0, message_id);
        msg.capabilities = Some(caps);
        msg
    }

    pub fn peer_badge(enabled: bool) -> Self {
        let kind = if enabled {
            MessageKind::PeerAxdpEnabled
        } else {
            MessageKind::PeerAxdpDisabled
        };
        Self::new(kind, 0, 0)
    }

    /// True when the stored payload CRC matches the payload. Messages
    /// without a CRC TLV verify trivially.
    pub fn crc_ok(&self) -> bool {
        match self.payload_crc {
            Some(crc) => crc32fast::hash(&self.payload) == crc,
            None => true,
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut tlvs = Vec::new();
        if !self.payload.is_empty() {
            push_tlv(&mut tlvs, tlv::PAYLOAD, &self.payload);
        }
        if let Some(crc) = self.payload_crc {
            push_tlv(&mut tlvs, tlv::PAYLOAD_CRC32, &crc.to_be_bytes());
        }
        if let Some(meta) = &self.file_meta {
            push_tlv(&mut tlvs, tlv::FILE_META, &encode_file_meta(meta));
        }
        if let Some(sack) = &self.sack {
            push_tlv(&mut tlvs, tlv::SACK_BITMAP, &encode_sack(sack));
        }
        if let Some(caps) = &self.capabilities {
            push_tlv(&mut tlvs, tlv::CAPABILITIES, &encode_caps(caps));
        }

        let mut out = Vec::with_capacity(HEADER_LEN + tlvs.len());
        out.extend_from_slice(&MAGIC);
        out.push(self.kind as u8);
        out.extend_from_slice(&self.session_id.to_be_bytes());
        out.extend_from_slice(&self.message_id.to_be_bytes());
        out.extend_from_slice(&self.chunk_index.to_be_bytes());
        out.extend_from_slice(&self.total_chunks.to_be_bytes());
        out.extend_from_slice(&(tlvs.len() as u16).to_be_bytes());
        out.extend_from_slice(&tlvs);
        out
    }

    /// Decodes one message from the front of `bytes`; returns the message
    /// and the number of bytes consumed.
    pub fn decode(bytes: &[u8]) -> Result<(AxdpMessage, usize), ProtoError> {
        if bytes.len() < HEADER_LEN {
            return Err(ProtoError::MalformedMessage("truncated header"));
        }
        if bytes[0..4] != MAGIC {
            return Err(ProtoError::MalformedMessage("bad magic"));
        }
        let kind = MessageKind::from_u8(bytes[4])
            .ok_or(ProtoError::MalformedMessage("unknown message kind"))?;
        let session_id = u16::from_be_bytes([bytes[5], bytes[6]]);
        let message_id = u32::from_be_bytes([bytes[7], bytes[8], bytes[9], bytes[10]]);
        let chunk_index = u32::from_be_bytes([bytes[11], bytes[12], bytes[13], bytes[14]]);
        let total_chunks = u32::from_be_bytes([bytes[15], bytes[16], bytes[17], bytes[18]]);
        let tlv_len = u16::from_be_bytes([bytes[19], bytes[20]]) as usize;
        if bytes.len() < HEADER_LEN + tlv_len {
            return Err(ProtoError::MalformedMessage("truncated TLV section"));
        }

        let mut msg = AxdpMessage::new(kind, session_id, message_id);
        msg.chunk_index = chunk_index;
        msg.total_chunks = total_chunks;

        let mut section = &bytes[HEADER_LEN..HEADER_LEN + tlv_len];
        while !section.is_empty() {
            if section.len() < 3 {
                return Err(ProtoError::MalformedMessage("truncated TLV"));
            }
            let t = section[0];
            let len = u16::from_be_bytes([section[1], section[2]]) as usize;
            if section.len() < 3 + len {
                return Err(ProtoError::MalformedMessage("TLV length overruns section"));
            }
            let value = &section[3..3 + len];
            match t {
                tlv::PAYLOAD => msg.payload = value.to_vec(),
                tlv::PAYLOAD_CRC32 => {
                    if len != 4 {
                        return Err(ProtoError::MalformedMessage("bad CRC TLV length"));
                    }
                    msg.payload_crc =
                        Some(u32::from_be_bytes([value[0], value[1], value[2], value[3]]));
                }
                tlv::FILE_META => msg.file_meta = Some(decode_file_meta(value)?),
                tlv::SACK_BITMAP => msg.sack = Some(decode_sack(value)?),
                tlv::CAPABILITIES => msg.capabilities = Some(decode_caps(value)?),
                _ => {
                    // Unknown TLV from a newer peer; skip.
                }
            }
            section = &section[3 + len..];
        }

        Ok((msg, HEADER_LEN + tlv_len))
    }
}

impl fmt::Display for AxdpMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:?} sid={} mid={:#x}",
            self.kind, self.session_id, self.message_id
        )
    }
}

fn push_tlv(out: &mut Vec<u8>, t: u8, value: &[u8]) {
    out.push(t);
    out.extend_from_slice(&(value.len() as u16).to_be_bytes());
    out.extend_from_slice(value);
}

fn encode_file_meta(meta: &FileMeta) -> Vec<u8> {
    let mut out = Vec::new();
    push_tlv(&mut out, tlv::FM_FILENAME, meta.filename.as_bytes());
    push_tlv(&mut out, tlv::FM_FILE_SIZE, &meta.file_size.to_be_bytes());
    push_tlv(&mut out, tlv::FM_SHA256, &meta.sha256);
    push_tlv(&mut out, tlv::FM_CHUNK_SIZE, &meta.chunk_size.to_be_bytes());
    push_tlv(&mut out, tlv::FM_COMPRESSION, &[meta.compression as u8]);
    out
}

fn decode_file_meta(mut bytes: &[u8]) -> Result<FileMeta, ProtoError> {
    let mut filename = None;
    let mut file_size = None;
    let mut sha256 = None;
    let mut chunk_size = None;
    let mut compression = Compression::None;
    while !bytes.is_empty() {
        if bytes.len() < 3 {
            return Err(ProtoError::MalformedMessage("truncated file-meta TLV"));
        }
        let t = bytes[0];
        let len = u16::from_be_bytes([bytes[1], bytes[2]]) as usize;
        if bytes.len() < 3 + len {
            return Err(ProtoError::MalformedMessage("file-meta TLV overrun"));
        }
        let value = &bytes[3..3 + len];
        match t {
            tlv::FM_FILENAME => {
                filename = Some(
                    String::from_utf8(value.to_vec())
                        .map_err(|_| ProtoError::MalformedMessage("filename not UTF-8"))?,
                );
            }
            tlv::FM_FILE_SIZE => {
                if len != 8 {
                    return Err(ProtoError::MalformedMessage("bad file-size length"));
                }
                let mut buf = [0u8; 8];
                buf.copy_from_slice(value);
                file_size = Some(u64::from_be_bytes(buf));
            }
            tlv::FM_SHA256 => {
                if len != 32 {
                    return Err(ProtoError::MalformedMessage("bad sha256 length"));
                }
                let mut buf = [0u8; 32];
                buf.copy_from_slice(value);
                sha256 = Some(buf);
            }
            tlv::FM_CHUNK_SIZE => {
                if len != 2 {
                    return Err(ProtoError::MalformedMessage("bad chunk-size length"));
                }
                chunk_size = Some(u16::from_be_bytes([value[0], value[1]]));
            }
            tlv::FM_COMPRESSION => {
                if len != 1 {
                    return Err(ProtoError::MalformedMessage("bad compression length"));
                }
                compression = Compression::from_u8(value[0])
                    .ok_or(ProtoError::MalformedMessage("unknown compression"))?;
            }
            _ => {}
        }
        bytes = &bytes[3 + len..];
    }
    Ok(FileMeta {
        filename: filename.ok_or(ProtoError::MalformedMessage("file-meta missing filename"))?,
        file_size: file_size.ok_or(ProtoError::MalformedMessage("file-meta missing size"))?,
        sha256: sha256.ok_or(ProtoError::MalformedMessage("file-meta missing sha256"))?,
        chunk_size: chunk_size.ok_or(ProtoError::MalformedMessage("file-meta missing chunk size"))?,
        compression,
    })
}

fn encode_sack(sack: &SackBitmap) -> Vec<u8> {
    let mut out = Vec::with_capacity(6 + sack.bits.len());
    out.extend_from_slice(&sack.base_chunk.to_be_bytes());
    out.extend_from_slice(&sack.window_size.to_be_bytes());
    out.extend_from_slice(&sack.bits);
    out
}

fn decode_sack(bytes: &[u8]) -> Result<SackBitmap, ProtoError> {
    if bytes.len() < 6 {
        return Err(ProtoError::MalformedMessage("truncated SACK bitmap"));
    }
    let base_chunk = u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]);
    let window_size = u16::from_be_bytes([bytes[4], bytes[5]]);
    let bits = bytes[6..].to_vec();
    if bits.len() < (window_size as usize).div_ceil(8) {
        return Err(ProtoError::MalformedMessage("SACK bits shorter than window"));
    }
    Ok(SackBitmap {
        base_chunk,
        window_size,
        bits,
    })
}

fn encode_caps(caps: &Capabilities) -> Vec<u8> {
    let mut out = Vec::with_capacity(10);
    out.push(caps.version);
    out.push(caps.proto_max);
    out.extend_from_slice(&caps.max_frame_len.to_be_bytes());
    out.extend_from_slice(&caps.max_paclen.to_be_bytes());
    out.extend_from_slice(&caps.features.to_be_bytes());
    out
}

fn decode_caps(bytes: &[u8]) -> Result<Capabilities, ProtoError> {
    // Versioned struct: newer peers may append fields, so only the prefix
    // we understand is required.
    if bytes.len() < 10 {
        return Err(ProtoError::MalformedMessage("truncated capabilities"));
    }
    Ok(Capabilities {
        version: bytes[0],
        proto_max: bytes[1],
        max_frame_len: u16::from_be_bytes([bytes[2], bytes[3]]),
        max_paclen: u16::from_be_bytes([bytes[4], bytes[5]]),
        features: u32::from_be_bytes([bytes[6], bytes[7], bytes[8], bytes[9]]),
    })
}

/// Splits an encoded message into fragments of at most `max_len` bytes for
/// carriage in I or UI frames. The receiver reassembles by byte stream, so
/// fragments carry no headers of their own.
pub fn fragment(encoded: &[u8], max_len: usize) -> Vec<Vec<u8>> {
    if max_len == 0 {
        return Vec::new();
    }
    encoded.chunks(max_len).map(|c| c.to_vec()).collect()
}

/// Per-peer reassembly stream. Bytes from accepted frames are appended and
/// complete messages extracted greedily; garbage before a magic is skipped.
#[derive(Debug, Default)]
pub struct MessageStream {
    buf: Vec<u8>,
}

impl MessageStream {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn buffered(&self) -> usize {
        self.buf.len()
    }

    pub fn clear(&mut self) {
        self.buf.clear();
    }

    pub fn feed(&mut self, bytes: &[u8]) -> Vec<AxdpMessage> {
        self.buf.extend_from_slice(bytes);
        let mut out = Vec::new();
        loop {
            // Drop leading garbage up to the next magic.
            match find_magic(&self.buf) {
                Some(0) => {}
                Some(pos) => {
                    self.buf.drain(..pos);
                }
                None => {
                    // Keep at most 3 trailing bytes in case a magic is split
                    // across feeds.
                    let keep = self.buf.len().min(3);
                    self.buf.drain(..self.buf.len() - keep);
                    return out;
                }
            }
            match AxdpMessage::decode(&self.buf) {
                Ok((msg, consumed)) => {
                    self.buf.drain(..consumed);
                    out.push(msg);
                }
                Err(ProtoError::MalformedMessage("truncated header"))
                | Err(ProtoError::MalformedMessage("truncated TLV section")) => {
                    return out;
                }
                Err(_) => {
                    // Corrupt message; resync one byte past this magic.
                    self.buf.drain(..1);
                }
            }
        }
    }
}

fn find_magic(buf: &[u8]) -> Option<usize> {
    buf.windows(4).position(|w| w == MAGIC)
}
