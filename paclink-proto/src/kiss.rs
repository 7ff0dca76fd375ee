//! KISS framing for the host↔TNC byte stream.
//!
//! `FEND` delimits frames; `FESC` introduces the two-byte escape sequences
//! for literal `FEND`/`FESC` bytes. The first unescaped byte of a frame is
//! the type byte: high nibble TNC port (0..15), low nibble command
//! (0 = data).

/// Frame delimiter.
pub const FEND: u8 = 0xC0;
/// Escape introducer.
pub const FESC: u8 = 0xDB;
/// Escaped FEND.
pub const TFEND: u8 = 0xDC;
/// Escaped FESC.
pub const TFESC: u8 = 0xDD;

/// KISS data command (low nibble of the type byte).
pub const CMD_DATA: u8 = 0x00;

/// A complete decoded KISS frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KissFrame {
    /// TNC port, 0..15.
    pub port: u8,
    /// Command nibble; 0 is data.
    pub command: u8,
    pub payload: Vec<u8>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DecodeState {
    /// Between frames, waiting for a FEND (or content, which opens a frame).
    Idle,
    /// Inside a frame, accumulating bytes.
    InFrame,
    /// After a FESC, expecting TFEND or TFESC.
    Escaped,
    /// Saw an invalid escape; discard until the next FEND.
    Resync,
}

/// Streaming KISS decoder.
///
/// `feed` consumes arbitrary byte chunks and returns the frames completed by
/// them; a partial frame is carried across calls. An empty frame
/// (consecutive FENDs) is ignored. An invalid escape sequence discards the
/// frame in progress and scanning resumes at the next FEND.
#[derive(Debug)]
pub struct KissCodec {
    state: DecodeState,
    buf: Vec<u8>,
}

impl Default for KissCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl KissCodec {
    pub fn new() -> Self {
        Self {
            state: DecodeState::Idle,
            buf: Vec::new(),
        }
    }

    pub fn feed(&mut self, bytes: &[u8]) -> Vec<KissFrame> {
        let mut frames = Vec::new();
        for &b in bytes {
            match self.state {
                DecodeState::Idle => {
                    if b == FEND {
                        // Delimiter between frames; stay idle.
                    } else {
                        self.state = DecodeState::InFrame;
                        self.push_content(b);
                    }
                }
                DecodeState::InFrame => {
                    if b == FEND {
                        self.finish_frame(&mut frames);
                    } else {
                        self.push_content(b);
                    }
                }
                DecodeState::Escaped => match b {
                    TFEND => {
                        self.buf.push(FEND);
                        self.state = DecodeState::InFrame;
                    }
                    TFESC => {
                        self.buf.push(FESC);
                        self.state = DecodeState::InFrame;
                    }
                    FEND => {
                        // Truncated escape; drop the frame, delimiter resets us.
                        self.buf.clear();
                        self.state = DecodeState::Idle;
                    }
                    _ => {
                        self.buf.clear();
                        self.state = DecodeState::Resync;
                    }
                },
                DecodeState::Resync => {
                    if b == FEND {
                        self.state = DecodeState::Idle;
                    }
                }
            }
        }
        frames
    }

    fn push_content(&mut self, b: u8) {
        if b == FESC {
            self.state = DecodeState::Escaped;
        } else {
            self.buf.push(b);
        }
    }

    fn finish_frame(&mut self, frames: &mut Vec<KissFrame>) {
        let raw = std::mem::take(&mut self.buf);
        self.state = DecodeState::Idle;
        if raw.is_empty() {
            return;
        }
        let type_byte = raw[0];
        frames.push(KissFrame {
            port: (type_byte >> 4) & 0x0F,
            command: type_byte & 0x0F,
            payload: raw[1..].to_vec(),
        });
    }
}

/// Encodes one data frame for the given TNC port.
pub fn encode(port: u8, payload: &[u8]) -> Vec<u8> {
    encode_command(port, CMD_DATA, payload)
}

/// Encodes a frame with an explicit command nibble.
pub fn encode_command(port: u8, command: u8, payload: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(payload.len() + 4);
    out.push(FEND);
    push_escaped(&mut out, ((port & 0x0F) << 4) | (command & 0x0F));
    for &b in payload {
        push_escaped(&mut out, b);
    }
    out.push(FEND);
    out
}

fn push_escaped(out: &mut Vec<u8>, b: u8) {
    match b {
        FEND => out.extend_from_slice(&[FESC, TFEND]),
        FESC => out.extend_from_slice(&[FESC, TFESC]),
        _ => out.push(b),
    }
}
