//! AX.25 v2.2 frame codec, modulo-8 control fields only.

use crate::address::{Address, DigiPath, MAX_DIGIPEATERS};
use crate::error::ProtoError;

/// PID for "no layer 3 protocol".
pub const PID_NO_L3: u8 = 0xF0;
/// PID for NET/ROM.
pub const PID_NETROM: u8 = 0xCF;

/// Supervisory frame subtype.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SFrame {
    Rr,
    Rnr,
    Rej,
    Srej,
}

/// Unnumbered frame subtype.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UFrame {
    Sabm,
    Ua,
    Disc,
    Dm,
    Ui,
    Frmr,
    /// Any other unnumbered pattern, kept for totality.
    Other(u8),
}

/// A decoded modulo-8 control field.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Control {
    I { ns: u8, nr: u8, poll: bool },
    S { kind: SFrame, nr: u8, poll: bool },
    U { kind: UFrame, poll: bool },
}

/// Coarse frame classification derived from the control field.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameType {
    I,
    Ui,
    S,
    U,
}

impl Control {
    pub fn decode(byte: u8) -> Control {
        if byte & 0x01 == 0 {
            return Control::I {
                ns: (byte >> 1) & 0x07,
                nr: (byte >> 5) & 0x07,
                poll: byte & 0x10 != 0,
            };
        }
        if byte & 0x03 == 0x01 {
            let kind = match (byte >> 2) & 0x03 {
                0 => SFrame::Rr,
                1 => SFrame::Rnr,
                2 => SFrame::Rej,
                _ => SFrame::Srej,
            };
            return Control::S {
                kind,
                nr: (byte >> 5) & 0x07,
                poll: byte & 0x10 != 0,
            };
        }
        let poll = byte & 0x10 != 0;
        let kind = match byte & !0x10 {
            0x2F => UFrame::Sabm,
            0x63 => UFrame::Ua,
            0x43 => UFrame::Disc,
            0x0F => UFrame::Dm,
            0x03 => UFrame::Ui,
            0x87 => UFrame::Frmr,
            other => UFrame::Other(other),
        };
        Control::U { kind, poll }
    }

    pub fn encode(&self) -> u8 {
        match *self {
            Control::I { ns, nr, poll } => {
                ((nr & 0x07) << 5) | (u8::from(poll) << 4) | ((ns & 0x07) << 1)
            }
            Control::S { kind, nr, poll } => {
                let t = match kind {
                    SFrame::Rr => 0,
                    SFrame::Rnr => 1,
                    SFrame::Rej => 2,
                    SFrame::Srej => 3,
                };
                ((nr & 0x07) << 5) | (u8::from(poll) << 4) | (t << 2) | 0x01
            }
            Control::U { kind, poll } => {
                let base = match kind {
                    UFrame::Sabm => 0x2F,
                    UFrame::Ua => 0x63,
                    UFrame::Disc => 0x43,
                    UFrame::Dm => 0x0F,
                    UFrame::Ui => 0x03,
                    UFrame::Frmr => 0x87,
                    UFrame::Other(b) => b & !0x10,
                };
                base | (u8::from(poll) << 4)
            }
        }
    }

    pub fn frame_type(&self) -> FrameType {
        match self {
            Control::I { .. } => FrameType::I,
            Control::S { .. } => FrameType::S,
            Control::U {
                kind: UFrame::Ui, ..
            } => FrameType::Ui,
            Control::U { .. } => FrameType::U,
        }
    }
}

/// A decoded AX.25 frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Ax25Frame {
    pub dest: Address,
    pub source: Address,
    pub path: DigiPath,
    pub control: Control,
    /// AX.25 v2.2 command/response: commands carry the C bit on the
    /// destination, responses on the source. With a P/F bit set this is
    /// what distinguishes a poll from its final answer.
    pub command: bool,
    /// Present on I and UI frames.
    pub pid: Option<u8>,
    pub info: Vec<u8>,
}

impl Ax25Frame {
    /// Decodes a frame from raw AX.25 bytes (no KISS framing, no FCS).
    ///
    /// Total over arbitrary input: malformed bytes yield an error.
    pub fn decode(bytes: &[u8]) -> Result<Ax25Frame, ProtoError> {
        if bytes.len() < 15 {
            return Err(ProtoError::InvalidFrame("frame shorter than minimum"));
        }
        let (dest, dest_last) = Address::decode(&bytes[0..7])?;
        if dest_last {
            return Err(ProtoError::InvalidFrame("destination marked last"));
        }
        let (source, mut last) = Address::decode(&bytes[7..14])?;
        let mut offset = 14;
        let mut path = DigiPath::empty();
        while !last {
            if path.len() >= MAX_DIGIPEATERS {
                return Err(ProtoError::PathTooLong);
            }
            if bytes.len() < offset + 7 {
                return Err(ProtoError::InvalidFrame("truncated digipeater list"));
            }
            let (digi, is_last) = Address::decode(&bytes[offset..offset + 7])?;
            path.push(digi).map_err(|_| ProtoError::PathTooLong)?;
            last = is_last;
            offset += 7;
        }
        if bytes.len() <= offset {
            return Err(ProtoError::InvalidFrame("missing control byte"));
        }
        let control = Control::decode(bytes[offset]);
        offset += 1;

        let carries_pid = matches!(
            control.frame_type(),
            FrameType::I | FrameType::Ui
        );
        let (pid, info) = if carries_pid {
            if bytes.len() <= offset {
                return Err(ProtoError::InvalidFrame("missing PID byte"));
            }
            (Some(bytes[offset]), bytes[offset + 1..].to_vec())
        } else {
            (None, bytes[offset..].to_vec())
        };

        // Responses set the C bit on the source only; everything else
        // (including pre-v2 frames with neither bit) reads as a command.
        let command = dest.repeated || !source.repeated;

        Ok(Ax25Frame {
            dest,
            source,
            path,
            control,
            command,
            pid,
            info,
        })
    }

    pub fn encode(&self) -> Vec<u8> {
        let command = self.command;
        let mut out = Vec::with_capacity(16 + self.path.len() * 7 + self.info.len());
        out.extend_from_slice(&self.dest.encode(command, false));
        let source_last = self.path.is_empty();
        out.extend_from_slice(&self.source.encode(!command, source_last));
        for (i, hop) in self.path.hops().iter().enumerate() {
            let is_last = i + 1 == self.path.len();
            out.extend_from_slice(&hop.encode(false, is_last));
        }
        out.push(self.control.encode());
        if let Some(pid) = self.pid {
            out.push(pid);
        }
        out.extend_from_slice(&self.info);
        out
    }

    /// Printable-ASCII decode of the info field, valid only when at least
    /// 75% of the bytes are printable (0x20..0x7E, tab, CR, LF).
    pub fn info_text(&self) -> Option<String> {
        if self.info.is_empty() {
            return None;
        }
        let printable = self
            .info
            .iter()
            .filter(|&&b| (0x20..=0x7E).contains(&b) || b == b'\t' || b == b'\r' || b == b'\n')
            .count();
        if printable * 4 >= self.info.len() * 3 {
            Some(self.info.iter().map(|&b| b as char).collect())
        } else {
            None
        }
    }

    pub fn frame_type(&self) -> FrameType {
        self.control.frame_type()
    }

    // Constructors for the frames the session engine emits.

    pub fn sabm(source: Address, dest: Address, path: DigiPath) -> Self {
        Self::unnumbered(source, dest, path, UFrame::Sabm, true, true)
    }

    pub fn ua(source: Address, dest: Address, path: DigiPath, fin: bool) -> Self {
        Self::unnumbered(source, dest, path, UFrame::Ua, fin, false)
    }

    pub fn disc(source: Address, dest: Address, path: DigiPath) -> Self {
        Self::unnumbered(source, dest, path, UFrame::Disc, true, true)
    }

    pub fn dm(source: Address, dest: Address, path: DigiPath, fin: bool) -> Self {
        Self::unnumbered(source, dest, path, UFrame::Dm, fin, false)
    }

    fn unnumbered(
        source: Address,
        dest: Address,
        path: DigiPath,
        kind: UFrame,
        poll: bool,
        command: bool,
    ) -> Self {
        Ax25Frame {
            dest,
            source,
            path,
            control: Control::U { kind, poll },
            command,
            pid: None,
            info: Vec::new(),
        }
    }

    pub fn ui(source: Address, dest: Address, path: DigiPath, pid: u8, info: Vec<u8>) -> Self {
        Ax25Frame {
            dest,
            source,
            path,
            control: Control::U {
                kind: UFrame::Ui,
                poll: false,
            },
            command: true,
            pid: Some(pid),
            info,
        }
    }

    pub fn i_frame(
        source: Address,
        dest: Address,
        path: DigiPath,
        ns: u8,
        nr: u8,
        poll: bool,
        info: Vec<u8>,
    ) -> Self {
        Ax25Frame {
            dest,
            source,
            path,
            control: Control::I { ns, nr, poll },
            command: true,
            pid: Some(PID_NO_L3),
            info,
        }
    }

    /// A supervisory response (the F interpretation of the P/F bit).
    pub fn supervisory(
        source: Address,
        dest: Address,
        path: DigiPath,
        kind: SFrame,
        nr: u8,
        fin: bool,
    ) -> Self {
        Self::supervisory_with(source, dest, path, kind, nr, fin, false)
    }

    /// A supervisory command (P interpretation), e.g. the RR(P=1) poll of
    /// timer recovery.
    pub fn supervisory_command(
        source: Address,
        dest: Address,
        path: DigiPath,
        kind: SFrame,
        nr: u8,
        poll: bool,
    ) -> Self {
        Self::supervisory_with(source, dest, path, kind, nr, poll, true)
    }

    #[allow(clippy::too_many_arguments)]
    fn supervisory_with(
        source: Address,
        dest: Address,
        path: DigiPath,
        kind: SFrame,
        nr: u8,
        poll: bool,
        command: bool,
    ) -> Self {
        Ax25Frame {
            dest,
            source,
            path,
            control: Control::S { kind, nr, poll },
            command,
            pid: None,
            info: Vec::new(),
        }
    }
}
