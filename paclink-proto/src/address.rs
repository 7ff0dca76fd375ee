use crate::error::ProtoError;
use smallvec::SmallVec;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::str::FromStr;

/// Maximum callsign length in an AX.25 address field.
pub const MAX_CALLSIGN_LEN: usize = 6;
/// Maximum number of digipeaters in a via path.
pub const MAX_DIGIPEATERS: usize = 8;

/// An AX.25 station address: a callsign of up to six characters plus a
/// 4-bit SSID.
///
/// The callsign is stored normalized (trimmed, uppercased). Two addresses
/// compare equal iff their normalized callsign and SSID match; the
/// has-been-repeated flag does not participate in equality.
#[derive(Debug, Clone)]
pub struct Address {
    callsign: String,
    ssid: u8,
    /// The H bit: set once a digipeater has repeated the frame.
    pub repeated: bool,
}

impl Address {
    pub fn new(callsign: &str, ssid: u8) -> Result<Self, ProtoError> {
        let normalized = callsign.trim().to_ascii_uppercase();
        if normalized.len() > MAX_CALLSIGN_LEN {
            return Err(ProtoError::CallsignTooLong(normalized));
        }
        if !normalized.bytes().all(|b| (0x20..=0x7E).contains(&b)) {
            return Err(ProtoError::CallsignNotAscii);
        }
        if ssid > 15 {
            return Err(ProtoError::SsidOutOfRange(ssid));
        }
        Ok(Self {
            callsign: normalized,
            ssid,
            repeated: false,
        })
    }

    pub fn with_repeated(mut self, repeated: bool) -> Self {
        self.repeated = repeated;
        self
    }

    pub fn callsign(&self) -> &str {
        &self.callsign
    }

    pub fn ssid(&self) -> u8 {
        self.ssid
    }

    /// Encodes into the 7-byte shifted wire form.
    ///
    /// Bit 7 of the SSID byte carries the H (has-been-repeated) flag when
    /// `c_bit` is false; when `c_bit` is true the top bit is the C
    /// (command/response) bit of AX.25 v2.2. The reserved bits are fixed
    /// high (0x60).
    pub fn encode(&self, c_bit: bool, is_last: bool) -> [u8; 7] {
        let mut out = [b' ' << 1; 7];
        for (i, b) in self.callsign.bytes().take(MAX_CALLSIGN_LEN).enumerate() {
            out[i] = b << 1;
        }
        let mut ssid_byte = 0x60 | ((self.ssid & 0x0F) << 1);
        if c_bit || self.repeated {
            ssid_byte |= 0x80;
        }
        if is_last {
            ssid_byte |= 0x01;
        }
        out[6] = ssid_byte;
        out
    }

    /// Decodes a 7-byte shifted address field. Returns the address and the
    /// extension ("last address") flag.
    ///
    /// Both 0x60 and 0xE0 reserved-bit variants are accepted; anything in
    /// the top three bits is tolerated and the H flag is taken from bit 7.
    pub fn decode(bytes: &[u8]) -> Result<(Self, bool), ProtoError> {
        if bytes.len() < 7 {
            return Err(ProtoError::InvalidFrame("address shorter than 7 bytes"));
        }
        let mut callsign = String::with_capacity(MAX_CALLSIGN_LEN);
        for &b in &bytes[..6] {
            let ch = b >> 1;
            if !(0x20..=0x7E).contains(&ch) {
                return Err(ProtoError::InvalidFrame("non-ASCII callsign byte"));
            }
            callsign.push(ch as char);
        }
        let ssid_byte = bytes[6];
        let addr = Self {
            callsign: callsign.trim_end().to_ascii_uppercase(),
            ssid: (ssid_byte >> 1) & 0x0F,
            repeated: ssid_byte & 0x80 != 0,
        };
        Ok((addr, ssid_byte & 0x01 != 0))
    }
}

impl PartialEq for Address {
    fn eq(&self, other: &Self) -> bool {
        self.callsign == other.callsign && self.ssid == other.ssid
    }
}

impl Eq for Address {}

impl Hash for Address {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.callsign.hash(state);
        self.ssid.hash(state);
    }
}

impl PartialOrd for Address {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Address {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        (&self.callsign, self.ssid).cmp(&(&other.callsign, other.ssid))
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.ssid == 0 {
            write!(f, "{}", self.callsign)
        } else {
            write!(f, "{}-{}", self.callsign, self.ssid)
        }
    }
}

impl FromStr for Address {
    type Err = ProtoError;

    fn from_str(s: &str) -> Result<Self, ProtoError> {
        match s.rsplit_once('-') {
            Some((call, ssid)) if !call.is_empty() => {
                let ssid: u8 = ssid
                    .parse()
                    .map_err(|_| ProtoError::SsidOutOfRange(255))?;
                Self::new(call, ssid)
            }
            _ => Self::new(s, 0),
        }
    }
}

/// An ordered digipeater path of at most eight addresses.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default)]
pub struct DigiPath(SmallVec<[Address; 2]>);

impl DigiPath {
    pub fn empty() -> Self {
        Self(SmallVec::new())
    }

    pub fn new(hops: impl IntoIterator<Item = Address>) -> Result<Self, ProtoError> {
        let hops: SmallVec<[Address; 2]> = hops.into_iter().collect();
        if hops.len() > MAX_DIGIPEATERS {
            return Err(ProtoError::PathTooLong);
        }
        Ok(Self(hops))
    }

    pub fn push(&mut self, hop: Address) -> Result<(), ProtoError> {
        if self.0.len() >= MAX_DIGIPEATERS {
            return Err(ProtoError::PathTooLong);
        }
        self.0.push(hop);
        Ok(())
    }

    pub fn hops(&self) -> &[Address] {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn contains(&self, addr: &Address) -> bool {
        self.0.iter().any(|hop| hop == addr)
    }

    /// The comma-joined normalized display form of the via list.
    /// Empty string means a direct path.
    pub fn signature(&self) -> String {
        self.0
            .iter()
            .map(|a| a.to_string())
            .collect::<Vec<_>>()
            .join(",")
    }
}

impl fmt::Display for DigiPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.signature())
    }
}
