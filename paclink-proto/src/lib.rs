//! # Paclink Proto
//!
//! Wire formats for the paclink packet engine.
//!
//! This crate holds everything that touches raw bytes: KISS framing for the
//! host↔TNC link, the AX.25 v2.2 address/control/frame codec (modulo-8), the
//! AXDP application datagram codec (`AXT1` magic, big-endian TLVs), and the
//! NET/ROM NODES broadcast parser. All decode paths are total: arbitrary
//! input yields `Err`, never a panic.

pub mod address;
pub mod axdp;
pub mod classify;
pub mod error;
pub mod frame;
pub mod kiss;
pub mod netrom;
pub mod time;

pub use address::{Address, DigiPath};
pub use classify::{Classification, PacketClassifier};
pub use error::ProtoError;
pub use frame::{Ax25Frame, Control, FrameType, SFrame, UFrame, PID_NETROM, PID_NO_L3};
pub use kiss::{KissCodec, KissFrame};
pub use time::{ManualTimeProvider, SystemTimeProvider, TimeProvider};
