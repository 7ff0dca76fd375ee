//! # Paclink Session
//!
//! The connected-mode half of the engine: per-peer AX.25 v2.2 session state
//! machines (SABM/UA/DISC/DM handshakes, modulo-8 sliding window,
//! REJ/SREJ recovery, T1/T2/T3 timers), the prioritized transmit scheduler
//! with per-destination token buckets, and the adaptive configuration store
//! that maps measured link quality onto session parameters.
//!
//! Sessions are driven entirely from outside: frames in via `handle_frame`,
//! time in via `poll_timers`, events out via `poll_event`. Nothing in this
//! crate reads the clock or touches a socket.

pub mod adaptive;
pub mod config;
pub mod error;
pub mod scheduler;
pub mod session;

pub use adaptive::{AdaptiveConfigStore, LinkQualitySample, RouteAdaptiveKey};
pub use config::SessionConfig;
pub use error::SessionError;
pub use scheduler::{FrameId, TxFrameState, TxPriority, TxScheduler};
pub use session::{Ax25Session, SessionEvent, SessionKey, SessionState};
