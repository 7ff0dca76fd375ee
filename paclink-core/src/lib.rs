//! # Paclink Core
//!
//! The orchestration layer: one [`SessionCoordinator`] owns the session
//! map, the router, the link-quality estimator, the transfer list, and the
//! capability cache. Decoded frames go in through a single ingest point;
//! application-visible changes come out as [`CoreEvent`]s; outbound frames
//! accumulate for the transport to drain.
//!
//! The coordinator is synchronous and single-threaded. The KISS/TCP
//! endpoint in [`transport`] runs on tokio and marshals bytes in and out;
//! nothing else in the crate is async.

pub mod capability;
pub mod config;
pub mod coordinator;
pub mod error;
pub mod events;
pub mod transfer;
pub mod transport;

pub use capability::{CapabilityCache, CapabilityStatus};
pub use config::CoreConfig;
pub use coordinator::SessionCoordinator;
pub use error::CoreError;
pub use events::CoreEvent;
pub use transfer::{BulkTransfer, InboundTransfer, TransferId, TransferStatus};
pub use transport::{InboundFrame, KissEndpoint, KissEndpointConfig, TransportEvent};
