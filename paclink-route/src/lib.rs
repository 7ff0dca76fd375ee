//! # Paclink Route
//!
//! The inference half of the engine: a per-link delivery-ratio estimator
//! with adaptive expiry, and a NET/ROM router that learns neighbors and
//! routes from NODES broadcasts and from overheard third-party traffic.
//!
//! All timestamps are wall-clock milliseconds supplied by the caller, so a
//! snapshot replay reproduces the exact same state.

pub mod linkquality;
pub mod router;

pub use linkquality::{LinkKey, LinkQualityConfig, LinkQualityEstimator, LinkStat};
pub use router::{
    Neighbor, NeighborSource, NetRomRouter, Route, RouteSource, RouterConfig, RouterMode,
};

/// Freshness of an aged entry: 1.0 through the plateau, then linear decay
/// to 0.0 at the TTL.
pub fn freshness(age_ms: i64, plateau_ms: i64, ttl_ms: i64) -> f64 {
    if age_ms <= plateau_ms {
        return 1.0;
    }
    if ttl_ms <= plateau_ms || age_ms >= ttl_ms {
        return 0.0;
    }
    1.0 - (age_ms - plateau_ms) as f64 / (ttl_ms - plateau_ms) as f64
}
