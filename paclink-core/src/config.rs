use paclink_route::{LinkQualityConfig, RouterConfig};
use paclink_session::SessionConfig;

/// Engine-wide tunables, gathered in one place and passed to the
/// coordinator at construction.
#[derive(Debug, Clone)]
pub struct CoreConfig {
    /// KISS TNC host, typically a Direwolf instance.
    pub kiss_host: String,
    pub kiss_port: u16,
    /// KISS port (channel) sessions run on.
    pub channel: u8,
    /// Send capability PINGs automatically when we initiate a session.
    pub auto_negotiate: bool,
    /// How long to wait for a PONG before marking a peer unsupported.
    pub peer_discovery_timeout_ms: i64,
    /// Token-bucket rate (frames/second) per destination.
    pub scheduler_rate: f64,
    /// Token-bucket burst per destination.
    pub scheduler_burst: f64,
    /// Reject persisted snapshots older than this.
    pub max_snapshot_age_ms: i64,
    /// Drop a per-source UI reassembly buffer after this much silence.
    pub ui_reassembly_timeout_ms: i64,
    /// Base session parameters; the adaptive layer refines them.
    pub session: SessionConfig,
    pub router: RouterConfig,
    pub link_quality: LinkQualityConfig,
}

impl Default for CoreConfig {
    fn default() -> Self {
        Self {
            kiss_host: "localhost".to_string(),
            kiss_port: 8001,
            channel: 0,
            auto_negotiate: true,
            peer_discovery_timeout_ms: 30_000,
            scheduler_rate: 2.0,
            scheduler_burst: 5.0,
            max_snapshot_age_ms: 86_400_000,
            ui_reassembly_timeout_ms: 60_000,
            session: SessionConfig::default(),
            router: RouterConfig::default(),
            link_quality: LinkQualityConfig::default(),
        }
    }
}
