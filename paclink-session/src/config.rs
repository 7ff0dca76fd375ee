use std::time::Duration;

/// Default outstanding-frame window.
pub const DEFAULT_WINDOW: u8 = 4;
/// Default maximum I-frame information length.
pub const DEFAULT_PACLEN: u16 = 128;
/// Default retry budget before a session gives up.
pub const DEFAULT_MAX_RETRIES: u32 = 10;
/// Initial T1 retransmission interval.
pub const DEFAULT_RTO: Duration = Duration::from_secs(3);
/// Delayed-acknowledgment (T2) interval.
pub const DEFAULT_ACK_TIMER: Duration = Duration::from_millis(250);
/// Idle-probe (T3) interval.
pub const DEFAULT_IDLE_PROBE: Duration = Duration::from_secs(300);

/// Parameters of one AX.25 session.
///
/// A session snapshots its config at creation; link-quality samples that
/// arrive later feed the adaptive store but never mutate a running session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionConfig {
    /// Sliding-window size W, 1..=7.
    pub window_size: u8,
    /// Maximum information field length per I frame.
    pub paclen: u16,
    /// Retry budget for SABM, DISC, and timer recovery.
    pub max_retries: u32,
    /// T2: how long to wait for a piggyback opportunity before an RR.
    pub ack_timer: Duration,
    /// Lower bound on the retransmission timer.
    pub rto_min: Duration,
    /// Upper bound on the retransmission timer.
    pub rto_max: Duration,
    /// Initial T1 value, clamped into `rto_min..=rto_max`.
    pub initial_rto: Duration,
    /// T3 idle probe interval.
    pub idle_probe: Duration,
    /// Use SREJ instead of REJ when both sides support it.
    pub srej_enabled: bool,
    /// Retry the initial SABM on layer-3 advice.
    pub layer3_initial_retry: bool,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            window_size: DEFAULT_WINDOW,
            paclen: DEFAULT_PACLEN,
            max_retries: DEFAULT_MAX_RETRIES,
            ack_timer: DEFAULT_ACK_TIMER,
            rto_min: Duration::from_secs(1),
            rto_max: Duration::from_secs(60),
            initial_rto: DEFAULT_RTO,
            idle_probe: DEFAULT_IDLE_PROBE,
            srej_enabled: false,
            layer3_initial_retry: false,
        }
    }
}

impl SessionConfig {
    /// The initial T1 interval with bounds applied.
    pub fn rto(&self) -> Duration {
        self.initial_rto.clamp(self.rto_min, self.rto_max)
    }
}
