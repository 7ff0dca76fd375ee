//! Peer AXDP capability cache.

use paclink_proto::axdp::Capabilities;
use paclink_proto::address::Address;
use std::collections::HashMap;

/// Where capability discovery stands for one peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CapabilityStatus {
    #[default]
    Unknown,
    /// We sent a PING and are waiting for the PONG.
    Pending,
    Confirmed,
    /// No PONG within the discovery timeout.
    Unsupported,
}

#[derive(Debug, Clone, Default)]
struct Entry {
    status: CapabilityStatus,
    caps: Option<Capabilities>,
    /// Unsolicited badge state, if the peer announced one.
    badge: Option<bool>,
    last_seen_ms: i64,
    ping_sent_ms: Option<i64>,
}

/// Capability state for every peer we have talked to, keyed by normalized
/// callsign.
#[derive(Debug, Default)]
pub struct CapabilityCache {
    entries: HashMap<Address, Entry>,
}

impl CapabilityCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn status(&self, peer: &Address) -> CapabilityStatus {
        self.entries
            .get(peer)
            .map(|e| e.status)
            .unwrap_or_default()
    }

    pub fn capabilities(&self, peer: &Address) -> Option<Capabilities> {
        self.entries.get(peer).and_then(|e| e.caps)
    }

    pub fn badge(&self, peer: &Address) -> Option<bool> {
        self.entries.get(peer).and_then(|e| e.badge)
    }

    /// Records that a PING left for `peer`.
    pub fn mark_pending(&mut self, peer: &Address, now_ms: i64) {
        let entry = self.entries.entry(peer.clone()).or_default();
        entry.status = CapabilityStatus::Pending;
        entry.ping_sent_ms = Some(now_ms);
        entry.last_seen_ms = now_ms;
    }

    /// A PONG (or a PING, which proves support just as well) arrived.
    pub fn confirm(&mut self, peer: &Address, caps: Capabilities, now_ms: i64) {
        let entry = self.entries.entry(peer.clone()).or_default();
        entry.status = CapabilityStatus::Confirmed;
        entry.caps = Some(caps);
        entry.ping_sent_ms = None;
        entry.last_seen_ms = now_ms;
    }

    pub fn set_badge(&mut self, peer: &Address, enabled: bool, now_ms: i64) {
        let entry = self.entries.entry(peer.clone()).or_default();
        entry.badge = Some(enabled);
        entry.last_seen_ms = now_ms;
    }

    /// Times out pending discoveries; returns the peers that just became
    /// unsupported.
    pub fn sweep_pending(&mut self, timeout_ms: i64, now_ms: i64) -> Vec<Address> {
        let mut flipped = Vec::new();
        for (peer, entry) in self.entries.iter_mut() {
            if entry.status == CapabilityStatus::Pending
                && entry
                    .ping_sent_ms
                    .is_some_and(|sent| now_ms - sent >= timeout_ms)
            {
                entry.status = CapabilityStatus::Unsupported;
                entry.ping_sent_ms = None;
                flipped.push(peer.clone());
            }
        }
        flipped
    }
}
