//! Packet classification feeding the link-quality and routing layers.

use crate::frame::{Ax25Frame, Control, FrameType, UFrame};
use crate::netrom::is_nodes_broadcast;
use std::collections::hash_map::DefaultHasher;
use std::collections::{HashSet, VecDeque};
use std::hash::{Hash, Hasher};

/// What a frame tells us about the link that carried it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Classification {
    /// An I frame or unicast UI carrying new application data.
    DataProgress,
    /// A NET/ROM NODES broadcast.
    RoutingBroadcast,
    /// A UI beacon/identification frame.
    UiBeacon,
    /// A supervisory frame carrying only acknowledgment state.
    AckOnly,
    /// A frame we have seen before (retransmission or digi echo).
    RetryOrDuplicate,
    /// Connection management (SABM/UA/DISC/DM/FRMR).
    SessionControl,
    Unknown,
}

impl Classification {
    /// Forward-delivery evidence weight for the link-quality estimator.
    pub fn forward_weight(&self) -> f64 {
        match self {
            Classification::DataProgress => 1.0,
            Classification::RoutingBroadcast => 0.8,
            Classification::UiBeacon => 0.4,
            Classification::AckOnly => 0.1,
            Classification::SessionControl => 0.1,
            Classification::RetryOrDuplicate | Classification::Unknown => 0.0,
        }
    }
}

/// Destinations that mark a UI frame as a beacon rather than directed data.
const BEACON_DESTINATIONS: [&str; 6] = ["BEACON", "ID", "CQ", "ALL", "QST", "MAIL"];

/// How many recent frame digests to remember for duplicate detection.
const DUPLICATE_MEMORY: usize = 512;

/// Stateful classifier: tags frames and remembers recent digests so
/// retransmissions classify as `RetryOrDuplicate`.
#[derive(Debug, Default)]
pub struct PacketClassifier {
    recent: HashSet<u64>,
    order: VecDeque<u64>,
}

impl PacketClassifier {
    pub fn new() -> Self {
        Self::default()
    }

    /// Classifies a frame and records its digest.
    ///
    /// Returns the classification and whether the frame was a duplicate of
    /// one seen recently.
    pub fn classify(&mut self, frame: &Ax25Frame) -> (Classification, bool) {
        let digest = frame_digest(frame);
        let duplicate = !self.remember(digest);
        if duplicate {
            return (Classification::RetryOrDuplicate, true);
        }
        (classify_fresh(frame), false)
    }

    /// Inserts a digest, returning false if it was already present.
    fn remember(&mut self, digest: u64) -> bool {
        if !self.recent.insert(digest) {
            return false;
        }
        self.order.push_back(digest);
        if self.order.len() > DUPLICATE_MEMORY {
            if let Some(old) = self.order.pop_front() {
                self.recent.remove(&old);
            }
        }
        true
    }
}

fn classify_fresh(frame: &Ax25Frame) -> Classification {
    match frame.frame_type() {
        FrameType::S => Classification::AckOnly,
        FrameType::U => match frame.control {
            Control::U {
                kind: UFrame::Sabm | UFrame::Ua | UFrame::Disc | UFrame::Dm | UFrame::Frmr,
                ..
            } => Classification::SessionControl,
            _ => Classification::Unknown,
        },
        FrameType::Ui => {
            if is_nodes_broadcast(frame) {
                Classification::RoutingBroadcast
            } else if BEACON_DESTINATIONS.contains(&frame.dest.callsign()) {
                Classification::UiBeacon
            } else if frame.info.is_empty() {
                Classification::UiBeacon
            } else {
                Classification::DataProgress
            }
        }
        FrameType::I => {
            if frame.info.is_empty() {
                Classification::AckOnly
            } else {
                Classification::DataProgress
            }
        }
    }
}

/// Digest over the fields that identify a transmission; a digi retransmission
/// (same content, H bits flipped) hashes identically because address equality
/// ignores the repeated flag.
fn frame_digest(frame: &Ax25Frame) -> u64 {
    let mut hasher = DefaultHasher::new();
    frame.source.hash(&mut hasher);
    frame.dest.hash(&mut hasher);
    frame.control.encode().hash(&mut hasher);
    frame.pid.hash(&mut hasher);
    frame.info.hash(&mut hasher);
    hasher.finish()
}
