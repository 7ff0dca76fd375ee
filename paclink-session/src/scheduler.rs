//! Prioritized transmit scheduling with per-destination token buckets.
//!
//! Frames dequeue strictly by priority class (interactive before normal
//! before bulk) and FIFO within a class, except that a frame whose
//! destination has no tokens is skipped in place so other destinations are
//! not head-of-line blocked.

use crate::error::SessionError;
use paclink_proto::address::Address;
use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::time::Instant;
use tracing::debug;

/// Scheduler-assigned frame identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FrameId(pub u64);

impl fmt::Display for FrameId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Transmit priority classes, highest first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(u8)]
pub enum TxPriority {
    Interactive = 0,
    Normal = 1,
    Bulk = 2,
}

const NUM_PRIORITIES: usize = 3;

/// Per-frame lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxFrameState {
    Queued,
    Sending,
    Sent,
    Acked,
    Failed,
    Cancelled,
}

/// One frame under scheduler management.
#[derive(Debug, Clone)]
pub struct TxFrame {
    pub id: FrameId,
    pub destination: Address,
    pub source: Address,
    pub payload: Vec<u8>,
    pub priority: TxPriority,
    pub state: TxFrameState,
    /// Caller-supplied group tag (e.g. a bulk-transfer id) so one
    /// transfer's frames can be cancelled without sweeping the whole
    /// destination.
    pub tag: Option<u64>,
    pub attempts: u32,
    pub sent_at: Option<Instant>,
    pub acked_at: Option<Instant>,
    pub error: Option<String>,
}

#[derive(Debug)]
struct TokenBucket {
    tokens: f64,
    last_refill: Instant,
}

impl TokenBucket {
    fn new(burst: f64, now: Instant) -> Self {
        Self {
            tokens: burst,
            last_refill: now,
        }
    }

    fn refill(&mut self, rate: f64, burst: f64, now: Instant) {
        let elapsed = now.saturating_duration_since(self.last_refill).as_secs_f64();
        self.tokens = (self.tokens + elapsed * rate).min(burst);
        self.last_refill = now;
    }

    fn try_take(&mut self) -> bool {
        if self.tokens >= 1.0 {
            self.tokens -= 1.0;
            true
        } else {
            false
        }
    }
}

/// The transmit scheduler.
#[derive(Debug)]
pub struct TxScheduler {
    next_id: u64,
    frames: HashMap<FrameId, TxFrame>,
    queues: [VecDeque<FrameId>; NUM_PRIORITIES],
    buckets: HashMap<Address, TokenBucket>,
    /// Tokens per second granted to each destination.
    rate: f64,
    /// Bucket capacity per destination.
    burst: f64,
}

impl TxScheduler {
    pub fn new(rate: f64, burst: f64) -> Self {
        Self {
            next_id: 1,
            frames: HashMap::new(),
            queues: Default::default(),
            buckets: HashMap::new(),
            rate: rate.max(f64::MIN_POSITIVE),
            burst: burst.max(1.0),
        }
    }

    pub fn queued_len(&self) -> usize {
        self.queues.iter().map(|q| q.len()).sum()
    }

    pub fn frame(&self, id: FrameId) -> Option<&TxFrame> {
        self.frames.get(&id)
    }

    /// Accepts a frame for transmission.
    pub fn enqueue(
        &mut self,
        source: Address,
        destination: Address,
        payload: Vec<u8>,
        priority: TxPriority,
    ) -> FrameId {
        self.enqueue_tagged(source, destination, payload, priority, None)
    }

    /// Accepts a frame carrying a group tag.
    pub fn enqueue_tagged(
        &mut self,
        source: Address,
        destination: Address,
        payload: Vec<u8>,
        priority: TxPriority,
        tag: Option<u64>,
    ) -> FrameId {
        let id = FrameId(self.next_id);
        self.next_id += 1;
        self.frames.insert(
            id,
            TxFrame {
                id,
                destination,
                source,
                payload,
                priority,
                state: TxFrameState::Queued,
                tag,
                attempts: 0,
                sent_at: None,
                acked_at: None,
                error: None,
            },
        );
        self.queues[priority as usize].push_back(id);
        id
    }

    /// Picks the next frame allowed to transmit, honoring priority order,
    /// FIFO within a class, and each destination's token bucket. Returns
    /// `None` when the queues are empty or every queued destination is
    /// rate-limited.
    pub fn dequeue(&mut self, now: Instant) -> Option<TxFrame> {
        let (rate, burst) = (self.rate, self.burst);
        for queue in self.queues.iter_mut() {
            let mut picked: Option<usize> = None;
            for (pos, id) in queue.iter().enumerate() {
                let Some(frame) = self.frames.get(id) else {
                    continue;
                };
                if frame.state != TxFrameState::Queued {
                    continue;
                }
                let bucket = self
                    .buckets
                    .entry(frame.destination.clone())
                    .or_insert_with(|| TokenBucket::new(burst, now));
                bucket.refill(rate, burst, now);
                if bucket.try_take() {
                    picked = Some(pos);
                    break;
                }
                // Destination out of tokens; leave the frame in place and
                // look further down the queue.
            }
            if let Some(pos) = picked {
                let id = queue.remove(pos).unwrap_or(FrameId(0));
                // Drop any stale ids (cancelled frames) ahead of the pick.
                if let Some(frame) = self.frames.get_mut(&id) {
                    frame.state = TxFrameState::Sending;
                    frame.attempts += 1;
                    debug!(id = %id, dest = %frame.destination, "dequeued for transmit");
                    return Some(frame.clone());
                }
            }
        }
        None
    }

    /// Marks a frame as handed to the link.
    pub fn mark_sent(&mut self, id: FrameId, now: Instant) -> Result<(), SessionError> {
        let frame = self.frames.get_mut(&id).ok_or(SessionError::UnknownFrame)?;
        if frame.state == TxFrameState::Sending {
            frame.state = TxFrameState::Sent;
            frame.sent_at = Some(now);
        }
        Ok(())
    }

    /// Marks a frame acknowledged by the peer.
    pub fn mark_acked(&mut self, id: FrameId, now: Instant) -> Result<(), SessionError> {
        let frame = self.frames.get_mut(&id).ok_or(SessionError::UnknownFrame)?;
        if matches!(frame.state, TxFrameState::Sending | TxFrameState::Sent) {
            frame.state = TxFrameState::Acked;
            frame.acked_at = Some(now);
        }
        Ok(())
    }

    /// Marks a frame terminally failed.
    pub fn mark_failed(&mut self, id: FrameId, reason: &str) -> Result<(), SessionError> {
        let frame = self.frames.get_mut(&id).ok_or(SessionError::UnknownFrame)?;
        if !matches!(frame.state, TxFrameState::Acked | TxFrameState::Cancelled) {
            frame.state = TxFrameState::Failed;
            frame.error = Some(reason.to_string());
        }
        Ok(())
    }

    /// Returns a frame that was being sent to the queue, keeping its
    /// attempt count.
    pub fn requeue_for_retry(&mut self, id: FrameId) -> Result<(), SessionError> {
        let frame = self.frames.get_mut(&id).ok_or(SessionError::UnknownFrame)?;
        if frame.state != TxFrameState::Sending {
            return Ok(());
        }
        frame.state = TxFrameState::Queued;
        let priority = frame.priority as usize;
        self.queues[priority].push_front(id);
        Ok(())
    }

    /// Cancels a frame. Idempotent; a cancelled frame can never dequeue.
    pub fn cancel(&mut self, id: FrameId) {
        if let Some(frame) = self.frames.get_mut(&id) {
            if !matches!(frame.state, TxFrameState::Acked | TxFrameState::Failed) {
                frame.state = TxFrameState::Cancelled;
            }
            let priority = frame.priority as usize;
            self.queues[priority].retain(|&qid| qid != id);
        }
    }

    /// Cancels every pending frame carrying `tag`; returns the ids hit.
    /// Frames to the same destination without the tag are untouched.
    pub fn cancel_tagged(&mut self, tag: u64) -> Vec<FrameId> {
        let ids: Vec<FrameId> = self
            .frames
            .values()
            .filter(|f| {
                f.tag == Some(tag)
                    && matches!(f.state, TxFrameState::Queued | TxFrameState::Sending)
            })
            .map(|f| f.id)
            .collect();
        for &id in &ids {
            self.cancel(id);
        }
        ids
    }

    /// Drops terminal frames older than the caller cares about.
    pub fn forget(&mut self, id: FrameId) {
        if self
            .frames
            .get(&id)
            .is_some_and(|f| {
                matches!(
                    f.state,
                    TxFrameState::Acked | TxFrameState::Failed | TxFrameState::Cancelled
                )
            })
        {
            self.frames.remove(&id);
        }
    }
}
