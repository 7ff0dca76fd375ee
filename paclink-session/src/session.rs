//! The AX.25 v2.2 connected-mode state machine, one instance per
//! `(local, remote, path, channel)` key.
//!
//! The session is a pure state machine: frames go in through
//! `handle_frame`, the clock goes in through `poll_timers`, and outbound
//! frames come back as return values. Application-visible changes are
//! queued as [`SessionEvent`]s and drained with `poll_event`.

use crate::config::SessionConfig;
use crate::error::SessionError;
use paclink_proto::address::{Address, DigiPath};
use paclink_proto::frame::{Ax25Frame, Control, SFrame, UFrame};
use rand::Rng;
use std::collections::VecDeque;
use std::fmt;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// Identity of a session.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SessionKey {
    pub local: Address,
    pub remote: Address,
    pub path: DigiPath,
    /// KISS port the session runs over.
    pub channel: u8,
}

/// Connection lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Disconnected,
    AwaitingConnection,
    Connected,
    AwaitingRelease,
    TimerRecovery,
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SessionState::Disconnected => "disconnected",
            SessionState::AwaitingConnection => "awaiting-connection",
            SessionState::Connected => "connected",
            SessionState::AwaitingRelease => "awaiting-release",
            SessionState::TimerRecovery => "timer-recovery",
        };
        write!(f, "{name}")
    }
}

/// Events surfaced to the coordinator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    StateChanged {
        old: SessionState,
        new: SessionState,
    },
    /// The handshake completed (either side).
    Connected,
    /// The peer refused our SABM with DM.
    Rejected,
    /// Retry budget exhausted.
    Timeout,
    /// In-sequence information delivered exactly once.
    DataReceived(Vec<u8>),
    /// The peer acknowledged this many of our I frames: reverse-path
    /// delivery evidence for the link-quality estimator.
    FramesAcked(usize),
    /// Orderly release completed.
    Disconnected,
    /// Frames still queued or unacknowledged when the session died.
    QueuedFramesFailed(usize),
}

/// An I frame that has been transmitted but not yet acknowledged.
#[derive(Debug, Clone)]
struct SentFrame {
    ns: u8,
    payload: Vec<u8>,
}

/// One AX.25 connected-mode session.
pub struct Ax25Session {
    key: SessionKey,
    config: SessionConfig,
    state: SessionState,
    /// Send state variable: N(S) of the next new I frame.
    vs: u8,
    /// Receive state variable: the N(S) we expect next.
    vr: u8,
    /// Acknowledge state variable: the oldest unacknowledged N(S).
    va: u8,
    /// Payloads accepted from the application but not yet transmitted.
    send_queue: VecDeque<Vec<u8>>,
    /// Transmitted, unacknowledged I frames in N(S) order.
    sent_unacked: VecDeque<SentFrame>,
    peer_busy: bool,
    /// REJ-once suppression until recovery.
    rej_sent: bool,
    retry_count: u32,
    t1_expiry: Option<Instant>,
    t2_expiry: Option<Instant>,
    t3_expiry: Option<Instant>,
    events: VecDeque<SessionEvent>,
    rng: rand::rngs::StdRng,
}

impl Ax25Session {
    pub fn new(key: SessionKey, config: SessionConfig, rng: rand::rngs::StdRng) -> Self {
        Self {
            key,
            config,
            state: SessionState::Disconnected,
            vs: 0,
            vr: 0,
            va: 0,
            send_queue: VecDeque::new(),
            sent_unacked: VecDeque::new(),
            peer_busy: false,
            rej_sent: false,
            retry_count: 0,
            t1_expiry: None,
            t2_expiry: None,
            t3_expiry: None,
            events: VecDeque::new(),
            rng,
        }
    }

    pub fn key(&self) -> &SessionKey {
        &self.key
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    /// The configuration frozen at creation.
    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    pub fn vs(&self) -> u8 {
        self.vs
    }

    pub fn vr(&self) -> u8 {
        self.vr
    }

    pub fn va(&self) -> u8 {
        self.va
    }

    pub fn poll_event(&mut self) -> Option<SessionEvent> {
        self.events.pop_front()
    }

    /// Payloads accepted but not yet acknowledged (queued plus in flight).
    /// Callers use this as back-pressure before queueing more bulk data.
    pub fn pending_send(&self) -> usize {
        self.send_queue.len() + self.sent_unacked.len()
    }

    /// The earliest instant at which `poll_timers` has work to do.
    pub fn next_wakeup(&self) -> Option<Instant> {
        [self.t1_expiry, self.t2_expiry, self.t3_expiry]
            .into_iter()
            .flatten()
            .min()
    }

    /// Initiates the connection handshake.
    pub fn connect(&mut self, now: Instant) -> Vec<Ax25Frame> {
        match self.state {
            SessionState::Disconnected => {
                self.retry_count = 0;
                self.set_state(SessionState::AwaitingConnection);
                self.start_t1(now);
                vec![self.sabm()]
            }
            _ => Vec::new(),
        }
    }

    /// Initiates an orderly release.
    pub fn disconnect(&mut self, now: Instant) -> Vec<Ax25Frame> {
        match self.state {
            SessionState::Connected | SessionState::TimerRecovery => {
                self.retry_count = 0;
                self.set_state(SessionState::AwaitingRelease);
                self.start_t1(now);
                vec![self.disc()]
            }
            SessionState::Disconnected | SessionState::AwaitingRelease => Vec::new(),
            SessionState::AwaitingConnection => {
                self.stop_timers();
                self.fail_pending();
                self.set_state(SessionState::Disconnected);
                self.events.push_back(SessionEvent::Disconnected);
                Vec::new()
            }
        }
    }

    /// Accepts application data for reliable delivery, splitting it into
    /// I frames of at most `paclen` bytes.
    pub fn send_data(&mut self, data: &[u8], now: Instant) -> Result<Vec<Ax25Frame>, SessionError> {
        if !matches!(
            self.state,
            SessionState::Connected | SessionState::TimerRecovery
        ) {
            return Err(SessionError::NotConnected);
        }
        let paclen = self.config.paclen.max(1) as usize;
        for chunk in data.chunks(paclen) {
            self.send_queue.push_back(chunk.to_vec());
        }
        let mut out = Vec::new();
        if self.state == SessionState::Connected {
            self.pump(now, &mut out);
        }
        Ok(out)
    }

    /// Processes one inbound frame addressed to this session.
    pub fn handle_frame(&mut self, frame: &Ax25Frame, now: Instant) -> Vec<Ax25Frame> {
        let mut out = Vec::new();
        match frame.control {
            Control::U { kind, poll } => self.handle_unnumbered(kind, poll, now, &mut out),
            Control::S { kind, nr, poll } => {
                self.handle_supervisory(kind, nr, poll, frame.command, now, &mut out)
            }
            Control::I { ns, nr, poll } => {
                self.handle_information(ns, nr, poll, &frame.info, now, &mut out)
            }
        }
        out
    }

    /// Fires any expired timers.
    pub fn poll_timers(&mut self, now: Instant) -> Vec<Ax25Frame> {
        let mut out = Vec::new();
        if self.t2_expiry.is_some_and(|t| now >= t) {
            self.t2_expiry = None;
            if matches!(
                self.state,
                SessionState::Connected | SessionState::TimerRecovery
            ) {
                out.push(self.rr_response(false));
            }
        }
        if self.t1_expiry.is_some_and(|t| now >= t) {
            self.t1_expiry = None;
            self.on_t1_expiry(now, &mut out);
        }
        if self.t3_expiry.is_some_and(|t| now >= t) {
            self.t3_expiry = None;
            if self.state == SessionState::Connected {
                // Idle probe: enter timer recovery to confirm the peer is
                // still there.
                debug!(key = %self.key.remote, "idle probe");
                self.enter_timer_recovery(now, &mut out);
            }
        }
        out
    }

    fn on_t1_expiry(&mut self, now: Instant, out: &mut Vec<Ax25Frame>) {
        match self.state {
            SessionState::AwaitingConnection => {
                if self.retry_count < self.config.max_retries {
                    self.retry_count += 1;
                    self.start_t1(now);
                    out.push(self.sabm());
                } else {
                    self.give_up(SessionEvent::Timeout);
                }
            }
            SessionState::Connected => {
                self.enter_timer_recovery(now, out);
            }
            SessionState::TimerRecovery => {
                if self.retry_count < self.config.max_retries {
                    self.retry_count += 1;
                    self.start_t1(now);
                    out.push(self.rr_command());
                } else {
                    self.give_up(SessionEvent::Timeout);
                }
            }
            SessionState::AwaitingRelease => {
                if self.retry_count < self.config.max_retries {
                    self.retry_count += 1;
                    self.start_t1(now);
                    out.push(self.disc());
                } else {
                    self.give_up(SessionEvent::Disconnected);
                }
            }
            SessionState::Disconnected => {}
        }
    }

    fn enter_timer_recovery(&mut self, now: Instant, out: &mut Vec<Ax25Frame>) {
        self.retry_count = 1;
        self.set_state(SessionState::TimerRecovery);
        self.start_t1(now);
        out.push(self.rr_command());
    }

    fn handle_unnumbered(
        &mut self,
        kind: UFrame,
        poll: bool,
        now: Instant,
        out: &mut Vec<Ax25Frame>,
    ) {
        match (self.state, kind) {
            (SessionState::Disconnected, UFrame::Sabm) => {
                self.reset_counters();
                self.set_state(SessionState::Connected);
                self.arm_t3(now);
                self.events.push_back(SessionEvent::Connected);
                out.push(self.ua(poll));
            }
            (SessionState::Disconnected, UFrame::Disc) => {
                out.push(self.dm(poll));
            }
            (SessionState::Disconnected, _) => {}

            (SessionState::AwaitingConnection, UFrame::Ua) => {
                self.stop_t1();
                self.reset_counters();
                self.set_state(SessionState::Connected);
                self.arm_t3(now);
                self.events.push_back(SessionEvent::Connected);
                let mut frames = Vec::new();
                self.pump(now, &mut frames);
                out.extend(frames);
            }
            (SessionState::AwaitingConnection, UFrame::Dm) => {
                self.stop_timers();
                self.fail_pending();
                self.set_state(SessionState::Disconnected);
                self.events.push_back(SessionEvent::Rejected);
            }
            (SessionState::AwaitingConnection, UFrame::Sabm) => {
                // Simultaneous SABM: acknowledge and treat as established.
                self.stop_t1();
                self.reset_counters();
                self.set_state(SessionState::Connected);
                self.arm_t3(now);
                self.events.push_back(SessionEvent::Connected);
                out.push(self.ua(poll));
            }
            (SessionState::AwaitingConnection, _) => {}

            (SessionState::Connected | SessionState::TimerRecovery, UFrame::Sabm) => {
                // Link reset by the peer.
                warn!(remote = %self.key.remote, "link reset by peer");
                self.fail_pending();
                self.reset_counters();
                self.set_state(SessionState::Connected);
                self.arm_t3(now);
                out.push(self.ua(poll));
            }
            (SessionState::Connected | SessionState::TimerRecovery, UFrame::Disc) => {
                self.stop_timers();
                self.fail_pending();
                self.set_state(SessionState::Disconnected);
                self.events.push_back(SessionEvent::Disconnected);
                out.push(self.ua(poll));
            }
            (SessionState::Connected | SessionState::TimerRecovery, UFrame::Dm) => {
                self.stop_timers();
                self.fail_pending();
                self.set_state(SessionState::Disconnected);
                self.events.push_back(SessionEvent::Disconnected);
            }
            (SessionState::Connected | SessionState::TimerRecovery, _) => {}

            (SessionState::AwaitingRelease, UFrame::Ua | UFrame::Dm) => {
                self.stop_timers();
                self.set_state(SessionState::Disconnected);
                self.events.push_back(SessionEvent::Disconnected);
            }
            (SessionState::AwaitingRelease, UFrame::Disc) => {
                out.push(self.ua(poll));
            }
            (SessionState::AwaitingRelease, _) => {}
        }
    }

    fn handle_supervisory(
        &mut self,
        kind: SFrame,
        nr: u8,
        poll: bool,
        command: bool,
        now: Instant,
        out: &mut Vec<Ax25Frame>,
    ) {
        match self.state {
            SessionState::Disconnected => {
                out.push(self.dm(poll));
                return;
            }
            SessionState::AwaitingConnection | SessionState::AwaitingRelease => return,
            SessionState::Connected | SessionState::TimerRecovery => {}
        }

        match kind {
            SFrame::Rr => {
                self.peer_busy = false;
                self.apply_ack(nr, now);
            }
            SFrame::Rnr => {
                self.peer_busy = true;
                self.apply_ack(nr, now);
            }
            SFrame::Rej => {
                self.peer_busy = false;
                self.apply_ack(nr, now);
                self.retransmit_from(nr, now, out);
            }
            SFrame::Srej => {
                // SREJ names one missing frame and acknowledges nothing.
                self.retransmit_one(nr, out);
            }
        }

        if self.state == SessionState::TimerRecovery && poll && !command {
            // The F bit answers our RR(P=1): recovery is over.
            self.retry_count = 0;
            self.set_state(SessionState::Connected);
            if self.sent_unacked.is_empty() {
                self.stop_t1();
            } else {
                self.retransmit_from(self.va, now, out);
                self.start_t1(now);
            }
        } else if poll && command {
            // A status poll from the peer; answer with F=1. Responses are
            // never re-answered, so two stations cannot RR each other
            // forever.
            out.push(self.rr_response(true));
        }

        let mut frames = Vec::new();
        if self.state == SessionState::Connected && !self.peer_busy {
            self.pump(now, &mut frames);
        }
        out.extend(frames);
        self.arm_t3(now);
    }

    #[allow(clippy::too_many_arguments)]
    fn handle_information(
        &mut self,
        ns: u8,
        nr: u8,
        poll: bool,
        info: &[u8],
        now: Instant,
        out: &mut Vec<Ax25Frame>,
    ) {
        match self.state {
            SessionState::Disconnected => {
                out.push(self.dm(poll));
                return;
            }
            SessionState::AwaitingConnection | SessionState::AwaitingRelease => return,
            SessionState::Connected | SessionState::TimerRecovery => {}
        }

        self.apply_ack(nr, now);

        if ns == self.vr {
            self.vr = (self.vr + 1) & 0x07;
            self.rej_sent = false;
            self.events
                .push_back(SessionEvent::DataReceived(info.to_vec()));
            if poll {
                // Answer the poll immediately; this is the acknowledgment.
                self.t2_expiry = None;
                out.push(self.rr_response(true));
            } else if self.t2_expiry.is_none() {
                self.t2_expiry = Some(now + self.config.ack_timer);
            }
        } else {
            // Out of sequence (or duplicate): discard, reject once.
            if !self.rej_sent {
                self.rej_sent = true;
                let kind = if self.config.srej_enabled {
                    SFrame::Srej
                } else {
                    SFrame::Rej
                };
                out.push(self.supervisory(kind, poll));
            } else if poll {
                out.push(self.rr_response(true));
            }
        }

        let mut frames = Vec::new();
        if self.state == SessionState::Connected && !self.peer_busy {
            self.pump(now, &mut frames);
        }
        out.extend(frames);
        self.arm_t3(now);
    }

    /// Advances V(A) for a received N(R), releasing acknowledged frames.
    fn apply_ack(&mut self, nr: u8, now: Instant) {
        if !self.nr_valid(nr) {
            return;
        }
        let advanced = self.va != nr;
        let mut released = 0;
        while self.va != nr {
            if self.sent_unacked.front().is_some_and(|f| f.ns == self.va) {
                self.sent_unacked.pop_front();
                released += 1;
            }
            self.va = (self.va + 1) & 0x07;
        }
        if advanced {
            self.events.push_back(SessionEvent::FramesAcked(released));
            self.retry_count = 0;
            if self.sent_unacked.is_empty() {
                self.stop_t1();
                self.arm_t3(now);
            } else {
                self.start_t1(now);
            }
        }
    }

    /// True when N(R) lies in the window V(A)..=V(S).
    fn nr_valid(&self, nr: u8) -> bool {
        let span = (self.vs.wrapping_sub(self.va)) & 0x07;
        let off = (nr.wrapping_sub(self.va)) & 0x07;
        off <= span
    }

    fn retransmit_from(&mut self, nr: u8, now: Instant, out: &mut Vec<Ax25Frame>) {
        let frames: Vec<SentFrame> = self
            .sent_unacked
            .iter()
            .filter(|f| {
                let off = (f.ns.wrapping_sub(nr)) & 0x07;
                let span = (self.vs.wrapping_sub(nr)) & 0x07;
                off < span
            })
            .cloned()
            .collect();
        if frames.is_empty() {
            return;
        }
        debug!(remote = %self.key.remote, count = frames.len(), "retransmitting from N(R)");
        for f in frames {
            out.push(self.i_frame(f.ns, false, f.payload));
        }
        self.start_t1(now);
    }

    fn retransmit_one(&mut self, ns: u8, out: &mut Vec<Ax25Frame>) {
        if let Some(f) = self.sent_unacked.iter().find(|f| f.ns == ns).cloned() {
            out.push(self.i_frame(f.ns, false, f.payload));
        }
    }

    /// Transmits queued payloads while the window is open.
    fn pump(&mut self, now: Instant, out: &mut Vec<Ax25Frame>) {
        while !self.peer_busy
            && self.outstanding() < self.config.window_size
            && !self.send_queue.is_empty()
        {
            let payload = self.send_queue.pop_front().unwrap_or_default();
            let ns = self.vs;
            self.vs = (self.vs + 1) & 0x07;
            self.sent_unacked.push_back(SentFrame {
                ns,
                payload: payload.clone(),
            });
            // I frames piggyback the current V(R); a pending delayed ack is
            // satisfied by them.
            self.t2_expiry = None;
            out.push(self.i_frame(ns, false, payload));
        }
        if !self.sent_unacked.is_empty() && self.t1_expiry.is_none() {
            self.start_t1(now);
        }
        self.arm_t3(now);
    }

    fn outstanding(&self) -> u8 {
        (self.vs.wrapping_sub(self.va)) & 0x07
    }

    fn reset_counters(&mut self) {
        self.vs = 0;
        self.vr = 0;
        self.va = 0;
        self.peer_busy = false;
        self.rej_sent = false;
        self.retry_count = 0;
    }

    /// Terminal failure: report and drop everything still pending.
    fn give_up(&mut self, event: SessionEvent) {
        self.stop_timers();
        self.fail_pending();
        self.set_state(SessionState::Disconnected);
        self.events.push_back(event);
    }

    fn fail_pending(&mut self) {
        let failed = self.send_queue.len() + self.sent_unacked.len();
        if failed > 0 {
            self.events
                .push_back(SessionEvent::QueuedFramesFailed(failed));
        }
        self.send_queue.clear();
        self.sent_unacked.clear();
    }

    fn set_state(&mut self, new: SessionState) {
        if self.state != new {
            let old = self.state;
            self.state = new;
            debug!(remote = %self.key.remote, %old, %new, "session state");
            self.events
                .push_back(SessionEvent::StateChanged { old, new });
        }
    }

    /// T1 with exponential backoff and a little jitter so simultaneous
    /// retries from both ends do not stay in lockstep.
    fn start_t1(&mut self, now: Instant) {
        let base = self.config.rto();
        let shift = self.retry_count.min(6);
        let backed_off = base
            .saturating_mul(1u32 << shift)
            .clamp(self.config.rto_min, self.config.rto_max);
        let jitter_ms = self.rng.gen_range(0..=(backed_off.as_millis() as u64 / 10).max(1));
        self.t1_expiry = Some(now + backed_off + Duration::from_millis(jitter_ms));
    }

    fn stop_t1(&mut self) {
        self.t1_expiry = None;
    }

    fn stop_timers(&mut self) {
        self.t1_expiry = None;
        self.t2_expiry = None;
        self.t3_expiry = None;
    }

    fn arm_t3(&mut self, now: Instant) {
        if self.state == SessionState::Connected && self.sent_unacked.is_empty() {
            self.t3_expiry = Some(now + self.config.idle_probe);
        } else {
            self.t3_expiry = None;
        }
    }

    // Frame constructors bound to this session's addressing.

    fn sabm(&self) -> Ax25Frame {
        Ax25Frame::sabm(
            self.key.local.clone(),
            self.key.remote.clone(),
            self.key.path.clone(),
        )
    }

    fn disc(&self) -> Ax25Frame {
        Ax25Frame::disc(
            self.key.local.clone(),
            self.key.remote.clone(),
            self.key.path.clone(),
        )
    }

    fn ua(&self, fin: bool) -> Ax25Frame {
        Ax25Frame::ua(
            self.key.local.clone(),
            self.key.remote.clone(),
            self.key.path.clone(),
            fin,
        )
    }

    fn dm(&self, fin: bool) -> Ax25Frame {
        Ax25Frame::dm(
            self.key.local.clone(),
            self.key.remote.clone(),
            self.key.path.clone(),
            fin,
        )
    }

    fn i_frame(&self, ns: u8, poll: bool, payload: Vec<u8>) -> Ax25Frame {
        Ax25Frame::i_frame(
            self.key.local.clone(),
            self.key.remote.clone(),
            self.key.path.clone(),
            ns,
            self.vr,
            poll,
            payload,
        )
    }

    fn supervisory(&self, kind: SFrame, fin: bool) -> Ax25Frame {
        Ax25Frame::supervisory(
            self.key.local.clone(),
            self.key.remote.clone(),
            self.key.path.clone(),
            kind,
            self.vr,
            fin,
        )
    }

    fn rr_response(&self, fin: bool) -> Ax25Frame {
        self.supervisory(SFrame::Rr, fin)
    }

    fn rr_command(&self) -> Ax25Frame {
        Ax25Frame::supervisory_command(
            self.key.local.clone(),
            self.key.remote.clone(),
            self.key.path.clone(),
            SFrame::Rr,
            self.vr,
            true,
        )
    }
}

impl fmt::Debug for Ax25Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Ax25Session")
            .field("remote", &self.key.remote.to_string())
            .field("state", &self.state)
            .field("vs", &self.vs)
            .field("vr", &self.vr)
            .field("va", &self.va)
            .finish()
    }
}
