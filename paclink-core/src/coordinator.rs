//! The session coordinator: single ingest point for decoded frames, owner
//! of every protocol table, producer of outbound frames and core events.
//!
//! All outbound frames pass through the transmit scheduler, so one noisy
//! destination cannot starve the others; frames for one session still
//! leave in N(S) order because scheduling is FIFO within a priority class
//! and per-destination.

use crate::capability::{CapabilityCache, CapabilityStatus};
use crate::config::CoreConfig;
use crate::error::CoreError;
use crate::events::CoreEvent;
use crate::transfer::{BulkTransfer, InboundTransfer, TransferId, TransferStatus};
use paclink_proto::address::{Address, DigiPath};
use paclink_proto::axdp::{
    AxdpMessage, Capabilities, Compression, MessageKind, MessageStream, SackBitmap,
    MSG_ID_COMPLETION_REQUEST, MSG_ID_TRANSFER_COMPLETE,
};
use paclink_proto::classify::PacketClassifier;
use paclink_proto::frame::{Ax25Frame, Control, FrameType, UFrame};
use paclink_proto::netrom::{decode_nodes, is_nodes_broadcast};
use paclink_proto::time::TimeProvider;
use paclink_route::{LinkKey, LinkQualityEstimator, NetRomRouter};
use paclink_session::adaptive::{AdaptiveConfigStore, LinkQualitySample, RouteAdaptiveKey};
use paclink_session::scheduler::{FrameId, TxPriority, TxScheduler};
use paclink_session::{Ax25Session, SessionEvent, SessionKey, SessionState};
use rand::rngs::StdRng;
use rand::{RngCore, SeedableRng};
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// How a dispatched AXDP message reached us.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Carriage {
    Session,
    Ui,
}

#[derive(Debug)]
struct UiStream {
    stream: MessageStream,
    last_activity_ms: i64,
}

pub struct SessionCoordinator {
    local: Address,
    config: CoreConfig,
    time: Arc<dyn TimeProvider>,
    rng: StdRng,
    classifier: PacketClassifier,
    sessions: HashMap<SessionKey, Ax25Session>,
    /// Sessions this station initiated (capability pings go out on these).
    initiated: HashSet<SessionKey>,
    session_streams: HashMap<SessionKey, MessageStream>,
    ui_streams: HashMap<Address, UiStream>,
    adaptive: AdaptiveConfigStore,
    router: NetRomRouter,
    links: LinkQualityEstimator,
    scheduler: TxScheduler,
    /// Frames handed to the scheduler, reclaimed at dequeue time.
    scheduled_frames: HashMap<FrameId, Ax25Frame>,
    capabilities: CapabilityCache,
    outbound_transfers: HashMap<u16, BulkTransfer>,
    inbound_transfers: HashMap<(Address, u16), InboundTransfer>,
    /// Next chunk index to generate per outbound transfer.
    transfer_cursor: HashMap<u16, u32>,
    events: VecDeque<CoreEvent>,
    outbound: VecDeque<Ax25Frame>,
    auto_negotiate: bool,
    next_transfer_id: u64,
    next_axdp_session: u16,
    last_processed_packet_id: i64,
    subscribed: bool,
}

impl SessionCoordinator {
    pub fn new(
        local: Address,
        config: CoreConfig,
        rng: StdRng,
        time: Arc<dyn TimeProvider>,
    ) -> Self {
        let auto_negotiate = config.auto_negotiate;
        Self {
            router: NetRomRouter::new(local.clone(), config.router),
            links: LinkQualityEstimator::new(config.link_quality),
            scheduler: TxScheduler::new(config.scheduler_rate, config.scheduler_burst),
            adaptive: AdaptiveConfigStore::new(config.session),
            local,
            config,
            time,
            rng,
            classifier: PacketClassifier::new(),
            sessions: HashMap::new(),
            initiated: HashSet::new(),
            session_streams: HashMap::new(),
            ui_streams: HashMap::new(),
            scheduled_frames: HashMap::new(),
            capabilities: CapabilityCache::new(),
            outbound_transfers: HashMap::new(),
            inbound_transfers: HashMap::new(),
            transfer_cursor: HashMap::new(),
            events: VecDeque::new(),
            outbound: VecDeque::new(),
            auto_negotiate,
            next_transfer_id: 1,
            next_axdp_session: 1,
            last_processed_packet_id: 0,
            subscribed: false,
        }
    }

    pub fn local(&self) -> &Address {
        &self.local
    }

    pub fn router(&self) -> &NetRomRouter {
        &self.router
    }

    pub fn router_mut(&mut self) -> &mut NetRomRouter {
        &mut self.router
    }

    pub fn links(&self) -> &LinkQualityEstimator {
        &self.links
    }

    pub fn adaptive(&self) -> &AdaptiveConfigStore {
        &self.adaptive
    }

    pub fn adaptive_mut(&mut self) -> &mut AdaptiveConfigStore {
        &mut self.adaptive
    }

    pub fn capabilities(&self) -> &CapabilityCache {
        &self.capabilities
    }

    pub fn last_processed_packet_id(&self) -> i64 {
        self.last_processed_packet_id
    }

    pub fn poll_event(&mut self) -> Option<CoreEvent> {
        self.events.pop_front()
    }

    /// Drains the frames ready for the transport, giving the scheduler a
    /// final chance to release what the token buckets allow.
    pub fn take_outbound(&mut self) -> Vec<Ax25Frame> {
        let now = self.time.now_instant();
        self.pump_scheduler(now);
        self.outbound.drain(..).collect()
    }

    /// Current status of a transfer in either direction.
    pub fn transfer_status(&self, id: TransferId) -> Option<TransferStatus> {
        self.outbound_transfers
            .values()
            .find(|t| t.id == id)
            .map(|t| t.status)
            .or_else(|| {
                self.inbound_transfers
                    .values()
                    .find(|t| t.id == id)
                    .map(|t| t.status)
            })
    }

    /// The AXDP session id carrying a transfer.
    pub fn transfer_axdp_session(&self, id: TransferId) -> Option<u16> {
        self.outbound_transfers
            .iter()
            .find(|(_, t)| t.id == id)
            .map(|(sid, _)| *sid)
            .or_else(|| {
                self.inbound_transfers
                    .iter()
                    .find(|(_, t)| t.id == id)
                    .map(|((_, sid), _)| *sid)
            })
    }

    /// Claims the single packet subscription. The transport wiring calls
    /// this once; a second caller must detach the first, never stack.
    pub fn attach_packet_source(&mut self) -> Result<(), CoreError> {
        if self.subscribed {
            return Err(CoreError::DuplicateSubscription);
        }
        self.subscribed = true;
        Ok(())
    }

    pub fn detach_packet_source(&mut self) {
        self.subscribed = false;
    }

    pub fn session_state(&self, remote: &Address) -> Option<SessionState> {
        self.sessions
            .values()
            .find(|s| s.key().remote == *remote)
            .map(|s| s.state())
    }

    /// Opens a connection to `remote`, snapshotting the adaptive config
    /// for the route at this moment.
    pub fn connect(&mut self, remote: Address, path: DigiPath) -> Result<(), CoreError> {
        let now = self.time.now_instant();
        let key = SessionKey {
            local: self.local.clone(),
            remote: remote.clone(),
            path: path.clone(),
            channel: self.config.channel,
        };
        let session_config = self.adaptive.session_config_for(&remote, &path.signature());
        let session = self.sessions.entry(key.clone()).or_insert_with(|| {
            Ax25Session::new(
                key.clone(),
                session_config,
                StdRng::seed_from_u64(self.rng.next_u64()),
            )
        });
        let frames = session.connect(now);
        if frames.is_empty() {
            return Err(CoreError::ConnectionFailed(format!(
                "session to {remote} is {}",
                session.state()
            )));
        }
        self.initiated.insert(key.clone());
        self.router
            .note_outgoing(&remote, self.time.now_system_ms());
        self.enqueue_frames(frames);
        self.drain_session_events(&key);
        Ok(())
    }

    pub fn disconnect(&mut self, remote: &Address) {
        let now = self.time.now_instant();
        let keys: Vec<SessionKey> = self
            .sessions
            .values()
            .filter(|s| s.key().remote == *remote)
            .map(|s| s.key().clone())
            .collect();
        for key in keys {
            if let Some(session) = self.sessions.get_mut(&key) {
                let frames = session.disconnect(now);
                self.enqueue_frames(frames);
                self.drain_session_events(&key);
            }
        }
    }

    /// Sends an AXDP chat message over an established session.
    pub fn send_chat(&mut self, remote: &Address, text: &str) -> Result<u32, CoreError> {
        let message_id = self.rng.next_u32();
        let msg = AxdpMessage::chat(0, message_id, text);
        self.send_axdp(remote, &msg, TxPriority::Interactive)?;
        Ok(message_id)
    }

    /// Sends raw bytes over an established session (a plain connected-mode
    /// terminal exchange, no AXDP framing).
    pub fn send_raw(&mut self, remote: &Address, data: &[u8]) -> Result<(), CoreError> {
        let now = self.time.now_instant();
        let key = self
            .connected_session(remote)
            .map(|s| s.key().clone())
            .ok_or_else(|| CoreError::NotConnected(remote.to_string()))?;
        if let Some(session) = self.sessions.get_mut(&key) {
            let frames = session.send_data(data, now)?;
            self.enqueue_frames(frames);
        }
        Ok(())
    }

    /// Starts a file transfer to `remote`; the peer must accept before
    /// chunks flow.
    pub fn send_file(
        &mut self,
        remote: &Address,
        filename: &str,
        data: &[u8],
        compression: Compression,
    ) -> Result<TransferId, CoreError> {
        let session = self
            .connected_session(remote)
            .ok_or_else(|| CoreError::NotConnected(remote.to_string()))?;
        let paclen = session.config().paclen;
        // Leave room for the AXDP header and chunk TLVs inside one I frame.
        let chunk_size = paclen.saturating_sub(48).max(16);

        let id = TransferId(self.next_transfer_id);
        self.next_transfer_id += 1;
        let sid = self.next_axdp_session;
        self.next_axdp_session = self.next_axdp_session.wrapping_add(1).max(1);

        let transfer = BulkTransfer::prepare(
            id,
            sid,
            remote.clone(),
            filename,
            data,
            compression,
            chunk_size,
        )?;
        info!(%id, file = filename, chunks = transfer.total_chunks(), "offering file");
        let meta = transfer.meta_message();
        self.outbound_transfers.insert(sid, transfer);
        self.transfer_cursor.insert(sid, 0);
        self.send_axdp_tagged(remote, &meta, TxPriority::Normal, Some(id.0))?;
        Ok(id)
    }

    /// Accepts a pending inbound transfer.
    pub fn accept_incoming(&mut self, id: TransferId) -> Result<(), CoreError> {
        let (source, sid) = self
            .find_inbound(id)
            .ok_or(CoreError::UnknownTransfer)?;
        let Some(transfer) = self.inbound_transfers.get_mut(&(source.clone(), sid)) else {
            return Err(CoreError::UnknownTransfer);
        };
        if transfer.status != TransferStatus::AwaitingAcceptance {
            return Err(CoreError::InvalidTransferState);
        }
        transfer.status = TransferStatus::Sending;
        let ack = AxdpMessage::ack(sid, 0);
        self.send_axdp(&source, &ack, TxPriority::Interactive)
    }

    /// Rejects a pending inbound transfer.
    pub fn reject_incoming(&mut self, id: TransferId) -> Result<(), CoreError> {
        let (source, sid) = self
            .find_inbound(id)
            .ok_or(CoreError::UnknownTransfer)?;
        self.inbound_transfers.remove(&(source.clone(), sid));
        let nack = AxdpMessage::nack(sid, 0, None);
        self.send_axdp(&source, &nack, TxPriority::Interactive)
    }

    /// Cancels an outbound transfer: no more chunks are generated and its
    /// queued frames drain from the scheduler.
    pub fn cancel_transfer(&mut self, id: TransferId) -> Result<(), CoreError> {
        let sid = self
            .outbound_transfers
            .iter()
            .find(|(_, t)| t.id == id)
            .map(|(sid, _)| *sid)
            .ok_or(CoreError::UnknownTransfer)?;
        let Some(transfer) = self.outbound_transfers.get_mut(&sid) else {
            return Err(CoreError::UnknownTransfer);
        };
        if transfer.is_terminal() {
            return Ok(());
        }
        transfer.status = TransferStatus::Cancelled;
        self.transfer_cursor.remove(&sid);
        for frame_id in self.scheduler.cancel_tagged(id.0) {
            self.scheduled_frames.remove(&frame_id);
        }
        self.events.push_back(CoreEvent::TransferFailed {
            id,
            reason: "cancelled".to_string(),
        });
        Ok(())
    }

    /// Turns auto capability negotiation on or off. Enabling it pings every
    /// currently connected session we initiated.
    pub fn set_auto_negotiate(&mut self, enabled: bool) {
        self.auto_negotiate = enabled;
        if !enabled {
            return;
        }
        let now_ms = self.time.now_system_ms();
        let peers: Vec<Address> = self
            .sessions
            .values()
            .filter(|s| {
                matches!(s.state(), SessionState::Connected | SessionState::TimerRecovery)
                    && self.initiated.contains(s.key())
            })
            .map(|s| s.key().remote.clone())
            .filter(|peer| self.capabilities.status(peer) == CapabilityStatus::Unknown)
            .collect();
        for peer in peers {
            self.send_capability_ping(&peer, now_ms);
        }
    }

    /// The single packet ingest point. Every decoded frame from the
    /// transport flows through here exactly once, in transport order.
    pub fn handle_packet(&mut self, frame: &Ax25Frame, packet_id: i64) {
        let now = self.time.now_instant();
        let now_ms = self.time.now_system_ms();
        self.last_processed_packet_id = self.last_processed_packet_id.max(packet_id);

        let (classification, is_duplicate) = self.classifier.classify(frame);

        if is_nodes_broadcast(frame) {
            match decode_nodes(&frame.source, &frame.info) {
                Ok(broadcast) => {
                    self.router.ingest_broadcast(&broadcast, now_ms);
                    self.events.push_back(CoreEvent::NodesBroadcastReceived {
                        origin: broadcast.origin.clone(),
                    });
                }
                Err(err) => debug!(%err, "dropping malformed NODES broadcast"),
            }
        }

        if frame.dest == self.local {
            // Link evidence applies only to the source→local direction we
            // actually measured; overheard traffic goes to inference below.
            self.links.observe(
                LinkKey::new(frame.source.clone(), self.local.clone()),
                classification,
                is_duplicate,
                now_ms,
            );
            self.router
                .observe_direct(&frame.source, classification, now_ms);
            self.feed_adaptive_sample(frame);
            self.handle_local_frame(frame, now, now_ms);
        } else {
            self.router.observe_third_party(
                &frame.source,
                &frame.dest,
                frame.path.hops(),
                now_ms,
            );
        }

        self.pump_transfers();
        self.pump_scheduler(now);
    }

    /// Fires expired session timers, capability timeouts, and housekeeping.
    pub fn poll_timers(&mut self) {
        let now = self.time.now_instant();
        let now_ms = self.time.now_system_ms();

        let keys: Vec<SessionKey> = self.sessions.keys().cloned().collect();
        for key in keys {
            if let Some(session) = self.sessions.get_mut(&key) {
                let frames = session.poll_timers(now);
                self.enqueue_frames(frames);
                self.drain_session_events(&key);
            }
        }

        for peer in self
            .capabilities
            .sweep_pending(self.config.peer_discovery_timeout_ms, now_ms)
        {
            self.events.push_back(CoreEvent::CapabilityChanged {
                peer,
                status: CapabilityStatus::Unsupported,
            });
        }

        let timeout = self.config.ui_reassembly_timeout_ms;
        self.ui_streams
            .retain(|_, s| now_ms - s.last_activity_ms < timeout);

        self.links.sweep(now_ms);
        self.pump_transfers();
        self.pump_scheduler(now);
    }

    /// Builds the state to persist.
    pub fn snapshot(&self, config_hash: Option<String>) -> paclink_sqlite::Snapshot {
        paclink_sqlite::Snapshot {
            neighbors: self.router.neighbors(),
            routes: self.router.routes(),
            link_stats: self.links.stats(),
            last_packet_id: self.last_processed_packet_id,
            config_hash,
            snapshot_timestamp_ms: self.time.now_system_ms(),
        }
    }

    /// Rehydrates router and estimator state. The caller then replays
    /// packets with ids beyond `last_packet_id`.
    pub fn restore_snapshot(&mut self, snapshot: &paclink_sqlite::Snapshot) {
        self.router
            .restore(snapshot.neighbors.clone(), snapshot.routes.clone());
        for stat in &snapshot.link_stats {
            self.links.restore(stat);
        }
        self.last_processed_packet_id = snapshot.last_packet_id;
    }

    // ---- internals -----------------------------------------------------

    fn handle_local_frame(&mut self, frame: &Ax25Frame, now: Instant, now_ms: i64) {
        if frame.frame_type() == FrameType::Ui {
            self.handle_local_ui(frame, now_ms);
            return;
        }

        let key = SessionKey {
            local: self.local.clone(),
            remote: frame.source.clone(),
            path: reverse_path(&frame.path),
            channel: self.config.channel,
        };

        if !self.sessions.contains_key(&key) {
            let is_sabm = matches!(
                frame.control,
                Control::U {
                    kind: UFrame::Sabm,
                    ..
                }
            );
            if !is_sabm {
                // No session: refuse connected-mode traffic with DM.
                if matches!(frame.frame_type(), FrameType::I | FrameType::S)
                    || matches!(
                        frame.control,
                        Control::U {
                            kind: UFrame::Disc,
                            ..
                        }
                    )
                {
                    let fin = match frame.control {
                        Control::I { poll, .. }
                        | Control::S { poll, .. }
                        | Control::U { poll, .. } => poll,
                    };
                    let dm = Ax25Frame::dm(
                        self.local.clone(),
                        frame.source.clone(),
                        key.path.clone(),
                        fin,
                    );
                    self.enqueue_frames(vec![dm]);
                }
                return;
            }
            let session_config = self
                .adaptive
                .session_config_for(&key.remote, &key.path.signature());
            self.sessions.insert(
                key.clone(),
                Ax25Session::new(
                    key.clone(),
                    session_config,
                    StdRng::seed_from_u64(self.rng.next_u64()),
                ),
            );
        }

        if let Some(session) = self.sessions.get_mut(&key) {
            let replies = session.handle_frame(frame, now);
            self.enqueue_frames(replies);
        }
        self.drain_session_events(&key);
    }

    fn handle_local_ui(&mut self, frame: &Ax25Frame, now_ms: i64) {
        if frame.info.is_empty() {
            return;
        }
        let source = frame.source.clone();
        let stream = self.ui_streams.entry(source.clone()).or_insert_with(|| UiStream {
            stream: MessageStream::new(),
            last_activity_ms: now_ms,
        });
        stream.last_activity_ms = now_ms;
        let messages = stream.stream.feed(&frame.info);
        for msg in messages {
            self.dispatch_axdp(&source, &msg, Carriage::Ui, now_ms);
        }
    }

    fn drain_session_events(&mut self, key: &SessionKey) {
        let now_ms = self.time.now_system_ms();
        loop {
            let event = match self.sessions.get_mut(key) {
                Some(session) => session.poll_event(),
                None => None,
            };
            let Some(event) = event else { break };
            match event {
                SessionEvent::StateChanged { old, new } => {
                    self.events.push_back(CoreEvent::SessionStateChanged {
                        key: key.clone(),
                        old,
                        new,
                    });
                    if new == SessionState::Connected
                        && self.auto_negotiate
                        && self.initiated.contains(key)
                        && self.capabilities.status(&key.remote) == CapabilityStatus::Unknown
                    {
                        self.send_capability_ping(&key.remote.clone(), now_ms);
                    }
                    if new == SessionState::Disconnected {
                        self.fail_transfers_to(&key.remote.clone(), "session closed");
                    }
                }
                SessionEvent::DataReceived(bytes) => {
                    self.events.push_back(CoreEvent::DataReceived {
                        key: key.clone(),
                        bytes: bytes.clone(),
                    });
                    let messages = self
                        .session_streams
                        .entry(key.clone())
                        .or_default()
                        .feed(&bytes);
                    let remote = key.remote.clone();
                    for msg in messages {
                        self.dispatch_axdp(&remote, &msg, Carriage::Session, now_ms);
                    }
                }
                SessionEvent::FramesAcked(_) => {
                    // The peer acknowledged our I frames: proof the
                    // local→remote direction delivered.
                    self.links.record_reverse_evidence(
                        LinkKey::new(self.local.clone(), key.remote.clone()),
                        true,
                        now_ms,
                    );
                }
                SessionEvent::Connected
                | SessionEvent::Rejected
                | SessionEvent::Timeout
                | SessionEvent::Disconnected => {
                    // Covered by StateChanged.
                }
                SessionEvent::QueuedFramesFailed(count) => {
                    debug!(remote = %key.remote, count, "frames failed at session teardown");
                }
            }
        }
    }

    fn dispatch_axdp(
        &mut self,
        from: &Address,
        msg: &AxdpMessage,
        carriage: Carriage,
        now_ms: i64,
    ) {
        match msg.kind {
            MessageKind::Chat => {
                let text = String::from_utf8_lossy(&msg.payload).into_owned();
                self.events.push_back(CoreEvent::ChatReceived {
                    from: from.clone(),
                    text,
                });
            }
            MessageKind::FileMeta => self.on_file_meta(from, msg, now_ms),
            MessageKind::FileChunk => self.on_file_chunk(from, msg, now_ms),
            MessageKind::Ack => self.on_ack(from, msg, now_ms),
            MessageKind::Nack => self.on_nack(msg),
            MessageKind::Ping => {
                if let Some(caps) = msg.capabilities {
                    self.capabilities.confirm(from, caps, now_ms);
                    self.events.push_back(CoreEvent::CapabilityChanged {
                        peer: from.clone(),
                        status: CapabilityStatus::Confirmed,
                    });
                }
                let pong = AxdpMessage::pong(msg.message_id, Capabilities::default());
                let _ = self.send_axdp_via(from, &pong, carriage, TxPriority::Interactive, None);
            }
            MessageKind::Pong => {
                if let Some(caps) = msg.capabilities {
                    self.capabilities.confirm(from, caps, now_ms);
                    self.events.push_back(CoreEvent::CapabilityChanged {
                        peer: from.clone(),
                        status: CapabilityStatus::Confirmed,
                    });
                }
            }
            MessageKind::PeerAxdpEnabled => {
                self.capabilities.set_badge(from, true, now_ms);
                self.events
                    .push_back(CoreEvent::PeerAxdpEnabled { from: from.clone() });
            }
            MessageKind::PeerAxdpDisabled => {
                self.capabilities.set_badge(from, false, now_ms);
                self.events
                    .push_back(CoreEvent::PeerAxdpDisabled { from: from.clone() });
            }
            MessageKind::Error => {
                warn!(%from, "peer reported AXDP error");
            }
        }
    }

    fn on_file_meta(&mut self, from: &Address, msg: &AxdpMessage, now_ms: i64) {
        let Some(meta) = &msg.file_meta else {
            debug!(%from, "file-meta without metadata TLV");
            return;
        };
        let sid = msg.session_id;
        if self.inbound_transfers.contains_key(&(from.clone(), sid)) {
            return;
        }
        let id = TransferId(self.next_transfer_id);
        self.next_transfer_id += 1;
        let transfer =
            InboundTransfer::from_meta(id, sid, from.clone(), meta, msg.total_chunks, now_ms);
        self.events.push_back(CoreEvent::IncomingTransferRequest {
            id,
            from: from.clone(),
            filename: transfer.file_name.clone(),
            size: transfer.file_size,
        });
        self.inbound_transfers.insert((from.clone(), sid), transfer);
    }

    fn on_file_chunk(&mut self, from: &Address, msg: &AxdpMessage, now_ms: i64) {
        if !msg.crc_ok() {
            // Corrupt chunk: drop it; the completion NACK+SACK round will
            // bring it back.
            debug!(%from, index = msg.chunk_index, "file chunk failed CRC");
            return;
        }
        let sid = msg.session_id;
        let Some(transfer) = self.inbound_transfers.get_mut(&(from.clone(), sid)) else {
            return;
        };
        if !transfer.insert_chunk(msg.chunk_index, msg.payload.clone()) {
            return;
        }
        let id = transfer.id;
        self.events.push_back(CoreEvent::TransferProgress {
            id,
            bytes_done: transfer.bytes_received(),
            bytes_total: transfer.file_size,
        });
        if !transfer.is_complete() {
            return;
        }
        match transfer.finish() {
            Some(Ok(data)) => {
                transfer.status = TransferStatus::Completed;
                transfer.ended_ms = Some(now_ms);
                let filename = transfer.file_name.clone();
                let ack = AxdpMessage::ack(sid, MSG_ID_TRANSFER_COMPLETE);
                let _ = self.send_axdp(from, &ack, TxPriority::Interactive);
                self.events.push_back(CoreEvent::InboundFileReady {
                    id,
                    filename,
                    data,
                });
                self.events.push_back(CoreEvent::TransferCompleted { id });
            }
            Some(Err(err)) => {
                transfer.status = TransferStatus::Failed;
                transfer.ended_ms = Some(now_ms);
                // Zero-length SACK: everything arrived but the digest is
                // wrong.
                let nack =
                    AxdpMessage::nack(sid, MSG_ID_TRANSFER_COMPLETE, Some(SackBitmap::empty()));
                let _ = self.send_axdp(from, &nack, TxPriority::Interactive);
                self.events.push_back(CoreEvent::TransferFailed {
                    id,
                    reason: err.to_string(),
                });
            }
            None => {}
        }
    }

    fn on_ack(&mut self, from: &Address, msg: &AxdpMessage, now_ms: i64) {
        let sid = msg.session_id;
        match msg.message_id {
            0 => {
                // Acceptance of our file offer.
                let Some(transfer) = self.outbound_transfers.get_mut(&sid) else {
                    return;
                };
                if transfer.status != TransferStatus::AwaitingAcceptance {
                    return;
                }
                info!(id = %transfer.id, "transfer accepted");
                transfer.status = TransferStatus::Sending;
                self.pump_transfers();
            }
            MSG_ID_TRANSFER_COMPLETE => {
                // Completion acknowledges the whole transfer, wherever its
                // state machine currently stands.
                let Some(transfer) = self.outbound_transfers.get_mut(&sid) else {
                    return;
                };
                if transfer.is_terminal() {
                    return;
                }
                transfer.status = TransferStatus::Completed;
                transfer.completed_at_ms = Some(now_ms);
                let id = transfer.id;
                self.transfer_cursor.remove(&sid);
                self.events.push_back(CoreEvent::TransferCompleted { id });
            }
            MSG_ID_COMPLETION_REQUEST => {
                // The sender is asking where we stand on an inbound
                // transfer.
                let Some(transfer) = self.inbound_transfers.get(&(from.clone(), sid)) else {
                    return;
                };
                let reply = if transfer.status == TransferStatus::Failed {
                    // Everything arrived but the digest was wrong.
                    AxdpMessage::nack(sid, MSG_ID_TRANSFER_COMPLETE, Some(SackBitmap::empty()))
                } else if transfer.is_complete() {
                    AxdpMessage::ack(sid, MSG_ID_TRANSFER_COMPLETE)
                } else {
                    let missing = transfer.missing_chunks();
                    AxdpMessage::nack(
                        sid,
                        MSG_ID_TRANSFER_COMPLETE,
                        Some(SackBitmap::from_missing(&missing)),
                    )
                };
                let _ = self.send_axdp(from, &reply, TxPriority::Interactive);
            }
            _ => {}
        }
    }

    fn on_nack(&mut self, msg: &AxdpMessage) {
        let sid = msg.session_id;
        match msg.message_id {
            0 => {
                let Some(transfer) = self.outbound_transfers.get_mut(&sid) else {
                    return;
                };
                if transfer.is_terminal() {
                    return;
                }
                transfer.status = TransferStatus::Failed;
                let id = transfer.id;
                self.transfer_cursor.remove(&sid);
                self.events.push_back(CoreEvent::TransferFailed {
                    id,
                    reason: "rejected by peer".to_string(),
                });
            }
            MSG_ID_TRANSFER_COMPLETE => {
                // A completion NACK without a SACK, or for a session we do
                // not know, changes nothing.
                let Some(sack) = &msg.sack else { return };
                let Some(transfer) = self.outbound_transfers.get(&sid) else {
                    return;
                };
                if transfer.is_terminal() {
                    return;
                }
                let destination = transfer.destination.clone();
                let transfer_id = transfer.id;
                let missing = sack.missing_chunks();
                debug!(id = %transfer_id, missing = missing.len(), "retransmitting from SACK");
                if missing.is_empty() {
                    // Zero-length SACK: the receiver failed its hash check.
                    // Nothing to retransmit, and the transfer never fails
                    // from a SACK NACK.
                    return;
                }
                for index in &missing {
                    if let Some(chunk_msg) = self
                        .outbound_transfers
                        .get(&sid)
                        .and_then(|t| t.chunk_message(*index))
                    {
                        let _ = self.send_axdp_tagged(
                            &destination,
                            &chunk_msg,
                            TxPriority::Bulk,
                            Some(transfer_id.0),
                        );
                    }
                }
                // Still awaiting completion; re-probe behind the
                // retransmissions so the receiver can close the handshake.
                let probe = AxdpMessage::ack(sid, MSG_ID_COMPLETION_REQUEST);
                let _ = self.send_axdp_tagged(
                    &destination,
                    &probe,
                    TxPriority::Interactive,
                    Some(transfer_id.0),
                );
            }
            _ => {}
        }
    }

    /// Adaptive samples follow the measured link from the peer toward us.
    fn feed_adaptive_sample(&mut self, frame: &Ax25Frame) {
        let key = LinkKey::new(frame.source.clone(), self.local.clone());
        if let Some((loss, etx)) = self.links.loss_and_etx(&key) {
            self.adaptive.apply_sample(
                LinkQualitySample {
                    loss_rate: loss,
                    etx,
                    srtt: Duration::from_millis(0),
                },
                Some(RouteAdaptiveKey::new(
                    frame.source.clone(),
                    &frame.path.signature(),
                )),
            );
        }
    }

    fn send_capability_ping(&mut self, peer: &Address, now_ms: i64) {
        let ping = AxdpMessage::ping(self.rng.next_u32(), Capabilities::default());
        if self.send_axdp(peer, &ping, TxPriority::Interactive).is_ok() {
            self.capabilities.mark_pending(peer, now_ms);
            self.events.push_back(CoreEvent::CapabilityChanged {
                peer: peer.clone(),
                status: CapabilityStatus::Pending,
            });
        }
    }

    fn fail_transfers_to(&mut self, remote: &Address, reason: &str) {
        let sids: Vec<u16> = self
            .outbound_transfers
            .iter()
            .filter(|(_, t)| t.destination == *remote && !t.is_terminal())
            .map(|(sid, _)| *sid)
            .collect();
        for sid in sids {
            if let Some(transfer) = self.outbound_transfers.get_mut(&sid) {
                transfer.status = TransferStatus::Failed;
                let id = transfer.id;
                self.transfer_cursor.remove(&sid);
                self.events.push_back(CoreEvent::TransferFailed {
                    id,
                    reason: reason.to_string(),
                });
            }
        }
    }

    /// Sends an AXDP message to a peer: over the connected session when one
    /// exists, otherwise as a unicast UI frame.
    fn send_axdp(
        &mut self,
        peer: &Address,
        msg: &AxdpMessage,
        priority: TxPriority,
    ) -> Result<(), CoreError> {
        self.send_axdp_tagged(peer, msg, priority, None)
    }

    /// Like `send_axdp`, stamping any UI frames with a transfer tag so a
    /// cancellation can drain exactly that transfer's fragments.
    fn send_axdp_tagged(
        &mut self,
        peer: &Address,
        msg: &AxdpMessage,
        priority: TxPriority,
        tag: Option<u64>,
    ) -> Result<(), CoreError> {
        let carriage = if self.connected_session(peer).is_some() {
            Carriage::Session
        } else {
            Carriage::Ui
        };
        self.send_axdp_via(peer, msg, carriage, priority, tag)
    }

    fn send_axdp_via(
        &mut self,
        peer: &Address,
        msg: &AxdpMessage,
        carriage: Carriage,
        priority: TxPriority,
        tag: Option<u64>,
    ) -> Result<(), CoreError> {
        let now = self.time.now_instant();
        let encoded = msg.encode();
        match carriage {
            Carriage::Session => {
                let key = self
                    .connected_session(peer)
                    .map(|s| s.key().clone())
                    .ok_or_else(|| CoreError::NotConnected(peer.to_string()))?;
                if let Some(session) = self.sessions.get_mut(&key) {
                    let frames = session.send_data(&encoded, now)?;
                    self.enqueue_frames(frames);
                }
                Ok(())
            }
            Carriage::Ui => {
                let frame = Ax25Frame::ui(
                    self.local.clone(),
                    peer.clone(),
                    DigiPath::empty(),
                    paclink_proto::frame::PID_NO_L3,
                    encoded,
                );
                self.enqueue_with_priority(frame, priority, tag);
                Ok(())
            }
        }
    }

    fn find_inbound(&self, id: TransferId) -> Option<(Address, u16)> {
        self.inbound_transfers
            .iter()
            .find(|(_, t)| t.id == id)
            .map(|((source, sid), _)| (source.clone(), *sid))
    }

    fn connected_session(&self, remote: &Address) -> Option<&Ax25Session> {
        self.sessions.values().find(|s| {
            s.key().remote == *remote
                && matches!(
                    s.state(),
                    SessionState::Connected | SessionState::TimerRecovery
                )
        })
    }

    /// Generates outstanding file chunks, respecting session back-pressure.
    fn pump_transfers(&mut self) {
        let sids: Vec<u16> = self
            .outbound_transfers
            .iter()
            .filter(|(_, t)| t.status == TransferStatus::Sending)
            .map(|(sid, _)| *sid)
            .collect();
        for sid in sids {
            loop {
                let Some(transfer) = self.outbound_transfers.get(&sid) else { break };
                let destination = transfer.destination.clone();
                let transfer_id = transfer.id;
                let total = transfer.total_chunks();
                let cursor = *self.transfer_cursor.get(&sid).unwrap_or(&0);
                if cursor >= total {
                    if let Some(t) = self.outbound_transfers.get_mut(&sid) {
                        t.status = TransferStatus::AwaitingCompletion;
                    }
                    // Probe the receiver: a complete peer answers with the
                    // completion ACK, an incomplete one with a SACK NACK.
                    let probe = AxdpMessage::ack(sid, MSG_ID_COMPLETION_REQUEST);
                    let _ = self.send_axdp_tagged(
                        &destination,
                        &probe,
                        TxPriority::Interactive,
                        Some(transfer_id.0),
                    );
                    break;
                }
                // Back-pressure: keep at most two windows of data queued.
                let room = match self.connected_session(&destination) {
                    Some(session) => {
                        session.pending_send() < session.config().window_size as usize * 2
                    }
                    None => false,
                };
                if !room {
                    break;
                }
                let Some(chunk_msg) = transfer.chunk_message(cursor) else { break };
                if self
                    .send_axdp_tagged(&destination, &chunk_msg, TxPriority::Bulk, Some(transfer_id.0))
                    .is_err()
                {
                    break;
                }
                self.transfer_cursor.insert(sid, cursor + 1);
                if let Some(t) = self.outbound_transfers.get_mut(&sid) {
                    t.note_chunk_sent(cursor);
                    let id = t.id;
                    let done = t.bytes_sent;
                    let total_bytes = t.wire_size();
                    self.events.push_back(CoreEvent::TransferProgress {
                        id,
                        bytes_done: done,
                        bytes_total: total_bytes,
                    });
                }
            }
        }
    }

    fn enqueue_frames(&mut self, frames: Vec<Ax25Frame>) {
        for frame in frames {
            let priority = match frame.frame_type() {
                FrameType::S | FrameType::U => TxPriority::Interactive,
                FrameType::I | FrameType::Ui => TxPriority::Normal,
            };
            self.enqueue_with_priority(frame, priority, None);
        }
    }

    fn enqueue_with_priority(&mut self, frame: Ax25Frame, priority: TxPriority, tag: Option<u64>) {
        let id = self.scheduler.enqueue_tagged(
            frame.source.clone(),
            frame.dest.clone(),
            frame.encode(),
            priority,
            tag,
        );
        self.scheduled_frames.insert(id, frame);
    }

    /// Moves every frame the token buckets allow from the scheduler to the
    /// outbound queue.
    fn pump_scheduler(&mut self, now: Instant) {
        while let Some(tx_frame) = self.scheduler.dequeue(now) {
            let _ = self.scheduler.mark_sent(tx_frame.id, now);
            if let Some(frame) = self.scheduled_frames.remove(&tx_frame.id) {
                self.outbound.push_back(frame);
            }
            self.scheduler.forget(tx_frame.id);
        }
    }
}

/// A reply to a digipeated frame retraces the digi path in reverse, with
/// the has-been-repeated flags cleared.
fn reverse_path(path: &DigiPath) -> DigiPath {
    let hops: Vec<Address> = path
        .hops()
        .iter()
        .rev()
        .map(|a| a.clone().with_repeated(false))
        .collect();
    DigiPath::new(hops).unwrap_or_default()
}
