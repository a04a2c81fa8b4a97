//! The mesh node engine.
//!
//! [`MeshNode`] is the long-lived context object: it owns the session table,
//! router, fragment assembler, store-and-forward queue and delivery tracker,
//! plus the attached neighbor links. It is shared behind an `Arc`; every
//! component synchronizes internally and no lock is held across a link
//! write.

use crate::config::MeshConfig;
use crate::error::NodeError;
use crate::events::MeshEvent;
use crate::link::{Link, LinkError};
use crate::sink::DeliverySink;
use bytes::Bytes;
use dashmap::DashMap;
use mesh_delivery::{DeliveryOutcome, DeliveryReceipt, DeliveryTracker, RetryAction};
use mesh_routing::{MeshRouter, OutboundRoute, PowerStateProvider, RouterStats, Targets};
use mesh_session::{IdentityProvider, SessionError, SessionEvent, SessionManager, SessionState};
use mesh_storage::StoreAndForwardQueue;
use mesh_wire::{
    encode_ack, split, DiscardedTransfer, Flags, FragmentAssembler, Message, MessageId, Packet,
    PacketType, PeerId,
};
use std::sync::{Arc, Mutex};
use std::time::Instant;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Largest application body accepted for sending
pub const MAX_MESSAGE_SIZE: usize = 256 * 1024;

/// What a link write does when the neighbor's queue is full
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Backpressure {
    /// Wait for room; only for sends the application asked for
    Wait,
    /// Discard the frame and count it
    Shed,
}

/// A mesh node
#[derive(Debug)]
pub struct MeshNode {
    pub(crate) config: MeshConfig,
    pub(crate) sessions: SessionManager,
    pub(crate) router: MeshRouter,
    pub(crate) assembler: Mutex<FragmentAssembler>,
    pub(crate) queue: StoreAndForwardQueue,
    pub(crate) tracker: DeliveryTracker,
    pub(crate) links: DashMap<PeerId, Arc<dyn Link>>,
    pub(crate) sink: Arc<dyn DeliverySink>,
    events: mpsc::Sender<MeshEvent>,
}

impl MeshNode {
    /// Build a node; returns it with the receiving end of its event channel
    pub fn new(
        config: MeshConfig,
        identity: Arc<dyn IdentityProvider>,
        sink: Arc<dyn DeliverySink>,
        power: Option<Arc<dyn PowerStateProvider>>,
    ) -> Result<(Arc<Self>, mpsc::Receiver<MeshEvent>), NodeError> {
        config.validate()?;

        let local = identity.local_id();
        let (events, rx) = mpsc::channel(config.event_buffer);
        let node = Self {
            sessions: SessionManager::new(identity, config.session_config()),
            router: MeshRouter::new(local, config.router_config(), power),
            assembler: Mutex::new(FragmentAssembler::new(config.assembler_config())),
            queue: StoreAndForwardQueue::new(config.queue_config()),
            tracker: DeliveryTracker::new(config.retry_policy()),
            links: DashMap::new(),
            sink,
            events,
            config,
        };
        info!(node = %local, "Mesh node created");
        Ok((Arc::new(node), rx))
    }

    /// This node's id
    pub fn local_id(&self) -> PeerId {
        self.sessions.local_id()
    }

    /// Active configuration
    pub fn config(&self) -> &MeshConfig {
        &self.config
    }

    /// Directly attached neighbors
    pub fn neighbors(&self) -> Vec<PeerId> {
        self.links.iter().map(|l| *l.key()).collect()
    }

    /// Whether an established session with `peer` exists
    pub fn has_session(&self, peer: &PeerId) -> bool {
        self.sessions.has_established_session(peer)
    }

    /// Session state with `peer`
    pub fn session_state(&self, peer: &PeerId) -> Option<SessionState> {
        self.sessions.state(peer)
    }

    /// Messages waiting in store-and-forward for `peer`
    pub fn queued_for(&self, peer: &PeerId) -> usize {
        self.queue.pending_for(peer)
    }

    /// Private messages awaiting an outcome
    pub fn pending_deliveries(&self) -> usize {
        self.tracker.len()
    }

    /// Router counters
    pub fn router_stats(&self) -> RouterStats {
        self.router.stats()
    }

    /// Attach a link to direct neighbor `peer` and start a handshake with it
    pub async fn attach_link(&self, peer: PeerId, link: Arc<dyn Link>) -> Result<(), NodeError> {
        if peer == self.local_id() {
            return Err(NodeError::SelfAddressed);
        }
        self.links.insert(peer, link);
        self.router.add_neighbor(peer, Instant::now());
        info!(peer = %peer, "Neighbor attached");
        self.emit(MeshEvent::NeighborUp { peer });

        match self.sessions.state(&peer) {
            Some(SessionState::Established) => {
                self.drain_queue(peer).await;
                Ok(())
            }
            Some(SessionState::HandshakeReceived) => Ok(()),
            Some(SessionState::HandshakeSent) => {
                // an earlier attempt went out before this link existed
                let (init, _) = self.sessions.rekey(peer, Instant::now())?;
                self.send_handshake(PacketType::HandshakeInit, peer, init).await
            }
            _ => self.initiate_handshake(peer).await.map(|_| ()),
        }
    }

    /// Detach the link to `peer`: its session is destroyed and its partial
    /// transfers are released. Tracked deliveries keep retrying.
    pub fn detach_link(&self, peer: &PeerId) {
        if self.links.remove(peer).is_none() {
            return;
        }
        self.router.remove_neighbor(peer);
        self.sessions.remove_peer(peer);
        let discarded = self.lock_assembler().cancel_sender(*peer);
        self.report_discarded(discarded);
        info!(peer = %peer, "Neighbor detached");
        self.emit(MeshEvent::NeighborDown { peer: *peer });
    }

    /// Broadcast an application message to the whole mesh
    pub async fn broadcast(&self, kind: u8, body: Bytes) -> Result<MessageId, NodeError> {
        self.check_size(body.len())?;
        let message = Message::new(kind, body, false);
        let packet = self.originate(PacketType::Data, None, message.encode(), false);
        self.transmit(packet, Backpressure::Wait).await?;
        debug!(message_id = %message.id, "Broadcast sent");
        Ok(message.id)
    }

    /// Send an application message confidentially to `recipient`.
    ///
    /// Never falls back to cleartext. With the recipient reachable but no
    /// established session this starts a handshake and fails with
    /// `NoSession`; the caller retries once the session is up. With the
    /// recipient unreachable the message is parked in store-and-forward and
    /// sent when a session with it is established.
    pub async fn send_private(
        &self,
        recipient: PeerId,
        kind: u8,
        body: Bytes,
    ) -> Result<DeliveryReceipt, NodeError> {
        if recipient == self.local_id() {
            return Err(NodeError::SelfAddressed);
        }
        self.check_size(body.len())?;

        let now = Instant::now();
        let message = Message::new(kind, body, true);
        let plaintext = message.encode();
        let reachable = self.router.is_reachable(&recipient, now);

        if reachable && self.sessions.has_established_session(&recipient) {
            self.send_encrypted(PacketType::Data, recipient, &plaintext, Backpressure::Wait)
                .await?;
            return Ok(self
                .tracker
                .track_in_flight(message.id, recipient, plaintext, now));
        }

        if reachable {
            self.initiate_handshake(recipient).await?;
            warn!(peer = %recipient, "No session yet, withholding private message");
            return Err(SessionError::NoSession(recipient).into());
        }

        let sealed = self.sessions.seal_at_rest(&recipient, &plaintext)?;
        let evicted = self.queue.enqueue(recipient, message.id, sealed, now)?;
        let receipt = self.tracker.track_queued(message.id, recipient, now);
        for entry in evicted {
            self.resolve_delivery(entry.message_id, entry.recipient, DeliveryOutcome::Evicted);
        }
        info!(peer = %recipient, message_id = %message.id, "Recipient unreachable, message queued");

        if !self.links.is_empty() && !self.sessions.has_established_session(&recipient) {
            // the peer may be further out than our hints reach
            if let Err(err) = self.initiate_handshake(recipient).await {
                debug!(peer = %recipient, error = %err, "Discovery handshake not sent");
            }
        }
        Ok(receipt)
    }

    /// Send an application extension packet.
    ///
    /// Unicast extensions require an established session, like private
    /// messages; broadcast extensions go out signed and in the clear.
    pub async fn send_extension(
        &self,
        tag: u8,
        recipient: Option<PeerId>,
        body: Bytes,
    ) -> Result<(), NodeError> {
        let packet_type = PacketType::extension(tag)?;
        self.check_size(body.len())?;

        match recipient {
            None => {
                let packet = self.originate(packet_type, None, body, false);
                self.transmit(packet, Backpressure::Wait).await?;
            }
            Some(peer) if peer == self.local_id() => return Err(NodeError::SelfAddressed),
            Some(peer) => {
                if !self.sessions.has_established_session(&peer) {
                    self.initiate_handshake(peer).await?;
                    return Err(SessionError::NoSession(peer).into());
                }
                self.send_encrypted(packet_type, peer, &body, Backpressure::Wait)
                    .await?;
            }
        }
        Ok(())
    }

    /// Start a handshake with `peer`; `false` when one is already running or
    /// a session exists
    pub async fn initiate_handshake(&self, peer: PeerId) -> Result<bool, NodeError> {
        match self.sessions.initiate(peer, Instant::now())? {
            Some(init) => {
                self.send_handshake(PacketType::HandshakeInit, peer, init)
                    .await?;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Replace the session with `peer` by a fresh handshake
    pub async fn rekey(&self, peer: PeerId) -> Result<(), NodeError> {
        let (init, was_established) = self.sessions.rekey(peer, Instant::now())?;
        if was_established {
            self.emit(MeshEvent::SessionExpired { peer });
        }
        self.send_handshake(PacketType::HandshakeInit, peer, init)
            .await
    }

    /// Announce departure to the mesh. The announcement is always signed.
    pub async fn leave(&self) -> Result<(), NodeError> {
        let packet = self.originate(PacketType::Leave, None, Bytes::new(), false);
        self.transmit(packet, Backpressure::Wait).await?;
        info!("Leave announced");
        Ok(())
    }

    /// Give up on a private message.
    ///
    /// A queued copy is removed from store-and-forward and the receipt
    /// resolves `Cancelled`. Returns `false` when the message is unknown or
    /// already resolved.
    pub fn cancel_delivery(&self, message_id: &MessageId) -> bool {
        let Some(recipient) = self.tracker.cancel(message_id) else {
            return false;
        };
        if self.queue.remove(&recipient, message_id) {
            debug!(peer = %recipient, message_id = %message_id, "Queued copy released");
        }
        info!(peer = %recipient, message_id = %message_id, "Delivery cancelled");
        self.emit(MeshEvent::DeliveryResolved {
            message_id: *message_id,
            recipient,
            outcome: DeliveryOutcome::Cancelled,
        });
        true
    }

    /// Run one maintenance sweep now
    pub async fn run_maintenance(&self) {
        self.run_maintenance_at(Instant::now()).await;
    }

    /// The single place time-based cleanup happens: session expiry and
    /// handshake timeouts, partial transfers, queued messages, retries and
    /// stale reachability hints.
    pub async fn run_maintenance_at(&self, now: Instant) {
        for event in self.sessions.sweep(now) {
            match event {
                SessionEvent::Established { peer, role } => {
                    self.emit(MeshEvent::SessionEstablished { peer, role })
                }
                SessionEvent::Failed { peer, reason } => {
                    self.emit(MeshEvent::SessionFailed { peer, reason })
                }
                SessionEvent::Expired { peer } => self.emit(MeshEvent::SessionExpired { peer }),
            }
        }

        let discarded = self.lock_assembler().sweep(now);
        self.report_discarded(discarded);

        for entry in self.queue.sweep(now) {
            warn!(peer = %entry.recipient, message_id = %entry.message_id, "Queued message expired");
            self.resolve_delivery(entry.message_id, entry.recipient, DeliveryOutcome::Expired);
        }

        for action in self.tracker.due(now) {
            match action {
                RetryAction::Resend {
                    message_id,
                    recipient,
                    payload,
                    attempt,
                } => {
                    debug!(message_id = %message_id, peer = %recipient, attempt, "Retrying delivery");
                    if self.sessions.has_established_session(&recipient) {
                        if let Err(err) = self
                            .send_encrypted(
                                PacketType::Data,
                                recipient,
                                &payload,
                                Backpressure::Shed,
                            )
                            .await
                        {
                            debug!(peer = %recipient, error = %err, "Retry not sent");
                        }
                    } else if let Err(err) = self.initiate_handshake(recipient).await {
                        debug!(peer = %recipient, error = %err, "Handshake for retry not sent");
                    }
                }
                RetryAction::Exhausted {
                    message_id,
                    recipient,
                    attempts,
                } => self.emit(MeshEvent::DeliveryResolved {
                    message_id,
                    recipient,
                    outcome: DeliveryOutcome::Exhausted { attempts },
                }),
            }
        }

        // sessions that came back while their recipient was out of reach
        for peer in self.sessions.established_peers() {
            if self.queue.pending_for(&peer) > 0 && self.router.is_reachable(&peer, now) {
                self.drain_queue(peer).await;
            }
        }

        self.router.sweep(now);
    }

    /// Run [`MeshNode::run_maintenance`] every `sweep_interval` until the
    /// node is dropped
    pub fn spawn_maintenance(self: &Arc<Self>) -> JoinHandle<()> {
        let node = Arc::downgrade(self);
        let period = self.config.sweep_interval;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let Some(node) = node.upgrade() else {
                    break;
                };
                node.run_maintenance().await;
            }
        })
    }

    /// Packet originated by this node with the current adaptive TTL
    pub(crate) fn originate(
        &self,
        packet_type: PacketType,
        recipient: Option<PeerId>,
        payload: Bytes,
        encrypted: bool,
    ) -> Packet {
        Packet::new(
            packet_type,
            self.local_id(),
            recipient,
            self.router.default_ttl(),
            payload,
        )
        .with_encrypted(encrypted)
    }

    /// Encrypt `plaintext` under the session with `peer` and send it
    pub(crate) async fn send_encrypted(
        &self,
        packet_type: PacketType,
        peer: PeerId,
        plaintext: &[u8],
        backpressure: Backpressure,
    ) -> Result<usize, NodeError> {
        let frame = self.sessions.encrypt(plaintext, &peer)?;
        let packet = self.originate(packet_type, Some(peer), frame, true);
        self.transmit(packet, backpressure).await
    }

    /// Handshake messages are shed on full links; the handshake timeout and
    /// the retry engine start over
    pub(crate) async fn send_handshake(
        &self,
        packet_type: PacketType,
        peer: PeerId,
        payload: Bytes,
    ) -> Result<(), NodeError> {
        let packet = self.originate(packet_type, Some(peer), payload, false);
        self.transmit(packet, Backpressure::Shed).await.map(|_| ())
    }

    /// Acknowledge `message_id` to `peer`, encrypted when a session exists
    pub(crate) async fn send_ack(&self, peer: PeerId, message_id: &MessageId) {
        let ack = encode_ack(message_id);
        let result = if self.sessions.has_established_session(&peer) {
            self.send_encrypted(PacketType::Ack, peer, &ack, Backpressure::Shed)
                .await
        } else {
            let packet = self.originate(PacketType::Ack, Some(peer), ack, false);
            self.transmit(packet, Backpressure::Shed).await
        };
        if let Err(err) = result {
            debug!(peer = %peer, message_id = %message_id, error = %err, "Ack not sent");
        }
    }

    /// Fragment, sign, and write an originated packet; returns link writes
    pub(crate) async fn transmit(
        &self,
        packet: Packet,
        backpressure: Backpressure,
    ) -> Result<usize, NodeError> {
        let targets = self.targets_for(&packet)?;
        let sign = packet.is_broadcast()
            && (self.config.sign_broadcasts || packet.packet_type == PacketType::Leave);

        let mut written = 0;
        for mut piece in self.fragment(packet)? {
            if sign {
                let signature = self.sessions.sign(&piece.signing_bytes()?);
                piece = piece.with_signature(signature);
            }
            self.router.mark_sent(&piece);
            written += self
                .write_to(&targets, piece.encode()?, backpressure)
                .await;
        }
        Ok(written)
    }

    /// Write one frame to each target; failures are logged per link
    pub(crate) async fn write_to(
        &self,
        targets: &[PeerId],
        frame: Bytes,
        backpressure: Backpressure,
    ) -> usize {
        let mut written = 0;
        for peer in targets {
            let Some(link) = self.links.get(peer).map(|l| Arc::clone(l.value())) else {
                continue;
            };
            let result = match backpressure {
                Backpressure::Wait => link.write(frame.clone()).await,
                Backpressure::Shed => link.try_write(frame.clone()),
            };
            match result {
                Ok(()) => written += 1,
                Err(LinkError::Full) => {
                    self.router.record_shed();
                    warn!(peer = %peer, size = frame.len(), "Link queue full, frame shed");
                }
                Err(err) => error!(peer = %peer, error = %err, "Link write failed"),
            }
        }
        written
    }

    /// Send whatever was queued for `peer` now that a session exists
    pub(crate) async fn drain_queue(&self, peer: PeerId) {
        let entries = self.queue.drain(&peer);
        if entries.is_empty() {
            return;
        }
        info!(peer = %peer, count = entries.len(), "Sending queued messages");

        let now = Instant::now();
        for entry in entries {
            let plaintext = match self.sessions.open_at_rest(&peer, &entry.sealed) {
                Ok(plaintext) => plaintext,
                Err(err) => {
                    error!(peer = %peer, error = %err, "Queued message could not be opened");
                    self.resolve_delivery(entry.message_id, peer, DeliveryOutcome::Cancelled);
                    continue;
                }
            };
            if let Err(err) = self
                .send_encrypted(PacketType::Data, peer, &plaintext, Backpressure::Shed)
                .await
            {
                // retry engine picks it up
                warn!(peer = %peer, error = %err, "Queued message send failed");
            }
            self.tracker.mark_in_flight(&entry.message_id, plaintext, now);
        }
    }

    pub(crate) fn resolve_delivery(
        &self,
        message_id: MessageId,
        recipient: PeerId,
        outcome: DeliveryOutcome,
    ) {
        if self.tracker.resolve(&message_id, outcome) {
            self.emit(MeshEvent::DeliveryResolved {
                message_id,
                recipient,
                outcome,
            });
        }
    }

    pub(crate) fn report_discarded(&self, discarded: Vec<DiscardedTransfer>) {
        for transfer in discarded {
            warn!(
                peer = %transfer.sender,
                transfer_id = transfer.transfer_id,
                received = transfer.received,
                total = transfer.total,
                reason = ?transfer.reason,
                "Partial transfer discarded"
            );
            self.emit(MeshEvent::TransferDiscarded {
                sender: transfer.sender,
                transfer_id: transfer.transfer_id,
                reason: transfer.reason,
            });
        }
    }

    pub(crate) fn emit(&self, event: MeshEvent) {
        if let Err(err) = self.events.try_send(event) {
            debug!(error = %err, "Event not published");
        }
    }

    pub(crate) fn lock_assembler(&self) -> std::sync::MutexGuard<'_, FragmentAssembler> {
        self.assembler.lock().unwrap_or_else(|err| err.into_inner())
    }

    fn targets_for(&self, packet: &Packet) -> Result<Targets, NodeError> {
        let Some(recipient) = packet.recipient else {
            return Ok(self.router.flood_targets());
        };
        let targets = match self.router.route_outbound(&recipient, Instant::now()) {
            // nothing known about the peer yet: let the mesh find it
            OutboundRoute::Unreachable => self.router.flood_targets(),
            route => route.targets(),
        };
        if targets.is_empty() {
            return Err(NodeError::NoRoute(recipient));
        }
        Ok(targets)
    }

    fn fragment(&self, packet: Packet) -> Result<Vec<Packet>, NodeError> {
        let threshold = self.config.fragment_threshold;
        if packet.payload.len() <= threshold || packet.packet_type.is_handshake() {
            return Ok(vec![packet]);
        }

        let inner_flags = packet.flags() & Flags::ENCRYPTED;
        let pieces = split(&packet.payload, threshold, packet.packet_type, inner_flags)?;
        debug!(
            size = packet.payload.len(),
            fragments = pieces.len(),
            "Fragmenting packet"
        );
        Ok(pieces
            .into_iter()
            .map(|piece| Packet {
                packet_type: PacketType::Fragment,
                encrypted: false,
                payload: piece.encode(),
                signature: None,
                ..packet.clone()
            })
            .collect())
    }

    fn check_size(&self, size: usize) -> Result<(), NodeError> {
        if size > MAX_MESSAGE_SIZE {
            return Err(NodeError::PayloadTooLarge {
                size,
                limit: MAX_MESSAGE_SIZE,
            });
        }
        Ok(())
    }
}
