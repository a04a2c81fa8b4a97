//! Inbound packet processing

use crate::events::MeshEvent;
use crate::node::{Backpressure, MeshNode};
use crate::sink::Delivery;
use bytes::Bytes;
use mesh_routing::{DropReason, RoutingDecision};
use mesh_session::{Role, SessionError};
use mesh_wire::{decode_ack, parse, Flags, Fragment, Message, Packet, PacketType, PeerId};
use std::time::Instant;
use tracing::{debug, info, warn};

/// What happened to one inbound packet
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InboundOutcome {
    /// Discarded before local processing or relay
    Dropped(DropReason),
    /// Accepted by the router
    Accepted {
        /// A payload reached the application sink
        delivered: bool,
        /// Neighbors the relay copy was written to
        relayed: usize,
    },
}

impl MeshNode {
    /// Process bytes received from direct neighbor `from`.
    ///
    /// Never fails: bad input is dropped and counted, and processing of
    /// other packets is unaffected.
    pub async fn handle_inbound(&self, from: PeerId, bytes: Bytes) -> InboundOutcome {
        let packet = match parse(bytes) {
            Ok(packet) => packet,
            Err(err) => {
                warn!(from = %from, error = %err, "Malformed packet");
                return self.reject(from, DropReason::Malformed);
            }
        };

        if let Some(reason) = self.check_signature(&packet) {
            return self.reject(from, reason);
        }

        let (deliver, relay) = match self.router.route_inbound(&packet, from, Instant::now()) {
            RoutingDecision::Drop(reason) => return InboundOutcome::Dropped(reason),
            RoutingDecision::Accept { deliver, relay } => (deliver, relay),
        };

        let mut relayed = 0;
        if let Some(relay) = relay {
            match relay.packet.encode() {
                Ok(frame) => {
                    relayed = self
                        .write_to(&relay.targets, frame, Backpressure::Shed)
                        .await
                }
                Err(err) => warn!(error = %err, "Relay copy could not be encoded"),
            }
        }

        let delivered = if deliver {
            self.process_local(packet).await
        } else {
            false
        };
        InboundOutcome::Accepted { delivered, relayed }
    }

    /// `Some(reason)` when the packet carries a signature that does not
    /// verify, or lacks one it must carry. Packets from senders whose key is
    /// unknown pass unverified.
    ///
    /// `Leave` must always be signed. Other broadcasts must be signed when
    /// this node signs its own and already knows the sender's key.
    fn check_signature(&self, packet: &Packet) -> Option<DropReason> {
        let Some(signature) = packet.signature else {
            let required = packet.packet_type == PacketType::Leave
                || (self.config.sign_broadcasts
                    && packet.is_broadcast()
                    && self.sessions.identity_key(&packet.sender).is_some());
            if required {
                warn!(sender = %packet.sender, packet_type = ?packet.packet_type, "Unsigned broadcast");
                return Some(DropReason::BadSignature);
            }
            return None;
        };
        let signed = match packet.signing_bytes() {
            Ok(signed) => signed,
            Err(_) => return Some(DropReason::Malformed),
        };
        match self.sessions.verify_from(&packet.sender, &signed, &signature) {
            Some(false) => {
                warn!(sender = %packet.sender, "Signature mismatch");
                Some(DropReason::BadSignature)
            }
            Some(true) => None,
            None => {
                debug!(sender = %packet.sender, "Sender key unknown, signature unchecked");
                None
            }
        }
    }

    fn reject(&self, from: PeerId, reason: DropReason) -> InboundOutcome {
        self.router.record_drop(reason);
        self.emit(MeshEvent::PacketRejected { from, reason });
        InboundOutcome::Dropped(reason)
    }

    async fn process_local(&self, packet: Packet) -> bool {
        if packet.packet_type != PacketType::Fragment {
            return self.process_payload(packet).await;
        }
        match self.reassemble(packet) {
            Some(inner) => self.process_payload(inner).await,
            None => false,
        }
    }

    /// Feed a fragment to the assembler; the rebuilt packet once complete
    fn reassemble(&self, packet: Packet) -> Option<Packet> {
        let fragment = match Fragment::decode(packet.payload.clone()) {
            Ok(fragment) => fragment,
            Err(err) => {
                warn!(sender = %packet.sender, error = %err, "Malformed fragment");
                self.router.record_drop(DropReason::Malformed);
                return None;
            }
        };

        let result = self
            .lock_assembler()
            .ingest(packet.sender, fragment, Instant::now());
        match result {
            Ok(Some(whole)) => {
                debug!(
                    sender = %packet.sender,
                    transfer_id = whole.transfer_id,
                    size = whole.payload.len(),
                    "Transfer reassembled"
                );
                Some(Packet {
                    packet_type: whole.inner_type,
                    encrypted: whole.inner_flags.contains(Flags::ENCRYPTED),
                    payload: whole.payload,
                    signature: None,
                    ..packet
                })
            }
            Ok(None) => None,
            Err(err) => {
                warn!(sender = %packet.sender, error = %err, "Fragment rejected");
                None
            }
        }
    }

    async fn process_payload(&self, packet: Packet) -> bool {
        let sender = packet.sender;
        let to_us = packet.recipient == Some(self.local_id());

        match packet.packet_type {
            PacketType::HandshakeInit if to_us => {
                self.on_handshake_init(sender, packet.payload).await;
                false
            }
            PacketType::HandshakeResponse if to_us => {
                self.on_handshake_response(sender, packet.payload).await;
                false
            }
            PacketType::HandshakeConfirm if to_us => {
                self.on_handshake_confirm(sender, packet.payload).await;
                false
            }
            PacketType::HandshakeInit
            | PacketType::HandshakeResponse
            | PacketType::HandshakeConfirm => {
                debug!(sender = %sender, "Ignoring broadcast handshake");
                false
            }
            PacketType::Data => self.on_data(packet).await,
            PacketType::Ack => {
                self.on_ack(packet);
                false
            }
            PacketType::Leave => {
                self.on_leave(sender);
                false
            }
            PacketType::Extension(_) => self.on_extension(packet).await,
            PacketType::Fragment => {
                debug!(sender = %sender, "Nested fragment ignored");
                false
            }
        }
    }

    async fn on_handshake_init(&self, sender: PeerId, payload: Bytes) {
        match self.sessions.handle_init(sender, payload, Instant::now()) {
            Ok(Some(response)) => {
                if let Err(err) = self
                    .send_handshake(PacketType::HandshakeResponse, sender, response)
                    .await
                {
                    warn!(peer = %sender, error = %err, "Handshake response not sent");
                }
            }
            Ok(None) => {}
            Err(err) => self.emit(MeshEvent::SessionFailed {
                peer: sender,
                reason: err.to_string(),
            }),
        }
    }

    async fn on_handshake_response(&self, sender: PeerId, payload: Bytes) {
        match self
            .sessions
            .handle_response(sender, payload, Instant::now())
        {
            Ok(confirm) => {
                if let Err(err) = self
                    .send_handshake(PacketType::HandshakeConfirm, sender, confirm)
                    .await
                {
                    warn!(peer = %sender, error = %err, "Handshake confirm not sent");
                }
                self.emit(MeshEvent::SessionEstablished {
                    peer: sender,
                    role: Role::Initiator,
                });
                self.drain_queue(sender).await;
            }
            Err(SessionError::UnexpectedHandshake(_)) => {
                debug!(peer = %sender, "Unexpected handshake response");
            }
            Err(err) => self.emit(MeshEvent::SessionFailed {
                peer: sender,
                reason: err.to_string(),
            }),
        }
    }

    async fn on_handshake_confirm(&self, sender: PeerId, payload: Bytes) {
        match self
            .sessions
            .handle_confirm(sender, payload, Instant::now())
        {
            Ok(()) => {
                self.emit(MeshEvent::SessionEstablished {
                    peer: sender,
                    role: Role::Responder,
                });
                self.drain_queue(sender).await;
            }
            Err(SessionError::UnexpectedHandshake(_)) => {
                debug!(peer = %sender, "Unexpected handshake confirm");
            }
            Err(err) => self.emit(MeshEvent::SessionFailed {
                peer: sender,
                reason: err.to_string(),
            }),
        }
    }

    /// Session plaintext for an encrypted payload, or the payload itself
    fn open_payload(&self, packet: &Packet) -> Option<Bytes> {
        if !packet.encrypted {
            return Some(packet.payload.clone());
        }
        match self.sessions.decrypt(&packet.payload, &packet.sender) {
            Ok(plaintext) => Some(plaintext),
            Err(err) => {
                warn!(sender = %packet.sender, error = %err, "Could not decrypt payload");
                None
            }
        }
    }

    async fn on_data(&self, packet: Packet) -> bool {
        let Some(plaintext) = self.open_payload(&packet) else {
            return false;
        };
        let message = match Message::decode(plaintext) {
            Ok(message) => message,
            Err(err) => {
                warn!(sender = %packet.sender, error = %err, "Malformed message");
                self.router.record_drop(DropReason::Malformed);
                return false;
            }
        };

        let broadcast = packet.is_broadcast();
        if message.ack_requested && !broadcast {
            // a lost ack makes the sender retry, so re-ack duplicates too
            self.send_ack(packet.sender, &message.id).await;
        }
        if self.router.seen_message(packet.sender, &message.id) {
            debug!(sender = %packet.sender, message_id = %message.id, "Message already delivered");
            return false;
        }

        self.sink
            .deliver(Delivery {
                sender: packet.sender,
                packet_type: PacketType::Data,
                message_id: Some(message.id),
                kind: Some(message.kind),
                body: message.body,
                encrypted: packet.encrypted,
                broadcast,
            })
            .await;
        true
    }

    fn on_ack(&self, packet: Packet) {
        if !packet.encrypted && self.sessions.has_established_session(&packet.sender) {
            debug!(sender = %packet.sender, "Cleartext ack ignored, session established");
            return;
        }
        let Some(plaintext) = self.open_payload(&packet) else {
            return;
        };
        match decode_ack(plaintext) {
            Ok(message_id) => {
                if self.tracker.ack(&packet.sender, &message_id) {
                    self.emit(MeshEvent::DeliveryResolved {
                        message_id,
                        recipient: packet.sender,
                        outcome: mesh_delivery::DeliveryOutcome::Delivered,
                    });
                }
            }
            Err(err) => warn!(sender = %packet.sender, error = %err, "Malformed ack"),
        }
    }

    fn on_leave(&self, sender: PeerId) {
        // only a signature checked against a known key tears state down
        if self.sessions.identity_key(&sender).is_none() {
            debug!(peer = %sender, "Leave from unknown key not acted on");
            return;
        }
        info!(peer = %sender, "Peer left the mesh");
        self.router.forget(&sender);
        self.sessions.remove_peer(&sender);
        self.emit(MeshEvent::PeerLeft { peer: sender });
    }

    async fn on_extension(&self, packet: Packet) -> bool {
        let Some(body) = self.open_payload(&packet) else {
            return false;
        };
        self.sink
            .deliver(Delivery {
                sender: packet.sender,
                packet_type: packet.packet_type,
                message_id: None,
                kind: None,
                body,
                encrypted: packet.encrypted,
                broadcast: packet.is_broadcast(),
            })
            .await;
        true
    }
}
