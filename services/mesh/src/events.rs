//! Node event stream

use mesh_delivery::DeliveryOutcome;
use mesh_routing::DropReason;
use mesh_session::Role;
use mesh_wire::{DiscardReason, MessageId, PeerId};

/// Notifications published on the node's bounded event channel.
///
/// Events are dropped, not queued without bound, when the receiver falls
/// behind.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MeshEvent {
    /// A neighbor link was attached
    NeighborUp {
        /// Neighbor
        peer: PeerId,
    },
    /// A neighbor link was detached
    NeighborDown {
        /// Neighbor
        peer: PeerId,
    },
    /// Encrypted traffic with `peer` is possible
    SessionEstablished {
        /// Remote peer
        peer: PeerId,
        /// Our handshake role
        role: Role,
    },
    /// Handshake failed verification or timed out
    SessionFailed {
        /// Remote peer
        peer: PeerId,
        /// Cause
        reason: String,
    },
    /// Session expired through inactivity or rekey
    SessionExpired {
        /// Remote peer
        peer: PeerId,
    },
    /// A peer announced it is leaving the mesh
    PeerLeft {
        /// Departing peer
        peer: PeerId,
    },
    /// A partial transfer was thrown away
    TransferDiscarded {
        /// Originating peer
        sender: PeerId,
        /// Transfer id
        transfer_id: u64,
        /// Why
        reason: DiscardReason,
    },
    /// A tracked private message reached a terminal outcome
    DeliveryResolved {
        /// Message id
        message_id: MessageId,
        /// Target peer
        recipient: PeerId,
        /// Outcome
        outcome: DeliveryOutcome,
    },
    /// A packet was rejected as malformed or badly signed
    PacketRejected {
        /// Neighbor it arrived from
        from: PeerId,
        /// Why
        reason: DropReason,
    },
}
