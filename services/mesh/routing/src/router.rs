//! Mesh router: inbound relay decisions and outbound path choice

use crate::table::{NeighborTable, DEFAULT_MAX_HINTED_PEERS};
use crate::ttl::{AdaptiveTtl, AlwaysPowered, PowerStateProvider};
use mesh_storage::{DedupConfig, DuplicateFilter};
use mesh_wire::{MessageId, Packet, PacketId, PeerId};
use serde::{Deserialize, Serialize};
use smallvec::SmallVec;
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::debug;

/// Relay target list; most nodes have only a handful of radio neighbors
pub type Targets = SmallVec<[PeerId; 8]>;

/// Reason for dropping a packet
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DropReason {
    /// Could not be parsed
    Malformed,
    /// Already seen
    Duplicate,
    /// Hop budget exhausted before reaching its recipient
    TtlExpired,
    /// Our own packet echoed back
    OwnPacket,
    /// Signature did not verify against the sender's identity key
    BadSignature,
}

impl DropReason {
    /// Stable label used in stats and logs
    pub fn as_str(&self) -> &'static str {
        match self {
            DropReason::Malformed => "malformed",
            DropReason::Duplicate => "duplicate",
            DropReason::TtlExpired => "ttl_expired",
            DropReason::OwnPacket => "own_packet",
            DropReason::BadSignature => "bad_signature",
        }
    }
}

impl fmt::Display for DropReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DropReason::Malformed => write!(f, "malformed packet"),
            DropReason::Duplicate => write!(f, "duplicate packet"),
            DropReason::TtlExpired => write!(f, "TTL expired"),
            DropReason::OwnPacket => write!(f, "own packet echoed back"),
            DropReason::BadSignature => write!(f, "bad signature"),
        }
    }
}

/// A relay copy of an inbound packet and the neighbors to write it to
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Relay {
    /// Packet with its TTL decremented
    pub packet: Packet,
    /// Neighbors to write to
    pub targets: Targets,
}

/// Routing decision for one inbound packet
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RoutingDecision {
    /// Discard without delivering or relaying
    Drop(DropReason),
    /// Accepted: deliver locally, relay, or both
    Accept {
        /// Hand to this node's application layer
        deliver: bool,
        /// Relay copy, when the hop budget allows one and someone can take it
        relay: Option<Relay>,
    },
}

/// How an originated unicast packet leaves this node
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OutboundRoute {
    /// Recipient is a direct neighbor
    Direct(PeerId),
    /// Subset of neighbors most likely to reach the recipient
    Selective(Targets),
    /// No neighbor and no fresh hint leads to the recipient
    Unreachable,
}

impl OutboundRoute {
    /// Neighbors to write to; empty when unreachable
    pub fn targets(&self) -> Targets {
        match self {
            OutboundRoute::Direct(peer) => SmallVec::from_slice(&[*peer]),
            OutboundRoute::Selective(targets) => targets.clone(),
            OutboundRoute::Unreachable => SmallVec::new(),
        }
    }
}

/// Router configuration
#[derive(Debug, Clone)]
pub struct RouterConfig {
    /// Ceiling for originated TTLs
    pub max_ttl: u8,
    /// Neighbors used for selective relay
    pub selective_relay_fanout: usize,
    /// Age after which reachability hints are ignored
    pub reachability_ttl: Duration,
    /// Remote peers the reachability table tracks at once
    pub max_hinted_peers: usize,
    /// Duplicate filter sizing
    pub dedup: DedupConfig,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            max_ttl: 7,
            selective_relay_fanout: 3,
            reachability_ttl: Duration::from_secs(5 * 60),
            max_hinted_peers: DEFAULT_MAX_HINTED_PEERS,
            dedup: DedupConfig::default(),
        }
    }
}

/// Router statistics snapshot
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RouterStats {
    /// Inbound packets routed
    pub packets_received: u64,
    /// Packets handed to the local application
    pub packets_local: u64,
    /// Relay copies produced
    pub packets_relayed: u64,
    /// Packets dropped
    pub packets_dropped: u64,
    /// Outbound frames discarded because a neighbor's link queue was full
    pub frames_shed: u64,
    /// Breakdown of drop reasons
    pub drop_reasons: HashMap<String, u64>,
    /// Direct neighbors
    pub neighbors: usize,
}

#[derive(Debug, Default)]
struct Counters {
    received: AtomicU64,
    local: AtomicU64,
    relayed: AtomicU64,
    shed: AtomicU64,
    malformed: AtomicU64,
    duplicate: AtomicU64,
    ttl_expired: AtomicU64,
    own_packet: AtomicU64,
    bad_signature: AtomicU64,
}

impl Counters {
    fn drop_counter(&self, reason: DropReason) -> &AtomicU64 {
        match reason {
            DropReason::Malformed => &self.malformed,
            DropReason::Duplicate => &self.duplicate,
            DropReason::TtlExpired => &self.ttl_expired,
            DropReason::OwnPacket => &self.own_packet,
            DropReason::BadSignature => &self.bad_signature,
        }
    }
}

/// TTL flood relay with duplicate suppression and selective unicast relay.
///
/// The router only decides; the node performs the writes. All state is
/// internally synchronized.
#[derive(Debug)]
pub struct MeshRouter {
    local: PeerId,
    config: RouterConfig,
    dedup: DuplicateFilter,
    neighbors: NeighborTable,
    ttl: AdaptiveTtl,
    power: Arc<dyn PowerStateProvider>,
    counters: Counters,
}

impl MeshRouter {
    /// Router for `local` reading power state from `power`
    pub fn new(
        local: PeerId,
        config: RouterConfig,
        power: Option<Arc<dyn PowerStateProvider>>,
    ) -> Self {
        Self {
            local,
            dedup: DuplicateFilter::new(config.dedup.clone()),
            neighbors: NeighborTable::new(config.reachability_ttl)
                .with_max_hinted_peers(config.max_hinted_peers),
            ttl: AdaptiveTtl::new(config.max_ttl),
            power: power.unwrap_or_else(|| Arc::new(AlwaysPowered)),
            counters: Counters::default(),
            config,
        }
    }

    /// This node's id
    pub fn local_id(&self) -> PeerId {
        self.local
    }

    /// Neighbor and reachability table
    pub fn neighbors(&self) -> &NeighborTable {
        &self.neighbors
    }

    /// Register a direct neighbor
    pub fn add_neighbor(&self, peer: PeerId, now: Instant) {
        self.neighbors.add_neighbor(peer, now);
    }

    /// Remove a direct neighbor and the hints through it
    pub fn remove_neighbor(&self, peer: &PeerId) -> bool {
        self.neighbors.remove_neighbor(peer)
    }

    /// Forget hints toward a peer that left the mesh
    pub fn forget(&self, peer: &PeerId) {
        self.neighbors.forget(peer);
    }

    /// TTL for a packet originated now
    pub fn default_ttl(&self) -> u8 {
        self.ttl.current(self.power.as_ref())
    }

    /// Record an originated packet so its echoes are recognized
    pub fn mark_sent(&self, packet: &Packet) {
        self.dedup.test_and_insert(&PacketId::of(packet));
    }

    /// Returns `true` if this end-to-end message was already delivered
    pub fn seen_message(&self, sender: PeerId, message_id: &MessageId) -> bool {
        self.dedup
            .test_and_insert(&PacketId::for_message(sender, message_id))
    }

    /// Decide what to do with a packet that arrived from neighbor `from`
    pub fn route_inbound(&self, packet: &Packet, from: PeerId, now: Instant) -> RoutingDecision {
        self.counters.received.fetch_add(1, Ordering::Relaxed);

        if packet.sender == self.local {
            return self.reject(packet, DropReason::OwnPacket);
        }
        if packet.ttl == 0 {
            return self.reject(packet, DropReason::TtlExpired);
        }

        // Duplicates still tell us which neighbor leads to the sender
        self.neighbors.observe(packet.sender, from, packet.ttl, now);

        if self.dedup.test_and_insert_at(&PacketId::of(packet), now) {
            return self.reject(packet, DropReason::Duplicate);
        }

        let deliver = match packet.recipient {
            None => true,
            Some(recipient) => recipient == self.local,
        };
        if deliver {
            self.counters.local.fetch_add(1, Ordering::Relaxed);
        }

        // Unicast to us ends here; everything else floods while TTL allows
        let relay = if packet.recipient == Some(self.local) {
            None
        } else {
            match packet.relayed() {
                Some(next) => {
                    let targets = self.relay_targets(packet.recipient, from);
                    if targets.is_empty() {
                        None
                    } else {
                        self.counters.relayed.fetch_add(1, Ordering::Relaxed);
                        Some(Relay {
                            packet: next,
                            targets,
                        })
                    }
                }
                None if !deliver => return self.reject(packet, DropReason::TtlExpired),
                None => None,
            }
        };

        debug!(
            sender = %packet.sender,
            from = %from,
            ttl = packet.ttl,
            deliver,
            relay = relay.as_ref().map(|r| r.targets.len()).unwrap_or(0),
            "Routed inbound packet"
        );
        RoutingDecision::Accept { deliver, relay }
    }

    /// Path for an originated packet to `recipient`
    pub fn route_outbound(&self, recipient: &PeerId, now: Instant) -> OutboundRoute {
        if self.neighbors.is_neighbor(recipient) {
            return OutboundRoute::Direct(*recipient);
        }
        let hops = self
            .neighbors
            .best_next_hops(recipient, self.config.selective_relay_fanout, now);
        if hops.is_empty() {
            OutboundRoute::Unreachable
        } else {
            OutboundRoute::Selective(hops.into_iter().collect())
        }
    }

    /// Every direct neighbor; used for broadcasts and discovery floods
    pub fn flood_targets(&self) -> Targets {
        self.neighbors.neighbors().into_iter().collect()
    }

    /// Whether `peer` can be reached right now
    pub fn is_reachable(&self, peer: &PeerId, now: Instant) -> bool {
        self.neighbors.is_reachable(peer, now)
    }

    /// Count a drop decided outside the router (parse or signature failures)
    pub fn record_drop(&self, reason: DropReason) {
        self.counters
            .drop_counter(reason)
            .fetch_add(1, Ordering::Relaxed);
    }

    /// Count a frame discarded at a full link instead of written
    pub fn record_shed(&self) {
        self.counters.shed.fetch_add(1, Ordering::Relaxed);
    }

    /// Drop stale reachability hints
    pub fn sweep(&self, now: Instant) {
        self.neighbors.sweep(now);
    }

    /// Statistics snapshot
    pub fn stats(&self) -> RouterStats {
        let reasons = [
            DropReason::Malformed,
            DropReason::Duplicate,
            DropReason::TtlExpired,
            DropReason::OwnPacket,
            DropReason::BadSignature,
        ];
        let mut drop_reasons = HashMap::new();
        let mut dropped = 0;
        for reason in reasons {
            let count = self.counters.drop_counter(reason).load(Ordering::Relaxed);
            if count > 0 {
                drop_reasons.insert(reason.as_str().to_string(), count);
            }
            dropped += count;
        }

        RouterStats {
            packets_received: self.counters.received.load(Ordering::Relaxed),
            packets_local: self.counters.local.load(Ordering::Relaxed),
            packets_relayed: self.counters.relayed.load(Ordering::Relaxed),
            packets_dropped: dropped,
            frames_shed: self.counters.shed.load(Ordering::Relaxed),
            drop_reasons,
            neighbors: self.neighbors.neighbor_count(),
        }
    }

    fn relay_targets(&self, recipient: Option<PeerId>, from: PeerId) -> Targets {
        if let Some(recipient) = recipient {
            if recipient != from && self.neighbors.is_neighbor(&recipient) {
                return SmallVec::from_slice(&[recipient]);
            }
        }
        self.neighbors
            .neighbors()
            .into_iter()
            .filter(|peer| *peer != from)
            .collect()
    }

    fn reject(&self, packet: &Packet, reason: DropReason) -> RoutingDecision {
        self.record_drop(reason);
        debug!(sender = %packet.sender, ttl = packet.ttl, reason = %reason, "Dropping packet");
        RoutingDecision::Drop(reason)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ttl::PowerState;
    use bytes::Bytes;
    use mesh_wire::PacketType;

    fn p(n: u64) -> PeerId {
        PeerId::from_u64(n)
    }

    fn router(local: u64, neighbors: &[u64]) -> MeshRouter {
        let router = MeshRouter::new(p(local), RouterConfig::default(), None);
        let now = Instant::now();
        for n in neighbors {
            router.add_neighbor(p(*n), now);
        }
        router
    }

    fn data(sender: u64, recipient: Option<u64>, ttl: u8) -> Packet {
        Packet::new(
            PacketType::Data,
            p(sender),
            recipient.map(p),
            ttl,
            Bytes::from_static(b"payload"),
        )
        .with_timestamp(1_000)
    }

    fn targets(decision: &RoutingDecision) -> Vec<PeerId> {
        match decision {
            RoutingDecision::Accept {
                relay: Some(relay), ..
            } => {
                let mut t = relay.targets.to_vec();
                t.sort();
                t
            }
            _ => Vec::new(),
        }
    }

    #[test]
    fn test_broadcast_delivered_and_flooded() {
        let r = router(1, &[2, 3, 4]);
        let packet = data(9, None, 5);
        let decision = r.route_inbound(&packet, p(2), Instant::now());

        match &decision {
            RoutingDecision::Accept { deliver, relay } => {
                assert!(*deliver);
                assert_eq!(relay.as_ref().unwrap().packet.ttl, 4);
            }
            other => panic!("unexpected decision {other:?}"),
        }
        assert_eq!(targets(&decision), vec![p(3), p(4)]);
    }

    #[test]
    fn test_duplicate_dropped() {
        let r = router(1, &[2, 3]);
        let packet = data(9, None, 5);
        let now = Instant::now();
        r.route_inbound(&packet, p(2), now);

        // same packet via another neighbor with a different TTL
        let mut again = packet.clone();
        again.ttl = 3;
        assert_eq!(
            r.route_inbound(&again, p(3), now),
            RoutingDecision::Drop(DropReason::Duplicate)
        );
        assert_eq!(r.stats().drop_reasons.get("duplicate"), Some(&1));
    }

    #[test]
    fn test_ttl_boundaries() {
        let r = router(1, &[2, 3]);
        let now = Instant::now();

        // not for us, no hop budget left
        assert_eq!(
            r.route_inbound(&data(9, Some(50), 1), p(2), now),
            RoutingDecision::Drop(DropReason::TtlExpired)
        );
        assert_eq!(
            r.route_inbound(&data(10, None, 0), p(2), now),
            RoutingDecision::Drop(DropReason::TtlExpired)
        );

        // broadcast at ttl 1 is delivered but not relayed
        assert_eq!(
            r.route_inbound(&data(11, None, 1), p(2), now),
            RoutingDecision::Accept {
                deliver: true,
                relay: None
            }
        );
    }

    #[test]
    fn test_addressed_to_us_not_relayed() {
        let r = router(1, &[2, 3]);
        assert_eq!(
            r.route_inbound(&data(9, Some(1), 6), p(2), Instant::now()),
            RoutingDecision::Accept {
                deliver: true,
                relay: None
            }
        );
    }

    #[test]
    fn test_unicast_relay() {
        let r = router(1, &[2, 3, 4]);
        let now = Instant::now();

        // recipient is a neighbor: only it gets the copy
        let decision = r.route_inbound(&data(9, Some(4), 5), p(2), now);
        assert_eq!(targets(&decision), vec![p(4)]);

        // unknown recipient: flood except the arrival link
        let decision = r.route_inbound(&data(10, Some(77), 5), p(2), now);
        assert_eq!(targets(&decision), vec![p(3), p(4)]);
        assert!(matches!(
            decision,
            RoutingDecision::Accept { deliver: false, .. }
        ));
    }

    #[test]
    fn test_own_packet_dropped() {
        let r = router(1, &[2]);
        assert_eq!(
            r.route_inbound(&data(1, None, 5), p(2), Instant::now()),
            RoutingDecision::Drop(DropReason::OwnPacket)
        );
    }

    #[test]
    fn test_outbound_paths() {
        let r = router(1, &[2, 3, 4, 5]);
        let now = Instant::now();
        assert_eq!(r.route_outbound(&p(3), now), OutboundRoute::Direct(p(3)));
        assert_eq!(r.route_outbound(&p(99), now), OutboundRoute::Unreachable);

        // learn that 99 is behind 4 (closest) and 2
        r.route_inbound(&data(99, None, 6), p(4), now);
        r.route_inbound(&data(99, Some(1), 3), p(2), now);
        let route = r.route_outbound(&p(99), now);
        assert_eq!(route.targets().to_vec(), vec![p(4), p(2)]);
        assert!(r.is_reachable(&p(99), now));

        r.remove_neighbor(&p(4));
        r.remove_neighbor(&p(2));
        assert_eq!(r.route_outbound(&p(99), now), OutboundRoute::Unreachable);
    }

    #[test]
    fn test_selective_relay_bounded_by_fanout() {
        let config = RouterConfig {
            selective_relay_fanout: 2,
            ..RouterConfig::default()
        };
        let r = MeshRouter::new(p(1), config, None);
        let now = Instant::now();
        for n in 2..=6 {
            r.add_neighbor(p(n), now);
            let packet = data(99, None, n as u8).with_timestamp(n);
            r.route_inbound(&packet, p(n), now);
        }
        assert_eq!(
            r.route_outbound(&p(99), now),
            OutboundRoute::Selective(SmallVec::from_slice(&[p(6), p(5)]))
        );
    }

    #[test]
    fn test_message_dedup_and_mark_sent() {
        let r = router(1, &[2]);
        let id = MessageId::random();
        assert!(!r.seen_message(p(9), &id));
        assert!(r.seen_message(p(9), &id));
        assert!(!r.seen_message(p(8), &id));

        let ours = data(1, None, 5);
        r.mark_sent(&ours);
        assert_eq!(
            r.route_inbound(&ours, p(2), Instant::now()),
            RoutingDecision::Drop(DropReason::OwnPacket)
        );
    }

    #[test]
    fn test_default_ttl_follows_power() {
        #[derive(Debug)]
        struct Critical;
        impl PowerStateProvider for Critical {
            fn power_state(&self) -> PowerState {
                PowerState::Critical
            }
        }

        assert_eq!(router(1, &[]).default_ttl(), 7);
        let r = MeshRouter::new(p(1), RouterConfig::default(), Some(Arc::new(Critical)));
        assert_eq!(r.default_ttl(), crate::ttl::MIN_TTL);
    }

    #[test]
    fn test_stats_and_display() {
        let r = router(1, &[2, 3]);
        let now = Instant::now();
        r.route_inbound(&data(9, None, 5), p(2), now);
        r.route_inbound(&data(9, None, 5), p(3), now);
        r.record_drop(DropReason::Malformed);
        r.record_shed();

        let stats = r.stats();
        assert_eq!(stats.packets_received, 2);
        assert_eq!(stats.packets_local, 1);
        assert_eq!(stats.packets_relayed, 1);
        assert_eq!(stats.packets_dropped, 2);
        assert_eq!(stats.frames_shed, 1);
        assert_eq!(stats.neighbors, 2);

        assert_eq!(DropReason::TtlExpired.to_string(), "TTL expired");
        assert_eq!(DropReason::BadSignature.to_string(), "bad signature");
    }
}
