//! Neighbor table with reachability hints for selective relay

use dashmap::DashMap;
use mesh_wire::PeerId;
use smallvec::SmallVec;
use std::time::{Duration, Instant};
use tracing::debug;

/// Hints kept per remote peer
const MAX_HINTS_PER_PEER: usize = 4;

/// Remote peers tracked unless configured otherwise
pub const DEFAULT_MAX_HINTED_PEERS: usize = 1024;

/// A direct radio neighbor
#[derive(Debug, Clone)]
pub struct Neighbor {
    /// Neighbor id
    pub peer: PeerId,
    /// When the link was attached
    pub connected_at: Instant,
    /// Last packet received over the link
    pub last_heard: Instant,
}

/// Evidence that `peer` was heard through a neighbor
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReachHint {
    /// Direct neighbor the traffic arrived through
    pub via: PeerId,
    /// Highest remaining TTL seen on arrival; larger means closer
    pub best_ttl: u8,
    /// When the hint was last refreshed
    pub last_seen: Instant,
}

/// Direct neighbors plus hints about which neighbor leads toward which peer
#[derive(Debug)]
pub struct NeighborTable {
    neighbors: DashMap<PeerId, Neighbor>,
    hints: DashMap<PeerId, SmallVec<[ReachHint; MAX_HINTS_PER_PEER]>>,
    hint_ttl: Duration,
    max_hinted_peers: usize,
}

impl NeighborTable {
    /// Create an empty table; hints older than `hint_ttl` are ignored
    pub fn new(hint_ttl: Duration) -> Self {
        Self {
            neighbors: DashMap::new(),
            hints: DashMap::new(),
            hint_ttl,
            max_hinted_peers: DEFAULT_MAX_HINTED_PEERS,
        }
    }

    /// Track at most `max` remote peers; the stalest is evicted for a new one
    pub fn with_max_hinted_peers(mut self, max: usize) -> Self {
        self.max_hinted_peers = max.max(1);
        self
    }

    /// Register a direct neighbor
    pub fn add_neighbor(&self, peer: PeerId, now: Instant) {
        self.neighbors.insert(
            peer,
            Neighbor {
                peer,
                connected_at: now,
                last_heard: now,
            },
        );
        debug!(peer = %peer, "Neighbor added");
    }

    /// Drop a direct neighbor and every hint that routes through it
    pub fn remove_neighbor(&self, peer: &PeerId) -> bool {
        let removed = self.neighbors.remove(peer).is_some();
        self.hints.retain(|_, hints| {
            hints.retain(|h| h.via != *peer);
            !hints.is_empty()
        });
        if removed {
            debug!(peer = %peer, "Neighbor removed");
        }
        removed
    }

    /// Forget hints toward `peer` (it announced departure)
    pub fn forget(&self, peer: &PeerId) {
        self.hints.remove(peer);
    }

    /// Whether `peer` is a direct neighbor
    pub fn is_neighbor(&self, peer: &PeerId) -> bool {
        self.neighbors.contains_key(peer)
    }

    /// All direct neighbors
    pub fn neighbors(&self) -> Vec<PeerId> {
        self.neighbors.iter().map(|n| *n.key()).collect()
    }

    /// Number of direct neighbors
    pub fn neighbor_count(&self) -> usize {
        self.neighbors.len()
    }

    /// Record that traffic from `origin` arrived through `via` with `ttl` left
    pub fn observe(&self, origin: PeerId, via: PeerId, ttl: u8, now: Instant) {
        if let Some(mut neighbor) = self.neighbors.get_mut(&via) {
            neighbor.last_heard = now;
        }
        if origin == via {
            return;
        }

        // origins are unauthenticated at this point
        if !self.hints.contains_key(&origin) && self.hints.len() >= self.max_hinted_peers {
            self.evict_stalest();
        }

        let mut hints = self.hints.entry(origin).or_default();
        if let Some(hint) = hints.iter_mut().find(|h| h.via == via) {
            hint.best_ttl = hint.best_ttl.max(ttl);
            hint.last_seen = now;
            return;
        }
        if hints.len() >= MAX_HINTS_PER_PEER {
            // replace the weakest hint
            if let Some(weakest) = hints
                .iter()
                .enumerate()
                .min_by_key(|(_, h)| (h.best_ttl, h.last_seen))
                .map(|(i, _)| i)
            {
                hints.remove(weakest);
            }
        }
        hints.push(ReachHint {
            via,
            best_ttl: ttl,
            last_seen: now,
        });
    }

    /// Neighbors most likely to reach `target`, best first, at most `limit`
    pub fn best_next_hops(&self, target: &PeerId, limit: usize, now: Instant) -> Vec<PeerId> {
        let Some(hints) = self.hints.get(target) else {
            return Vec::new();
        };
        let mut fresh: SmallVec<[ReachHint; MAX_HINTS_PER_PEER]> = hints
            .iter()
            .filter(|h| now.saturating_duration_since(h.last_seen) < self.hint_ttl)
            .filter(|h| self.neighbors.contains_key(&h.via))
            .copied()
            .collect();
        drop(hints);

        fresh.sort_by(|a, b| {
            b.best_ttl
                .cmp(&a.best_ttl)
                .then_with(|| b.last_seen.cmp(&a.last_seen))
        });
        fresh.into_iter().take(limit).map(|h| h.via).collect()
    }

    /// Whether `peer` is a neighbor or has a fresh hint
    pub fn is_reachable(&self, peer: &PeerId, now: Instant) -> bool {
        self.is_neighbor(peer) || !self.best_next_hops(peer, 1, now).is_empty()
    }

    /// Drop stale hints
    pub fn sweep(&self, now: Instant) {
        let ttl = self.hint_ttl;
        self.hints.retain(|_, hints| {
            hints.retain(|h| now.saturating_duration_since(h.last_seen) < ttl);
            !hints.is_empty()
        });
    }

    /// Number of peers with at least one hint
    pub fn hinted_peers(&self) -> usize {
        self.hints.len()
    }

    fn evict_stalest(&self) {
        let stalest = self
            .hints
            .iter()
            .min_by_key(|entry| entry.value().iter().map(|h| h.last_seen).max())
            .map(|entry| *entry.key());
        if let Some(peer) = stalest {
            self.hints.remove(&peer);
            debug!(peer = %peer, "Reachability table full, evicted stalest peer");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn p(n: u64) -> PeerId {
        PeerId::from_u64(n)
    }

    #[test]
    fn test_neighbors() {
        let table = NeighborTable::new(Duration::from_secs(60));
        let now = Instant::now();
        table.add_neighbor(p(1), now);
        table.add_neighbor(p(2), now);
        assert!(table.is_neighbor(&p(1)));
        assert_eq!(table.neighbor_count(), 2);
        assert!(table.remove_neighbor(&p(1)));
        assert!(!table.remove_neighbor(&p(1)));
        assert_eq!(table.neighbors(), vec![p(2)]);
    }

    #[test]
    fn test_hints_rank_by_ttl() {
        let table = NeighborTable::new(Duration::from_secs(60));
        let now = Instant::now();
        for n in 1..=3 {
            table.add_neighbor(p(n), now);
        }
        let target = p(100);
        table.observe(target, p(1), 3, now);
        table.observe(target, p(2), 6, now);
        table.observe(target, p(3), 5, now);

        assert_eq!(table.best_next_hops(&target, 2, now), vec![p(2), p(3)]);
        assert!(table.is_reachable(&target, now));
        assert!(!table.is_reachable(&p(101), now));
    }

    #[test]
    fn test_hints_expire_and_follow_links() {
        let table = NeighborTable::new(Duration::from_secs(60));
        let now = Instant::now();
        table.add_neighbor(p(1), now);
        table.add_neighbor(p(2), now);
        let target = p(100);
        table.observe(target, p(1), 4, now);
        table.observe(target, p(2), 4, now + Duration::from_secs(30));

        let later = now + Duration::from_secs(70);
        assert_eq!(table.best_next_hops(&target, 3, later), vec![p(2)]);

        table.remove_neighbor(&p(2));
        assert!(table.best_next_hops(&target, 3, now).contains(&p(1)));
        table.sweep(later);
        assert!(!table.is_reachable(&target, later));
        assert_eq!(table.hinted_peers(), 0);
    }

    #[test]
    fn test_hint_capacity_replaces_weakest() {
        let table = NeighborTable::new(Duration::from_secs(60));
        let now = Instant::now();
        for n in 1..=5 {
            table.add_neighbor(p(n), now);
        }
        let target = p(100);
        for n in 1..=4 {
            table.observe(target, p(n), n as u8 + 1, now);
        }
        table.observe(target, p(5), 7, now);

        let hops = table.best_next_hops(&target, 10, now);
        assert_eq!(hops.len(), MAX_HINTS_PER_PEER);
        assert_eq!(hops[0], p(5));
        assert!(!hops.contains(&p(1)));
    }

    #[test]
    fn test_hinted_peers_bounded() {
        let table = NeighborTable::new(Duration::from_secs(60)).with_max_hinted_peers(3);
        let now = Instant::now();
        table.add_neighbor(p(1), now);
        for (i, origin) in (10..13).enumerate() {
            table.observe(p(origin), p(1), 5, now + Duration::from_secs(i as u64));
        }
        // refreshing a tracked peer never evicts
        table.observe(p(10), p(1), 5, now + Duration::from_secs(5));
        assert_eq!(table.hinted_peers(), 3);

        let later = now + Duration::from_secs(6);
        table.observe(p(13), p(1), 5, later);
        assert_eq!(table.hinted_peers(), 3);
        assert!(table.is_reachable(&p(13), later));
        assert!(table.is_reachable(&p(10), later));
        assert!(!table.is_reachable(&p(11), later));

        for origin in 1_000..2_000 {
            table.observe(p(origin), p(1), 5, later);
        }
        assert_eq!(table.hinted_peers(), 3);
    }

    #[test]
    fn test_forget_and_self_observation() {
        let table = NeighborTable::new(Duration::from_secs(60));
        let now = Instant::now();
        table.add_neighbor(p(1), now);
        table.observe(p(1), p(1), 7, now);
        assert_eq!(table.hinted_peers(), 0);

        table.observe(p(9), p(1), 7, now);
        table.forget(&p(9));
        assert!(!table.is_reachable(&p(9), now));
    }
}
