//! Rotating bloom-filter pair for packet deduplication.
//!
//! Two generations are kept. Lookups consult both; inserts go to the current
//! one. When the current generation reaches its capacity or its age limit it
//! becomes the previous one and a fresh generation starts, so an identifier is
//! remembered for at least one full generation and memory never grows.

use mesh_wire::PacketId;
use std::sync::Mutex;
use std::time::{Duration, Instant};
use tracing::debug;

/// Sizing and rotation parameters
#[derive(Debug, Clone)]
pub struct DedupConfig {
    /// Identifiers per generation before rotating
    pub capacity: usize,
    /// Target false-positive probability at `capacity` entries
    pub false_positive_rate: f64,
    /// Maximum age of a generation before rotating
    pub rotation: Duration,
}

impl Default for DedupConfig {
    fn default() -> Self {
        Self {
            capacity: 1000,
            false_positive_rate: 0.001,
            rotation: Duration::from_secs(300),
        }
    }
}

#[derive(Debug, Clone)]
struct Bloom {
    bits: Vec<u64>,
    num_bits: u64,
    num_hashes: u32,
    inserted: usize,
    started: Instant,
}

impl Bloom {
    fn new(num_bits: u64, num_hashes: u32, now: Instant) -> Self {
        Self {
            bits: vec![0u64; num_bits.div_ceil(64) as usize],
            num_bits,
            num_hashes,
            inserted: 0,
            started: now,
        }
    }

    fn positions(&self, id: &PacketId) -> impl Iterator<Item = u64> + '_ {
        let bytes = id.as_bytes();
        let mut lo = [0u8; 8];
        let mut hi = [0u8; 8];
        lo.copy_from_slice(&bytes[..8]);
        hi.copy_from_slice(&bytes[8..16]);
        let h1 = u64::from_le_bytes(lo);
        let h2 = u64::from_le_bytes(hi) | 1;
        (0..self.num_hashes as u64)
            .map(move |i| h1.wrapping_add(i.wrapping_mul(h2)) % self.num_bits)
    }

    fn contains(&self, id: &PacketId) -> bool {
        self.positions(id)
            .all(|bit| self.bits[(bit / 64) as usize] & (1 << (bit % 64)) != 0)
    }

    fn insert(&mut self, id: &PacketId) {
        let positions: Vec<u64> = self.positions(id).collect();
        for bit in positions {
            self.bits[(bit / 64) as usize] |= 1 << (bit % 64);
        }
        self.inserted += 1;
    }
}

#[derive(Debug)]
struct Generations {
    current: Bloom,
    previous: Option<Bloom>,
}

/// Probabilistic "seen before" set over [`PacketId`]s.
///
/// Internally locked; share it behind an `Arc` and call from any task.
#[derive(Debug)]
pub struct DuplicateFilter {
    config: DedupConfig,
    num_bits: u64,
    num_hashes: u32,
    state: Mutex<Generations>,
}

impl DuplicateFilter {
    /// Create a filter sized for `config`
    pub fn new(config: DedupConfig) -> Self {
        let (num_bits, num_hashes) = optimal_params(config.capacity, config.false_positive_rate);
        debug!(
            capacity = config.capacity,
            num_bits, num_hashes, "Sizing duplicate filter"
        );
        Self {
            state: Mutex::new(Generations {
                current: Bloom::new(num_bits, num_hashes, Instant::now()),
                previous: None,
            }),
            config,
            num_bits,
            num_hashes,
        }
    }

    /// Returns `true` if `id` was already seen, recording it either way
    pub fn test_and_insert(&self, id: &PacketId) -> bool {
        self.test_and_insert_at(id, Instant::now())
    }

    /// [`DuplicateFilter::test_and_insert`] with an explicit clock
    pub fn test_and_insert_at(&self, id: &PacketId, now: Instant) -> bool {
        let mut state = self.state.lock().unwrap_or_else(|err| err.into_inner());
        self.maybe_rotate(&mut state, now);

        if state.current.contains(id) {
            return true;
        }
        let seen_before = state
            .previous
            .as_ref()
            .map(|bloom| bloom.contains(id))
            .unwrap_or(false);

        // Carry the id forward so it survives the next rotation too
        state.current.insert(id);
        seen_before
    }

    /// Membership test without recording
    pub fn contains(&self, id: &PacketId) -> bool {
        let state = self.state.lock().unwrap_or_else(|err| err.into_inner());
        state.current.contains(id)
            || state
                .previous
                .as_ref()
                .map(|bloom| bloom.contains(id))
                .unwrap_or(false)
    }

    /// Force a generation swap
    pub fn rotate(&self) {
        let mut state = self.state.lock().unwrap_or_else(|err| err.into_inner());
        self.swap(&mut state, Instant::now());
    }

    /// Bits per generation
    pub fn num_bits(&self) -> u64 {
        self.num_bits
    }

    /// Hash functions per lookup
    pub fn num_hashes(&self) -> u32 {
        self.num_hashes
    }

    fn maybe_rotate(&self, state: &mut Generations, now: Instant) {
        let full = state.current.inserted >= self.config.capacity;
        let stale = now.saturating_duration_since(state.current.started) >= self.config.rotation;
        if full || stale {
            self.swap(state, now);
        }
    }

    fn swap(&self, state: &mut Generations, now: Instant) {
        let fresh = Bloom::new(self.num_bits, self.num_hashes, now);
        let old = std::mem::replace(&mut state.current, fresh);
        debug!(inserted = old.inserted, "Rotating duplicate filter generation");
        state.previous = Some(old);
    }
}

impl Default for DuplicateFilter {
    fn default() -> Self {
        Self::new(DedupConfig::default())
    }
}

/// Bits and hash count for `n` entries at false-positive rate `p`
fn optimal_params(n: usize, p: f64) -> (u64, u32) {
    let n = n.max(1) as f64;
    let p = p.clamp(1e-9, 0.5);
    let ln2 = std::f64::consts::LN_2;
    let m = (-(n * p.ln()) / (ln2 * ln2)).ceil().max(64.0);
    let k = ((m / n) * ln2).round().clamp(1.0, 16.0);
    (m as u64, k as u32)
}
