//! Fragmentation and reassembly for payloads larger than one link write.
//!
//! A fragment travels as the payload of a `Fragment` packet:
//!
//! ```text
//! | transfer_id(8) | index(2) | total(2) | inner_type(1) | inner_flags(1) | data ... |
//! ```
//!
//! `inner_type` and `inner_flags` describe the packet that was split, so the
//! receiver can rebuild it once every index `0..total` has arrived.
//! Reassembly is keyed by index, which tolerates reordering and duplicates.

use crate::error::WireError;
use crate::packet::{Flags, PacketType, PeerId};
use bytes::{Buf, BufMut, Bytes, BytesMut};
use rand::RngCore;
use std::collections::{BTreeMap, HashMap};
use std::time::{Duration, Instant};
use tracing::debug;

/// Fixed prefix of every fragment payload
pub const FRAGMENT_HEADER_SIZE: usize = 8 + 2 + 2 + 1 + 1;

/// Largest number of fragments a single transfer may have
pub const MAX_FRAGMENTS: usize = u16::MAX as usize;

/// Per-fragment metadata
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FragmentHeader {
    /// Shared by every fragment of one transfer
    pub transfer_id: u64,
    /// 0-based position
    pub index: u16,
    /// Number of fragments in the transfer
    pub total: u16,
    /// Type of the packet that was split
    pub inner_type: PacketType,
    /// Flags of the packet that was split (only `ENCRYPTED` is meaningful)
    pub inner_flags: Flags,
}

/// One piece of a split payload
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Fragment {
    /// Fragment metadata
    pub header: FragmentHeader,
    /// Slice of the original payload
    pub data: Bytes,
}

impl Fragment {
    /// Encode into a fragment packet payload
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(FRAGMENT_HEADER_SIZE + self.data.len());
        buf.put_u64(self.header.transfer_id);
        buf.put_u16(self.header.index);
        buf.put_u16(self.header.total);
        buf.put_u8(self.header.inner_type.tag());
        buf.put_u8(self.header.inner_flags.bits());
        buf.put_slice(&self.data);
        buf.freeze()
    }

    /// Decode a fragment packet payload
    pub fn decode(mut buf: Bytes) -> Result<Self, WireError> {
        if buf.len() < FRAGMENT_HEADER_SIZE {
            return Err(WireError::Malformed("short fragment header"));
        }

        let transfer_id = buf.get_u64();
        let index = buf.get_u16();
        let total = buf.get_u16();
        if total == 0 || index >= total {
            return Err(WireError::Malformed("fragment index out of range"));
        }

        let inner_type = PacketType::try_from(buf.get_u8())
            .map_err(|_| WireError::Malformed("unknown inner type tag"))?;
        if inner_type == PacketType::Fragment || inner_type.is_handshake() {
            return Err(WireError::Malformed("inner type cannot be fragmented"));
        }
        let inner_flags = Flags::from_bits(buf.get_u8())
            .ok_or(WireError::Malformed("unknown inner flag bits"))?;

        Ok(Self {
            header: FragmentHeader {
                transfer_id,
                index,
                total,
                inner_type,
                inner_flags,
            },
            data: buf,
        })
    }
}

/// Split `payload` into fragments whose encoded size fits `max_fragment_size`.
///
/// An empty payload still yields one (empty) fragment so the receiver sees a
/// complete transfer.
pub fn split(
    payload: &Bytes,
    max_fragment_size: usize,
    inner_type: PacketType,
    inner_flags: Flags,
) -> Result<Vec<Fragment>, WireError> {
    split_with_id(
        rand::thread_rng().next_u64(),
        payload,
        max_fragment_size,
        inner_type,
        inner_flags,
    )
}

/// [`split`] with an explicit transfer id
pub fn split_with_id(
    transfer_id: u64,
    payload: &Bytes,
    max_fragment_size: usize,
    inner_type: PacketType,
    inner_flags: Flags,
) -> Result<Vec<Fragment>, WireError> {
    if max_fragment_size <= FRAGMENT_HEADER_SIZE {
        return Err(WireError::Size(max_fragment_size));
    }
    let chunk_size = max_fragment_size - FRAGMENT_HEADER_SIZE;
    let total = payload.len().div_ceil(chunk_size).max(1);
    if total > MAX_FRAGMENTS {
        return Err(WireError::Size(payload.len()));
    }

    let mut fragments = Vec::with_capacity(total);
    for index in 0..total {
        let start = index * chunk_size;
        let end = std::cmp::min(start + chunk_size, payload.len());
        fragments.push(Fragment {
            header: FragmentHeader {
                transfer_id,
                index: index as u16,
                total: total as u16,
                inner_type,
                inner_flags,
            },
            data: payload.slice(start..end),
        });
    }

    Ok(fragments)
}

/// Limits applied by the [`FragmentAssembler`]
#[derive(Debug, Clone)]
pub struct AssemblerConfig {
    /// A transfer not completed within this window is discarded
    pub transfer_timeout: Duration,
    /// Concurrent partial transfers per sender
    pub max_transfers_per_peer: usize,
    /// Concurrent partial transfers overall
    pub max_transfers_total: usize,
}

impl Default for AssemblerConfig {
    fn default() -> Self {
        Self {
            transfer_timeout: Duration::from_secs(30),
            max_transfers_per_peer: 8,
            max_transfers_total: 64,
        }
    }
}

/// A fully reassembled payload
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reassembled {
    /// Originating peer
    pub sender: PeerId,
    /// Transfer the payload belonged to
    pub transfer_id: u64,
    /// Type of the packet that was split
    pub inner_type: PacketType,
    /// Flags of the packet that was split
    pub inner_flags: Flags,
    /// Original payload
    pub payload: Bytes,
}

/// Why a partial transfer was discarded
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiscardReason {
    /// Not completed within the transfer timeout
    Timeout,
    /// Evicted to make room for a newer transfer
    Evicted,
    /// Sender disconnected
    Cancelled,
}

/// Report for a partial transfer that was discarded
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiscardedTransfer {
    /// Originating peer
    pub sender: PeerId,
    /// Transfer identifier
    pub transfer_id: u64,
    /// Distinct fragments received before discard
    pub received: usize,
    /// Declared fragment count
    pub total: u16,
    /// Why it was discarded
    pub reason: DiscardReason,
}

#[derive(Debug)]
struct Transfer {
    total: u16,
    inner_type: PacketType,
    inner_flags: Flags,
    pieces: BTreeMap<u16, Bytes>,
    created: Instant,
}

impl Transfer {
    fn discarded(&self, key: (PeerId, u64), reason: DiscardReason) -> DiscardedTransfer {
        DiscardedTransfer {
            sender: key.0,
            transfer_id: key.1,
            received: self.pieces.len(),
            total: self.total,
            reason,
        }
    }
}

/// Buffers fragments per (sender, transfer id) until a transfer completes.
///
/// Memory is bounded by the per-sender and global transfer limits; the oldest
/// transfer is evicted when a limit would be exceeded. Expired transfers are
/// only removed by [`FragmentAssembler::sweep`].
#[derive(Debug)]
pub struct FragmentAssembler {
    config: AssemblerConfig,
    transfers: HashMap<(PeerId, u64), Transfer>,
    discarded: Vec<DiscardedTransfer>,
}

impl FragmentAssembler {
    /// Create an assembler with the given limits
    pub fn new(config: AssemblerConfig) -> Self {
        Self {
            config,
            transfers: HashMap::new(),
            discarded: Vec::new(),
        }
    }

    /// Number of partial transfers held
    pub fn len(&self) -> usize {
        self.transfers.len()
    }

    /// True when no partial transfer is held
    pub fn is_empty(&self) -> bool {
        self.transfers.is_empty()
    }

    /// Add a fragment, returning the full payload once every index has arrived.
    ///
    /// Re-inserting an index already held is a no-op. A fragment whose total
    /// or inner type disagrees with the transfer it claims to belong to is
    /// rejected and the transfer is left untouched.
    pub fn ingest(
        &mut self,
        sender: PeerId,
        fragment: Fragment,
        now: Instant,
    ) -> Result<Option<Reassembled>, WireError> {
        let header = fragment.header;
        if header.total == 0 || header.index >= header.total {
            return Err(WireError::Malformed("fragment index out of range"));
        }
        let key = (sender, header.transfer_id);

        if header.total == 1 {
            self.transfers.remove(&key);
            return Ok(Some(Reassembled {
                sender,
                transfer_id: header.transfer_id,
                inner_type: header.inner_type,
                inner_flags: header.inner_flags,
                payload: fragment.data,
            }));
        }

        if !self.transfers.contains_key(&key) {
            self.make_room(sender);
            self.transfers.insert(
                key,
                Transfer {
                    total: header.total,
                    inner_type: header.inner_type,
                    inner_flags: header.inner_flags,
                    pieces: BTreeMap::new(),
                    created: now,
                },
            );
        }

        let Some(transfer) = self.transfers.get_mut(&key) else {
            return Ok(None);
        };
        if transfer.total != header.total
            || transfer.inner_type != header.inner_type
            || transfer.inner_flags != header.inner_flags
        {
            return Err(WireError::Malformed("fragment disagrees with transfer"));
        }

        transfer.pieces.entry(header.index).or_insert(fragment.data);
        if transfer.pieces.len() < transfer.total as usize {
            return Ok(None);
        }

        let Some(transfer) = self.transfers.remove(&key) else {
            return Ok(None);
        };
        let size = transfer.pieces.values().map(Bytes::len).sum();
        let mut payload = BytesMut::with_capacity(size);
        for piece in transfer.pieces.values() {
            payload.extend_from_slice(piece);
        }

        debug!(
            sender = %sender,
            transfer_id = header.transfer_id,
            fragments = transfer.total,
            size,
            "Transfer reassembled"
        );

        Ok(Some(Reassembled {
            sender,
            transfer_id: header.transfer_id,
            inner_type: transfer.inner_type,
            inner_flags: transfer.inner_flags,
            payload: payload.freeze(),
        }))
    }

    /// Discard transfers older than the timeout, plus any evicted since the
    /// last sweep
    pub fn sweep(&mut self, now: Instant) -> Vec<DiscardedTransfer> {
        let timeout = self.config.transfer_timeout;
        let expired: Vec<(PeerId, u64)> = self
            .transfers
            .iter()
            .filter(|(_, t)| now.saturating_duration_since(t.created) >= timeout)
            .map(|(k, _)| *k)
            .collect();

        let mut report = std::mem::take(&mut self.discarded);
        for key in expired {
            if let Some(transfer) = self.transfers.remove(&key) {
                report.push(transfer.discarded(key, DiscardReason::Timeout));
            }
        }
        report
    }

    /// Drop every partial transfer from `sender`
    pub fn cancel_sender(&mut self, sender: PeerId) -> Vec<DiscardedTransfer> {
        let keys: Vec<(PeerId, u64)> = self
            .transfers
            .keys()
            .filter(|(s, _)| *s == sender)
            .copied()
            .collect();

        keys.into_iter()
            .filter_map(|key| {
                self.transfers
                    .remove(&key)
                    .map(|t| t.discarded(key, DiscardReason::Cancelled))
            })
            .collect()
    }

    fn make_room(&mut self, sender: PeerId) {
        let per_sender = self.transfers.keys().filter(|(s, _)| *s == sender).count();
        if per_sender >= self.config.max_transfers_per_peer {
            self.evict_oldest(Some(sender));
        }
        if self.transfers.len() >= self.config.max_transfers_total {
            self.evict_oldest(None);
        }
    }

    fn evict_oldest(&mut self, sender: Option<PeerId>) {
        let oldest = self
            .transfers
            .iter()
            .filter(|((s, _), _)| sender.map_or(true, |wanted| *s == wanted))
            .min_by_key(|(_, t)| t.created)
            .map(|(k, _)| *k);

        if let Some(key) = oldest {
            if let Some(transfer) = self.transfers.remove(&key) {
                debug!(sender = %key.0, transfer_id = key.1, "Evicting partial transfer");
                self.discarded
                    .push(transfer.discarded(key, DiscardReason::Evicted));
            }
        }
    }
}

impl Default for FragmentAssembler {
    fn default() -> Self {
        Self::new(AssemblerConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn payload(len: usize) -> Bytes {
        Bytes::from((0..len).map(|i| (i % 251) as u8).collect::<Vec<u8>>())
    }

    fn assemble(
        assembler: &mut FragmentAssembler,
        sender: PeerId,
        fragments: impl IntoIterator<Item = Fragment>,
    ) -> Option<Reassembled> {
        let now = Instant::now();
        let mut out = None;
        for fragment in fragments {
            if let Some(done) = assembler.ingest(sender, fragment, now).unwrap() {
                assert!(out.is_none(), "completed twice");
                out = Some(done);
            }
        }
        out
    }

    #[test]
    fn test_split_sizes() {
        let data = payload(2048);
        let fragments = split(&data, 200, PacketType::Data, Flags::empty()).unwrap();
        let chunk = 200 - FRAGMENT_HEADER_SIZE;
        assert_eq!(fragments.len(), 2048usize.div_ceil(chunk));
        assert!(fragments.iter().all(|f| f.encode().len() <= 200));
        assert!(fragments
            .iter()
            .all(|f| f.header.transfer_id == fragments[0].header.transfer_id));
        assert_eq!(fragments.last().unwrap().header.index as usize, fragments.len() - 1);
    }

    #[test]
    fn test_split_empty_and_tiny_limit() {
        let fragments = split(&Bytes::new(), 64, PacketType::Data, Flags::empty()).unwrap();
        assert_eq!(fragments.len(), 1);
        assert_eq!(fragments[0].header.total, 1);
        assert!(fragments[0].data.is_empty());

        assert!(split(&payload(10), FRAGMENT_HEADER_SIZE, PacketType::Data, Flags::empty()).is_err());
    }

    #[test]
    fn test_fragment_encoding() {
        let fragment = Fragment {
            header: FragmentHeader {
                transfer_id: 0xdead_beef,
                index: 2,
                total: 5,
                inner_type: PacketType::Data,
                inner_flags: Flags::ENCRYPTED,
            },
            data: Bytes::from_static(b"piece"),
        };
        assert_eq!(Fragment::decode(fragment.encode()).unwrap(), fragment);

        let mut bad = BytesMut::from(&fragment.encode()[..]);
        bad[10] = 0;
        bad[11] = 2;
        assert!(Fragment::decode(bad.freeze()).is_err());

        let mut nested = fragment.clone();
        nested.header.inner_type = PacketType::Fragment;
        assert!(Fragment::decode(nested.encode()).is_err());
    }

    #[test]
    fn test_reassemble_in_order() {
        let data = payload(2048);
        let fragments = split(&data, 256, PacketType::Data, Flags::ENCRYPTED).unwrap();
        let mut assembler = FragmentAssembler::default();
        let done = assemble(&mut assembler, PeerId::from_u64(1), fragments).unwrap();
        assert_eq!(done.payload, data);
        assert_eq!(done.inner_flags, Flags::ENCRYPTED);
        assert!(assembler.is_empty());
    }

    #[test]
    fn test_reassemble_reverse_interleaved_and_duplicated() {
        let a = payload(1500);
        let b = Bytes::from(vec![9u8; 900]);
        let mut fa = split(&a, 100, PacketType::Data, Flags::empty()).unwrap();
        let fb = split(&b, 100, PacketType::Extension(0x30), Flags::empty()).unwrap();
        fa.reverse();

        let sender = PeerId::from_u64(3);
        let mut assembler = FragmentAssembler::default();
        let now = Instant::now();
        let mut results = Vec::new();

        let mut ib = fb.into_iter();
        for f in fa {
            // duplicate every fragment of A
            if let Some(r) = assembler.ingest(sender, f.clone(), now).unwrap() {
                results.push(r);
            }
            if let Some(r) = assembler.ingest(sender, f, now).unwrap() {
                results.push(r);
            }
            if let Some(g) = ib.next() {
                if let Some(r) = assembler.ingest(sender, g, now).unwrap() {
                    results.push(r);
                }
            }
        }
        for g in ib {
            if let Some(r) = assembler.ingest(sender, g, now).unwrap() {
                results.push(r);
            }
        }

        assert_eq!(results.len(), 2);
        let got_a = results.iter().find(|r| r.inner_type == PacketType::Data).unwrap();
        let got_b = results
            .iter()
            .find(|r| r.inner_type == PacketType::Extension(0x30))
            .unwrap();
        assert_eq!(got_a.payload, a);
        assert_eq!(got_b.payload, b);
        assert!(assembler.is_empty());
    }

    #[test]
    fn test_same_transfer_id_different_senders() {
        let data = payload(300);
        let fragments = split_with_id(7, &data, 100, PacketType::Data, Flags::empty()).unwrap();
        let mut assembler = FragmentAssembler::default();
        let now = Instant::now();

        assembler
            .ingest(PeerId::from_u64(1), fragments[0].clone(), now)
            .unwrap();
        assert_eq!(assembler.len(), 1);
        let done = assemble(&mut assembler, PeerId::from_u64(2), fragments).unwrap();
        assert_eq!(done.sender, PeerId::from_u64(2));
        assert_eq!(assembler.len(), 1);
    }

    #[test]
    fn test_inconsistent_fragment_rejected() {
        let fragments = split_with_id(7, &payload(300), 100, PacketType::Data, Flags::empty()).unwrap();
        let mut assembler = FragmentAssembler::default();
        let sender = PeerId::from_u64(1);
        let now = Instant::now();
        assembler.ingest(sender, fragments[0].clone(), now).unwrap();

        let mut liar = fragments[1].clone();
        liar.header.total += 1;
        assert!(assembler.ingest(sender, liar, now).is_err());
        assert_eq!(assembler.len(), 1);
    }

    #[test]
    fn test_sweep_discards_expired() {
        let fragments = split(&payload(500), 100, PacketType::Data, Flags::empty()).unwrap();
        let mut assembler = FragmentAssembler::new(AssemblerConfig {
            transfer_timeout: Duration::from_secs(30),
            ..Default::default()
        });
        let start = Instant::now();
        let sender = PeerId::from_u64(4);
        assembler.ingest(sender, fragments[0].clone(), start).unwrap();
        assembler.ingest(sender, fragments[1].clone(), start).unwrap();

        assert!(assembler.sweep(start + Duration::from_secs(10)).is_empty());
        let report = assembler.sweep(start + Duration::from_secs(31));
        assert_eq!(report.len(), 1);
        assert_eq!(report[0].received, 2);
        assert_eq!(report[0].reason, DiscardReason::Timeout);
        assert!(assembler.is_empty());
    }

    #[test]
    fn test_per_sender_limit_evicts_oldest() {
        let mut assembler = FragmentAssembler::new(AssemblerConfig {
            max_transfers_per_peer: 2,
            ..Default::default()
        });
        let sender = PeerId::from_u64(5);
        let start = Instant::now();
        for id in 0..3u64 {
            let fragments = split_with_id(id, &payload(300), 100, PacketType::Data, Flags::empty()).unwrap();
            assembler
                .ingest(sender, fragments[0].clone(), start + Duration::from_secs(id))
                .unwrap();
        }
        assert_eq!(assembler.len(), 2);

        let report = assembler.sweep(start + Duration::from_secs(3));
        assert_eq!(report.len(), 1);
        assert_eq!(report[0].transfer_id, 0);
        assert_eq!(report[0].reason, DiscardReason::Evicted);
    }

    #[test]
    fn test_total_limit_and_cancel_sender() {
        let mut assembler = FragmentAssembler::new(AssemblerConfig {
            max_transfers_total: 2,
            ..Default::default()
        });
        let now = Instant::now();
        for peer in 1..=3u64 {
            let fragments = split_with_id(peer, &payload(300), 100, PacketType::Data, Flags::empty()).unwrap();
            assembler
                .ingest(PeerId::from_u64(peer), fragments[0].clone(), now + Duration::from_millis(peer))
                .unwrap();
        }
        assert_eq!(assembler.len(), 2);

        let cancelled = assembler.cancel_sender(PeerId::from_u64(3));
        assert_eq!(cancelled.len(), 1);
        assert_eq!(cancelled[0].reason, DiscardReason::Cancelled);
        assert_eq!(assembler.len(), 1);
    }
}
