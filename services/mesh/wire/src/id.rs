//! Packet and message identifiers.

use crate::fragment::Fragment;
use crate::message::MessageId;
use crate::packet::{Packet, PacketType, PeerId};
use sha2::{Digest, Sha256};
use std::fmt;

/// Identifier length in bytes
pub const PACKET_ID_LEN: usize = 16;

const DOMAIN_PACKET: u8 = 0x01;
const DOMAIN_FRAGMENT: u8 = 0x02;
const DOMAIN_MESSAGE: u8 = 0x03;

/// Deterministic identifier used as the duplicate-filter key.
///
/// Two packets with the same identifier are the same logical message no
/// matter which neighbor delivered them. TTL is not part of the identity.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PacketId(pub [u8; PACKET_ID_LEN]);

impl PacketId {
    /// Identifier of a packet.
    ///
    /// Fragments are keyed by their transfer id and index; everything else by
    /// type, sender, timestamp and a digest of the payload.
    pub fn of(packet: &Packet) -> Self {
        if packet.packet_type == PacketType::Fragment {
            if let Ok(fragment) = Fragment::decode(packet.payload.clone()) {
                return Self::for_fragment(
                    packet.sender,
                    fragment.header.transfer_id,
                    fragment.header.index,
                );
            }
        }

        let payload_digest = Sha256::digest(&packet.payload);
        Self::digest(
            DOMAIN_PACKET,
            &[
                &[packet.packet_type.tag()],
                packet.sender.as_bytes(),
                &packet.timestamp.to_be_bytes(),
                &payload_digest,
            ],
        )
    }

    /// Identifier of one fragment of a transfer
    pub fn for_fragment(sender: PeerId, transfer_id: u64, index: u16) -> Self {
        Self::digest(
            DOMAIN_FRAGMENT,
            &[
                sender.as_bytes(),
                &transfer_id.to_be_bytes(),
                &index.to_be_bytes(),
            ],
        )
    }

    /// Identifier of an end-to-end message, independent of the packet that
    /// carried it
    pub fn for_message(sender: PeerId, message_id: &MessageId) -> Self {
        Self::digest(DOMAIN_MESSAGE, &[sender.as_bytes(), message_id.as_bytes()])
    }

    /// Raw identifier bytes
    pub fn as_bytes(&self) -> &[u8; PACKET_ID_LEN] {
        &self.0
    }

    fn digest(domain: u8, parts: &[&[u8]]) -> Self {
        let mut hasher = Sha256::new();
        hasher.update([domain]);
        for part in parts {
            hasher.update(part);
        }
        let full = hasher.finalize();
        let mut id = [0u8; PACKET_ID_LEN];
        id.copy_from_slice(&full[..PACKET_ID_LEN]);
        Self(id)
    }
}

impl fmt::Debug for PacketId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PacketId(")?;
        for b in &self.0[..6] {
            write!(f, "{:02x}", b)?;
        }
        write!(f, "..)")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;

    fn packet(payload: &'static [u8], ts: u64) -> Packet {
        Packet::new(
            PacketType::Data,
            PeerId::from_u64(1),
            None,
            7,
            Bytes::from_static(payload),
        )
        .with_timestamp(ts)
    }

    #[test]
    fn test_id_ignores_ttl() {
        let a = packet(b"abc", 10);
        let b = a.relayed().unwrap();
        assert_eq!(PacketId::of(&a), PacketId::of(&b));
    }

    #[test]
    fn test_id_distinguishes_content() {
        assert_ne!(
            PacketId::of(&packet(b"abc", 10)),
            PacketId::of(&packet(b"abd", 10))
        );
        assert_ne!(
            PacketId::of(&packet(b"abc", 10)),
            PacketId::of(&packet(b"abc", 11))
        );
    }

    #[test]
    fn test_fragment_id_uses_transfer() {
        let sender = PeerId::from_u64(9);
        assert_eq!(
            PacketId::for_fragment(sender, 77, 0),
            PacketId::for_fragment(sender, 77, 0)
        );
        assert_ne!(
            PacketId::for_fragment(sender, 77, 0),
            PacketId::for_fragment(sender, 77, 1)
        );
        assert_ne!(
            PacketId::for_fragment(sender, 77, 0),
            PacketId::for_fragment(PeerId::from_u64(10), 77, 0)
        );
    }
}
