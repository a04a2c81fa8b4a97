//! Packet codec for the mesh wire protocol.
//!
//! Every packet travels as a single link-layer write. Multi-byte integers are
//! big-endian.
//!
//! ```text
//! +---------+------+-------+-----------+----------------+-----------+-----+-------------+---------+-------------+
//! | version | type | flags | sender(8) | recipient(0|8) | ts(8, ms) | ttl | payload_len | payload | sig(0|64)   |
//! +---------+------+-------+-----------+----------------+-----------+-----+-------------+---------+-------------+
//! ```

use crate::error::{DecodeError, WireError};
use bitflags::bitflags;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::time::{SystemTime, UNIX_EPOCH};

/// Wire protocol version
pub const WIRE_VERSION: u8 = 1;

/// Peer identifier length in bytes
pub const PEER_ID_LEN: usize = 8;

/// Ed25519 signature length in bytes
pub const SIGNATURE_LEN: usize = 64;

/// Smallest valid packet: broadcast, unsigned, empty payload
pub const MIN_HEADER_SIZE: usize = 3 + PEER_ID_LEN + 8 + 1 + 2;

/// Largest payload the 16-bit length field can describe
pub const MAX_PAYLOAD_SIZE: usize = u16::MAX as usize;

/// First tag of the application extension range
pub const EXTENSION_TAG_MIN: u8 = 0x20;

/// Last tag of the application extension range
pub const EXTENSION_TAG_MAX: u8 = 0xFE;

/// Stable 8-byte peer identifier
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PeerId(pub [u8; PEER_ID_LEN]);

impl PeerId {
    /// Wrap raw identifier bytes
    pub const fn new(bytes: [u8; PEER_ID_LEN]) -> Self {
        Self(bytes)
    }

    /// Build an identifier from an integer (tests and tooling)
    pub const fn from_u64(value: u64) -> Self {
        Self(value.to_be_bytes())
    }

    /// Raw identifier bytes
    pub fn as_bytes(&self) -> &[u8; PEER_ID_LEN] {
        &self.0
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for b in self.0 {
            write!(f, "{:02x}", b)?;
        }
        Ok(())
    }
}

impl fmt::Debug for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PeerId({})", self)
    }
}

impl FromStr for PeerId {
    type Err = WireError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if s.len() != PEER_ID_LEN * 2 || !s.is_ascii() {
            return Err(WireError::Malformed("peer id must be 16 hex characters"));
        }
        let mut bytes = [0u8; PEER_ID_LEN];
        for (i, byte) in bytes.iter_mut().enumerate() {
            *byte = u8::from_str_radix(&s[i * 2..i * 2 + 2], 16)
                .map_err(|_| WireError::Malformed("peer id must be 16 hex characters"))?;
        }
        Ok(Self(bytes))
    }
}

/// Packet type tags
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PacketType {
    /// First handshake message (initiator to responder)
    HandshakeInit,
    /// Second handshake message (responder to initiator)
    HandshakeResponse,
    /// Key confirmation from the initiator
    HandshakeConfirm,
    /// Application data, possibly encrypted
    Data,
    /// End-to-end delivery acknowledgement
    Ack,
    /// One piece of a fragmented transfer
    Fragment,
    /// Sender is leaving the mesh
    Leave,
    /// Application-defined tag; relayed and delivered as opaque payload
    Extension(u8),
}

impl PacketType {
    /// Wire tag for this type
    pub fn tag(self) -> u8 {
        match self {
            PacketType::HandshakeInit => 0x01,
            PacketType::HandshakeResponse => 0x02,
            PacketType::HandshakeConfirm => 0x03,
            PacketType::Data => 0x04,
            PacketType::Ack => 0x05,
            PacketType::Fragment => 0x06,
            PacketType::Leave => 0x07,
            PacketType::Extension(tag) => tag,
        }
    }

    /// Build an extension type, rejecting tags outside the extension range
    pub fn extension(tag: u8) -> Result<Self, WireError> {
        if (EXTENSION_TAG_MIN..=EXTENSION_TAG_MAX).contains(&tag) {
            Ok(PacketType::Extension(tag))
        } else {
            Err(WireError::Type(tag))
        }
    }

    /// Handshake messages are never encrypted and never fragmented
    pub fn is_handshake(self) -> bool {
        matches!(
            self,
            PacketType::HandshakeInit | PacketType::HandshakeResponse | PacketType::HandshakeConfirm
        )
    }
}

impl TryFrom<u8> for PacketType {
    type Error = WireError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0x01 => Ok(PacketType::HandshakeInit),
            0x02 => Ok(PacketType::HandshakeResponse),
            0x03 => Ok(PacketType::HandshakeConfirm),
            0x04 => Ok(PacketType::Data),
            0x05 => Ok(PacketType::Ack),
            0x06 => Ok(PacketType::Fragment),
            0x07 => Ok(PacketType::Leave),
            EXTENSION_TAG_MIN..=EXTENSION_TAG_MAX => Ok(PacketType::Extension(value)),
            _ => Err(WireError::Type(value)),
        }
    }
}

impl From<PacketType> for u8 {
    fn from(value: PacketType) -> Self {
        value.tag()
    }
}

bitflags! {
    /// Packet flags bitmask
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
    pub struct Flags: u8 {
        /// Recipient field present (absent = broadcast)
        const HAS_RECIPIENT = 1 << 0;
        /// Signature trailer present
        const HAS_SIGNATURE = 1 << 1;
        /// Payload is a session ciphertext
        const ENCRYPTED = 1 << 2;
    }
}

/// A single mesh packet.
///
/// Immutable once built; relaying produces a copy with a smaller TTL.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    /// Type tag
    pub packet_type: PacketType,
    /// Originating peer
    pub sender: PeerId,
    /// Target peer, `None` for broadcast
    pub recipient: Option<PeerId>,
    /// Milliseconds since the Unix epoch at the sender
    pub timestamp: u64,
    /// Remaining hop budget
    pub ttl: u8,
    /// Whether `payload` is a session ciphertext
    pub encrypted: bool,
    /// Opaque payload
    pub payload: Bytes,
    /// Optional Ed25519 signature over [`Packet::signing_bytes`]
    pub signature: Option<[u8; SIGNATURE_LEN]>,
}

impl Packet {
    /// Create an unsigned, unencrypted packet stamped with the current time
    pub fn new(
        packet_type: PacketType,
        sender: PeerId,
        recipient: Option<PeerId>,
        ttl: u8,
        payload: Bytes,
    ) -> Self {
        Self {
            packet_type,
            sender,
            recipient,
            timestamp: now_millis(),
            ttl,
            encrypted: false,
            payload,
            signature: None,
        }
    }

    /// Override the timestamp
    pub fn with_timestamp(mut self, timestamp: u64) -> Self {
        self.timestamp = timestamp;
        self
    }

    /// Mark the payload as a session ciphertext
    pub fn with_encrypted(mut self, encrypted: bool) -> Self {
        self.encrypted = encrypted;
        self
    }

    /// Attach a signature
    pub fn with_signature(mut self, signature: [u8; SIGNATURE_LEN]) -> Self {
        self.signature = Some(signature);
        self
    }

    /// True when the packet has no specific recipient
    pub fn is_broadcast(&self) -> bool {
        self.recipient.is_none()
    }

    /// Flags implied by the optional fields
    pub fn flags(&self) -> Flags {
        let mut flags = Flags::empty();
        if self.recipient.is_some() {
            flags |= Flags::HAS_RECIPIENT;
        }
        if self.signature.is_some() {
            flags |= Flags::HAS_SIGNATURE;
        }
        if self.encrypted {
            flags |= Flags::ENCRYPTED;
        }
        flags
    }

    /// Size of the encoded packet in bytes
    pub fn encoded_len(&self) -> usize {
        let mut size = MIN_HEADER_SIZE + self.payload.len();
        if self.recipient.is_some() {
            size += PEER_ID_LEN;
        }
        if self.signature.is_some() {
            size += SIGNATURE_LEN;
        }
        size
    }

    /// Encode into a fresh buffer
    pub fn encode(&self) -> Result<Bytes, WireError> {
        if self.payload.len() > MAX_PAYLOAD_SIZE {
            return Err(WireError::Size(self.payload.len()));
        }

        let mut buf = BytesMut::with_capacity(self.encoded_len());
        buf.put_u8(WIRE_VERSION);
        buf.put_u8(self.packet_type.tag());
        buf.put_u8(self.flags().bits());
        buf.put_slice(self.sender.as_bytes());
        if let Some(recipient) = self.recipient {
            buf.put_slice(recipient.as_bytes());
        }
        buf.put_u64(self.timestamp);
        buf.put_u8(self.ttl);
        buf.put_u16(self.payload.len() as u16);
        buf.put_slice(&self.payload);
        if let Some(signature) = self.signature {
            buf.put_slice(&signature);
        }

        Ok(buf.freeze())
    }

    /// Decode one packet occupying the whole buffer
    pub fn decode(mut buf: Bytes) -> Result<Self, DecodeError> {
        if buf.len() < MIN_HEADER_SIZE {
            return Err(WireError::Malformed("short header"));
        }

        let ver = buf.get_u8();
        if ver != WIRE_VERSION {
            return Err(WireError::Malformed("unsupported version"));
        }

        let packet_type = PacketType::try_from(buf.get_u8())
            .map_err(|_| WireError::Malformed("unknown type tag"))?;
        let flags =
            Flags::from_bits(buf.get_u8()).ok_or(WireError::Malformed("unknown flag bits"))?;
        let sender = read_peer_id(&mut buf);

        let recipient = if flags.contains(Flags::HAS_RECIPIENT) {
            if buf.len() < PEER_ID_LEN + 11 {
                return Err(WireError::Malformed("short header"));
            }
            Some(read_peer_id(&mut buf))
        } else {
            None
        };

        let timestamp = buf.get_u64();
        let ttl = buf.get_u8();
        let payload_len = buf.get_u16() as usize;

        let sig_len = if flags.contains(Flags::HAS_SIGNATURE) {
            SIGNATURE_LEN
        } else {
            0
        };
        if buf.len() < payload_len + sig_len {
            return Err(WireError::Malformed("payload shorter than declared"));
        }
        if buf.len() > payload_len + sig_len {
            return Err(WireError::Malformed("trailing bytes"));
        }

        let payload = buf.split_to(payload_len);
        let signature = if sig_len > 0 {
            let mut sig = [0u8; SIGNATURE_LEN];
            buf.copy_to_slice(&mut sig);
            Some(sig)
        } else {
            None
        };

        Ok(Self {
            packet_type,
            sender,
            recipient,
            timestamp,
            ttl,
            encrypted: flags.contains(Flags::ENCRYPTED),
            payload,
            signature,
        })
    }

    /// Bytes covered by the packet signature.
    ///
    /// TTL is zeroed so relays do not invalidate the signature.
    pub fn signing_bytes(&self) -> Result<Bytes, WireError> {
        let mut unsigned = self.clone();
        unsigned.ttl = 0;
        unsigned.signature = None;
        unsigned.encode()
    }

    /// Copy for relaying with the TTL decremented, or `None` when the hop
    /// budget does not allow another hop
    pub fn relayed(&self) -> Option<Packet> {
        if self.ttl > 1 {
            let mut next = self.clone();
            next.ttl -= 1;
            Some(next)
        } else {
            None
        }
    }
}

/// Serialize a packet (codec contract entry point)
pub fn serialize(packet: &Packet) -> Result<Bytes, WireError> {
    packet.encode()
}

/// Parse a packet (codec contract entry point)
pub fn parse(bytes: Bytes) -> Result<Packet, DecodeError> {
    Packet::decode(bytes)
}

/// Current wall-clock time in milliseconds since the Unix epoch
pub fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

fn read_peer_id(buf: &mut Bytes) -> PeerId {
    let mut id = [0u8; PEER_ID_LEN];
    buf.copy_to_slice(&mut id);
    PeerId(id)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(recipient: Option<PeerId>) -> Packet {
        Packet::new(
            PacketType::Data,
            PeerId::from_u64(0x1122334455667788),
            recipient,
            7,
            Bytes::from_static(b"hello mesh"),
        )
        .with_timestamp(1_700_000_000_123)
    }

    #[test]
    fn test_packet_type_conversion() {
        assert_eq!(PacketType::try_from(0x01).unwrap(), PacketType::HandshakeInit);
        assert_eq!(PacketType::try_from(0x06).unwrap(), PacketType::Fragment);
        assert_eq!(PacketType::try_from(0x30).unwrap(), PacketType::Extension(0x30));
        assert!(PacketType::try_from(0x00).is_err());
        assert!(PacketType::try_from(0x10).is_err());
        assert!(PacketType::try_from(0xFF).is_err());
        assert!(PacketType::extension(0x05).is_err());
        assert_eq!(u8::from(PacketType::Extension(0x21)), 0x21);
    }

    #[test]
    fn test_peer_id_hex() {
        let id = PeerId::from_u64(0x00ff10a0b0c0d0e0);
        let text = id.to_string();
        assert_eq!(text, "00ff10a0b0c0d0e0");
        assert_eq!(text.parse::<PeerId>().unwrap(), id);
        assert!("xyz".parse::<PeerId>().is_err());
        assert!("00ff10a0b0c0d0zz".parse::<PeerId>().is_err());
    }

    #[test]
    fn test_broadcast_roundtrip() {
        let packet = sample(None);
        let bytes = packet.encode().unwrap();
        assert_eq!(bytes.len(), MIN_HEADER_SIZE + 10);
        assert_eq!(Packet::decode(bytes).unwrap(), packet);
    }

    #[test]
    fn test_unicast_signed_encrypted_roundtrip() {
        let packet = sample(Some(PeerId::from_u64(42)))
            .with_encrypted(true)
            .with_signature([7u8; SIGNATURE_LEN]);
        let bytes = serialize(&packet).unwrap();
        assert_eq!(bytes.len(), packet.encoded_len());

        let decoded = parse(bytes).unwrap();
        assert_eq!(decoded, packet);
        assert!(decoded.encrypted);
        assert_eq!(decoded.recipient, Some(PeerId::from_u64(42)));
    }

    #[test]
    fn test_extension_type_is_opaque() {
        let mut packet = sample(None);
        packet.packet_type = PacketType::Extension(0x40);
        let decoded = Packet::decode(packet.encode().unwrap()).unwrap();
        assert_eq!(decoded.packet_type, PacketType::Extension(0x40));
        assert_eq!(decoded.payload, packet.payload);
    }

    #[test]
    fn test_rejects_short_header() {
        let bytes = sample(None).encode().unwrap();
        let err = Packet::decode(bytes.slice(..MIN_HEADER_SIZE - 1)).unwrap_err();
        assert_eq!(err, WireError::Malformed("short header"));
    }

    #[test]
    fn test_rejects_bad_version_and_type() {
        let bytes = sample(None).encode().unwrap();

        let mut bad = BytesMut::from(&bytes[..]);
        bad[0] = 9;
        assert!(matches!(
            Packet::decode(bad.freeze()),
            Err(WireError::Malformed(_))
        ));

        let mut bad = BytesMut::from(&bytes[..]);
        bad[1] = 0x00;
        assert_eq!(
            Packet::decode(bad.freeze()),
            Err(WireError::Malformed("unknown type tag"))
        );

        let mut bad = BytesMut::from(&bytes[..]);
        bad[2] = 0x80;
        assert_eq!(
            Packet::decode(bad.freeze()),
            Err(WireError::Malformed("unknown flag bits"))
        );
    }

    #[test]
    fn test_rejects_length_mismatch() {
        let bytes = sample(None).encode().unwrap();

        let truncated = bytes.slice(..bytes.len() - 1);
        assert_eq!(
            Packet::decode(truncated),
            Err(WireError::Malformed("payload shorter than declared"))
        );

        let mut padded = BytesMut::from(&bytes[..]);
        padded.put_u8(0);
        assert_eq!(
            Packet::decode(padded.freeze()),
            Err(WireError::Malformed("trailing bytes"))
        );

        // Recipient flag set but no room for the recipient
        let mut lying = BytesMut::from(&bytes[..MIN_HEADER_SIZE]);
        lying[2] = Flags::HAS_RECIPIENT.bits();
        assert!(Packet::decode(lying.freeze()).is_err());
    }

    #[test]
    fn test_payload_too_large() {
        let mut packet = sample(None);
        packet.payload = Bytes::from(vec![0u8; MAX_PAYLOAD_SIZE + 1]);
        assert_eq!(packet.encode(), Err(WireError::Size(MAX_PAYLOAD_SIZE + 1)));
    }

    #[test]
    fn test_relayed_ttl() {
        let packet = sample(None);
        let next = packet.relayed().unwrap();
        assert_eq!(next.ttl, 6);
        assert_eq!(next.payload, packet.payload);

        let mut last = packet.clone();
        last.ttl = 1;
        assert!(last.relayed().is_none());
        last.ttl = 0;
        assert!(last.relayed().is_none());
    }

    #[test]
    fn test_signing_bytes_ignore_ttl_and_signature() {
        let packet = sample(None);
        let relayed = packet.relayed().unwrap().with_signature([1u8; SIGNATURE_LEN]);
        assert_eq!(
            packet.signing_bytes().unwrap(),
            relayed.signing_bytes().unwrap()
        );
    }
}
