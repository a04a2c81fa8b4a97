//! Wire protocol for the radio mesh: packet codec, packet identifiers,
//! fragmentation and payload encoding.
//!
//! Everything in this crate is a pure transform over bytes. Nothing here
//! suspends, allocates beyond its output buffers, or touches shared state, so
//! it can run on the inbound path of every link without coordination.
//!
//! ## Features
//!
//! - **Packet Codec**: compact, versioned, bit-exact packet format
//! - **Packet Identifiers**: deterministic dedup keys that survive relaying
//! - **Fragmentation**: index-keyed split and reassembly with bounded memory
//! - **Value Payloads**: tagged-variant values encoded as CBOR
//!
//! ## Wire Format
//!
//! ```text
//! +-------------------+------------------------------------+
//! | u8 version        | currently 1                        |
//! +-------------------+------------------------------------+
//! | u8 type           | core tag or extension (0x20..0xFE) |
//! +-------------------+------------------------------------+
//! | u8 flags          | recipient / signature / encrypted  |
//! +-------------------+------------------------------------+
//! | sender (8B)       | originating peer id                |
//! +-------------------+------------------------------------+
//! | recipient (0|8B)  | absent for broadcast               |
//! +-------------------+------------------------------------+
//! | u64 timestamp     | milliseconds since epoch           |
//! +-------------------+------------------------------------+
//! | u8 ttl            | remaining hops                     |
//! +-------------------+------------------------------------+
//! | u16 payload_len   | length of payload                  |
//! +-------------------+------------------------------------+
//! | payload           | variable (0..65535)                |
//! +-------------------+------------------------------------+
//! | signature (0|64B) | Ed25519, ttl zeroed when signing   |
//! +-------------------+------------------------------------+
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod error;
pub mod fragment;
pub mod id;
pub mod message;
pub mod packet;
pub mod value;

// Re-export main types
pub use error::{DecodeError, WireError};
pub use fragment::{
    split, split_with_id, AssemblerConfig, DiscardReason, DiscardedTransfer, Fragment,
    FragmentAssembler, FragmentHeader, Reassembled, FRAGMENT_HEADER_SIZE, MAX_FRAGMENTS,
};
pub use id::{PacketId, PACKET_ID_LEN};
pub use message::{decode_ack, encode_ack, Message, MessageId, MESSAGE_HEADER_SIZE, MESSAGE_ID_LEN};
pub use packet::{
    now_millis, parse, serialize, Flags, Packet, PacketType, PeerId, EXTENSION_TAG_MAX,
    EXTENSION_TAG_MIN, MAX_PAYLOAD_SIZE, MIN_HEADER_SIZE, PEER_ID_LEN, SIGNATURE_LEN,
    WIRE_VERSION,
};
pub use value::Value;
