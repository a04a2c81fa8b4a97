//! Inner message framing for data and acknowledgement packets.
//!
//! ```text
//! data: | message_id(16) | kind(1) | flags(1) | body ... |
//! ack:  | message_id(16) |
//! ```
//!
//! For private messages the whole data frame is the plaintext that gets
//! sealed by the session cipher.

use crate::error::WireError;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use rand::RngCore;
use std::fmt;

/// Message identifier length
pub const MESSAGE_ID_LEN: usize = 16;

/// Fixed prefix of a data frame
pub const MESSAGE_HEADER_SIZE: usize = MESSAGE_ID_LEN + 2;

const FLAG_ACK_REQUESTED: u8 = 1 << 0;

/// End-to-end message identifier, random per message
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MessageId(pub [u8; MESSAGE_ID_LEN]);

impl MessageId {
    /// Fresh random identifier
    pub fn random() -> Self {
        let mut id = [0u8; MESSAGE_ID_LEN];
        rand::thread_rng().fill_bytes(&mut id);
        Self(id)
    }

    /// Raw identifier bytes
    pub fn as_bytes(&self) -> &[u8; MESSAGE_ID_LEN] {
        &self.0
    }
}

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for b in &self.0[..8] {
            write!(f, "{:02x}", b)?;
        }
        Ok(())
    }
}

impl fmt::Debug for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "MessageId({})", self)
    }
}

/// Application message carried by a data packet
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    /// End-to-end identifier used for acks and delivery dedup
    pub id: MessageId,
    /// Application message kind, opaque to the core
    pub kind: u8,
    /// Whether the recipient should answer with an ack
    pub ack_requested: bool,
    /// Application body
    pub body: Bytes,
}

impl Message {
    /// New message with a random identifier
    pub fn new(kind: u8, body: Bytes, ack_requested: bool) -> Self {
        Self {
            id: MessageId::random(),
            kind,
            ack_requested,
            body,
        }
    }

    /// Encode into a fresh buffer
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(MESSAGE_HEADER_SIZE + self.body.len());
        buf.put_slice(self.id.as_bytes());
        buf.put_u8(self.kind);
        buf.put_u8(if self.ack_requested {
            FLAG_ACK_REQUESTED
        } else {
            0
        });
        buf.put_slice(&self.body);
        buf.freeze()
    }

    /// Decode a data frame
    pub fn decode(mut buf: Bytes) -> Result<Self, WireError> {
        if buf.len() < MESSAGE_HEADER_SIZE {
            return Err(WireError::Malformed("short message header"));
        }
        let id = read_message_id(&mut buf);
        let kind = buf.get_u8();
        let flags = buf.get_u8();
        if flags & !FLAG_ACK_REQUESTED != 0 {
            return Err(WireError::Malformed("unknown message flags"));
        }
        Ok(Self {
            id,
            kind,
            ack_requested: flags & FLAG_ACK_REQUESTED != 0,
            body: buf,
        })
    }
}

/// Encode an ack payload
pub fn encode_ack(message_id: &MessageId) -> Bytes {
    Bytes::copy_from_slice(message_id.as_bytes())
}

/// Decode an ack payload
pub fn decode_ack(mut buf: Bytes) -> Result<MessageId, WireError> {
    if buf.len() != MESSAGE_ID_LEN {
        return Err(WireError::Malformed("ack payload length"));
    }
    Ok(read_message_id(&mut buf))
}

fn read_message_id(buf: &mut Bytes) -> MessageId {
    let mut id = [0u8; MESSAGE_ID_LEN];
    buf.copy_to_slice(&mut id);
    MessageId(id)
}
