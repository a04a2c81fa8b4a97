//! Application delivery sink

use async_trait::async_trait;
use bytes::Bytes;
use mesh_wire::{MessageId, PacketType, PeerId};
use std::fmt;
use tokio::sync::mpsc;
use tracing::warn;

/// A fully reassembled, decrypted payload for the application
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
    /// Originating peer
    pub sender: PeerId,
    /// `Data` or an extension type
    pub packet_type: PacketType,
    /// End-to-end id, for data messages
    pub message_id: Option<MessageId>,
    /// Application kind, for data messages
    pub kind: Option<u8>,
    /// Payload body
    pub body: Bytes,
    /// Arrived under session encryption
    pub encrypted: bool,
    /// Sent to every node rather than to us
    pub broadcast: bool,
}

/// Receives everything addressed to this node
#[async_trait]
pub trait DeliverySink: Send + Sync + fmt::Debug {
    /// Accept one delivery; may wait for buffer space
    async fn deliver(&self, delivery: Delivery);
}

/// Sink backed by a bounded channel
#[derive(Debug, Clone)]
pub struct ChannelSink {
    tx: mpsc::Sender<Delivery>,
}

impl ChannelSink {
    /// Sink plus the receiver deliveries arrive on
    pub fn new(buffer: usize) -> (Self, mpsc::Receiver<Delivery>) {
        let (tx, rx) = mpsc::channel(buffer);
        (Self { tx }, rx)
    }
}

#[async_trait]
impl DeliverySink for ChannelSink {
    async fn deliver(&self, delivery: Delivery) {
        let sender = delivery.sender;
        if self.tx.send(delivery).await.is_err() {
            warn!(peer = %sender, "Delivery receiver closed, dropping payload");
        }
    }
}
