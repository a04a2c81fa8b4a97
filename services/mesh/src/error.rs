//! Node error types

use crate::link::LinkError;
use mesh_session::SessionError;
use mesh_storage::QueueError;
use mesh_wire::{PeerId, WireError};
use thiserror::Error;

/// Errors surfaced by [`crate::MeshNode`] operations
#[derive(Debug, Error)]
pub enum NodeError {
    /// Packet could not be built or parsed
    #[error("wire error: {0}")]
    Wire(#[from] WireError),

    /// Session layer refused; `NoSession` means the send was withheld
    #[error("session error: {0}")]
    Session(#[from] SessionError),

    /// Store-and-forward queue refused the message
    #[error("queue error: {0}")]
    Queue(#[from] QueueError),

    /// A link write failed
    #[error("link error: {0}")]
    Link(#[from] LinkError),

    /// No neighbor is attached to carry the packet
    #[error("no route to {0}")]
    NoRoute(PeerId),

    /// Application body exceeds what the node will fragment
    #[error("payload too large: {size} bytes (limit {limit})")]
    PayloadTooLarge {
        /// Offered size
        size: usize,
        /// Largest accepted size
        limit: usize,
    },

    /// A message addressed to this node itself
    #[error("cannot address the local node")]
    SelfAddressed,

    /// Rejected configuration
    #[error("invalid configuration: {0}")]
    Config(String),
}

impl NodeError {
    /// Whether the send failed closed for lack of an established session
    pub fn is_no_session(&self) -> bool {
        matches!(self, NodeError::Session(SessionError::NoSession(_)))
    }
}
