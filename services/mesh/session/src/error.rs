//! Session error types.

use mesh_wire::PeerId;
use thiserror::Error;

/// Session errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SessionError {
    /// No established session with the peer
    #[error("no established session with {0}")]
    NoSession(PeerId),

    /// Ciphertext failed authentication, was replayed, or was malformed
    #[error("decryption failed")]
    DecryptFailed,

    /// Handshake verification failed; the session was torn down
    #[error("handshake failed: {0}")]
    HandshakeFailed(String),

    /// Handshake message that does not fit the current state
    #[error("unexpected handshake message from {0}")]
    UnexpectedHandshake(PeerId),

    /// Handshake payload could not be parsed
    #[error("malformed handshake payload: {0}")]
    Malformed(&'static str),

    /// Presented identity key does not belong to the claimed peer id
    #[error("identity key does not match peer {0}")]
    IdentityMismatch(PeerId),

    /// Send counter exhausted; the session must be rekeyed
    #[error("nonce space exhausted")]
    NonceExhausted,
}
