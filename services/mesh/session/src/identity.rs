//! Node identity collaborator.
//!
//! The core never persists keys. Whoever constructs the node supplies an
//! [`IdentityProvider`]; [`StaticIdentity`] is the in-memory implementation.

use ed25519_dalek::{Signature, Signer, SigningKey, VerifyingKey};
use mesh_wire::{PeerId, PEER_ID_LEN, SIGNATURE_LEN};
use rand::rngs::OsRng;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::fmt;

/// Supplies this node's identifier and long-term signing key
pub trait IdentityProvider: Send + Sync + fmt::Debug {
    /// Stable identifier of this node
    fn local_id(&self) -> PeerId;

    /// Long-term Ed25519 key
    fn signing_key(&self) -> &SigningKey;

    /// Identity key the operator pinned for `peer`, if any
    fn pinned_key(&self, _peer: &PeerId) -> Option<VerifyingKey> {
        None
    }
}

/// Peer id belonging to an identity key: the first 8 bytes of its SHA-256
pub fn peer_id_for(key: &VerifyingKey) -> PeerId {
    let digest = Sha256::digest(key.as_bytes());
    let mut id = [0u8; PEER_ID_LEN];
    id.copy_from_slice(&digest[..PEER_ID_LEN]);
    PeerId::new(id)
}

/// Sign `message` with the provider's key
pub fn sign(identity: &dyn IdentityProvider, message: &[u8]) -> [u8; SIGNATURE_LEN] {
    identity.signing_key().sign(message).to_bytes()
}

/// Strict Ed25519 verification
pub fn verify(key: &VerifyingKey, message: &[u8], signature: &[u8; SIGNATURE_LEN]) -> bool {
    key.verify_strict(message, &Signature::from_bytes(signature))
        .is_ok()
}

/// In-memory identity
pub struct StaticIdentity {
    id: PeerId,
    signing_key: SigningKey,
    pinned: HashMap<PeerId, VerifyingKey>,
}

impl StaticIdentity {
    /// Fresh random identity
    pub fn generate() -> Self {
        Self::from_signing_key(SigningKey::generate(&mut OsRng))
    }

    /// Deterministic identity from a 32-byte seed
    pub fn from_seed(seed: &[u8; 32]) -> Self {
        Self::from_signing_key(SigningKey::from_bytes(seed))
    }

    /// Wrap an existing key
    pub fn from_signing_key(signing_key: SigningKey) -> Self {
        Self {
            id: peer_id_for(&signing_key.verifying_key()),
            signing_key,
            pinned: HashMap::new(),
        }
    }

    /// Require `peer` to present exactly `key` during handshakes
    pub fn pin(mut self, peer: PeerId, key: VerifyingKey) -> Self {
        self.pinned.insert(peer, key);
        self
    }

    /// Public half of the identity key
    pub fn verifying_key(&self) -> VerifyingKey {
        self.signing_key.verifying_key()
    }
}

impl IdentityProvider for StaticIdentity {
    fn local_id(&self) -> PeerId {
        self.id
    }

    fn signing_key(&self) -> &SigningKey {
        &self.signing_key
    }

    fn pinned_key(&self, peer: &PeerId) -> Option<VerifyingKey> {
        self.pinned.get(peer).copied()
    }
}

impl fmt::Debug for StaticIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StaticIdentity")
            .field("id", &self.id)
            .field("pinned", &self.pinned.len())
            .finish_non_exhaustive()
    }
}
