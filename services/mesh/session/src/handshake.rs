//! Signed ephemeral X25519 handshake.
//!
//! Three messages, each carried by its own packet type:
//!
//! ```text
//! init     (I -> R): | version(1) | ephemeral_i(32) | identity_i(32) | sig_i(64) |
//! response (R -> I): | ephemeral_r(32) | identity_r(32) | sig_r(64) |
//! confirm  (I -> R): empty frame sealed under the I->R key
//! ```
//!
//! Each side signs the ephemeral keys with its long-term Ed25519 key, so the
//! exchange is mutually authenticated, and the session keys depend only on
//! ephemeral secrets, so compromising a long-term key later does not expose
//! past traffic. Peer ids are bound into every signature and into the key
//! derivation.

use crate::error::SessionError;
use crate::identity::{peer_id_for, sign, verify, IdentityProvider};
use bytes::{Buf, BufMut, Bytes, BytesMut};
use ed25519_dalek::VerifyingKey;
use hkdf::Hkdf;
use mesh_wire::{PeerId, SIGNATURE_LEN};
use rand::rngs::OsRng;
use sha2::{Digest, Sha256};
use std::fmt;
use x25519_dalek::{EphemeralSecret, PublicKey};
use zeroize::Zeroizing;

/// Handshake protocol version carried by the init message
pub const HANDSHAKE_VERSION: u8 = 1;

/// Init payload size
pub const INIT_LEN: usize = 1 + 32 + 32 + SIGNATURE_LEN;

/// Response payload size
pub const RESPONSE_LEN: usize = 32 + 32 + SIGNATURE_LEN;

const INIT_LABEL: &[u8] = b"mesh-handshake-init-v1";
const RESPONSE_LABEL: &[u8] = b"mesh-handshake-response-v1";
const TRANSCRIPT_LABEL: &[u8] = b"mesh-handshake-transcript-v1";
const KDF_INFO: &[u8] = b"mesh-session-keys-v1";

/// Directional keys produced by a completed handshake
#[derive(Clone, PartialEq, Eq)]
pub struct SessionKeys {
    /// Initiator to responder
    pub initiator_to_responder: Zeroizing<[u8; 32]>,
    /// Responder to initiator
    pub responder_to_initiator: Zeroizing<[u8; 32]>,
    /// SHA-256 of the handshake transcript
    pub transcript_hash: [u8; 32],
}

impl fmt::Debug for SessionKeys {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionKeys")
            .field("transcript_hash", &hex8(&self.transcript_hash))
            .finish_non_exhaustive()
    }
}

fn hex8(bytes: &[u8]) -> String {
    bytes.iter().take(8).map(|b| format!("{:02x}", b)).collect()
}

/// Parsed init message
#[derive(Debug, Clone)]
pub struct InitMessage {
    /// Initiator's ephemeral public key
    pub ephemeral: [u8; 32],
    /// Initiator's identity key
    pub identity: [u8; 32],
    /// Signature over the init transcript
    pub signature: [u8; SIGNATURE_LEN],
}

impl InitMessage {
    /// Encode into a packet payload
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(INIT_LEN);
        buf.put_u8(HANDSHAKE_VERSION);
        buf.put_slice(&self.ephemeral);
        buf.put_slice(&self.identity);
        buf.put_slice(&self.signature);
        buf.freeze()
    }

    /// Decode a packet payload
    pub fn decode(mut buf: Bytes) -> Result<Self, SessionError> {
        if buf.len() != INIT_LEN {
            return Err(SessionError::Malformed("init length"));
        }
        if buf.get_u8() != HANDSHAKE_VERSION {
            return Err(SessionError::Malformed("handshake version"));
        }
        let mut msg = Self {
            ephemeral: [0u8; 32],
            identity: [0u8; 32],
            signature: [0u8; SIGNATURE_LEN],
        };
        buf.copy_to_slice(&mut msg.ephemeral);
        buf.copy_to_slice(&mut msg.identity);
        buf.copy_to_slice(&mut msg.signature);
        Ok(msg)
    }
}

/// Parsed response message
#[derive(Debug, Clone)]
pub struct ResponseMessage {
    /// Responder's ephemeral public key
    pub ephemeral: [u8; 32],
    /// Responder's identity key
    pub identity: [u8; 32],
    /// Signature over the response transcript
    pub signature: [u8; SIGNATURE_LEN],
}

impl ResponseMessage {
    /// Encode into a packet payload
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(RESPONSE_LEN);
        buf.put_slice(&self.ephemeral);
        buf.put_slice(&self.identity);
        buf.put_slice(&self.signature);
        buf.freeze()
    }

    /// Decode a packet payload
    pub fn decode(mut buf: Bytes) -> Result<Self, SessionError> {
        if buf.len() != RESPONSE_LEN {
            return Err(SessionError::Malformed("response length"));
        }
        let mut msg = Self {
            ephemeral: [0u8; 32],
            identity: [0u8; 32],
            signature: [0u8; SIGNATURE_LEN],
        };
        buf.copy_to_slice(&mut msg.ephemeral);
        buf.copy_to_slice(&mut msg.identity);
        buf.copy_to_slice(&mut msg.signature);
        Ok(msg)
    }
}

/// Initiator side waiting for the response
pub struct Initiator {
    local: PeerId,
    remote: PeerId,
    secret: EphemeralSecret,
    ephemeral: [u8; 32],
    identity: [u8; 32],
}

impl fmt::Debug for Initiator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Initiator")
            .field("local", &self.local)
            .field("remote", &self.remote)
            .finish_non_exhaustive()
    }
}

impl Initiator {
    /// Generate an ephemeral key and build the init message for `remote`
    pub fn start(identity: &dyn IdentityProvider, remote: PeerId) -> (Self, InitMessage) {
        let local = identity.local_id();
        let secret = EphemeralSecret::random_from_rng(OsRng);
        let ephemeral = PublicKey::from(&secret).to_bytes();
        let identity_key = identity.signing_key().verifying_key().to_bytes();

        let signature = sign(identity, &init_transcript(local, remote, &ephemeral));
        let msg = InitMessage {
            ephemeral,
            identity: identity_key,
            signature,
        };

        (
            Self {
                local,
                remote,
                secret,
                ephemeral,
                identity: identity_key,
            },
            msg,
        )
    }

    /// Verify the response and derive the session keys.
    ///
    /// Returns the keys and the responder's verified identity key.
    pub fn finish(
        self,
        provider: &dyn IdentityProvider,
        response: &ResponseMessage,
    ) -> Result<(SessionKeys, VerifyingKey), SessionError> {
        let remote_key = check_identity(provider, self.remote, &response.identity)?;

        let transcript = response_transcript(
            self.local,
            self.remote,
            &self.ephemeral,
            &response.ephemeral,
        );
        if !verify(&remote_key, &transcript, &response.signature) {
            return Err(SessionError::HandshakeFailed(
                "response signature invalid".to_string(),
            ));
        }

        let shared = self
            .secret
            .diffie_hellman(&PublicKey::from(response.ephemeral));
        if !shared.was_contributory() {
            return Err(SessionError::HandshakeFailed(
                "non-contributory key exchange".to_string(),
            ));
        }

        let keys = derive_keys(
            shared.as_bytes(),
            self.local,
            self.remote,
            &self.ephemeral,
            &response.ephemeral,
            &self.identity,
            &response.identity,
        )?;
        Ok((keys, remote_key))
    }
}

/// Verify an init message from `initiator` and answer it.
///
/// Returns the session keys, the initiator's verified identity key, and the
/// response to send back.
pub fn respond(
    provider: &dyn IdentityProvider,
    initiator: PeerId,
    init: &InitMessage,
) -> Result<(SessionKeys, VerifyingKey, ResponseMessage), SessionError> {
    let local = provider.local_id();
    let remote_key = check_identity(provider, initiator, &init.identity)?;

    if !verify(
        &remote_key,
        &init_transcript(initiator, local, &init.ephemeral),
        &init.signature,
    ) {
        return Err(SessionError::HandshakeFailed(
            "init signature invalid".to_string(),
        ));
    }

    let secret = EphemeralSecret::random_from_rng(OsRng);
    let ephemeral = PublicKey::from(&secret).to_bytes();
    let identity_key = provider.signing_key().verifying_key().to_bytes();
    let signature = sign(
        provider,
        &response_transcript(initiator, local, &init.ephemeral, &ephemeral),
    );

    let shared = secret.diffie_hellman(&PublicKey::from(init.ephemeral));
    if !shared.was_contributory() {
        return Err(SessionError::HandshakeFailed(
            "non-contributory key exchange".to_string(),
        ));
    }

    let keys = derive_keys(
        shared.as_bytes(),
        initiator,
        local,
        &init.ephemeral,
        &ephemeral,
        &init.identity,
        &identity_key,
    )?;

    Ok((
        keys,
        remote_key,
        ResponseMessage {
            ephemeral,
            identity: identity_key,
            signature,
        },
    ))
}

/// Parse `raw` as an identity key and check it against `claimed` and any
/// pinned key
fn check_identity(
    provider: &dyn IdentityProvider,
    claimed: PeerId,
    raw: &[u8; 32],
) -> Result<VerifyingKey, SessionError> {
    let key = VerifyingKey::from_bytes(raw)
        .map_err(|_| SessionError::HandshakeFailed("invalid identity key".to_string()))?;
    if peer_id_for(&key) != claimed {
        return Err(SessionError::IdentityMismatch(claimed));
    }
    if let Some(pinned) = provider.pinned_key(&claimed) {
        if pinned != key {
            return Err(SessionError::IdentityMismatch(claimed));
        }
    }
    Ok(key)
}

fn init_transcript(initiator: PeerId, responder: PeerId, eph_i: &[u8; 32]) -> Vec<u8> {
    let mut t = Vec::with_capacity(INIT_LABEL.len() + 16 + 32);
    t.extend_from_slice(INIT_LABEL);
    t.extend_from_slice(initiator.as_bytes());
    t.extend_from_slice(responder.as_bytes());
    t.extend_from_slice(eph_i);
    t
}

fn response_transcript(
    initiator: PeerId,
    responder: PeerId,
    eph_i: &[u8; 32],
    eph_r: &[u8; 32],
) -> Vec<u8> {
    let mut t = Vec::with_capacity(RESPONSE_LABEL.len() + 16 + 64);
    t.extend_from_slice(RESPONSE_LABEL);
    t.extend_from_slice(initiator.as_bytes());
    t.extend_from_slice(responder.as_bytes());
    t.extend_from_slice(eph_i);
    t.extend_from_slice(eph_r);
    t
}

fn derive_keys(
    shared: &[u8; 32],
    initiator: PeerId,
    responder: PeerId,
    eph_i: &[u8; 32],
    eph_r: &[u8; 32],
    identity_i: &[u8; 32],
    identity_r: &[u8; 32],
) -> Result<SessionKeys, SessionError> {
    let transcript_hash: [u8; 32] = Sha256::new()
        .chain_update(TRANSCRIPT_LABEL)
        .chain_update(initiator.as_bytes())
        .chain_update(responder.as_bytes())
        .chain_update(eph_i)
        .chain_update(eph_r)
        .chain_update(identity_i)
        .chain_update(identity_r)
        .finalize()
        .into();

    let hk = Hkdf::<Sha256>::new(Some(&transcript_hash), shared);
    let mut okm = Zeroizing::new([0u8; 64]);
    hk.expand(KDF_INFO, okm.as_mut_slice())
        .map_err(|_| SessionError::HandshakeFailed("key derivation".to_string()))?;

    let mut i2r = Zeroizing::new([0u8; 32]);
    let mut r2i = Zeroizing::new([0u8; 32]);
    i2r.copy_from_slice(&okm[..32]);
    r2i.copy_from_slice(&okm[32..]);

    Ok(SessionKeys {
        initiator_to_responder: i2r,
        responder_to_initiator: r2i,
        transcript_hash,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::StaticIdentity;

    #[test]
    fn test_both_sides_derive_identical_keys() {
        let alice = StaticIdentity::generate();
        let bob = StaticIdentity::generate();

        let (initiator, init) = Initiator::start(&alice, bob.local_id());
        let init = InitMessage::decode(init.encode()).unwrap();
        let (bob_keys, alice_key, response) = respond(&bob, alice.local_id(), &init).unwrap();
        assert_eq!(alice_key, alice.verifying_key());

        let response = ResponseMessage::decode(response.encode()).unwrap();
        let (alice_keys, bob_key) = initiator.finish(&alice, &response).unwrap();
        assert_eq!(bob_key, bob.verifying_key());
        assert_eq!(alice_keys, bob_keys);
        assert_ne!(
            alice_keys.initiator_to_responder,
            alice_keys.responder_to_initiator
        );
    }

    #[test]
    fn test_fresh_keys_every_handshake() {
        let alice = StaticIdentity::generate();
        let bob = StaticIdentity::generate();

        let run = || {
            let (initiator, init) = Initiator::start(&alice, bob.local_id());
            let (_, _, response) = respond(&bob, alice.local_id(), &init).unwrap();
            initiator.finish(&alice, &response).unwrap().0
        };
        assert_ne!(run(), run());
    }

    #[test]
    fn test_wrong_claimed_sender_fails() {
        let alice = StaticIdentity::generate();
        let bob = StaticIdentity::generate();
        let mallory = StaticIdentity::generate();

        let (_, init) = Initiator::start(&alice, bob.local_id());
        // mallory replays alice's init as if it came from mallory's id
        assert_eq!(
            respond(&bob, mallory.local_id(), &init).unwrap_err(),
            SessionError::IdentityMismatch(mallory.local_id())
        );
    }

    #[test]
    fn test_init_for_other_responder_fails() {
        let alice = StaticIdentity::generate();
        let bob = StaticIdentity::generate();
        let carol = StaticIdentity::generate();

        // signed for bob, presented to carol
        let (_, init) = Initiator::start(&alice, bob.local_id());
        assert!(matches!(
            respond(&carol, alice.local_id(), &init),
            Err(SessionError::HandshakeFailed(_))
        ));
    }

    #[test]
    fn test_tampered_response_fails() {
        let alice = StaticIdentity::generate();
        let bob = StaticIdentity::generate();

        let (initiator, init) = Initiator::start(&alice, bob.local_id());
        let (_, _, mut response) = respond(&bob, alice.local_id(), &init).unwrap();
        response.ephemeral[0] ^= 0xff;
        assert!(matches!(
            initiator.finish(&alice, &response),
            Err(SessionError::HandshakeFailed(_))
        ));
    }

    #[test]
    fn test_pinned_key_mismatch_fails() {
        let alice = StaticIdentity::generate();
        let impostor = StaticIdentity::generate();
        let bob = StaticIdentity::generate().pin(alice.local_id(), impostor.verifying_key());

        let (_, init) = Initiator::start(&alice, bob.local_id());
        assert_eq!(
            respond(&bob, alice.local_id(), &init).unwrap_err(),
            SessionError::IdentityMismatch(alice.local_id())
        );
    }

    #[test]
    fn test_malformed_payloads() {
        assert!(InitMessage::decode(Bytes::from_static(&[1u8; 10])).is_err());
        let mut raw = vec![0u8; INIT_LEN];
        raw[0] = 9;
        assert_eq!(
            InitMessage::decode(Bytes::from(raw)).unwrap_err(),
            SessionError::Malformed("handshake version")
        );
        assert!(ResponseMessage::decode(Bytes::new()).is_err());
    }
}
