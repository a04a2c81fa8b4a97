//! Session manager owning the per-peer session table.
//!
//! Every state transition for a peer happens under that peer's table entry
//! lock, so [`SessionManager::has_established_session`] never observes a
//! half-finished handshake. Handshake messages are produced and consumed
//! here; sending them is the caller's job.
//!
//! An init for a peer we already share a session with is answered, but the
//! new keys are only staged. The established session is replaced once the
//! initiator's confirm opens under them, so a replayed init cannot knock a
//! working session down.

use crate::cipher::AtRestSealer;
use crate::error::SessionError;
use crate::handshake::{respond, InitMessage, Initiator, ResponseMessage};
use crate::identity::{self, IdentityProvider};
use crate::session::{PeerSession, Role, SessionConfig, SessionState, StagedRekey};
use bytes::Bytes;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use ed25519_dalek::VerifyingKey;
use mesh_wire::{PeerId, SIGNATURE_LEN};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, warn};

/// Lifecycle notifications produced by the manager
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    /// Keys confirmed; encrypted traffic may flow
    Established {
        /// Remote peer
        peer: PeerId,
        /// Our role in the handshake
        role: Role,
    },
    /// Handshake failed verification or timed out
    Failed {
        /// Remote peer
        peer: PeerId,
        /// Human-readable cause
        reason: String,
    },
    /// Established session expired through inactivity or rekey
    Expired {
        /// Remote peer
        peer: PeerId,
    },
}

/// Owns the session table and performs handshakes, encryption and decryption
#[derive(Debug)]
pub struct SessionManager {
    identity: Arc<dyn IdentityProvider>,
    config: SessionConfig,
    sessions: DashMap<PeerId, PeerSession>,
    /// Identity keys verified during handshakes
    identity_keys: DashMap<PeerId, VerifyingKey>,
    at_rest: AtRestSealer,
}

impl SessionManager {
    /// Create a manager for the given identity
    pub fn new(identity: Arc<dyn IdentityProvider>, config: SessionConfig) -> Self {
        Self {
            identity,
            config,
            sessions: DashMap::new(),
            identity_keys: DashMap::new(),
            at_rest: AtRestSealer::generate(),
        }
    }

    /// This node's id
    pub fn local_id(&self) -> PeerId {
        self.identity.local_id()
    }

    /// Current state for `peer`; `None` means uninitialized
    pub fn state(&self, peer: &PeerId) -> Option<SessionState> {
        self.sessions.get(peer).map(|s| s.state)
    }

    /// Whether encrypted traffic to `peer` is possible right now
    pub fn has_established_session(&self, peer: &PeerId) -> bool {
        self.state(peer) == Some(SessionState::Established)
    }

    /// Peers with an established session
    pub fn established_peers(&self) -> Vec<PeerId> {
        self.sessions
            .iter()
            .filter(|s| s.state == SessionState::Established)
            .map(|s| *s.key())
            .collect()
    }

    /// Hash of the handshake transcript for an established or confirming
    /// session
    pub fn transcript_hash(&self, peer: &PeerId) -> Option<[u8; 32]> {
        self.sessions.get(peer).and_then(|s| s.transcript_hash)
    }

    /// Start a handshake with `peer`.
    ///
    /// Returns the init payload to send, or `None` when a session is already
    /// established or a handshake is still in progress.
    pub fn initiate(&self, peer: PeerId, now: Instant) -> Result<Option<Bytes>, SessionError> {
        if peer == self.local_id() {
            return Err(SessionError::HandshakeFailed(
                "cannot handshake with self".to_string(),
            ));
        }

        match self.sessions.entry(peer) {
            Entry::Occupied(mut occupied) => {
                let session = occupied.get();
                let in_progress = session.is_pending()
                    && now.saturating_duration_since(session.created)
                        < self.config.handshake_timeout;
                if session.state == SessionState::Established || in_progress {
                    return Ok(None);
                }
                let (initiator, init) = Initiator::start(self.identity.as_ref(), peer);
                occupied.insert(PeerSession::initiating(initiator, now));
                debug!(peer = %peer, "Restarting handshake");
                Ok(Some(init.encode()))
            }
            Entry::Vacant(vacant) => {
                let (initiator, init) = Initiator::start(self.identity.as_ref(), peer);
                vacant.insert(PeerSession::initiating(initiator, now));
                debug!(peer = %peer, "Starting handshake");
                Ok(Some(init.encode()))
            }
        }
    }

    /// Tear down any session with `peer` and start a fresh handshake.
    ///
    /// Returns the init payload and whether an established session was
    /// discarded.
    pub fn rekey(&self, peer: PeerId, now: Instant) -> Result<(Bytes, bool), SessionError> {
        let was_established = self
            .sessions
            .remove(&peer)
            .map(|(_, s)| s.state == SessionState::Established)
            .unwrap_or(false);
        let init = self.initiate(peer, now)?.ok_or(SessionError::UnexpectedHandshake(peer))?;
        info!(peer = %peer, "Rekeying session");
        Ok((init, was_established))
    }

    /// Process an init from `from`.
    ///
    /// Returns the response payload, or `None` when both sides initiated at
    /// once and this node keeps the initiator role.
    pub fn handle_init(
        &self,
        from: PeerId,
        payload: Bytes,
        now: Instant,
    ) -> Result<Option<Bytes>, SessionError> {
        let init = InitMessage::decode(payload)?;

        // Simultaneous initiation: the smaller id stays initiator
        let keep_initiator = self
            .sessions
            .get(&from)
            .map(|s| {
                s.state == SessionState::HandshakeSent
                    && now.saturating_duration_since(s.created) < self.config.handshake_timeout
                    && self.local_id() < from
            })
            .unwrap_or(false);
        if keep_initiator {
            debug!(peer = %from, "Ignoring crossed init, keeping initiator role");
            return Ok(None);
        }

        match respond(self.identity.as_ref(), from, &init) {
            Ok((keys, key, response)) => {
                self.identity_keys.insert(from, key);
                match self.sessions.entry(from) {
                    Entry::Occupied(mut occupied)
                        if occupied.get().state == SessionState::Established =>
                    {
                        // live keys stay in use until the confirm verifies
                        occupied.get_mut().staged = Some(StagedRekey::responding(&keys, now));
                        debug!(peer = %from, "Answered init for established session, rekey staged");
                    }
                    Entry::Occupied(mut occupied) => {
                        occupied.insert(PeerSession::responding(&keys, now));
                        debug!(peer = %from, "Answered handshake init");
                    }
                    Entry::Vacant(vacant) => {
                        vacant.insert(PeerSession::responding(&keys, now));
                        debug!(peer = %from, "Answered handshake init");
                    }
                }
                Ok(Some(response.encode()))
            }
            Err(err) => {
                warn!(peer = %from, error = %err, "Handshake init rejected");
                self.fail_unless_established(from, now);
                Err(err)
            }
        }
    }

    /// Process a response from `from`, establishing the session.
    ///
    /// Returns the confirm payload to send back.
    pub fn handle_response(
        &self,
        from: PeerId,
        payload: Bytes,
        now: Instant,
    ) -> Result<Bytes, SessionError> {
        let response = ResponseMessage::decode(payload)?;

        let mut session = self
            .sessions
            .get_mut(&from)
            .ok_or(SessionError::UnexpectedHandshake(from))?;
        if session.state != SessionState::HandshakeSent {
            return Err(SessionError::UnexpectedHandshake(from));
        }
        let initiator = session
            .initiator
            .take()
            .ok_or(SessionError::UnexpectedHandshake(from))?;

        match initiator.finish(self.identity.as_ref(), &response) {
            Ok((keys, key)) => {
                session.establish_initiator(&keys, now);
                let confirm = session
                    .cipher
                    .as_mut()
                    .ok_or(SessionError::NoSession(from))?
                    .seal(&[])?;
                drop(session);
                self.identity_keys.insert(from, key);
                info!(peer = %from, role = "initiator", "Session established");
                Ok(confirm)
            }
            Err(err) => {
                session.fail();
                warn!(peer = %from, error = %err, "Handshake response rejected");
                Err(err)
            }
        }
    }

    /// Process the initiator's confirm, establishing the responder side
    pub fn handle_confirm(
        &self,
        from: PeerId,
        payload: Bytes,
        now: Instant,
    ) -> Result<(), SessionError> {
        let mut session = self
            .sessions
            .get_mut(&from)
            .ok_or(SessionError::UnexpectedHandshake(from))?;
        if session.state == SessionState::Established {
            let mut staged = session
                .staged
                .take()
                .ok_or(SessionError::UnexpectedHandshake(from))?;
            return match staged.cipher.open(&payload) {
                Ok(plaintext) if plaintext.is_empty() => {
                    session.commit_rekey(staged, now);
                    info!(peer = %from, role = "responder", "Session rekeyed");
                    Ok(())
                }
                _ => {
                    warn!(peer = %from, "Rekey confirm did not verify, keeping current session");
                    Err(SessionError::UnexpectedHandshake(from))
                }
            };
        }
        if session.state != SessionState::HandshakeReceived {
            return Err(SessionError::UnexpectedHandshake(from));
        }

        let opened = session
            .cipher
            .as_mut()
            .ok_or(SessionError::UnexpectedHandshake(from))?
            .open(&payload);
        match opened {
            Ok(plaintext) if plaintext.is_empty() => {
                session.state = SessionState::Established;
                session.last_activity = now;
                info!(peer = %from, role = "responder", "Session established");
                Ok(())
            }
            _ => {
                session.fail();
                warn!(peer = %from, "Handshake confirm did not verify");
                Err(SessionError::HandshakeFailed(
                    "confirm did not verify".to_string(),
                ))
            }
        }
    }

    /// Encrypt `plaintext` for `peer`. Fails closed without a session.
    pub fn encrypt(&self, plaintext: &[u8], peer: &PeerId) -> Result<Bytes, SessionError> {
        let mut session = self
            .sessions
            .get_mut(peer)
            .ok_or(SessionError::NoSession(*peer))?;
        if session.state != SessionState::Established {
            return Err(SessionError::NoSession(*peer));
        }
        let frame = session
            .cipher
            .as_mut()
            .ok_or(SessionError::NoSession(*peer))?
            .seal(plaintext)?;
        session.last_activity = Instant::now();
        Ok(frame)
    }

    /// Decrypt a frame from `peer`
    pub fn decrypt(&self, ciphertext: &[u8], peer: &PeerId) -> Result<Bytes, SessionError> {
        let mut session = self
            .sessions
            .get_mut(peer)
            .ok_or(SessionError::NoSession(*peer))?;
        if session.state != SessionState::Established {
            return Err(SessionError::NoSession(*peer));
        }
        let plaintext = session
            .cipher
            .as_mut()
            .ok_or(SessionError::NoSession(*peer))?
            .open(ciphertext)?;
        session.last_activity = Instant::now();
        Ok(plaintext)
    }

    /// Destroy the session with `peer`, returning its last state
    pub fn remove_peer(&self, peer: &PeerId) -> Option<SessionState> {
        let removed = self.sessions.remove(peer).map(|(_, s)| s.state);
        if removed.is_some() {
            debug!(peer = %peer, "Session removed");
        }
        removed
    }

    /// Expire idle sessions, fail stale handshakes and clear failed entries
    pub fn sweep(&self, now: Instant) -> Vec<SessionEvent> {
        let mut events = Vec::new();
        let idle = self.config.idle_timeout;
        let handshake = self.config.handshake_timeout;

        self.sessions.retain(|peer, session| match session.state {
            SessionState::Established => {
                if now.saturating_duration_since(session.last_activity) >= idle {
                    info!(peer = %peer, "Session expired after inactivity");
                    events.push(SessionEvent::Expired { peer: *peer });
                    return false;
                }
                let stale = session
                    .staged
                    .as_ref()
                    .is_some_and(|s| now.saturating_duration_since(s.started) >= handshake);
                if stale {
                    debug!(peer = %peer, "Unconfirmed rekey dropped");
                    session.staged = None;
                }
                true
            }
            SessionState::HandshakeSent | SessionState::HandshakeReceived => {
                if now.saturating_duration_since(session.created) >= handshake {
                    warn!(peer = %peer, "Handshake timed out");
                    session.fail();
                    events.push(SessionEvent::Failed {
                        peer: *peer,
                        reason: "handshake timed out".to_string(),
                    });
                }
                true
            }
            SessionState::Failed | SessionState::Expired => false,
        });

        events
    }

    /// Identity key for `peer`: pinned, or verified during a handshake
    pub fn identity_key(&self, peer: &PeerId) -> Option<VerifyingKey> {
        self.identity
            .pinned_key(peer)
            .or_else(|| self.identity_keys.get(peer).map(|k| *k))
    }

    /// Sign with this node's identity key
    pub fn sign(&self, message: &[u8]) -> [u8; SIGNATURE_LEN] {
        identity::sign(self.identity.as_ref(), message)
    }

    /// Verify a signature by `peer`; `None` when its key is unknown
    pub fn verify_from(
        &self,
        peer: &PeerId,
        message: &[u8],
        signature: &[u8; SIGNATURE_LEN],
    ) -> Option<bool> {
        self.identity_key(peer)
            .map(|key| identity::verify(&key, message, signature))
    }

    /// Seal a message for storage until `recipient` is reachable
    pub fn seal_at_rest(&self, recipient: &PeerId, plaintext: &[u8]) -> Result<Bytes, SessionError> {
        self.at_rest.seal(plaintext, recipient.as_bytes())
    }

    /// Open a message sealed with [`SessionManager::seal_at_rest`]
    pub fn open_at_rest(&self, recipient: &PeerId, sealed: &[u8]) -> Result<Bytes, SessionError> {
        self.at_rest.open(sealed, recipient.as_bytes())
    }

    fn fail_unless_established(&self, peer: PeerId, now: Instant) {
        match self.sessions.entry(peer) {
            Entry::Occupied(mut occupied) => {
                if occupied.get().state != SessionState::Established {
                    occupied.get_mut().fail();
                }
            }
            Entry::Vacant(vacant) => {
                let session = vacant.insert(PeerSession::failed(now));
                debug!(peer = %peer, state = %session.state, "Recorded failed handshake");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::StaticIdentity;
    use std::time::Duration;

    fn manager() -> SessionManager {
        SessionManager::new(Arc::new(StaticIdentity::generate()), SessionConfig::default())
    }

    /// Run a full handshake from `a` to `b`
    fn connect(a: &SessionManager, b: &SessionManager, now: Instant) {
        let init = a.initiate(b.local_id(), now).unwrap().unwrap();
        let response = b.handle_init(a.local_id(), init, now).unwrap().unwrap();
        let confirm = a.handle_response(b.local_id(), response, now).unwrap();
        b.handle_confirm(a.local_id(), confirm, now).unwrap();
    }

    #[test]
    fn test_handshake_and_traffic() {
        let a = manager();
        let b = manager();
        let now = Instant::now();

        assert!(!a.has_established_session(&b.local_id()));
        let init = a.initiate(b.local_id(), now).unwrap().unwrap();
        assert_eq!(a.state(&b.local_id()), Some(SessionState::HandshakeSent));
        assert!(a.initiate(b.local_id(), now).unwrap().is_none());

        let response = b.handle_init(a.local_id(), init, now).unwrap().unwrap();
        assert_eq!(b.state(&a.local_id()), Some(SessionState::HandshakeReceived));
        assert!(!b.has_established_session(&a.local_id()));

        let confirm = a.handle_response(b.local_id(), response, now).unwrap();
        assert!(a.has_established_session(&b.local_id()));

        b.handle_confirm(a.local_id(), confirm, now).unwrap();
        assert!(b.has_established_session(&a.local_id()));
        assert_eq!(
            a.transcript_hash(&b.local_id()),
            b.transcript_hash(&a.local_id())
        );

        let frame = a.encrypt(b"secret", &b.local_id()).unwrap();
        assert_eq!(&b.decrypt(&frame, &a.local_id()).unwrap()[..], b"secret");
        let frame = b.encrypt(b"reply", &a.local_id()).unwrap();
        assert_eq!(&a.decrypt(&frame, &b.local_id()).unwrap()[..], b"reply");

        assert!(a.identity_key(&b.local_id()).is_some());
        assert!(b.identity_key(&a.local_id()).is_some());
    }

    #[test]
    fn test_encrypt_fails_closed() {
        let a = manager();
        let peer = PeerId::from_u64(99);
        assert_eq!(
            a.encrypt(b"x", &peer),
            Err(SessionError::NoSession(peer))
        );
        a.initiate(peer, Instant::now()).unwrap();
        assert_eq!(
            a.encrypt(b"x", &peer),
            Err(SessionError::NoSession(peer))
        );
    }

    #[test]
    fn test_tampered_response_marks_failed() {
        let a = manager();
        let b = manager();
        let now = Instant::now();

        let init = a.initiate(b.local_id(), now).unwrap().unwrap();
        let response = b.handle_init(a.local_id(), init, now).unwrap().unwrap();
        let mut bad = response.to_vec();
        bad[0] ^= 0x55;

        assert!(matches!(
            a.handle_response(b.local_id(), Bytes::from(bad), now),
            Err(SessionError::HandshakeFailed(_))
        ));
        assert_eq!(a.state(&b.local_id()), Some(SessionState::Failed));
        assert!(!a.has_established_session(&b.local_id()));

        // a fresh attempt is allowed
        assert!(a.initiate(b.local_id(), now).unwrap().is_some());
    }

    #[test]
    fn test_bad_confirm_marks_failed() {
        let a = manager();
        let b = manager();
        let now = Instant::now();

        let init = a.initiate(b.local_id(), now).unwrap().unwrap();
        b.handle_init(a.local_id(), init, now).unwrap();
        assert!(b
            .handle_confirm(a.local_id(), Bytes::from(vec![0u8; 24]), now)
            .is_err());
        assert_eq!(b.state(&a.local_id()), Some(SessionState::Failed));
    }

    #[test]
    fn test_unexpected_messages() {
        let a = manager();
        let b = manager();
        let now = Instant::now();
        connect(&a, &b, now);

        let stray = Bytes::from(vec![0u8; crate::handshake::RESPONSE_LEN]);
        assert_eq!(
            a.handle_response(b.local_id(), stray, now),
            Err(SessionError::UnexpectedHandshake(b.local_id()))
        );
        assert!(a.has_established_session(&b.local_id()));
    }

    #[test]
    fn test_simultaneous_initiation_converges() {
        let a = manager();
        let b = manager();
        let now = Instant::now();
        let (low, high) = if a.local_id() < b.local_id() {
            (&a, &b)
        } else {
            (&b, &a)
        };

        let init_low = low.initiate(high.local_id(), now).unwrap().unwrap();
        let init_high = high.initiate(low.local_id(), now).unwrap().unwrap();

        // low keeps its role and ignores high's init
        assert!(low
            .handle_init(high.local_id(), init_high, now)
            .unwrap()
            .is_none());
        // high abandons its init and answers
        let response = high
            .handle_init(low.local_id(), init_low, now)
            .unwrap()
            .unwrap();
        let confirm = low.handle_response(high.local_id(), response, now).unwrap();
        high.handle_confirm(low.local_id(), confirm, now).unwrap();

        assert!(low.has_established_session(&high.local_id()));
        assert!(high.has_established_session(&low.local_id()));
    }

    #[test]
    fn test_sweep_expiry_and_timeouts() {
        let a = manager();
        let b = manager();
        let start = Instant::now();
        connect(&a, &b, start);

        let stranger = PeerId::from_u64(7);
        a.initiate(stranger, start).unwrap();

        let later = start + Duration::from_secs(16);
        let events = a.sweep(later);
        assert_eq!(
            events,
            vec![SessionEvent::Failed {
                peer: stranger,
                reason: "handshake timed out".to_string()
            }]
        );
        assert_eq!(a.state(&stranger), Some(SessionState::Failed));

        // failed entries are cleared on the next pass, idle sessions expire
        let much_later = start + Duration::from_secs(31 * 60);
        let events = a.sweep(much_later);
        assert_eq!(events, vec![SessionEvent::Expired { peer: b.local_id() }]);
        assert_eq!(a.state(&stranger), None);
        assert!(!a.has_established_session(&b.local_id()));
    }

    #[test]
    fn test_rekey_replaces_session() {
        let a = manager();
        let b = manager();
        let now = Instant::now();
        connect(&a, &b, now);
        let old = a.transcript_hash(&b.local_id());

        let (init, was_established) = a.rekey(b.local_id(), now).unwrap();
        assert!(was_established);
        assert!(!a.has_established_session(&b.local_id()));

        let response = b.handle_init(a.local_id(), init, now).unwrap().unwrap();
        assert!(b.has_established_session(&a.local_id()));
        assert_eq!(b.transcript_hash(&a.local_id()), old);

        let confirm = a.handle_response(b.local_id(), response, now).unwrap();
        b.handle_confirm(a.local_id(), confirm, now).unwrap();
        assert_ne!(a.transcript_hash(&b.local_id()), old);
        assert_eq!(a.transcript_hash(&b.local_id()), b.transcript_hash(&a.local_id()));
        assert!(b.has_established_session(&a.local_id()));

        let frame = a.encrypt(b"after rekey", &b.local_id()).unwrap();
        assert_eq!(&b.decrypt(&frame, &a.local_id()).unwrap()[..], b"after rekey");
    }

    #[test]
    fn test_replayed_init_keeps_established_session() {
        let a = manager();
        let b = manager();
        let now = Instant::now();

        let init = a.initiate(b.local_id(), now).unwrap().unwrap();
        let response = b
            .handle_init(a.local_id(), init.clone(), now)
            .unwrap()
            .unwrap();
        let confirm = a.handle_response(b.local_id(), response, now).unwrap();
        b.handle_confirm(a.local_id(), confirm.clone(), now).unwrap();
        let hash = b.transcript_hash(&a.local_id());

        // the same init again is answered but changes nothing yet
        assert!(b.handle_init(a.local_id(), init, now).unwrap().is_some());
        assert_eq!(b.state(&a.local_id()), Some(SessionState::Established));
        assert_eq!(b.transcript_hash(&a.local_id()), hash);

        let frame = a.encrypt(b"still here", &b.local_id()).unwrap();
        assert_eq!(&b.decrypt(&frame, &a.local_id()).unwrap()[..], b"still here");
        let frame = b.encrypt(b"reply", &a.local_id()).unwrap();
        assert_eq!(&a.decrypt(&frame, &b.local_id()).unwrap()[..], b"reply");

        // an old confirm does not open under the staged keys
        assert_eq!(
            b.handle_confirm(a.local_id(), confirm, now),
            Err(SessionError::UnexpectedHandshake(a.local_id()))
        );
        assert!(b.has_established_session(&a.local_id()));
        assert_eq!(b.transcript_hash(&a.local_id()), hash);
    }

    #[test]
    fn test_unconfirmed_rekey_is_swept() {
        let a = manager();
        let b = manager();
        let start = Instant::now();

        let init = a.initiate(b.local_id(), start).unwrap().unwrap();
        let response = b
            .handle_init(a.local_id(), init.clone(), start)
            .unwrap()
            .unwrap();
        let confirm = a.handle_response(b.local_id(), response, start).unwrap();
        b.handle_confirm(a.local_id(), confirm, start).unwrap();

        b.handle_init(a.local_id(), init, start).unwrap();
        assert!(b.sessions.get(&a.local_id()).unwrap().staged.is_some());

        let frame = a.encrypt(b"keepalive", &b.local_id()).unwrap();
        b.decrypt(&frame, &a.local_id()).unwrap();

        let events = b.sweep(start + Duration::from_secs(16));
        assert!(events.is_empty());
        assert!(b.has_established_session(&a.local_id()));
        assert!(b.sessions.get(&a.local_id()).unwrap().staged.is_none());
    }

    #[test]
    fn test_signatures_need_known_key() {
        let a = manager();
        let b = manager();
        let sig = b.sign(b"broadcast");
        assert_eq!(a.verify_from(&b.local_id(), b"broadcast", &sig), None);

        connect(&a, &b, Instant::now());
        assert_eq!(a.verify_from(&b.local_id(), b"broadcast", &sig), Some(true));
        assert_eq!(a.verify_from(&b.local_id(), b"forged", &sig), Some(false));
    }

    #[test]
    fn test_at_rest_roundtrip() {
        let a = manager();
        let peer = PeerId::from_u64(3);
        let sealed = a.seal_at_rest(&peer, b"later").unwrap();
        assert_eq!(&a.open_at_rest(&peer, &sealed).unwrap()[..], b"later");
        assert!(a.open_at_rest(&PeerId::from_u64(4), &sealed).is_err());
    }
}
