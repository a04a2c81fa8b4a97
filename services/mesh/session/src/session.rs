//! Per-peer session state.

use crate::cipher::SessionCipher;
use crate::handshake::{Initiator, SessionKeys};
use std::fmt;
use std::time::{Duration, Instant};

/// Handshake and session lifecycle.
///
/// A peer with no entry in the session table is uninitialized.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SessionState {
    /// Init sent, waiting for the response
    HandshakeSent,
    /// Response sent, waiting for the initiator's confirm
    HandshakeReceived,
    /// Keys derived and confirmed
    Established,
    /// Idle too long or rekeyed
    Expired,
    /// Verification failed or the handshake timed out
    Failed,
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            SessionState::HandshakeSent => "handshake_sent",
            SessionState::HandshakeReceived => "handshake_received",
            SessionState::Established => "established",
            SessionState::Expired => "expired",
            SessionState::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// Which side of the handshake this node played
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// Sent the init
    Initiator,
    /// Answered the init
    Responder,
}

/// Session configuration
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Established sessions idle this long expire
    pub idle_timeout: Duration,
    /// Handshakes not completed within this window fail
    pub handshake_timeout: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            idle_timeout: Duration::from_secs(30 * 60),
            handshake_timeout: Duration::from_secs(15),
        }
    }
}

/// Responder keys for a handshake that arrived while a session was already
/// established. The live session keeps working until these are confirmed.
#[derive(Debug)]
pub(crate) struct StagedRekey {
    pub(crate) cipher: SessionCipher,
    pub(crate) transcript_hash: [u8; 32],
    pub(crate) started: Instant,
}

impl StagedRekey {
    pub(crate) fn responding(keys: &SessionKeys, now: Instant) -> Self {
        Self {
            cipher: SessionCipher::new(&keys.responder_to_initiator, &keys.initiator_to_responder),
            transcript_hash: keys.transcript_hash,
            started: now,
        }
    }
}

/// One peer's entry in the session table
#[derive(Debug)]
pub struct PeerSession {
    /// Current state
    pub state: SessionState,
    /// Our role in the current handshake
    pub role: Role,
    /// When the current handshake started
    pub created: Instant,
    /// Last successful handshake step, encrypt or decrypt
    pub last_activity: Instant,
    pub(crate) initiator: Option<Initiator>,
    pub(crate) cipher: Option<SessionCipher>,
    pub(crate) transcript_hash: Option<[u8; 32]>,
    pub(crate) staged: Option<StagedRekey>,
}

impl PeerSession {
    pub(crate) fn initiating(initiator: Initiator, now: Instant) -> Self {
        Self {
            state: SessionState::HandshakeSent,
            role: Role::Initiator,
            created: now,
            last_activity: now,
            initiator: Some(initiator),
            cipher: None,
            transcript_hash: None,
            staged: None,
        }
    }

    pub(crate) fn responding(keys: &SessionKeys, now: Instant) -> Self {
        Self {
            state: SessionState::HandshakeReceived,
            role: Role::Responder,
            created: now,
            last_activity: now,
            initiator: None,
            cipher: Some(SessionCipher::new(
                &keys.responder_to_initiator,
                &keys.initiator_to_responder,
            )),
            transcript_hash: Some(keys.transcript_hash),
            staged: None,
        }
    }

    pub(crate) fn failed(now: Instant) -> Self {
        Self {
            state: SessionState::Failed,
            role: Role::Responder,
            created: now,
            last_activity: now,
            initiator: None,
            cipher: None,
            transcript_hash: None,
            staged: None,
        }
    }

    /// Move an initiator to `Established` with the derived keys
    pub(crate) fn establish_initiator(&mut self, keys: &SessionKeys, now: Instant) {
        self.state = SessionState::Established;
        self.initiator = None;
        self.cipher = Some(SessionCipher::new(
            &keys.initiator_to_responder,
            &keys.responder_to_initiator,
        ));
        self.transcript_hash = Some(keys.transcript_hash);
        self.last_activity = now;
    }

    /// Replace the live keys with a confirmed staged rekey
    pub(crate) fn commit_rekey(&mut self, staged: StagedRekey, now: Instant) {
        self.role = Role::Responder;
        self.created = staged.started;
        self.cipher = Some(staged.cipher);
        self.transcript_hash = Some(staged.transcript_hash);
        self.last_activity = now;
    }

    /// Drop key material and mark failed
    pub(crate) fn fail(&mut self) {
        self.state = SessionState::Failed;
        self.initiator = None;
        self.cipher = None;
        self.transcript_hash = None;
        self.staged = None;
    }

    /// Whether a handshake is still in progress
    pub fn is_pending(&self) -> bool {
        matches!(
            self.state,
            SessionState::HandshakeSent | SessionState::HandshakeReceived
        )
    }
}
