//! ChaCha20-Poly1305 framing for established sessions.
//!
//! ```text
//! | counter(8) | ciphertext + tag(16) |
//! ```
//!
//! The nonce is four zero bytes followed by the big-endian counter. Each
//! direction has its own key, so counters never collide across directions.

use crate::error::SessionError;
use bytes::{BufMut, Bytes, BytesMut};
use chacha20poly1305::aead::{Aead, KeyInit, Payload};
use chacha20poly1305::{ChaCha20Poly1305, Key, Nonce};
use rand::RngCore;
use zeroize::Zeroizing;

/// Counter prefix length
pub const COUNTER_LEN: usize = 8;

/// Poly1305 tag length
pub const TAG_LEN: usize = 16;

/// Per-frame overhead added by [`SessionCipher::seal`]
pub const FRAME_OVERHEAD: usize = COUNTER_LEN + TAG_LEN;

const REPLAY_WINDOW: u64 = 64;

fn nonce_for(counter: u64) -> Nonce {
    let mut nonce = [0u8; 12];
    nonce[4..].copy_from_slice(&counter.to_be_bytes());
    Nonce::from(nonce)
}

/// Sliding window over received counters
#[derive(Debug, Default, Clone)]
struct ReplayWindow {
    highest: Option<u64>,
    bitmap: u64,
}

impl ReplayWindow {
    fn check(&self, counter: u64) -> bool {
        match self.highest {
            None => true,
            Some(high) if counter > high => true,
            Some(high) => {
                let age = high - counter;
                age < REPLAY_WINDOW && self.bitmap & (1 << age) == 0
            }
        }
    }

    fn accept(&mut self, counter: u64) {
        match self.highest {
            None => {
                self.highest = Some(counter);
                self.bitmap = 1;
            }
            Some(high) if counter > high => {
                let shift = counter - high;
                self.bitmap = if shift >= REPLAY_WINDOW {
                    1
                } else {
                    (self.bitmap << shift) | 1
                };
                self.highest = Some(counter);
            }
            Some(high) => {
                self.bitmap |= 1 << (high - counter);
            }
        }
    }
}

/// Directional cipher pair of one established session
pub struct SessionCipher {
    send: ChaCha20Poly1305,
    recv: ChaCha20Poly1305,
    send_counter: u64,
    replay: ReplayWindow,
}

impl SessionCipher {
    /// Build from the send and receive keys
    pub fn new(send_key: &[u8; 32], recv_key: &[u8; 32]) -> Self {
        Self {
            send: ChaCha20Poly1305::new(Key::from_slice(send_key)),
            recv: ChaCha20Poly1305::new(Key::from_slice(recv_key)),
            send_counter: 0,
            replay: ReplayWindow::default(),
        }
    }

    /// Encrypt one frame
    pub fn seal(&mut self, plaintext: &[u8]) -> Result<Bytes, SessionError> {
        if self.send_counter == u64::MAX {
            return Err(SessionError::NonceExhausted);
        }
        let counter = self.send_counter;
        let ciphertext = self
            .send
            .encrypt(&nonce_for(counter), plaintext)
            .map_err(|_| SessionError::DecryptFailed)?;
        self.send_counter += 1;

        let mut frame = BytesMut::with_capacity(COUNTER_LEN + ciphertext.len());
        frame.put_u64(counter);
        frame.put_slice(&ciphertext);
        Ok(frame.freeze())
    }

    /// Decrypt one frame, rejecting replays
    pub fn open(&mut self, frame: &[u8]) -> Result<Bytes, SessionError> {
        if frame.len() < FRAME_OVERHEAD {
            return Err(SessionError::DecryptFailed);
        }
        let mut raw = [0u8; COUNTER_LEN];
        raw.copy_from_slice(&frame[..COUNTER_LEN]);
        let counter = u64::from_be_bytes(raw);
        if !self.replay.check(counter) {
            return Err(SessionError::DecryptFailed);
        }

        let plaintext = self
            .recv
            .decrypt(&nonce_for(counter), &frame[COUNTER_LEN..])
            .map_err(|_| SessionError::DecryptFailed)?;
        self.replay.accept(counter);
        Ok(Bytes::from(plaintext))
    }

    /// Frames sealed so far
    pub fn sent(&self) -> u64 {
        self.send_counter
    }
}

impl std::fmt::Debug for SessionCipher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionCipher")
            .field("send_counter", &self.send_counter)
            .finish_non_exhaustive()
    }
}

/// Node-local key for sealing queued messages at rest.
///
/// ```text
/// | nonce(12) | ciphertext + tag(16) |
/// ```
pub struct AtRestSealer {
    cipher: ChaCha20Poly1305,
}

impl AtRestSealer {
    /// Fresh random key
    pub fn generate() -> Self {
        let mut key = Zeroizing::new([0u8; 32]);
        rand::thread_rng().fill_bytes(&mut key[..]);
        Self {
            cipher: ChaCha20Poly1305::new(Key::from_slice(&key[..])),
        }
    }

    /// Seal `plaintext`, binding it to `aad`
    pub fn seal(&self, plaintext: &[u8], aad: &[u8]) -> Result<Bytes, SessionError> {
        let mut nonce = [0u8; 12];
        rand::thread_rng().fill_bytes(&mut nonce);
        let ciphertext = self
            .cipher
            .encrypt(
                &Nonce::from(nonce),
                Payload {
                    msg: plaintext,
                    aad,
                },
            )
            .map_err(|_| SessionError::DecryptFailed)?;

        let mut out = BytesMut::with_capacity(nonce.len() + ciphertext.len());
        out.put_slice(&nonce);
        out.put_slice(&ciphertext);
        Ok(out.freeze())
    }

    /// Open a sealed entry
    pub fn open(&self, sealed: &[u8], aad: &[u8]) -> Result<Bytes, SessionError> {
        if sealed.len() < 12 + TAG_LEN {
            return Err(SessionError::DecryptFailed);
        }
        let (nonce, ciphertext) = sealed.split_at(12);
        self.cipher
            .decrypt(
                Nonce::from_slice(nonce),
                Payload {
                    msg: ciphertext,
                    aad,
                },
            )
            .map(Bytes::from)
            .map_err(|_| SessionError::DecryptFailed)
    }
}

impl std::fmt::Debug for AtRestSealer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("AtRestSealer")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pair() -> (SessionCipher, SessionCipher) {
        let a = [1u8; 32];
        let b = [2u8; 32];
        (SessionCipher::new(&a, &b), SessionCipher::new(&b, &a))
    }

    #[test]
    fn test_seal_open() {
        let (mut alice, mut bob) = pair();
        let frame = alice.seal(b"hello").unwrap();
        assert_eq!(frame.len(), 5 + FRAME_OVERHEAD);
        assert_eq!(&bob.open(&frame).unwrap()[..], b"hello");

        let reply = bob.seal(b"hi").unwrap();
        assert_eq!(&alice.open(&reply).unwrap()[..], b"hi");
    }

    #[test]
    fn test_replay_and_tamper_rejected() {
        let (mut alice, mut bob) = pair();
        let frame = alice.seal(b"once").unwrap();
        bob.open(&frame).unwrap();
        assert_eq!(bob.open(&frame), Err(SessionError::DecryptFailed));

        let mut tampered = alice.seal(b"data").unwrap().to_vec();
        let last = tampered.len() - 1;
        tampered[last] ^= 1;
        assert_eq!(bob.open(&tampered), Err(SessionError::DecryptFailed));
        assert!(bob.open(&[0u8; 4]).is_err());
    }

    #[test]
    fn test_out_of_order_within_window() {
        let (mut alice, mut bob) = pair();
        let frames: Vec<Bytes> = (0..5).map(|_| alice.seal(b"x").unwrap()).collect();
        bob.open(&frames[4]).unwrap();
        bob.open(&frames[1]).unwrap();
        bob.open(&frames[3]).unwrap();
        assert!(bob.open(&frames[1]).is_err());
        bob.open(&frames[0]).unwrap();
    }

    #[test]
    fn test_window_drops_very_old() {
        let mut window = ReplayWindow::default();
        window.accept(100);
        assert!(!window.check(100 - REPLAY_WINDOW));
        assert!(window.check(100 - REPLAY_WINDOW + 1));
        window.accept(300);
        assert!(!window.check(100));
        assert!(window.check(299));
    }

    #[test]
    fn test_counter_exhaustion() {
        let (mut alice, _) = pair();
        alice.send_counter = u64::MAX;
        assert_eq!(alice.seal(b"x"), Err(SessionError::NonceExhausted));
    }

    #[test]
    fn test_at_rest_binds_aad() {
        let sealer = AtRestSealer::generate();
        let sealed = sealer.seal(b"queued", b"peer-a").unwrap();
        assert_eq!(&sealer.open(&sealed, b"peer-a").unwrap()[..], b"queued");
        assert!(sealer.open(&sealed, b"peer-b").is_err());
        assert!(AtRestSealer::generate().open(&sealed, b"peer-a").is_err());
    }
}
