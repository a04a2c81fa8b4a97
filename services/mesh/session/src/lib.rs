//! Authenticated, forward-secret sessions between mesh peers.
//!
//! This crate owns everything cryptographic in the mesh core: the node
//! identity collaborator, the signed ephemeral X25519 handshake, the per-peer
//! session state machine, and ChaCha20-Poly1305 framing for established
//! sessions.
//!
//! ## Features
//!
//! - **Handshake Protocol**: init / response / confirm with Ed25519-signed
//!   ephemeral keys
//! - **Session Table**: one entry per peer, transitions under the entry lock
//! - **Fail-Closed Encryption**: `encrypt` refuses without an established
//!   session
//! - **Replay Protection**: 64-frame sliding window per session
//! - **Sealing At Rest**: node-local key for messages waiting in the
//!   store-and-forward queue
//!
//! ## Example
//!
//! ```rust
//! use mesh_session::{IdentityProvider, SessionConfig, SessionManager, StaticIdentity};
//! use std::sync::Arc;
//! use std::time::Instant;
//!
//! let alice = SessionManager::new(Arc::new(StaticIdentity::generate()), SessionConfig::default());
//! let bob = SessionManager::new(Arc::new(StaticIdentity::generate()), SessionConfig::default());
//! let now = Instant::now();
//!
//! let init = alice.initiate(bob.local_id(), now)?.expect("fresh handshake");
//! let response = bob.handle_init(alice.local_id(), init, now)?.expect("no crossing init");
//! let confirm = alice.handle_response(bob.local_id(), response, now)?;
//! bob.handle_confirm(alice.local_id(), confirm, now)?;
//!
//! let frame = alice.encrypt(b"hello", &bob.local_id())?;
//! assert_eq!(&bob.decrypt(&frame, &alice.local_id())?[..], b"hello");
//! # Ok::<(), mesh_session::SessionError>(())
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod cipher;
pub mod error;
pub mod handshake;
pub mod identity;
pub mod manager;
pub mod session;

// Re-export main types
pub use cipher::{AtRestSealer, SessionCipher, FRAME_OVERHEAD};
pub use error::SessionError;
pub use handshake::{InitMessage, Initiator, ResponseMessage, SessionKeys, INIT_LEN, RESPONSE_LEN};
pub use identity::{peer_id_for, IdentityProvider, StaticIdentity};
pub use manager::{SessionEvent, SessionManager};
pub use session::{PeerSession, Role, SessionConfig, SessionState};
