//! Mesh node engine.
//!
//! A [`MeshNode`] ties the mesh core together over a set of neighbor links:
//!
//! ```text
//! link bytes -> parse -> signature check -> MeshRouter (dedup, TTL, relay)
//!            -> reassemble -> decrypt -> DeliverySink
//!
//! send_private -> SessionManager::encrypt -> fragment -> route -> link writes
//!              \-> StoreAndForwardQueue when the recipient is unreachable
//! ```
//!
//! Time-based cleanup happens only in [`MeshNode::run_maintenance`], driven
//! periodically by [`MeshNode::spawn_maintenance`].

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod config;
pub mod error;
pub mod events;
mod inbound;
pub mod link;
pub mod node;
pub mod sink;

pub use config::MeshConfig;
pub use error::NodeError;
pub use events::MeshEvent;
pub use inbound::InboundOutcome;
pub use link::{ChannelLink, Link, LinkError};
pub use node::{MeshNode, MAX_MESSAGE_SIZE};
pub use sink::{ChannelSink, Delivery, DeliverySink};

// Component crates, re-exported for embedders
pub use mesh_delivery as delivery;
pub use mesh_routing as routing;
pub use mesh_session as session;
pub use mesh_storage as storage;
pub use mesh_wire as wire;
