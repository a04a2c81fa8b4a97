//! Relay decisions for the radio mesh.
//!
//! Inbound packets are deduplicated and flooded to every neighbor except the
//! one they arrived from while their TTL allows. Originated unicast goes
//! straight to a neighbor when the recipient is one, otherwise to the few
//! neighbors the reachability hints rank best. Originated TTLs shrink under
//! power pressure reported by the host.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod router;
pub mod table;
pub mod ttl;

pub use router::*;
pub use table::*;
pub use ttl::*;
