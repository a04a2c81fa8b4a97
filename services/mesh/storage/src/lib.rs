//! Bounded in-memory storage for the mesh: packet deduplication and the
//! store-and-forward queue.
//!
//! Both structures own their state behind an internal lock, so callers share
//! them by reference and never synchronize externally. Neither persists to
//! disk; a restart forgets seen packets and queued messages.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod dedup;
pub mod queue;

use thiserror::Error;

/// Store-and-forward errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum QueueError {
    /// A single entry exceeds the global byte bound
    #[error("entry of {size} bytes exceeds queue limit of {limit} bytes")]
    TooLarge {
        /// Entry size
        size: usize,
        /// Configured global bound
        limit: usize,
    },
}

// Re-export main types
pub use dedup::{DedupConfig, DuplicateFilter};
pub use queue::{QueueConfig, QueuedMessage, StoreAndForwardQueue};
