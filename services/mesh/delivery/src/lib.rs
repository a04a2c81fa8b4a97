//! Delivery tracking and retry scheduling.
//!
//! The tracker holds one [`PendingDelivery`] per outbound private message.
//! Retries are not timer driven: the node's periodic sweep calls
//! [`DeliveryTracker::due`] and performs the resends it returns.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod retry;
pub mod tracker;

pub use retry::RetryPolicy;
pub use tracker::{
    DeliveryOutcome, DeliveryReceipt, DeliveryState, DeliveryTracker, PendingDelivery, RetryAction,
};
