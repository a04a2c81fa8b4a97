//! Delivery tracking for private messages.
//!
//! Each outbound private message is tracked from send (or queueing) until it
//! is acknowledged, runs out of attempts, expires in the store-and-forward
//! queue, or is cancelled. The caller gets a [`DeliveryReceipt`] resolved
//! exactly once with the terminal [`DeliveryOutcome`].

use crate::retry::RetryPolicy;
use bytes::Bytes;
use dashmap::DashMap;
use mesh_wire::{MessageId, PeerId};
use std::fmt;
use std::time::Instant;
use tokio::sync::oneshot;
use tracing::{debug, warn};

/// Terminal result of a tracked message
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryOutcome {
    /// Recipient acknowledged the message
    Delivered,
    /// Every attempt went unacknowledged
    Exhausted {
        /// Sends made
        attempts: u32,
    },
    /// Retention ran out while waiting in the store-and-forward queue
    Expired,
    /// Pushed out of a full store-and-forward queue
    Evicted,
    /// Cancelled by the caller or dropped with the node
    Cancelled,
}

impl fmt::Display for DeliveryOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DeliveryOutcome::Delivered => write!(f, "delivered"),
            DeliveryOutcome::Exhausted { attempts } => {
                write!(f, "undelivered after {} attempts", attempts)
            }
            DeliveryOutcome::Expired => write!(f, "expired in queue"),
            DeliveryOutcome::Evicted => write!(f, "evicted from queue"),
            DeliveryOutcome::Cancelled => write!(f, "cancelled"),
        }
    }
}

/// Handle resolved once with the message's outcome
#[derive(Debug)]
pub struct DeliveryReceipt {
    message_id: MessageId,
    rx: oneshot::Receiver<DeliveryOutcome>,
}

impl DeliveryReceipt {
    /// Id of the tracked message
    pub fn message_id(&self) -> MessageId {
        self.message_id
    }

    /// Wait for the outcome; a tracker dropped mid-flight reads as cancelled
    pub async fn outcome(self) -> DeliveryOutcome {
        self.rx.await.unwrap_or(DeliveryOutcome::Cancelled)
    }

    /// Outcome if already resolved
    pub fn try_outcome(&mut self) -> Option<DeliveryOutcome> {
        self.rx.try_recv().ok()
    }
}

/// Where a tracked message is
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryState {
    /// Waiting in store-and-forward; no retries run
    Queued,
    /// Sent at least once, waiting for an ack
    InFlight {
        /// Sends made so far
        attempts: u32,
        /// When the next resend is due
        next_retry: Instant,
    },
}

/// A tracked outbound message
#[derive(Debug)]
pub struct PendingDelivery {
    /// Target peer
    pub recipient: PeerId,
    /// Inner message to resend; empty while queued
    pub payload: Bytes,
    /// Current state
    pub state: DeliveryState,
    /// When tracking started
    pub created: Instant,
    notify: Option<oneshot::Sender<DeliveryOutcome>>,
}

impl PendingDelivery {
    fn resolve(mut self, outcome: DeliveryOutcome) {
        if let Some(tx) = self.notify.take() {
            // receiver may be gone; nothing to report to then
            let _ = tx.send(outcome);
        }
    }
}

/// Work produced by [`DeliveryTracker::due`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RetryAction {
    /// Send the payload again
    Resend {
        /// Message to resend
        message_id: MessageId,
        /// Target peer
        recipient: PeerId,
        /// Inner message bytes
        payload: Bytes,
        /// Attempt number this resend counts as
        attempt: u32,
    },
    /// Attempts ran out; the receipt has been resolved
    Exhausted {
        /// Message that failed
        message_id: MessageId,
        /// Target peer
        recipient: PeerId,
        /// Sends made
        attempts: u32,
    },
}

/// Tracks acknowledgement state and schedules retries
#[derive(Debug)]
pub struct DeliveryTracker {
    policy: RetryPolicy,
    pending: DashMap<MessageId, PendingDelivery>,
}

impl DeliveryTracker {
    /// Create a tracker using `policy`
    pub fn new(policy: RetryPolicy) -> Self {
        Self {
            policy,
            pending: DashMap::new(),
        }
    }

    /// Retry policy in use
    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Track a message whose first send happened at `now`
    pub fn track_in_flight(
        &self,
        message_id: MessageId,
        recipient: PeerId,
        payload: Bytes,
        now: Instant,
    ) -> DeliveryReceipt {
        let state = DeliveryState::InFlight {
            attempts: 1,
            next_retry: now + self.policy.backoff(1),
        };
        self.track(message_id, recipient, payload, state, now)
    }

    /// Track a message parked in the store-and-forward queue
    pub fn track_queued(&self, message_id: MessageId, recipient: PeerId, now: Instant) -> DeliveryReceipt {
        self.track(message_id, recipient, Bytes::new(), DeliveryState::Queued, now)
    }

    /// A queued message was drained and sent for the first time
    pub fn mark_in_flight(&self, message_id: &MessageId, payload: Bytes, now: Instant) -> bool {
        let Some(mut entry) = self.pending.get_mut(message_id) else {
            return false;
        };
        if entry.state != DeliveryState::Queued {
            return false;
        }
        entry.payload = payload;
        entry.state = DeliveryState::InFlight {
            attempts: 1,
            next_retry: now + self.policy.backoff(1),
        };
        true
    }

    /// Record an ack from `from`. Returns `true` only for the first matching
    /// ack; repeats and acks from other peers are ignored.
    pub fn ack(&self, from: &PeerId, message_id: &MessageId) -> bool {
        let removed = self
            .pending
            .remove_if(message_id, |_, pending| pending.recipient == *from);
        match removed {
            Some((_, pending)) => {
                debug!(message_id = %message_id, peer = %from, "Message acknowledged");
                pending.resolve(DeliveryOutcome::Delivered);
                true
            }
            None => false,
        }
    }

    /// Stop tracking `message_id`, resolving its receipt as cancelled.
    ///
    /// Returns the recipient it was addressed to, or `None` when the message
    /// was not tracked or already resolved.
    pub fn cancel(&self, message_id: &MessageId) -> Option<PeerId> {
        let (_, pending) = self.pending.remove(message_id)?;
        debug!(message_id = %message_id, peer = %pending.recipient, "Delivery cancelled");
        let recipient = pending.recipient;
        pending.resolve(DeliveryOutcome::Cancelled);
        Some(recipient)
    }

    /// Resolve a tracked message with `outcome` and release it
    pub fn resolve(&self, message_id: &MessageId, outcome: DeliveryOutcome) -> bool {
        match self.pending.remove(message_id) {
            Some((_, pending)) => {
                debug!(message_id = %message_id, outcome = %outcome, "Delivery resolved");
                pending.resolve(outcome);
                true
            }
            None => false,
        }
    }

    /// Resends and exhaustions due at `now`
    pub fn due(&self, now: Instant) -> Vec<RetryAction> {
        let mut actions = Vec::new();
        let policy = self.policy;

        self.pending.retain(|message_id, pending| {
            let DeliveryState::InFlight {
                attempts,
                next_retry,
            } = pending.state
            else {
                return true;
            };
            if next_retry > now {
                return true;
            }

            if policy.allows_retry(attempts) {
                let attempt = attempts + 1;
                pending.state = DeliveryState::InFlight {
                    attempts: attempt,
                    next_retry: now + policy.backoff(attempt),
                };
                actions.push(RetryAction::Resend {
                    message_id: *message_id,
                    recipient: pending.recipient,
                    payload: pending.payload.clone(),
                    attempt,
                });
                true
            } else {
                warn!(
                    message_id = %message_id,
                    peer = %pending.recipient,
                    attempts,
                    "Delivery exhausted"
                );
                if let Some(tx) = pending.notify.take() {
                    let _ = tx.send(DeliveryOutcome::Exhausted { attempts });
                }
                actions.push(RetryAction::Exhausted {
                    message_id: *message_id,
                    recipient: pending.recipient,
                    attempts,
                });
                false
            }
        });

        actions
    }

    /// State of a tracked message
    pub fn state(&self, message_id: &MessageId) -> Option<DeliveryState> {
        self.pending.get(message_id).map(|p| p.state)
    }

    /// Messages tracked for `recipient`
    pub fn pending_for(&self, recipient: &PeerId) -> Vec<MessageId> {
        self.pending
            .iter()
            .filter(|p| p.recipient == *recipient)
            .map(|p| *p.key())
            .collect()
    }

    /// Tracked messages
    pub fn len(&self) -> usize {
        self.pending.len()
    }

    /// Whether nothing is tracked
    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    fn track(
        &self,
        message_id: MessageId,
        recipient: PeerId,
        payload: Bytes,
        state: DeliveryState,
        now: Instant,
    ) -> DeliveryReceipt {
        let (tx, rx) = oneshot::channel();
        let previous = self.pending.insert(
            message_id,
            PendingDelivery {
                recipient,
                payload,
                state,
                created: now,
                notify: Some(tx),
            },
        );
        if let Some(previous) = previous {
            previous.resolve(DeliveryOutcome::Cancelled);
        }
        debug!(message_id = %message_id, peer = %recipient, ?state, "Tracking delivery");
        DeliveryReceipt { message_id, rx }
    }
}

impl Default for DeliveryTracker {
    fn default() -> Self {
        Self::new(RetryPolicy::default())
    }
}
