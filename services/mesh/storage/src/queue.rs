//! Store-and-forward buffer for peers that are not currently reachable.

use crate::QueueError;
use bytes::Bytes;
use mesh_wire::{MessageId, PeerId};
use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// Queue bounds
#[derive(Debug, Clone)]
pub struct QueueConfig {
    /// Maximum messages held per recipient
    pub per_recipient: usize,
    /// Maximum payload bytes held across all recipients
    pub total_bytes: usize,
    /// Entries older than this are dropped by the sweep
    pub retention: Duration,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            per_recipient: 100,
            total_bytes: 1024 * 1024,
            retention: Duration::from_secs(12 * 60 * 60),
        }
    }
}

/// A message waiting for its recipient
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueuedMessage {
    /// Target peer
    pub recipient: PeerId,
    /// End-to-end message identifier
    pub message_id: MessageId,
    /// Payload sealed at rest
    pub sealed: Bytes,
    /// When the entry was queued
    pub enqueued_at: Instant,
    /// When the sweep will drop it
    pub expires_at: Instant,
}

#[derive(Debug, Default)]
struct QueueState {
    by_recipient: HashMap<PeerId, VecDeque<QueuedMessage>>,
    total_bytes: usize,
}

impl QueueState {
    fn pop_oldest_for(&mut self, recipient: &PeerId) -> Option<QueuedMessage> {
        let queue = self.by_recipient.get_mut(recipient)?;
        let evicted = queue.pop_front()?;
        if queue.is_empty() {
            self.by_recipient.remove(recipient);
        }
        self.total_bytes -= evicted.sealed.len();
        Some(evicted)
    }

    fn pop_oldest_overall(&mut self) -> Option<QueuedMessage> {
        let recipient = self
            .by_recipient
            .iter()
            .filter_map(|(peer, queue)| queue.front().map(|m| (*peer, m.enqueued_at)))
            .min_by_key(|(_, at)| *at)
            .map(|(peer, _)| peer)?;
        self.pop_oldest_for(&recipient)
    }
}

/// Bounded per-recipient FIFO of undeliverable messages.
///
/// Enqueue never blocks: past a bound, the oldest entries for the same
/// recipient are evicted first, then the oldest entries overall.
#[derive(Debug)]
pub struct StoreAndForwardQueue {
    config: QueueConfig,
    state: Mutex<QueueState>,
}

impl StoreAndForwardQueue {
    /// Create an empty queue
    pub fn new(config: QueueConfig) -> Self {
        Self {
            config,
            state: Mutex::new(QueueState::default()),
        }
    }

    /// Queue `sealed` for `recipient`, returning the entries evicted to make
    /// room
    pub fn enqueue(
        &self,
        recipient: PeerId,
        message_id: MessageId,
        sealed: Bytes,
        now: Instant,
    ) -> Result<Vec<QueuedMessage>, QueueError> {
        let size = sealed.len();
        if size > self.config.total_bytes {
            return Err(QueueError::TooLarge {
                size,
                limit: self.config.total_bytes,
            });
        }

        let mut state = self.state.lock().unwrap_or_else(|err| err.into_inner());
        let mut evicted = Vec::new();

        let held = state.by_recipient.get(&recipient).map_or(0, VecDeque::len);
        if held >= self.config.per_recipient {
            if let Some(old) = state.pop_oldest_for(&recipient) {
                evicted.push(old);
            }
        }

        while state.total_bytes + size > self.config.total_bytes {
            let next = state
                .pop_oldest_for(&recipient)
                .or_else(|| state.pop_oldest_overall());
            match next {
                Some(old) => evicted.push(old),
                None => break,
            }
        }

        state.total_bytes += size;
        state
            .by_recipient
            .entry(recipient)
            .or_default()
            .push_back(QueuedMessage {
                recipient,
                message_id,
                sealed,
                enqueued_at: now,
                expires_at: now + self.config.retention,
            });

        if !evicted.is_empty() {
            warn!(
                peer = %recipient,
                evicted = evicted.len(),
                "Store-and-forward queue full, evicted oldest entries"
            );
        }
        debug!(peer = %recipient, message = %message_id, size, "Queued message");

        Ok(evicted)
    }

    /// Remove and return every entry for `recipient` in enqueue order
    pub fn drain(&self, recipient: &PeerId) -> Vec<QueuedMessage> {
        let mut state = self.state.lock().unwrap_or_else(|err| err.into_inner());
        let Some(queue) = state.by_recipient.remove(recipient) else {
            return Vec::new();
        };
        let drained: Vec<QueuedMessage> = queue.into_iter().collect();
        state.total_bytes -= drained.iter().map(|m| m.sealed.len()).sum::<usize>();
        drained
    }

    /// Remove one entry, returning whether it was present
    pub fn remove(&self, recipient: &PeerId, message_id: &MessageId) -> bool {
        let mut state = self.state.lock().unwrap_or_else(|err| err.into_inner());
        let Some(queue) = state.by_recipient.get_mut(recipient) else {
            return false;
        };
        let Some(pos) = queue.iter().position(|m| m.message_id == *message_id) else {
            return false;
        };
        let removed = queue.remove(pos);
        if queue.is_empty() {
            state.by_recipient.remove(recipient);
        }
        if let Some(removed) = removed {
            state.total_bytes -= removed.sealed.len();
        }
        true
    }

    /// Drop entries whose expiry has passed
    pub fn sweep(&self, now: Instant) -> Vec<QueuedMessage> {
        let mut state = self.state.lock().unwrap_or_else(|err| err.into_inner());
        let mut expired = Vec::new();

        state.by_recipient.retain(|_, queue| {
            while queue.front().is_some_and(|m| m.expires_at <= now) {
                if let Some(old) = queue.pop_front() {
                    expired.push(old);
                }
            }
            !queue.is_empty()
        });
        state.total_bytes -= expired.iter().map(|m| m.sealed.len()).sum::<usize>();

        if !expired.is_empty() {
            debug!(count = expired.len(), "Expired store-and-forward entries");
        }
        expired
    }

    /// Entries held for `recipient`
    pub fn pending_for(&self, recipient: &PeerId) -> usize {
        let state = self.state.lock().unwrap_or_else(|err| err.into_inner());
        state.by_recipient.get(recipient).map_or(0, VecDeque::len)
    }

    /// Total entries held
    pub fn len(&self) -> usize {
        let state = self.state.lock().unwrap_or_else(|err| err.into_inner());
        state.by_recipient.values().map(VecDeque::len).sum()
    }

    /// True when nothing is queued
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Payload bytes held
    pub fn total_bytes(&self) -> usize {
        self.state
            .lock()
            .unwrap_or_else(|err| err.into_inner())
            .total_bytes
    }
}

impl Default for StoreAndForwardQueue {
    fn default() -> Self {
        Self::new(QueueConfig::default())
    }
}
