//! Node configuration.
//!
//! Durations are written as human strings (`"30s"`, `"5m"`, `"12h"`).

use crate::error::NodeError;
use mesh_delivery::RetryPolicy;
use mesh_routing::{RouterConfig, DEFAULT_MAX_HINTED_PEERS};
use mesh_session::SessionConfig;
use mesh_storage::{DedupConfig, QueueConfig};
use mesh_wire::{AssemblerConfig, FRAGMENT_HEADER_SIZE, MAX_PAYLOAD_SIZE};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Serde adapter for humantime duration strings
mod human_duration {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&humantime::format_duration(*value).to_string())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        let raw = String::deserialize(deserializer)?;
        humantime::parse_duration(&raw).map_err(serde::de::Error::custom)
    }
}

/// Mesh node configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MeshConfig {
    /// Ceiling for originated TTLs
    pub max_ttl: u8,
    /// Packet payloads above this size are fragmented
    pub fragment_threshold: usize,
    /// Partial transfers older than this are discarded
    #[serde(with = "human_duration")]
    pub transfer_timeout: Duration,
    /// Concurrent partial transfers per sender
    pub max_transfers_per_peer: usize,
    /// Concurrent partial transfers overall
    pub max_transfers_total: usize,
    /// Packet ids per duplicate-filter generation
    pub dedup_capacity: usize,
    /// Target duplicate-filter false-positive rate
    pub dedup_false_positive_rate: f64,
    /// Maximum age of a duplicate-filter generation
    #[serde(with = "human_duration")]
    pub dedup_rotation: Duration,
    /// Sends per private message before giving up
    pub retry_max_attempts: u32,
    /// Wait after the first send
    #[serde(with = "human_duration")]
    pub retry_base_backoff: Duration,
    /// Upper bound for any retry wait
    #[serde(with = "human_duration")]
    pub retry_max_backoff: Duration,
    /// Queued messages per unreachable peer
    pub queue_per_peer: usize,
    /// Queued bytes overall
    pub queue_total_bytes: usize,
    /// How long a queued message waits for its recipient
    #[serde(with = "human_duration")]
    pub queue_retention: Duration,
    /// Established sessions idle this long expire
    #[serde(with = "human_duration")]
    pub session_idle_timeout: Duration,
    /// Handshakes not completed within this window fail
    #[serde(with = "human_duration")]
    pub handshake_timeout: Duration,
    /// Neighbors used when relaying toward a non-neighbor
    pub selective_relay_fanout: usize,
    /// Age after which reachability hints are ignored
    #[serde(with = "human_duration")]
    pub reachability_ttl: Duration,
    /// Remote peers tracked in the reachability table
    pub max_hinted_peers: usize,
    /// Period of the maintenance sweep
    #[serde(with = "human_duration")]
    pub sweep_interval: Duration,
    /// Capacity of the event channel
    pub event_buffer: usize,
    /// Sign originated broadcasts
    pub sign_broadcasts: bool,
}

impl Default for MeshConfig {
    fn default() -> Self {
        Self {
            max_ttl: 7,
            fragment_threshold: 512,
            transfer_timeout: Duration::from_secs(30),
            max_transfers_per_peer: 8,
            max_transfers_total: 64,
            dedup_capacity: 1000,
            dedup_false_positive_rate: 0.001,
            dedup_rotation: Duration::from_secs(5 * 60),
            retry_max_attempts: 5,
            retry_base_backoff: Duration::from_secs(2),
            retry_max_backoff: Duration::from_secs(60),
            queue_per_peer: 100,
            queue_total_bytes: 1024 * 1024,
            queue_retention: Duration::from_secs(12 * 60 * 60),
            session_idle_timeout: Duration::from_secs(30 * 60),
            handshake_timeout: Duration::from_secs(15),
            selective_relay_fanout: 3,
            reachability_ttl: Duration::from_secs(5 * 60),
            max_hinted_peers: DEFAULT_MAX_HINTED_PEERS,
            sweep_interval: Duration::from_secs(5),
            event_buffer: 256,
            sign_broadcasts: true,
        }
    }
}

impl MeshConfig {
    /// Reject values the node cannot run with
    pub fn validate(&self) -> Result<(), NodeError> {
        let invalid = |msg: &str| Err(NodeError::Config(msg.to_string()));

        if self.max_ttl == 0 {
            return invalid("max_ttl must be at least 1");
        }
        if self.fragment_threshold <= FRAGMENT_HEADER_SIZE {
            return invalid("fragment_threshold must exceed the fragment header");
        }
        if self.fragment_threshold > MAX_PAYLOAD_SIZE {
            return invalid("fragment_threshold exceeds the packet payload limit");
        }
        if self.max_transfers_per_peer == 0 || self.max_transfers_total == 0 {
            return invalid("transfer limits must be non-zero");
        }
        if self.dedup_capacity == 0 {
            return invalid("dedup_capacity must be non-zero");
        }
        if !(self.dedup_false_positive_rate > 0.0 && self.dedup_false_positive_rate < 1.0) {
            return invalid("dedup_false_positive_rate must be between 0 and 1");
        }
        if self.retry_max_attempts == 0 {
            return invalid("retry_max_attempts must be non-zero");
        }
        if self.queue_per_peer == 0 || self.queue_total_bytes == 0 {
            return invalid("queue limits must be non-zero");
        }
        if self.selective_relay_fanout == 0 {
            return invalid("selective_relay_fanout must be non-zero");
        }
        if self.max_hinted_peers == 0 {
            return invalid("max_hinted_peers must be non-zero");
        }
        if self.event_buffer == 0 {
            return invalid("event_buffer must be non-zero");
        }
        if self.sweep_interval.is_zero() {
            return invalid("sweep_interval must be non-zero");
        }
        Ok(())
    }

    pub(crate) fn session_config(&self) -> SessionConfig {
        SessionConfig {
            idle_timeout: self.session_idle_timeout,
            handshake_timeout: self.handshake_timeout,
        }
    }

    pub(crate) fn router_config(&self) -> RouterConfig {
        RouterConfig {
            max_ttl: self.max_ttl,
            selective_relay_fanout: self.selective_relay_fanout,
            reachability_ttl: self.reachability_ttl,
            max_hinted_peers: self.max_hinted_peers,
            dedup: DedupConfig {
                capacity: self.dedup_capacity,
                false_positive_rate: self.dedup_false_positive_rate,
                rotation: self.dedup_rotation,
            },
        }
    }

    pub(crate) fn assembler_config(&self) -> AssemblerConfig {
        AssemblerConfig {
            transfer_timeout: self.transfer_timeout,
            max_transfers_per_peer: self.max_transfers_per_peer,
            max_transfers_total: self.max_transfers_total,
        }
    }

    pub(crate) fn queue_config(&self) -> QueueConfig {
        QueueConfig {
            per_recipient: self.queue_per_peer,
            total_bytes: self.queue_total_bytes,
            retention: self.queue_retention,
        }
    }

    pub(crate) fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.retry_max_attempts,
            base_backoff: self.retry_base_backoff,
            max_backoff: self.retry_max_backoff,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = MeshConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.max_ttl, 7);
        assert_eq!(config.router_config().dedup.capacity, 1000);
        assert_eq!(config.retry_policy().max_attempts, 5);
    }

    #[test]
    fn test_validate_rejects() {
        let cases = [
            MeshConfig {
                max_ttl: 0,
                ..MeshConfig::default()
            },
            MeshConfig {
                fragment_threshold: FRAGMENT_HEADER_SIZE,
                ..MeshConfig::default()
            },
            MeshConfig {
                dedup_capacity: 0,
                ..MeshConfig::default()
            },
            MeshConfig {
                dedup_false_positive_rate: 1.5,
                ..MeshConfig::default()
            },
            MeshConfig {
                queue_per_peer: 0,
                ..MeshConfig::default()
            },
            MeshConfig {
                max_hinted_peers: 0,
                ..MeshConfig::default()
            },
        ];
        for config in cases {
            assert!(matches!(config.validate(), Err(NodeError::Config(_))));
        }
    }

    #[test]
    fn test_yaml_with_human_durations() {
        let yaml = r#"
max_ttl: 5
transfer_timeout: 45s
queue_retention: 2h
sign_broadcasts: false
"#;
        let config: MeshConfig = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(config.max_ttl, 5);
        assert_eq!(config.transfer_timeout, Duration::from_secs(45));
        assert_eq!(config.queue_retention, Duration::from_secs(2 * 60 * 60));
        assert!(!config.sign_broadcasts);
        // unspecified fields keep their defaults
        assert_eq!(config.fragment_threshold, 512);

        let text = serde_yaml::to_string(&config).unwrap();
        let back: MeshConfig = serde_yaml::from_str(&text).unwrap();
        assert_eq!(back, config);
    }

    #[test]
    fn test_bad_duration_rejected() {
        let result: Result<MeshConfig, _> = serde_yaml::from_str("sweep_interval: soon");
        assert!(result.is_err());
    }
}
