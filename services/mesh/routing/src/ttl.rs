//! Adaptive TTL for originated packets

use serde::{Deserialize, Serialize};
use std::fmt;

/// Lowest TTL an originated packet is given
pub const MIN_TTL: u8 = 2;

/// Power budget reported by the host device
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PowerState {
    /// Mains power or healthy battery
    #[default]
    Normal,
    /// Battery saver engaged
    LowPower,
    /// Battery nearly exhausted
    Critical,
}

impl fmt::Display for PowerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PowerState::Normal => write!(f, "normal"),
            PowerState::LowPower => write!(f, "low_power"),
            PowerState::Critical => write!(f, "critical"),
        }
    }
}

/// Host signals consulted when choosing a TTL
pub trait PowerStateProvider: Send + Sync + fmt::Debug {
    /// Current power budget
    fn power_state(&self) -> PowerState;

    /// Whether the radio channel is congested
    fn congested(&self) -> bool {
        false
    }
}

/// Provider for hosts that never report power pressure
#[derive(Debug, Default, Clone, Copy)]
pub struct AlwaysPowered;

impl PowerStateProvider for AlwaysPowered {
    fn power_state(&self) -> PowerState {
        PowerState::Normal
    }
}

/// TTL policy bounded by a configured maximum
#[derive(Debug, Clone, Copy)]
pub struct AdaptiveTtl {
    max_ttl: u8,
}

impl AdaptiveTtl {
    /// Policy with the given ceiling
    pub fn new(max_ttl: u8) -> Self {
        Self {
            max_ttl: max_ttl.max(1),
        }
    }

    /// Configured ceiling
    pub fn max_ttl(&self) -> u8 {
        self.max_ttl
    }

    /// TTL for a packet originated under the given conditions.
    ///
    /// Never exceeds the ceiling and never drops below [`MIN_TTL`] unless the
    /// ceiling itself is lower.
    pub fn ttl_for(&self, power: PowerState, congested: bool) -> u8 {
        let floor = MIN_TTL.min(self.max_ttl);
        let mut ttl = match power {
            PowerState::Normal => self.max_ttl,
            PowerState::LowPower => (self.max_ttl as u16 * 2 / 3) as u8,
            PowerState::Critical => floor,
        };
        if congested {
            ttl = ttl.saturating_sub(1);
        }
        ttl.clamp(floor, self.max_ttl)
    }

    /// TTL read from a provider
    pub fn current(&self, provider: &dyn PowerStateProvider) -> u8 {
        self.ttl_for(provider.power_state(), provider.congested())
    }
}
