//! LLM provider auth profiles
//!
//! Each profile is one credential for one provider plus failover state. The
//! pool hands out live profiles and applies class-based cooldowns when calls
//! fail.

pub mod pool;
pub mod store;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub use pool::AuthProfilePool;

/// Failure classes reported by provider calls
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorClass {
    Auth,
    RateLimit,
    Billing,
    Format,
    Timeout,
    Unknown,
}

impl ErrorClass {
    /// Transient classes are retried on another profile within the run
    #[must_use]
    pub const fn is_transient(self) -> bool {
        matches!(self, Self::RateLimit | Self::Timeout | Self::Unknown)
    }
}

/// Mutable failover state for one profile
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProfileState {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_used: Option<DateTime<Utc>>,
    #[serde(default)]
    pub error_count: u32,
    /// Consecutive billing failures, for the doubling schedule
    #[serde(default)]
    pub billing_error_count: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cooldown_until: Option<DateTime<Utc>>,
    /// Set means the profile needs operator intervention
    #[serde(default)]
    pub disabled: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error_class: Option<ErrorClass>,
}

/// One credential plus its state
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthProfile {
    pub id: String,
    pub provider: String,
    pub api_key: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub base_url: Option<String>,
    #[serde(default)]
    pub state: ProfileState,
}

impl AuthProfile {
    /// Is this profile usable right now?
    #[must_use]
    pub fn is_live(&self, now: DateTime<Utc>) -> bool {
        !self.state.disabled
            && self.state.cooldown_until.is_none_or(|until| until <= now)
            && !self.api_key.is_empty()
    }
}

/// Read-through handle given to runs; the pool can cool the profile down
/// concurrently without invalidating the handle.
#[derive(Debug, Clone)]
pub struct ProfileHandle {
    pub id: String,
    pub provider: String,
    pub api_key: String,
    pub base_url: Option<String>,
}
