//! ballast.toml scheduling configuration.
//!
//! Every option treats a zero (or missing) value as "use the default".
//! [`Config::adjust`] fills those defaults in; all constructors in this
//! module return an adjusted config, so components can read it as-is.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors produced while validating a configuration.
#[derive(Debug, Error, PartialEq)]
pub enum ConfigError {
    #[error("min_schedule_interval ({min:?}) exceeds max_schedule_interval ({max:?})")]
    IntervalBounds { min: Duration, max: Duration },

    #[error("min_available_storage_used_rate must be within 1..=100, got {0}")]
    StorageRate(u32),

    #[error("invalid location label: {0:?}")]
    LocationLabel(String),

    #[error("invalid duration: {0:?}")]
    Duration(String),
}

/// Tunables for the rebalancing scheduler.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Schedule attempts per scheduler tick.
    pub max_schedule_retries: u32,
    /// Upper bound of the per-scheduler cadence.
    #[serde(with = "duration_str")]
    pub max_schedule_interval: Duration,
    /// Lower bound of the per-scheduler cadence.
    #[serde(with = "duration_str")]
    pub min_schedule_interval: Duration,
    /// How long an emitted operator may stay in flight.
    #[serde(with = "duration_str")]
    pub timeout_wait_operator_complete: Duration,
    /// Cooldown applied to a container that was skipped by a scheduler.
    #[serde(with = "duration_str")]
    pub max_freeze_schedule_interval: Duration,
    /// Heartbeat age after which a container is treated as down.
    #[serde(with = "duration_str")]
    pub max_allow_container_down_duration: Duration,
    pub max_rebalance_leader: u64,
    pub max_rebalance_replica: u64,
    pub max_schedule_replica: u64,
    pub max_limit_snapshots_count: u64,
    /// Target replica count per resource.
    pub count_resource_replicas: usize,
    /// Containers at or above this storage usage (percent) are not targets.
    pub min_available_storage_used_rate: u32,
    /// Ordered topology label keys, outermost tier first (zone, rack, host).
    pub location_labels: Vec<String>,
    /// Batch size for bulk metadata loads.
    pub load_batch_size: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self::unset().adjust()
    }
}

impl Config {
    /// All-zero config; every field falls back to its default on `adjust`.
    fn unset() -> Self {
        Self {
            max_schedule_retries: 0,
            max_schedule_interval: Duration::ZERO,
            min_schedule_interval: Duration::ZERO,
            timeout_wait_operator_complete: Duration::ZERO,
            max_freeze_schedule_interval: Duration::ZERO,
            max_allow_container_down_duration: Duration::ZERO,
            max_rebalance_leader: 0,
            max_rebalance_replica: 0,
            max_schedule_replica: 0,
            max_limit_snapshots_count: 0,
            count_resource_replicas: 0,
            min_available_storage_used_rate: 0,
            location_labels: Vec::new(),
            load_batch_size: 0,
        }
    }

    /// Replace every zero-valued option with its default.
    pub fn adjust(mut self) -> Self {
        if self.max_schedule_retries == 0 {
            self.max_schedule_retries = 3;
        }
        if self.max_schedule_interval.is_zero() {
            self.max_schedule_interval = Duration::from_secs(60);
        }
        if self.min_schedule_interval.is_zero() {
            self.min_schedule_interval = Duration::from_millis(10);
        }
        if self.timeout_wait_operator_complete.is_zero() {
            self.timeout_wait_operator_complete = Duration::from_secs(5 * 60);
        }
        if self.max_freeze_schedule_interval.is_zero() {
            self.max_freeze_schedule_interval = Duration::from_secs(30);
        }
        if self.max_allow_container_down_duration.is_zero() {
            self.max_allow_container_down_duration = Duration::from_secs(60 * 60);
        }
        if self.max_rebalance_leader == 0 {
            self.max_rebalance_leader = 16;
        }
        if self.max_rebalance_replica == 0 {
            self.max_rebalance_replica = 12;
        }
        if self.max_schedule_replica == 0 {
            self.max_schedule_replica = 16;
        }
        if self.max_limit_snapshots_count == 0 {
            self.max_limit_snapshots_count = 3;
        }
        if self.count_resource_replicas == 0 {
            self.count_resource_replicas = 3;
        }
        if self.min_available_storage_used_rate == 0 {
            self.min_available_storage_used_rate = 80;
        }
        if self.load_batch_size == 0 {
            self.load_batch_size = 1000;
        }
        self
    }

    /// Check cross-field constraints. Call after [`Config::adjust`].
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.min_schedule_interval > self.max_schedule_interval {
            return Err(ConfigError::IntervalBounds {
                min: self.min_schedule_interval,
                max: self.max_schedule_interval,
            });
        }
        if self.min_available_storage_used_rate > 100 {
            return Err(ConfigError::StorageRate(self.min_available_storage_used_rate));
        }
        for (i, label) in self.location_labels.iter().enumerate() {
            if label.trim().is_empty() || self.location_labels[..i].contains(label) {
                return Err(ConfigError::LocationLabel(label.clone()));
            }
        }
        Ok(())
    }

    /// Parse, adjust and validate a TOML document.
    pub fn from_toml_str(content: &str) -> anyhow::Result<Self> {
        let config: Config = toml::from_str(content)?;
        let config = config.adjust();
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml_str(&content)
    }

    pub fn to_toml_string(&self) -> anyhow::Result<String> {
        Ok(toml::to_string_pretty(self)?)
    }

    /// Builder-style override of the location labels.
    pub fn with_location_labels<I, S>(mut self, labels: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.location_labels = labels.into_iter().map(Into::into).collect();
        self
    }
}

/// Parse a duration string like "10ms", "30s", "5m", "1h".
///
/// A bare number is read as seconds. Values that overflow are rejected.
pub fn parse_duration(s: &str) -> Option<Duration> {
    let s = s.trim();
    if let Some(ms) = s.strip_suffix("ms") {
        ms.trim().parse::<u64>().ok().map(Duration::from_millis)
    } else if let Some(secs) = s.strip_suffix('s') {
        secs.trim().parse::<u64>().ok().map(Duration::from_secs)
    } else if let Some(mins) = s.strip_suffix('m') {
        let mins = mins.trim().parse::<u64>().ok()?;
        mins.checked_mul(60).map(Duration::from_secs)
    } else if let Some(hours) = s.strip_suffix('h') {
        let hours = hours.trim().parse::<u64>().ok()?;
        hours.checked_mul(3600).map(Duration::from_secs)
    } else {
        s.parse::<u64>().ok().map(Duration::from_secs)
    }
}

/// Render a duration with the largest unit that divides it exactly.
fn format_duration(d: Duration) -> String {
    let millis = d.as_millis();
    if millis == 0 {
        "0s".to_string()
    } else if millis % 3_600_000 == 0 {
        format!("{}h", millis / 3_600_000)
    } else if millis % 60_000 == 0 {
        format!("{}m", millis / 60_000)
    } else if millis % 1000 == 0 {
        format!("{}s", millis / 1000)
    } else {
        format!("{millis}ms")
    }
}

mod duration_str {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&super::format_duration(*d))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        let raw = String::deserialize(d)?;
        super::parse_duration(&raw)
            .ok_or_else(|| serde::de::Error::custom(super::ConfigError::Duration(raw)))
    }
}
