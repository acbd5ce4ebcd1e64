//! fleet.toml configuration parser.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::CoreError;

#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
#[serde(default)]
pub struct FleetConfig {
    pub store: StoreConfig,
    pub events: EventsConfig,
    pub rollout: RolloutConfig,
    pub api: ApiConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct StoreConfig {
    pub data_dir: PathBuf,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("/var/lib/fleetgrid"),
        }
    }
}

/// Change-notification coalescing.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct EventsConfig {
    pub flush_interval_ms: u64,
    /// Delay before the first flush so the process can settle on startup.
    pub initial_delay_ms: u64,
    /// Broadcast channel capacity of the in-process bus.
    pub bus_capacity: usize,
}

impl Default for EventsConfig {
    fn default() -> Self {
        Self {
            flush_interval_ms: 2_000,
            initial_delay_ms: 10_000,
            bus_capacity: 4_096,
        }
    }
}

impl EventsConfig {
    pub fn flush_interval(&self) -> Duration {
        Duration::from_millis(self.flush_interval_ms)
    }

    pub fn initial_delay(&self) -> Duration {
        Duration::from_millis(self.initial_delay_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct RolloutConfig {
    /// Period of the creating/starting/running rollout checks.
    pub check_interval_ms: u64,
    /// Actions/targets written per store transaction.
    pub action_batch: usize,
}

impl Default for RolloutConfig {
    fn default() -> Self {
        Self {
            check_interval_ms: 2_000,
            action_batch: 1_000,
        }
    }
}

impl RolloutConfig {
    pub fn check_interval(&self) -> Duration {
        Duration::from_millis(self.check_interval_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ApiConfig {
    pub port: u16,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self { port: 8480 }
    }
}

impl FleetConfig {
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: FleetConfig = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn to_toml_string(&self) -> anyhow::Result<String> {
        Ok(toml::to_string_pretty(self)?)
    }

    /// Reject values that would spin a background loop or stall writers.
    pub fn validate(&self) -> Result<(), CoreError> {
        if self.events.flush_interval_ms == 0 {
            return Err(CoreError::InvalidConfig(
                "events.flush_interval_ms must be greater than zero".to_string(),
            ));
        }
        if self.events.bus_capacity == 0 {
            return Err(CoreError::InvalidConfig(
                "events.bus_capacity must be greater than zero".to_string(),
            ));
        }
        if self.rollout.check_interval_ms == 0 {
            return Err(CoreError::InvalidConfig(
                "rollout.check_interval_ms must be greater than zero".to_string(),
            ));
        }
        if self.rollout.action_batch == 0 {
            return Err(CoreError::InvalidConfig(
                "rollout.action_batch must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_observed_scheduler() {
        let config = FleetConfig::default();
        assert_eq!(config.events.flush_interval(), Duration::from_millis(2000));
        assert_eq!(config.events.initial_delay(), Duration::from_millis(10_000));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn parse_partial() {
        let toml_str = r#"
[events]
flush_interval_ms = 500

[api]
port = 9000
"#;
        let config: FleetConfig = toml::from_str(toml_str).unwrap();
        assert_eq!(config.events.flush_interval_ms, 500);
        assert_eq!(config.events.initial_delay_ms, 10_000);
        assert_eq!(config.api.port, 9000);
        assert_eq!(config.rollout, RolloutConfig::default());
    }

    #[test]
    fn roundtrip_through_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("fleet.toml");
        let mut config = FleetConfig::default();
        config.rollout.action_batch = 250;
        std::fs::write(&path, config.to_toml_string().unwrap()).unwrap();

        let loaded = FleetConfig::from_file(&path).unwrap();
        assert_eq!(loaded, config);
    }

    #[test]
    fn zero_interval_rejected() {
        let mut config = FleetConfig::default();
        config.events.flush_interval_ms = 0;
        assert!(config.validate().is_err());
    }
}
