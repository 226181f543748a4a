//! Configuration for pulselink
//!
//! Two files live under the pulselink config directory:
//!
//! - `config.yaml`: [`LinkConfig`], written by the application or its packager
//! - `settings.yaml`: [`UserSettings`], written by the user's settings UI
//!
//! Every field has a default, so partial files are fine.
//!
//! ```ignore
//! use pulselink_core::config::{load_config, default_config_path, LinkConfig};
//!
//! let config: LinkConfig = load_config(&default_config_path("config.yaml"));
//! ```

mod io;
mod paths;
mod settings;

pub use io::{load_config, save_config, try_load_config};
pub use paths::{default_config_dir, default_config_path, default_settings_path};
pub use settings::{SettingsWatcher, UserSettings};

use crate::ghost::EstimatorConfig;
use crate::merge::EngineConfig;
use crate::timeline::validate_quantum;
use crate::types::NANOS_PER_MILLI;
use serde::{Deserialize, Serialize};
use std::net::Ipv4Addr;
use std::path::PathBuf;
use std::time::Duration;

/// Top-level configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LinkConfig {
    pub network: NetworkConfig,
    pub timing: TimingConfig,
    pub clock: ClockConfig,
    pub session: SessionConfig,
    pub settings: SettingsConfig,
}

/// UDP multicast transport
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    pub multicast_group: Ipv4Addr,
    pub port: u16,
    /// Local interface to send and join on (unspecified = OS default)
    pub interface: Ipv4Addr,
    /// Multicast hop limit; 1 keeps traffic on the local subnet
    pub multicast_ttl: u32,
    /// Deliver our own datagrams to other sockets on this host
    pub multicast_loop: bool,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            multicast_group: Ipv4Addr::new(224, 76, 78, 75),
            port: 20808,
            interface: Ipv4Addr::UNSPECIFIED,
            multicast_ttl: 1,
            multicast_loop: true,
        }
    }
}

/// Periods and timeouts of the session protocol
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TimingConfig {
    /// Re-broadcast period of the session state
    pub broadcast_interval_ms: u64,
    /// Peers silent for this long are dropped
    pub peer_ttl_ms: u64,
    pub ping_interval_ms: u64,
    pub drift_interval_ms: u64,
    pub measurement_timeout_ms: u64,
    /// Controller loop wake-up period
    pub controller_poll_us: u64,
}

impl Default for TimingConfig {
    fn default() -> Self {
        Self {
            broadcast_interval_ms: 250,
            peer_ttl_ms: 5_000,
            ping_interval_ms: 50,
            drift_interval_ms: 1_000,
            measurement_timeout_ms: 3_000,
            controller_poll_us: 1_000,
        }
    }
}

/// Clock measurement between peers
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClockConfig {
    pub min_samples: usize,
    pub max_samples: usize,
    pub max_round_trip_ms: u64,
    pub max_drift_ppm: f64,
}

impl Default for ClockConfig {
    fn default() -> Self {
        let estimator = EstimatorConfig::default();
        Self {
            min_samples: estimator.min_samples,
            max_samples: estimator.max_samples,
            max_round_trip_ms: (estimator.max_round_trip_nanos / NANOS_PER_MILLI) as u64,
            max_drift_ppm: estimator.max_drift_ppm,
        }
    }
}

/// Session behaviour
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Quantum whose phase peers agree on
    pub quantum: f64,
    /// Capacity of the real-time commit queue
    pub realtime_queue_capacity: usize,
    /// Whether a new Link starts out active
    pub start_active: bool,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            quantum: 4.0,
            realtime_queue_capacity: 64,
            start_active: true,
        }
    }
}

/// Where user settings come from
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SettingsConfig {
    /// Settings file; `None` uses [`default_settings_path`]
    pub path: Option<PathBuf>,
    /// Reload the settings file when it changes
    pub watch: bool,
}

impl Default for SettingsConfig {
    fn default() -> Self {
        Self {
            path: None,
            watch: true,
        }
    }
}

impl SettingsConfig {
    pub fn resolved_path(&self) -> PathBuf {
        self.path.clone().unwrap_or_else(default_settings_path)
    }
}

fn millis(ms: u64) -> i64 {
    i64::try_from(ms).unwrap_or(i64::MAX / NANOS_PER_MILLI).saturating_mul(NANOS_PER_MILLI)
}

impl LinkConfig {
    /// Merge engine parameters, with invalid values replaced by defaults
    pub fn engine_config(&self) -> EngineConfig {
        let defaults = EngineConfig::default();
        let quantum = validate_quantum(self.session.quantum).unwrap_or_else(|_| {
            log::warn!(
                "Invalid session quantum {}, using {}",
                self.session.quantum,
                defaults.quantum
            );
            defaults.quantum
        });
        EngineConfig {
            quantum,
            broadcast_interval_nanos: millis(self.timing.broadcast_interval_ms.max(1)),
            peer_ttl_nanos: millis(self.timing.peer_ttl_ms.max(1)),
            ping_interval_nanos: millis(self.timing.ping_interval_ms.max(1)),
            drift_interval_nanos: millis(self.timing.drift_interval_ms.max(1)),
            measurement_timeout_nanos: millis(self.timing.measurement_timeout_ms.max(1)),
            estimator: EstimatorConfig {
                min_samples: self.clock.min_samples.max(1),
                max_samples: self.clock.max_samples.max(self.clock.min_samples).max(1),
                max_round_trip_nanos: millis(self.clock.max_round_trip_ms),
                max_drift_ppm: self.clock.max_drift_ppm.abs(),
            },
        }
    }

    pub fn controller_poll(&self) -> Duration {
        Duration::from_micros(self.timing.controller_poll_us.clamp(100, 100_000))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_engine_config_matches_engine_defaults() {
        assert_eq!(LinkConfig::default().engine_config(), EngineConfig::default());
    }

    #[test]
    fn test_partial_yaml() {
        let yaml = "session:\n  quantum: 3\nnetwork:\n  port: 4000\n";
        let config: LinkConfig = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(config.session.quantum, 3.0);
        assert_eq!(config.session.realtime_queue_capacity, 64);
        assert_eq!(config.network.port, 4000);
        assert_eq!(config.network.multicast_group, Ipv4Addr::new(224, 76, 78, 75));
        assert_eq!(config.timing, TimingConfig::default());
    }

    #[test]
    fn test_invalid_quantum_falls_back() {
        let mut config = LinkConfig::default();
        config.session.quantum = -2.0;
        assert_eq!(config.engine_config().quantum, 4.0);
    }

    #[test]
    fn test_roundtrip_through_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.yaml");
        let mut config = LinkConfig::default();
        config.timing.broadcast_interval_ms = 100;
        config.settings.path = Some(dir.path().join("settings.yaml"));
        save_config(&config, &path).unwrap();
        let loaded: LinkConfig = load_config(&path);
        assert_eq!(loaded, config);
        assert_eq!(loaded.engine_config().broadcast_interval_nanos, 100 * NANOS_PER_MILLI);
    }
}
