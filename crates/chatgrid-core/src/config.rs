//! Cluster configuration.
//!
//! One immutable `ClusterConfig` is built at supervisor start (from TOML
//! or defaults) and handed to every component behind an `Arc`. Nothing
//! reads configuration from ambient state.

use serde::{Deserialize, Serialize};
use std::path::Path;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ClusterConfig {
    pub process: ProcessConfig,
    pub supervisor: SupervisorConfig,
    pub autoscale: AutoScaleConfig,
    pub throttle: ThrottleConfig,
    pub multi_clients: MultiClientsConfig,
    pub metrics: MetricsConfig,
    pub distribution: DistributionConfig,
}

/// Worker process timing.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProcessConfig {
    /// A worker whose heartbeat is older than this is stale.
    pub stale_secs: u64,
    /// Worker-side heartbeat / queue-drain interval.
    pub periodic_timer_ms: u64,
    /// A terminating worker is force-killed after this long.
    pub timeout_ms: u64,
    /// Poll interval while waiting for scale-down removals.
    pub scale_poll_ms: u64,
    /// Poll interval while waiting for pool teardown.
    pub terminate_poll_ms: u64,
}

impl Default for ProcessConfig {
    fn default() -> Self {
        Self {
            stale_secs: 90,
            periodic_timer_ms: 2_000,
            timeout_ms: 60_000,
            scale_poll_ms: 1_000,
            terminate_poll_ms: 500,
        }
    }
}

/// Supervisor replica timing and identity.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SupervisorConfig {
    /// A supervisor whose heartbeat is older than this is stale.
    pub stale_secs: u64,
    /// Tick interval; also the `handle-queue` lease TTL.
    pub update_interval_ms: u64,
    /// Length of the random suffix in generated supervisor ids.
    pub key_length: usize,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            stale_secs: 120,
            update_interval_ms: 1_000,
            key_length: 8,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AutoScaleConfig {
    pub processes: ProcessBounds,
    pub thresholds: ScaleThresholds,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProcessBounds {
    pub min: usize,
    pub max: usize,
}

impl Default for ProcessBounds {
    fn default() -> Self {
        Self { min: 2, max: 20 }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ScaleThresholds {
    /// Channels one worker is expected to carry.
    pub channels: usize,
    /// Scale up above this average usage percentage.
    pub scale_up: f64,
    /// Scale down below this average usage percentage.
    pub scale_down: f64,
}

impl Default for ScaleThresholds {
    fn default() -> Self {
        Self {
            channels: 1_000,
            scale_up: 75.0,
            scale_down: 50.0,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ThrottleConfig {
    pub join: RateBudgetConfig,
    pub clients: ClientRateBudgetConfig,
}

/// Join/part budget: the chat network's join-rate limit applies to the
/// whole fleet, so these numbers are shared across replicas.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RateBudgetConfig {
    /// Points available per window.
    pub allow: u32,
    /// Window length.
    pub every_ms: u64,
    /// Maximum actions placed per batch.
    pub take: usize,
}

impl Default for RateBudgetConfig {
    fn default() -> Self {
        Self {
            allow: 2_000,
            every_ms: 10_000,
            take: 20,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientRateBudgetConfig {
    pub allow: u32,
    pub every_ms: u64,
    pub take: usize,
}

impl Default for ClientRateBudgetConfig {
    fn default() -> Self {
        Self {
            allow: 100,
            every_ms: 10_000,
            take: 10,
        }
    }
}

/// Dedicated-client routing (channels joined under secondary identities).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct MultiClientsConfig {
    pub enabled: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MetricsConfig {
    pub enabled: bool,
    /// Include process memory in persisted metrics.
    pub memory: bool,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            memory: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DistributionConfig {
    /// Delivery strategy: commands land on a worker's private queue
    /// (`queue`) or are published with a queue fallback (`pubsub`).
    pub mode: DistributionMode,
}

impl Default for DistributionConfig {
    fn default() -> Self {
        Self {
            mode: DistributionMode::Queue,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DistributionMode {
    Queue,
    PubSub,
}

impl ClusterConfig {
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: ClusterConfig = toml::from_str(&content)?;
        Ok(config)
    }

    pub fn to_toml_string(&self) -> anyhow::Result<String> {
        Ok(toml::to_string_pretty(self)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_values() {
        let config = ClusterConfig::default();
        assert_eq!(config.process.stale_secs, 90);
        assert_eq!(config.supervisor.stale_secs, 120);
        assert_eq!(config.autoscale.processes.min, 2);
        assert_eq!(config.autoscale.processes.max, 20);
        assert_eq!(config.autoscale.thresholds.channels, 1_000);
        assert_eq!(config.throttle.join.allow, 2_000);
        assert!(!config.multi_clients.enabled);
        assert_eq!(config.distribution.mode, DistributionMode::Queue);
    }

    #[test]
    fn parse_partial_toml_keeps_defaults() {
        let toml_str = r#"
[autoscale.thresholds]
channels = 30
scale_up = 75.0
scale_down = 50.0

[distribution]
mode = "pub_sub"
"#;
        let config: ClusterConfig = toml::from_str(toml_str).unwrap();
        assert_eq!(config.autoscale.thresholds.channels, 30);
        assert_eq!(config.distribution.mode, DistributionMode::PubSub);
        // Untouched sections fall back to defaults.
        assert_eq!(config.process.timeout_ms, 60_000);
        assert_eq!(config.throttle.join.take, 20);
    }

    #[test]
    fn toml_round_trip() {
        let config = ClusterConfig::default();
        let rendered = config.to_toml_string().unwrap();
        let back: ClusterConfig = toml::from_str(&rendered).unwrap();
        assert_eq!(back.supervisor.key_length, config.supervisor.key_length);
        assert_eq!(back.throttle.clients.allow, config.throttle.clients.allow);
    }
}
