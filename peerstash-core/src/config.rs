use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Which ops a node serves from its sweep endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum SweepScope {
    /// Only ops authored by the responding host.
    #[default]
    Own,
    /// Every op in the responding host's log.
    All,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OpLogConfig {
    pub pull_limit: usize,
    pub sweep_interval_secs: u64,
    pub outbox_capacity: usize,
    pub push_timeout_secs: u64,
    pub sweep_timeout_secs: u64,
    pub sweep_scope: SweepScope,
    pub seeded_batch_threshold: usize,
    pub seeded_window_secs: u64,
}

impl Default for OpLogConfig {
    fn default() -> Self {
        Self {
            pull_limit: 10_000,
            sweep_interval_secs: 60,
            outbox_capacity: 1_000,
            push_timeout_secs: 5,
            sweep_timeout_secs: 120,
            sweep_scope: SweepScope::Own,
            seeded_batch_threshold: 1_000,
            seeded_window_secs: 3_600,
        }
    }
}

impl OpLogConfig {
    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs.max(1))
    }

    pub fn push_timeout(&self) -> Duration {
        Duration::from_secs(self.push_timeout_secs.max(1))
    }

    pub fn sweep_timeout(&self) -> Duration {
        Duration::from_secs(self.sweep_timeout_secs.max(1))
    }

    pub fn seeded_window(&self) -> Duration {
        Duration::from_secs(self.seeded_window_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RepairConfig {
    pub replication_factor: usize,
    pub interval_secs: u64,
    pub batch_size: usize,
    /// Chance that an eligible tick also runs the over-replication pass.
    pub cleanup_probability: f64,
    pub blob_timeout_secs: u64,
}

impl Default for RepairConfig {
    fn default() -> Self {
        Self {
            replication_factor: 5,
            interval_secs: 60,
            batch_size: 1_000,
            cleanup_probability: 1.0 / 3.0,
            blob_timeout_secs: 300,
        }
    }
}

impl RepairConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs.max(1))
    }

    pub fn blob_timeout(&self) -> Duration {
        Duration::from_secs(self.blob_timeout_secs.max(1))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HealthConfig {
    pub poll_interval_secs: u64,
    pub liveness_window_secs: u64,
    pub timeout_secs: u64,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            poll_interval_secs: 30,
            liveness_window_secs: 120,
            timeout_secs: 5,
        }
    }
}

impl HealthConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs.max(1))
    }

    pub fn liveness_window(&self) -> Duration {
        Duration::from_secs(self.liveness_window_secs)
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs.max(1))
    }
}
