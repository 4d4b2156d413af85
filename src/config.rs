//! Runtime configuration.
//!
//! Every component reads from a single validated config record with
//! enumerated fields instead of a dynamic options bag. Modeled on
//! `async-raft::config::Config`: a plain struct built with
//! `Config::build(cluster_name)` and validated once at construction.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{RuntimeError, RuntimeResult};

/// Raft and cluster membership timing & sizing knobs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RaftConfig {
    pub cluster_name: String,
    pub election_timeout_min_ms: u64,
    pub election_timeout_max_ms: u64,
    pub heartbeat_interval_ms: u64,
    pub max_log_entries_per_append: usize,
    pub snapshot_threshold: u64,
    pub suspicion_threshold: u32,
    pub quarantine_period: Duration,
    pub pending_change_timeout: Duration,
}

impl Default for RaftConfig {
    fn default() -> Self {
        Self {
            cluster_name: "default".to_string(),
            election_timeout_min_ms: 150,
            election_timeout_max_ms: 300,
            heartbeat_interval_ms: 50,
            max_log_entries_per_append: 10_000,
            snapshot_threshold: 1_000,
            suspicion_threshold: 3,
            quarantine_period: Duration::from_secs(5 * 60),
            pending_change_timeout: Duration::from_secs(30),
        }
    }
}

impl RaftConfig {
    pub fn validate(&self) -> RuntimeResult<()> {
        if self.election_timeout_min_ms >= self.election_timeout_max_ms {
            return Err(RuntimeError::Internal(
                "election_timeout_min_ms must be < election_timeout_max_ms".into(),
            ));
        }
        if self.heartbeat_interval_ms >= self.election_timeout_min_ms {
            return Err(RuntimeError::Internal(
                "heartbeat_interval_ms must be < election_timeout_min_ms".into(),
            ));
        }
        Ok(())
    }

    pub fn election_timeout_range(&self) -> std::ops::Range<u64> {
        self.election_timeout_min_ms..self.election_timeout_max_ms
    }
}

/// Cluster Manager polling & health knobs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClusterConfig {
    pub health_check_interval: Duration,
    pub discovery_interval: Duration,
    pub unhealthy_after_failures: u32,
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            health_check_interval: Duration::from_secs(5),
            discovery_interval: Duration::from_secs(10),
            unhealthy_after_failures: 3,
        }
    }
}

/// Event Store sizing/behavior knobs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventStoreConfig {
    pub partition_count: u32,
    pub snapshot_interval_versions: u64,
    pub auto_snapshot: bool,
    pub compression_enabled: bool,
    pub encryption_enabled: bool,
    pub subscription_queue_capacity: usize,
}

impl Default for EventStoreConfig {
    fn default() -> Self {
        Self {
            partition_count: 16,
            snapshot_interval_versions: 100,
            auto_snapshot: false,
            compression_enabled: true,
            encryption_enabled: false,
            subscription_queue_capacity: 1_000,
        }
    }
}

/// Saga orchestrator knobs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SagaConfig {
    pub max_retries: u32,
    pub retry_base_delay: Duration,
    pub compensation_timeout: Duration,
    pub instance_timeout: Duration,
}

impl Default for SagaConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            retry_base_delay: Duration::from_secs(1),
            compensation_timeout: Duration::from_secs(60),
            instance_timeout: Duration::from_secs(5 * 60),
        }
    }
}

/// Dispatcher knobs, shared between Command and Query dispatchers where applicable.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DispatchConfig {
    pub max_retries: u32,
    pub retry_delay: Duration,
    pub command_timeout: Duration,
    pub query_timeout: Duration,
    pub cache_ttl: Duration,
    pub default_page_size: usize,
    pub max_page_size: usize,
    pub max_concurrent_commands: usize,
    pub slow_query_threshold: Duration,
    pub slow_query_ring_capacity: usize,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            retry_delay: Duration::from_secs(1),
            command_timeout: Duration::from_secs(30),
            query_timeout: Duration::from_secs(30),
            cache_ttl: Duration::from_secs(5 * 60),
            default_page_size: 50,
            max_page_size: 1_000,
            max_concurrent_commands: 1_000,
            slow_query_threshold: Duration::from_secs(1),
            slow_query_ring_capacity: 100,
        }
    }
}

/// Top-level configuration aggregating every component's knobs.
///
/// Constructed via [`RuntimeConfig::build`], which validates cross-field
/// constraints once, the way `async-raft::Config::build` does.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuntimeConfig {
    pub node_id: crate::NodeId,
    pub cluster_id: String,
    pub raft: RaftConfig,
    pub cluster: ClusterConfig,
    pub event_store: EventStoreConfig,
    pub saga: SagaConfig,
    pub dispatch: DispatchConfig,
}

impl RuntimeConfig {
    pub fn build(node_id: crate::NodeId, cluster_id: impl Into<String>) -> RuntimeResult<Self> {
        let cfg = Self {
            node_id,
            cluster_id: cluster_id.into(),
            raft: RaftConfig::default(),
            cluster: ClusterConfig::default(),
            event_store: EventStoreConfig::default(),
            saga: SagaConfig::default(),
            dispatch: DispatchConfig::default(),
        };
        cfg.raft.validate()?;
        Ok(cfg)
    }
}
