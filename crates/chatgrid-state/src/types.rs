//! Domain types for the cluster store.

use serde::{Deserialize, Serialize};

/// Unique identifier for a supervisor replica (`{host}-{suffix}`).
pub type SupervisorId = String;

/// Unique identifier for a worker process.
pub type WorkerId = String;

// ── Supervisor ─────────────────────────────────────────────────────

/// One row per live supervisor replica.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SupervisorRecord {
    pub id: SupervisorId,
    /// Unix timestamp (milliseconds) of the last tick heartbeat.
    pub last_ping_at: u64,
    pub metrics: SupervisorMetrics,
    /// Unix timestamp (milliseconds) when this replica registered.
    pub created_at: u64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct SupervisorMetrics {
    /// Resident memory of the supervisor process, if metrics.memory is on.
    pub memory_bytes: u64,
}

// ── Worker ─────────────────────────────────────────────────────────

/// Lifecycle state a worker reports about itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerState {
    /// Spawned, chat client not yet connected.
    Starting,
    /// Connected and eligible for placement.
    Open,
    /// Shutting down; its channels are up for redistribution.
    Terminated,
}

/// Counters a worker accumulates between heartbeats.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct WorkerMetrics {
    pub messages: u64,
    pub raw_messages: u64,
    pub queue_commands: u64,
    pub memory_bytes: u64,
}

/// One row per worker process, written by the worker itself and read by
/// every supervisor replica for placement decisions.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct WorkerRecord {
    pub id: WorkerId,
    pub supervisor_id: SupervisorId,
    pub state: WorkerState,
    /// Channels currently joined (sanitized, unique).
    pub channels: Vec<String>,
    /// Secondary client usernames hosted on this worker.
    pub clients: Vec<String>,
    pub metrics: WorkerMetrics,
    /// Unix timestamp (milliseconds) of the last worker heartbeat.
    pub last_ping_at: u64,
    pub created_at: u64,
    pub updated_at: u64,
}

impl WorkerRecord {
    /// A fresh row for a just-spawned worker.
    pub fn starting(id: WorkerId, supervisor_id: SupervisorId, now: u64) -> Self {
        Self {
            id,
            supervisor_id,
            state: WorkerState::Starting,
            channels: Vec::new(),
            clients: Vec::new(),
            metrics: WorkerMetrics::default(),
            last_ping_at: now,
            created_at: now,
            updated_at: now,
        }
    }
}

// ── Dedicated clients ──────────────────────────────────────────────

/// A channel registered to run under a specific secondary identity
/// instead of the main client.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ChannelClient {
    /// Channel login, `#` stripped, lowercase.
    pub channel_login: String,
    pub username: String,
    pub password: String,
}
