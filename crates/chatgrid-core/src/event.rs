//! The cluster event vocabulary.
//!
//! A closed enum delivered over a `tokio::sync::broadcast` channel.
//! Hosts embedding a supervisor subscribe to react to pool and lifecycle
//! changes; nothing inside the cluster dispatches on string event names.

/// Everything a supervisor or pool can announce.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClusterEvent {
    /// A worker process was created and registered.
    ProcessCreate { worker_id: String },
    /// A worker process left the pool.
    ProcessRemove { worker_id: String },
    /// The supervisor registered itself and is about to start ticking.
    SupervisorReady { supervisor_id: String },
    /// One supervisor tick completed.
    SupervisorPing,
    /// The supervisor began graceful shutdown.
    SupervisorTerminate { supervisor_id: String },
    /// A worker failed to join a channel.
    JoinError { channel: String, error: String },
    /// A worker failed to part a channel.
    PartError { channel: String, error: String },
    /// A rate budget was exhausted for the rest of its window.
    RateLimited { budget: String },
}
