//! chatgrid-broker — coordination primitives over a shared store.
//!
//! Supervisor replicas cooperate through a small capability set
//! (ordered lists, get/set with NX/PX, publish/subscribe, atomic
//! counters) modeled by the [`SharedStore`] trait. On top of it sit the
//! three primitives the scheduler needs:
//!
//! - [`CommandQueue`] — durable, ordered, multi-named FIFO with an
//!   atomic drain
//! - [`DistributedLock`] — lease-based mutual exclusion, TTL as the
//!   crash-recovery mechanism
//! - [`RateLimiter`] — bounded-points throttle, process-local or
//!   fleet-wide
//!
//! [`MemoryBroker`] implements `SharedStore` in-process for tests and
//! single-node deployments.

pub mod error;
pub mod lock;
pub mod memory;
pub mod queue;
pub mod rate;
pub mod shared;

pub use error::{BrokerError, BrokerResult};

/// Flag key a worker sets when it terminates on purpose. The stale
/// sweep consumes it and redistributes right away instead of waiting
/// out the stale window.
pub const PROCESS_STALED_KEY: &str = "process-staled";
pub use lock::DistributedLock;
pub use memory::MemoryBroker;
pub use queue::{CommandQueue, SHARE_QUEUE, WILDCARD_QUEUE, input_queue};
pub use rate::{LocalRateLimiter, RateLimiter, SharedRateLimiter};
pub use shared::{SetOptions, SharedStore, Subscription};
