//! chatgrid-scheduler — the channel distributor.
//!
//! Supervisor replicas compete to drain the shared command queue and
//! place each action on a live worker. Placement is least-loaded over
//! the persisted worker rows, throttled by fleet-wide rate budgets, and
//! serialized across replicas by the `handle-queue` lease. Stale
//! reconciliation sweeps dead workers and supervisors and re-queues
//! their channels so nothing is lost permanently.

mod delivery;
mod distributor;
mod error;
mod placement;

pub use delivery::{Delivery, PubSubDelivery, QueueDelivery};
pub use distributor::{ChannelDistributor, HANDLE_QUEUE_LOCK, RELEASE_SUPERVISORS_LOCK};
pub use error::{DistributorError, DistributorResult};
pub use placement::WorkerView;
