//! Delivery strategies.
//!
//! Once a command is placed on a worker, how it reaches that worker is
//! a deployment choice: appended to the worker's private input queue
//! (durable, drained on the worker's next tick) or published to its
//! per-kind topic (low latency, acknowledged by subscriber count). An
//! unacknowledged delivery is reported as `false`; the distributor
//! re-queues the command at the front of the shared queue.

use std::future::Future;

use tracing::debug;

use chatgrid_broker::{BrokerError, CommandQueue, SharedStore, input_queue};
use chatgrid_core::Command;

use crate::error::DistributorResult;

pub trait Delivery: Send + Sync + 'static {
    /// Hand a placed command to a worker. `false` means the worker did
    /// not (and will not) see it and the caller must re-queue.
    fn deliver(
        &self,
        worker_id: &str,
        command: &Command,
    ) -> impl Future<Output = DistributorResult<bool>> + Send;
}

/// Direct-queue mode: the command is appended to the worker's private
/// input queue. Durable, so the append itself is the acknowledgment.
pub struct QueueDelivery<S: SharedStore> {
    queue: CommandQueue<S>,
}

impl<S: SharedStore> QueueDelivery<S> {
    pub fn new(store: S) -> Self {
        Self {
            queue: CommandQueue::new(store),
        }
    }
}

impl<S: SharedStore> Delivery for QueueDelivery<S> {
    async fn deliver(&self, worker_id: &str, command: &Command) -> DistributorResult<bool> {
        self.queue
            .push_command(&input_queue(worker_id), command)
            .await?;
        Ok(true)
    }
}

/// Topic a command is published on in pub/sub mode.
pub fn command_topic(worker_id: &str, command: &Command) -> String {
    format!("{worker_id}:{}", command.kind.as_str())
}

/// Pub/sub mode: the command is published to the worker's per-kind
/// topic. Zero subscribers means the worker is not listening (crashed,
/// partitioned, or still starting) and the delivery is unacknowledged.
pub struct PubSubDelivery<S: SharedStore> {
    store: S,
}

impl<S: SharedStore> PubSubDelivery<S> {
    pub fn new(store: S) -> Self {
        Self { store }
    }
}

impl<S: SharedStore> Delivery for PubSubDelivery<S> {
    async fn deliver(&self, worker_id: &str, command: &Command) -> DistributorResult<bool> {
        let payload = serde_json::to_string(command)
            .map_err(|e| BrokerError::Serialize(e.to_string()))?;
        let subscribers = self
            .store
            .publish(&command_topic(worker_id, command), payload)
            .await?;
        if subscribers == 0 {
            debug!(worker = %worker_id, kind = command.kind.as_str(), "no subscribers");
        }
        Ok(subscribers > 0)
    }
}
