//! Durable command queues over the shared store.
//!
//! Queues are named lists under `commands:{name}`. One shared
//! distribution queue is drained competitively by supervisor replicas
//! (under the `handle-queue` lock); each worker additionally owns a
//! private input queue it alone consumes.

use tracing::warn;

use chatgrid_core::{Command, CommandKind, CommandOptions};

use crate::error::{BrokerError, BrokerResult};
use crate::shared::SharedStore;

/// Name of the shared distribution queue.
pub const SHARE_QUEUE: &str = "share";

/// Queue for commands not addressed to a specific worker; workers drain
/// it alongside their private queue, which is what makes
/// single-process/no-distribution deployments work.
pub const WILDCARD_QUEUE: &str = "*";

/// Name of a worker's private input queue.
pub fn input_queue(worker_id: &str) -> String {
    format!("{worker_id}-input")
}

/// Typed view of the command lists in the shared store.
#[derive(Clone)]
pub struct CommandQueue<S: SharedStore> {
    store: S,
}

impl<S: SharedStore> CommandQueue<S> {
    pub fn new(store: S) -> Self {
        Self { store }
    }

    fn key(name: &str) -> String {
        format!("commands:{name}")
    }

    /// Append a command to the tail of a queue.
    pub async fn push(
        &self,
        name: &str,
        kind: CommandKind,
        options: CommandOptions,
    ) -> BrokerResult<()> {
        let payload = encode(&Command::new(kind, options))?;
        self.store.rpush(&Self::key(name), payload).await
    }

    /// Prepend a command, used for priority re-delivery and failure
    /// re-queue.
    pub async fn unshift(
        &self,
        name: &str,
        kind: CommandKind,
        options: CommandOptions,
    ) -> BrokerResult<()> {
        let payload = encode(&Command::new(kind, options))?;
        self.store.lpush(&Self::key(name), payload).await
    }

    /// Re-insert an existing command at the front, keeping its original
    /// timestamp.
    pub async fn unshift_command(&self, name: &str, command: &Command) -> BrokerResult<()> {
        let payload = encode(command)?;
        self.store.lpush(&Self::key(name), payload).await
    }

    /// Append an existing command, keeping its original timestamp. Used
    /// when forwarding a drained command to another queue.
    pub async fn push_command(&self, name: &str, command: &Command) -> BrokerResult<()> {
        let payload = encode(command)?;
        self.store.rpush(&Self::key(name), payload).await
    }

    /// Atomically remove and return all queued commands, in order.
    ///
    /// Malformed entries are logged and dropped; they are never retried.
    pub async fn pending(&self, name: &str) -> BrokerResult<Vec<Command>> {
        let raw = self.store.drain(&Self::key(name)).await?;
        let mut commands = Vec::with_capacity(raw.len());
        for entry in raw {
            match serde_json::from_str::<Command>(&entry) {
                Ok(command) => commands.push(command),
                Err(error) => warn!(queue = name, %error, "dropping malformed queued command"),
            }
        }
        Ok(commands)
    }

    /// Discard everything queued under a name.
    pub async fn flush(&self, name: &str) -> BrokerResult<()> {
        self.store.del(&Self::key(name)).await?;
        Ok(())
    }
}

fn encode(command: &Command) -> BrokerResult<String> {
    serde_json::to_string(command).map_err(|e| BrokerError::Serialize(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryBroker;
    use crate::shared::SharedStore;

    fn queue() -> (CommandQueue<MemoryBroker>, MemoryBroker) {
        let broker = MemoryBroker::new();
        (CommandQueue::new(broker.clone()), broker)
    }

    #[tokio::test]
    async fn push_then_pending_in_order() {
        let (queue, _) = queue();
        queue
            .push(SHARE_QUEUE, CommandKind::Join, CommandOptions::channel("#a"))
            .await
            .unwrap();
        queue
            .push(SHARE_QUEUE, CommandKind::Part, CommandOptions::channel("#b"))
            .await
            .unwrap();

        let commands = queue.pending(SHARE_QUEUE).await.unwrap();
        assert_eq!(commands.len(), 2);
        assert_eq!(commands[0].kind, CommandKind::Join);
        assert_eq!(commands[1].kind, CommandKind::Part);

        // Drained: second caller sees nothing.
        assert!(queue.pending(SHARE_QUEUE).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn unshift_goes_to_front() {
        let (queue, _) = queue();
        queue
            .push(SHARE_QUEUE, CommandKind::Join, CommandOptions::channel("#late"))
            .await
            .unwrap();
        queue
            .unshift(SHARE_QUEUE, CommandKind::Join, CommandOptions::channel("#first"))
            .await
            .unwrap();

        let commands = queue.pending(SHARE_QUEUE).await.unwrap();
        assert_eq!(commands[0].options.channel.as_deref(), Some("#first"));
    }

    #[tokio::test]
    async fn malformed_entries_are_dropped() {
        let (queue, broker) = queue();
        broker
            .rpush("commands:share", "not-json".into())
            .await
            .unwrap();
        queue
            .push(SHARE_QUEUE, CommandKind::Join, CommandOptions::channel("#ok"))
            .await
            .unwrap();

        let commands = queue.pending(SHARE_QUEUE).await.unwrap();
        assert_eq!(commands.len(), 1);
        assert_eq!(commands[0].options.channel.as_deref(), Some("#ok"));
    }

    #[tokio::test]
    async fn queues_are_independent() {
        let (queue, _) = queue();
        queue
            .push(&input_queue("w1"), CommandKind::Join, CommandOptions::channel("#a"))
            .await
            .unwrap();
        queue
            .push(WILDCARD_QUEUE, CommandKind::Join, CommandOptions::channel("#b"))
            .await
            .unwrap();

        assert_eq!(queue.pending(&input_queue("w1")).await.unwrap().len(), 1);
        assert_eq!(queue.pending(WILDCARD_QUEUE).await.unwrap().len(), 1);
        assert!(queue.pending(SHARE_QUEUE).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn flush_clears_queue() {
        let (queue, _) = queue();
        queue
            .push(SHARE_QUEUE, CommandKind::Join, CommandOptions::channel("#a"))
            .await
            .unwrap();
        queue.flush(SHARE_QUEUE).await.unwrap();
        assert!(queue.pending(SHARE_QUEUE).await.unwrap().is_empty());
    }
}
