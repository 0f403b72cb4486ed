//! The shared-store capability boundary.
//!
//! Everything the cluster asks of its shared store fits in this trait:
//! ordered lists for queues, get/set with set-if-absent and TTL for
//! locks and rate windows, atomic counters, and publish/subscribe for
//! the low-latency delivery path. A Redis deployment satisfies it
//! directly; [`crate::MemoryBroker`] satisfies it in-process.

use std::future::Future;
use std::time::Duration;

use tokio::sync::mpsc;

use crate::error::BrokerResult;

/// Options for [`SharedStore::set`] (the NX / PX subset).
#[derive(Debug, Clone, Copy, Default)]
pub struct SetOptions {
    /// Only set if the key does not exist (NX).
    pub if_absent: bool,
    /// Expire the key after this long (PX).
    pub ttl: Option<Duration>,
}

impl SetOptions {
    pub fn if_absent() -> Self {
        Self {
            if_absent: true,
            ttl: None,
        }
    }

    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = Some(ttl);
        self
    }

    pub fn ttl(ttl: Duration) -> Self {
        Self {
            if_absent: false,
            ttl: Some(ttl),
        }
    }
}

/// A live subscription to a pub/sub topic.
pub struct Subscription {
    rx: mpsc::UnboundedReceiver<String>,
}

impl Subscription {
    pub fn new(rx: mpsc::UnboundedReceiver<String>) -> Self {
        Self { rx }
    }

    /// Next published payload; `None` once the topic is torn down.
    pub async fn recv(&mut self) -> Option<String> {
        self.rx.recv().await
    }

    /// Non-blocking variant for poll loops.
    pub fn try_recv(&mut self) -> Option<String> {
        self.rx.try_recv().ok()
    }
}

/// The shared-store capability set.
///
/// All operations are atomic with respect to each other; in particular
/// [`drain`](SharedStore::drain) removes and returns the whole list in
/// one step so two concurrent drainers never observe overlapping items.
pub trait SharedStore: Clone + Send + Sync + 'static {
    /// Append to the tail of a list.
    fn rpush(&self, key: &str, value: String) -> impl Future<Output = BrokerResult<()>> + Send;

    /// Prepend to the head of a list (priority re-insert).
    fn lpush(&self, key: &str, value: String) -> impl Future<Output = BrokerResult<()>> + Send;

    /// Atomically remove and return the entire list, in order.
    fn drain(&self, key: &str) -> impl Future<Output = BrokerResult<Vec<String>>> + Send;

    /// Delete a key (list or value). Returns true if it existed.
    fn del(&self, key: &str) -> impl Future<Output = BrokerResult<bool>> + Send;

    /// Get a value, honoring expiry.
    fn get(&self, key: &str) -> impl Future<Output = BrokerResult<Option<String>>> + Send;

    /// Set a value. Returns false iff `if_absent` was requested and the
    /// key already existed.
    fn set(
        &self,
        key: &str,
        value: &str,
        options: SetOptions,
    ) -> impl Future<Output = BrokerResult<bool>> + Send;

    /// Atomically add `delta` to an integer value (missing keys count
    /// as zero). Returns the new value.
    fn incr_by(&self, key: &str, delta: i64) -> impl Future<Output = BrokerResult<i64>> + Send;

    /// Publish to a topic. Returns the number of live subscribers that
    /// received the payload.
    fn publish(&self, topic: &str, payload: String)
    -> impl Future<Output = BrokerResult<usize>> + Send;

    /// Subscribe to a topic.
    fn subscribe(&self, topic: &str) -> impl Future<Output = BrokerResult<Subscription>> + Send;
}
