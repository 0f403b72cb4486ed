//! In-process `SharedStore` implementation.
//!
//! Backs tests and single-node deployments. All state lives behind one
//! mutex; expiry is evaluated lazily on access, so no background task
//! is needed.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Instant;

use tokio::sync::mpsc;

use crate::error::{BrokerError, BrokerResult};
use crate::shared::{SetOptions, SharedStore, Subscription};

#[derive(Default)]
struct Inner {
    lists: HashMap<String, VecDeque<String>>,
    values: HashMap<String, Entry>,
    topics: HashMap<String, Vec<mpsc::UnboundedSender<String>>>,
}

struct Entry {
    value: String,
    expires_at: Option<Instant>,
}

impl Entry {
    fn expired(&self) -> bool {
        self.expires_at.is_some_and(|at| Instant::now() >= at)
    }
}

/// Shared in-memory broker. Cheap to clone; clones share state.
#[derive(Clone, Default)]
pub struct MemoryBroker {
    inner: Arc<Mutex<Inner>>,
}

impl MemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    fn locked(&self) -> BrokerResult<std::sync::MutexGuard<'_, Inner>> {
        self.inner
            .lock()
            .map_err(|e| BrokerError::Unavailable(e.to_string()))
    }

    /// Number of items currently queued under a list key (test helper).
    pub fn list_len(&self, key: &str) -> usize {
        self.inner
            .lock()
            .map(|inner| inner.lists.get(key).map_or(0, VecDeque::len))
            .unwrap_or(0)
    }
}

impl SharedStore for MemoryBroker {
    async fn rpush(&self, key: &str, value: String) -> BrokerResult<()> {
        let mut inner = self.locked()?;
        inner.lists.entry(key.to_string()).or_default().push_back(value);
        Ok(())
    }

    async fn lpush(&self, key: &str, value: String) -> BrokerResult<()> {
        let mut inner = self.locked()?;
        inner.lists.entry(key.to_string()).or_default().push_front(value);
        Ok(())
    }

    async fn drain(&self, key: &str) -> BrokerResult<Vec<String>> {
        let mut inner = self.locked()?;
        Ok(inner
            .lists
            .remove(key)
            .map(Vec::from)
            .unwrap_or_default())
    }

    async fn del(&self, key: &str) -> BrokerResult<bool> {
        let mut inner = self.locked()?;
        let had_list = inner.lists.remove(key).is_some();
        let had_value = inner.values.remove(key).is_some();
        Ok(had_list || had_value)
    }

    async fn get(&self, key: &str) -> BrokerResult<Option<String>> {
        let mut inner = self.locked()?;
        if inner.values.get(key).is_some_and(Entry::expired) {
            inner.values.remove(key);
        }
        Ok(inner.values.get(key).map(|entry| entry.value.clone()))
    }

    async fn set(&self, key: &str, value: &str, options: SetOptions) -> BrokerResult<bool> {
        let mut inner = self.locked()?;
        if inner.values.get(key).is_some_and(Entry::expired) {
            inner.values.remove(key);
        }
        if options.if_absent && inner.values.contains_key(key) {
            return Ok(false);
        }
        inner.values.insert(
            key.to_string(),
            Entry {
                value: value.to_string(),
                expires_at: options.ttl.map(|ttl| Instant::now() + ttl),
            },
        );
        Ok(true)
    }

    async fn incr_by(&self, key: &str, delta: i64) -> BrokerResult<i64> {
        let mut inner = self.locked()?;
        if inner.values.get(key).is_some_and(Entry::expired) {
            inner.values.remove(key);
        }
        let (current, expires_at) = match inner.values.get(key) {
            Some(entry) => (
                entry
                    .value
                    .parse::<i64>()
                    .map_err(|e| BrokerError::Serialize(e.to_string()))?,
                entry.expires_at,
            ),
            None => (0, None),
        };
        let next = current + delta;
        inner.values.insert(
            key.to_string(),
            Entry {
                value: next.to_string(),
                expires_at,
            },
        );
        Ok(next)
    }

    async fn publish(&self, topic: &str, payload: String) -> BrokerResult<usize> {
        let mut inner = self.locked()?;
        let Some(senders) = inner.topics.get_mut(topic) else {
            return Ok(0);
        };
        // Drop subscribers whose receiver side is gone.
        senders.retain(|tx| !tx.is_closed());
        let mut delivered = 0;
        for tx in senders.iter() {
            if tx.send(payload.clone()).is_ok() {
                delivered += 1;
            }
        }
        if senders.is_empty() {
            inner.topics.remove(topic);
        }
        Ok(delivered)
    }

    async fn subscribe(&self, topic: &str) -> BrokerResult<Subscription> {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut inner = self.locked()?;
        inner.topics.entry(topic.to_string()).or_default().push(tx);
        Ok(Subscription::new(rx))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn list_push_and_drain_preserve_order() {
        let broker = MemoryBroker::new();
        broker.rpush("q", "a".into()).await.unwrap();
        broker.rpush("q", "b".into()).await.unwrap();
        broker.lpush("q", "front".into()).await.unwrap();

        let items = broker.drain("q").await.unwrap();
        assert_eq!(items, vec!["front", "a", "b"]);
        assert!(broker.drain("q").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn drain_is_exclusive_between_callers() {
        let broker = MemoryBroker::new();
        for i in 0..100 {
            broker.rpush("q", i.to_string()).await.unwrap();
        }

        let a = tokio::spawn({
            let broker = broker.clone();
            async move { broker.drain("q").await.unwrap() }
        });
        let b = tokio::spawn({
            let broker = broker.clone();
            async move { broker.drain("q").await.unwrap() }
        });

        let (a, b) = (a.await.unwrap(), b.await.unwrap());
        // One caller gets everything, the other nothing; never overlap.
        assert_eq!(a.len() + b.len(), 100);
        assert!(a.is_empty() || b.is_empty());
    }

    #[tokio::test]
    async fn set_if_absent_wins_only_once() {
        let broker = MemoryBroker::new();
        assert!(broker.set("k", "1", SetOptions::if_absent()).await.unwrap());
        assert!(!broker.set("k", "2", SetOptions::if_absent()).await.unwrap());
        assert_eq!(broker.get("k").await.unwrap().as_deref(), Some("1"));
    }

    #[tokio::test]
    async fn ttl_expires_value() {
        let broker = MemoryBroker::new();
        broker
            .set("k", "v", SetOptions::ttl(Duration::from_millis(10)))
            .await
            .unwrap();
        assert!(broker.get("k").await.unwrap().is_some());

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(broker.get("k").await.unwrap().is_none());
        // Expired key can be re-acquired with NX.
        assert!(broker.set("k", "2", SetOptions::if_absent()).await.unwrap());
    }

    #[tokio::test]
    async fn incr_by_counts_from_zero() {
        let broker = MemoryBroker::new();
        assert_eq!(broker.incr_by("n", 5).await.unwrap(), 5);
        assert_eq!(broker.incr_by("n", -2).await.unwrap(), 3);
    }

    #[tokio::test]
    async fn publish_counts_live_subscribers() {
        let broker = MemoryBroker::new();
        assert_eq!(broker.publish("t", "x".into()).await.unwrap(), 0);

        let mut sub = broker.subscribe("t").await.unwrap();
        assert_eq!(broker.publish("t", "hello".into()).await.unwrap(), 1);
        assert_eq!(sub.recv().await.as_deref(), Some("hello"));

        drop(sub);
        assert_eq!(broker.publish("t", "y".into()).await.unwrap(), 0);
    }
}
