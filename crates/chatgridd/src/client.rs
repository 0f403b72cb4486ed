//! Loopback chat client.
//!
//! Always-open client that tracks joins in memory without speaking any
//! protocol. Serves single-node deployments where the cluster machinery
//! runs without a real chat backend, and the integration tests.

use std::sync::{Arc, Mutex, PoisonError};

use chatgrid_core::{ChatClient, ClientEvent, ReadyState};

#[derive(Default)]
struct Inner {
    channels: Vec<String>,
    events: Vec<ClientEvent>,
}

#[derive(Clone, Default)]
pub struct LoopbackClient {
    inner: Arc<Mutex<Inner>>,
}

impl LoopbackClient {
    pub fn new() -> Self {
        let client = Self::default();
        client.locked().events.push(ClientEvent::Connected);
        client
    }

    fn locked(&self) -> std::sync::MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl ChatClient for LoopbackClient {
    async fn join(&self, channel: &str) -> anyhow::Result<()> {
        let mut inner = self.locked();
        if !inner.channels.iter().any(|c| c == channel) {
            inner.channels.push(channel.to_string());
        }
        Ok(())
    }

    async fn part(&self, channel: &str) -> anyhow::Result<()> {
        self.locked().channels.retain(|c| c != channel);
        Ok(())
    }

    fn channels(&self) -> Vec<String> {
        self.locked().channels.clone()
    }

    fn ready_state(&self) -> ReadyState {
        ReadyState::Open
    }

    fn drain_events(&self) -> Vec<ClientEvent> {
        std::mem::take(&mut self.locked().events)
    }
}
