//! ClusterStore — redb-backed persistence for supervisor and worker rows.

use std::path::Path;
use std::sync::Arc;

use redb::{Database, ReadableDatabase, ReadableTable};
use tracing::debug;

use crate::error::{StateError, StateResult};
use crate::tables::*;
use crate::types::*;

/// Convert any `Display` error into a `StateError` variant via a closure factory.
macro_rules! map_err {
    ($variant:ident) => {
        |e| StateError::$variant(e.to_string())
    };
}

/// Thread-safe cluster store backed by redb.
#[derive(Clone)]
pub struct ClusterStore {
    db: Arc<Database>,
}

impl ClusterStore {
    /// Open (or create) a persistent store at the given path.
    pub fn open(path: &Path) -> StateResult<Self> {
        let db = Database::create(path).map_err(map_err!(Open))?;
        let store = Self { db: Arc::new(db) };
        store.ensure_tables()?;
        debug!(?path, "cluster store opened");
        Ok(store)
    }

    /// Create an ephemeral in-memory store (for testing).
    pub fn open_in_memory() -> StateResult<Self> {
        let backend = redb::backends::InMemoryBackend::new();
        let db = Database::builder()
            .create_with_backend(backend)
            .map_err(map_err!(Open))?;
        let store = Self { db: Arc::new(db) };
        store.ensure_tables()?;
        debug!("in-memory cluster store opened");
        Ok(store)
    }

    /// Create all tables if they don't exist yet.
    fn ensure_tables(&self) -> StateResult<()> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        // Opening a table in a write transaction creates it if absent.
        txn.open_table(SUPERVISORS).map_err(map_err!(Table))?;
        txn.open_table(WORKERS).map_err(map_err!(Table))?;
        txn.open_table(CHANNEL_CLIENTS).map_err(map_err!(Table))?;
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(())
    }

    // ── Supervisors ────────────────────────────────────────────────

    /// Insert or update a supervisor row.
    pub fn put_supervisor(&self, record: &SupervisorRecord) -> StateResult<()> {
        let value = serde_json::to_vec(record).map_err(map_err!(Serialize))?;
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        {
            let mut table = txn.open_table(SUPERVISORS).map_err(map_err!(Table))?;
            table
                .insert(record.id.as_str(), value.as_slice())
                .map_err(map_err!(Write))?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        debug!(id = %record.id, "supervisor stored");
        Ok(())
    }

    /// Get a supervisor row by id.
    pub fn get_supervisor(&self, id: &str) -> StateResult<Option<SupervisorRecord>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(SUPERVISORS).map_err(map_err!(Table))?;
        match table.get(id).map_err(map_err!(Read))? {
            Some(guard) => {
                let record: SupervisorRecord =
                    serde_json::from_slice(guard.value()).map_err(map_err!(Deserialize))?;
                Ok(Some(record))
            }
            None => Ok(None),
        }
    }

    /// List all supervisor rows.
    pub fn list_supervisors(&self) -> StateResult<Vec<SupervisorRecord>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(SUPERVISORS).map_err(map_err!(Table))?;
        let mut results = Vec::new();
        for entry in table.iter().map_err(map_err!(Read))? {
            let (_, value) = entry.map_err(map_err!(Read))?;
            let record: SupervisorRecord =
                serde_json::from_slice(value.value()).map_err(map_err!(Deserialize))?;
            results.push(record);
        }
        Ok(results)
    }

    /// Update a supervisor's heartbeat and metrics. Returns false if the
    /// row is gone (a replica swept it as stale).
    pub fn touch_supervisor(
        &self,
        id: &str,
        now: u64,
        metrics: &SupervisorMetrics,
    ) -> StateResult<bool> {
        let mut record = match self.get_supervisor(id)? {
            Some(r) => r,
            None => return Ok(false),
        };
        record.last_ping_at = now;
        record.metrics = metrics.clone();
        self.put_supervisor(&record)?;
        Ok(true)
    }

    /// Delete a supervisor row by id. Returns true if it existed.
    pub fn delete_supervisor(&self, id: &str) -> StateResult<bool> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let existed;
        {
            let mut table = txn.open_table(SUPERVISORS).map_err(map_err!(Table))?;
            existed = table.remove(id).map_err(map_err!(Write))?.is_some();
        }
        txn.commit().map_err(map_err!(Transaction))?;
        debug!(%id, existed, "supervisor deleted");
        Ok(existed)
    }

    // ── Workers ────────────────────────────────────────────────────

    /// Insert or update a worker row.
    pub fn put_worker(&self, record: &WorkerRecord) -> StateResult<()> {
        let value = serde_json::to_vec(record).map_err(map_err!(Serialize))?;
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        {
            let mut table = txn.open_table(WORKERS).map_err(map_err!(Table))?;
            table
                .insert(record.id.as_str(), value.as_slice())
                .map_err(map_err!(Write))?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(())
    }

    /// Get a worker row by id.
    pub fn get_worker(&self, id: &str) -> StateResult<Option<WorkerRecord>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(WORKERS).map_err(map_err!(Table))?;
        match table.get(id).map_err(map_err!(Read))? {
            Some(guard) => {
                let record: WorkerRecord =
                    serde_json::from_slice(guard.value()).map_err(map_err!(Deserialize))?;
                Ok(Some(record))
            }
            None => Ok(None),
        }
    }

    /// List all worker rows.
    pub fn list_workers(&self) -> StateResult<Vec<WorkerRecord>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(WORKERS).map_err(map_err!(Table))?;
        let mut results = Vec::new();
        for entry in table.iter().map_err(map_err!(Read))? {
            let (_, value) = entry.map_err(map_err!(Read))?;
            let record: WorkerRecord =
                serde_json::from_slice(value.value()).map_err(map_err!(Deserialize))?;
            results.push(record);
        }
        Ok(results)
    }

    /// The live placement view: workers in `Open` state whose heartbeat
    /// is within `stale_secs` of `now`.
    pub fn list_open_workers(&self, now: u64, stale_secs: u64) -> StateResult<Vec<WorkerRecord>> {
        let cutoff = now.saturating_sub(stale_secs * 1_000);
        let workers = self.list_workers()?;
        Ok(workers
            .into_iter()
            .filter(|w| w.state == WorkerState::Open && w.last_ping_at > cutoff)
            .collect())
    }

    /// Worker-side heartbeat: state, channel/client sets, metrics, ping.
    /// Returns false if the row is gone (swept as stale).
    pub fn heartbeat_worker(
        &self,
        id: &str,
        state: WorkerState,
        channels: Vec<String>,
        clients: Vec<String>,
        metrics: &WorkerMetrics,
        now: u64,
    ) -> StateResult<bool> {
        let mut record = match self.get_worker(id)? {
            Some(r) => r,
            None => return Ok(false),
        };
        record.state = state;
        record.channels = channels;
        record.clients = clients;
        record.metrics = metrics.clone();
        record.last_ping_at = now;
        record.updated_at = now;
        self.put_worker(&record)?;
        Ok(true)
    }

    /// Delete a worker row by id. Returns true if it existed.
    pub fn delete_worker(&self, id: &str) -> StateResult<bool> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let existed;
        {
            let mut table = txn.open_table(WORKERS).map_err(map_err!(Table))?;
            existed = table.remove(id).map_err(map_err!(Write))?.is_some();
        }
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(existed)
    }

    /// Delete all worker rows owned by a supervisor. Returns number deleted.
    pub fn delete_workers_for_supervisor(&self, supervisor_id: &str) -> StateResult<u32> {
        let ids: Vec<WorkerId> = self
            .list_workers()?
            .into_iter()
            .filter(|w| w.supervisor_id == supervisor_id)
            .map(|w| w.id)
            .collect();
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let count = ids.len() as u32;
        {
            let mut table = txn.open_table(WORKERS).map_err(map_err!(Table))?;
            for id in &ids {
                table.remove(id.as_str()).map_err(map_err!(Write))?;
            }
        }
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(count)
    }

    // ── Channel clients ────────────────────────────────────────────

    /// Register (or update) a dedicated client for a channel.
    pub fn put_channel_client(&self, client: &ChannelClient) -> StateResult<()> {
        let value = serde_json::to_vec(client).map_err(map_err!(Serialize))?;
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        {
            let mut table = txn.open_table(CHANNEL_CLIENTS).map_err(map_err!(Table))?;
            table
                .insert(client.channel_login.as_str(), value.as_slice())
                .map_err(map_err!(Write))?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(())
    }

    /// Look up registrations for a set of channel logins. Logins with no
    /// registration are simply absent from the result.
    pub fn channel_clients_for(&self, logins: &[String]) -> StateResult<Vec<ChannelClient>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(CHANNEL_CLIENTS).map_err(map_err!(Table))?;
        let mut results = Vec::new();
        for login in logins {
            if let Some(guard) = table.get(login.as_str()).map_err(map_err!(Read))? {
                let client: ChannelClient =
                    serde_json::from_slice(guard.value()).map_err(map_err!(Deserialize))?;
                results.push(client);
            }
        }
        Ok(results)
    }

    /// Remove every registration pointing at a username. Returns the
    /// number removed.
    pub fn delete_channel_clients_for(&self, username: &str) -> StateResult<u32> {
        let logins: Vec<String> = {
            let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
            let table = txn.open_table(CHANNEL_CLIENTS).map_err(map_err!(Table))?;
            let mut logins = Vec::new();
            for entry in table.iter().map_err(map_err!(Read))? {
                let (key, value) = entry.map_err(map_err!(Read))?;
                let client: ChannelClient =
                    serde_json::from_slice(value.value()).map_err(map_err!(Deserialize))?;
                if client.username == username {
                    logins.push(key.value().to_string());
                }
            }
            logins
        };
        let count = logins.len() as u32;
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        {
            let mut table = txn.open_table(CHANNEL_CLIENTS).map_err(map_err!(Table))?;
            for login in &logins {
                table.remove(login.as_str()).map_err(map_err!(Write))?;
            }
        }
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(count)
    }

    /// Remove a dedicated-client registration. Returns true if it existed.
    pub fn delete_channel_client(&self, login: &str) -> StateResult<bool> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let existed;
        {
            let mut table = txn.open_table(CHANNEL_CLIENTS).map_err(map_err!(Table))?;
            existed = table.remove(login).map_err(map_err!(Write))?.is_some();
        }
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(existed)
    }
}
