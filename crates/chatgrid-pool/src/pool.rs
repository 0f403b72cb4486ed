//! The supervisor-side worker pool.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use chatgrid_core::{ClusterConfig, ClusterEvent, random_suffix};
use chatgrid_state::WorkerId;

use crate::error::{PoolError, PoolResult};
use crate::process::{WorkerProcess, WorkerSignal};

pub type SpawnFuture = Pin<Box<dyn Future<Output = anyhow::Result<WorkerProcess>> + Send>>;

/// Callback that brings one worker to life: registers its row, spawns
/// its task, and returns the handle. Provided by the host so the pool
/// stays ignorant of the chat client and store wiring.
pub type SpawnFn = Box<dyn Fn(WorkerId) -> SpawnFuture + Send + Sync>;

/// Owns the worker handles of one supervisor replica.
///
/// All methods take `&mut self`; the pool is driven from the single
/// supervisor tick task and needs no interior locking.
pub struct ProcessPool {
    config: Arc<ClusterConfig>,
    spawner: SpawnFn,
    events: broadcast::Sender<ClusterEvent>,
    workers: Vec<WorkerProcess>,
    /// Last target requested through [`scale`](Self::scale); `monitor`
    /// re-applies it after reaping crashed workers.
    requested: usize,
    monitoring: bool,
}

impl ProcessPool {
    pub fn new(
        config: Arc<ClusterConfig>,
        events: broadcast::Sender<ClusterEvent>,
        spawner: SpawnFn,
    ) -> Self {
        Self {
            config,
            spawner,
            events,
            workers: Vec::new(),
            requested: 0,
            monitoring: false,
        }
    }

    pub fn len(&self) -> usize {
        self.workers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.workers.is_empty()
    }

    pub fn worker_ids(&self) -> Vec<WorkerId> {
        self.workers.iter().map(|w| w.id().to_string()).collect()
    }

    /// Workers that are neither gone nor winding down.
    fn active(&self) -> usize {
        self.workers
            .iter()
            .filter(|w| !w.is_gone() && !w.terminating())
            .count()
    }

    /// Bring the pool to `target` workers. Scale-up spawns sequentially
    /// and fails fast; scale-down asks the excess to terminate and waits
    /// for them to leave (with the force-kill bound applied while
    /// waiting).
    pub async fn scale(&mut self, target: usize) -> PoolResult<()> {
        self.requested = target;
        let active = self.active();
        if target > active {
            self.scale_up(target - active).await
        } else if target < active {
            self.scale_down(active - target).await;
            Ok(())
        } else {
            Ok(())
        }
    }

    async fn scale_up(&mut self, count: usize) -> PoolResult<()> {
        for _ in 0..count {
            let id = format!(
                "worker-{}",
                random_suffix(self.config.supervisor.key_length)
            );
            let worker = (self.spawner)(id.clone())
                .await
                .map_err(|source| PoolError::Spawn {
                    id: id.clone(),
                    source,
                })?;
            info!(worker = %id, "worker spawned");
            self.workers.push(worker);
            self.emit(ClusterEvent::ProcessCreate { worker_id: id });
        }
        Ok(())
    }

    async fn scale_down(&mut self, count: usize) {
        let victims: Vec<WorkerId> = self
            .workers
            .iter_mut()
            .filter(|w| !w.terminating())
            .take(count)
            .map(|w| {
                w.request_terminate();
                w.id().to_string()
            })
            .collect();
        info!(count = victims.len(), "scaling down");

        let poll = Duration::from_millis(self.config.process.scale_poll_ms);
        loop {
            self.reap();
            let remaining = self
                .workers
                .iter()
                .filter(|w| victims.iter().any(|v| v == w.id()))
                .count();
            if remaining == 0 {
                break;
            }
            self.force_kill_overdue();
            tokio::time::sleep(poll).await;
        }
    }

    /// Periodic supervision: drop handles of exited workers, force-kill
    /// terminations that overran the process timeout, and re-apply the
    /// requested worker count. Re-entrant calls are ignored.
    pub async fn monitor(&mut self) -> PoolResult<()> {
        if self.monitoring {
            return Ok(());
        }
        self.monitoring = true;

        self.reap();
        self.force_kill_overdue();
        let result = if self.active() != self.requested {
            debug!(
                active = self.active(),
                requested = self.requested,
                "pool drifted from requested size"
            );
            let target = self.requested;
            self.scale(target).await
        } else {
            Ok(())
        };

        self.monitoring = false;
        result
    }

    /// Gracefully drain the whole pool, force-killing stragglers.
    pub async fn terminate(&mut self) {
        self.requested = 0;
        for worker in &mut self.workers {
            worker.request_terminate();
        }

        let poll = Duration::from_millis(self.config.process.terminate_poll_ms);
        loop {
            self.reap();
            if self.workers.is_empty() {
                break;
            }
            self.force_kill_overdue();
            tokio::time::sleep(poll).await;
        }
    }

    /// Drop handles whose worker task has exited.
    fn reap(&mut self) {
        let mut removed = Vec::new();
        self.workers.retain(|w| {
            if w.is_gone() {
                removed.push(w.id().to_string());
                false
            } else {
                true
            }
        });
        for worker_id in removed {
            info!(worker = %worker_id, "worker left the pool");
            self.emit(ClusterEvent::ProcessRemove { worker_id });
        }
    }

    fn force_kill_overdue(&mut self) {
        let timeout = Duration::from_millis(self.config.process.timeout_ms);
        for worker in self.workers.iter().filter(|w| w.overdue(timeout)) {
            warn!(worker = %worker.id(), "worker overran termination timeout, killing");
            worker.signal(WorkerSignal::Kill);
        }
    }

    fn emit(&self, event: ClusterEvent) {
        // No subscribers is fine.
        let _ = self.events.send(event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc;

    #[derive(Clone, Copy)]
    enum Temper {
        /// Exits on Terminate.
        Obedient,
        /// Ignores Terminate, exits only on Kill.
        Stubborn,
        /// Task dies right away, simulating a crash.
        Crashing,
    }

    fn spawner(temper: Temper) -> SpawnFn {
        Box::new(move |id| {
            Box::pin(async move {
                let (tx, mut rx) = mpsc::unbounded_channel();
                tokio::spawn(async move {
                    if matches!(temper, Temper::Crashing) {
                        return;
                    }
                    while let Some(signal) = rx.recv().await {
                        match (signal, temper) {
                            (WorkerSignal::Kill, _) => return,
                            (WorkerSignal::Terminate, Temper::Obedient) => return,
                            (WorkerSignal::Terminate, _) => {}
                        }
                    }
                });
                Ok(WorkerProcess::new(id, tx))
            })
        })
    }

    fn fast_config() -> Arc<ClusterConfig> {
        let mut config = ClusterConfig::default();
        config.process.scale_poll_ms = 10;
        config.process.terminate_poll_ms = 10;
        config.process.timeout_ms = 50;
        Arc::new(config)
    }

    fn pool(temper: Temper) -> (ProcessPool, broadcast::Receiver<ClusterEvent>) {
        let (tx, rx) = broadcast::channel(64);
        (ProcessPool::new(fast_config(), tx, spawner(temper)), rx)
    }

    #[tokio::test]
    async fn scale_up_spawns_requested_count() {
        let (mut pool, mut events) = pool(Temper::Obedient);
        pool.scale(3).await.unwrap();
        assert_eq!(pool.len(), 3);

        for _ in 0..3 {
            assert!(matches!(
                events.try_recv().unwrap(),
                ClusterEvent::ProcessCreate { .. }
            ));
        }
    }

    #[tokio::test]
    async fn scale_down_waits_for_workers_to_leave() {
        let (mut pool, mut events) = pool(Temper::Obedient);
        pool.scale(3).await.unwrap();
        pool.scale(1).await.unwrap();
        assert_eq!(pool.len(), 1);

        let removes = std::iter::from_fn(|| events.try_recv().ok())
            .filter(|e| matches!(e, ClusterEvent::ProcessRemove { .. }))
            .count();
        assert_eq!(removes, 2);
    }

    #[tokio::test]
    async fn stubborn_worker_is_force_killed() {
        let (mut pool, _events) = pool(Temper::Stubborn);
        pool.scale(2).await.unwrap();

        // Completes only because the overdue workers get killed.
        tokio::time::timeout(Duration::from_secs(5), pool.scale(0))
            .await
            .expect("scale-down should force-kill within the timeout")
            .unwrap();
        assert!(pool.is_empty());
    }

    #[tokio::test]
    async fn monitor_respawns_crashed_workers() {
        let (mut pool, mut events) = pool(Temper::Crashing);
        pool.scale(2).await.unwrap();

        // Let the crashing tasks exit.
        tokio::time::sleep(Duration::from_millis(20)).await;
        pool.monitor().await.unwrap();

        // Crashed handles were reaped and replacements spawned.
        assert_eq!(pool.len(), 2);
        let removes = std::iter::from_fn(|| events.try_recv().ok())
            .filter(|e| matches!(e, ClusterEvent::ProcessRemove { .. }))
            .count();
        assert_eq!(removes, 2);
    }

    #[tokio::test]
    async fn spawn_failure_surfaces_and_keeps_siblings() {
        let calls = Arc::new(std::sync::atomic::AtomicUsize::new(0));
        let calls_in_spawner = calls.clone();
        let spawner: SpawnFn = Box::new(move |id| {
            let n = calls_in_spawner.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
            Box::pin(async move {
                if n == 1 {
                    anyhow::bail!("out of capacity");
                }
                let (tx, mut rx) = mpsc::unbounded_channel();
                tokio::spawn(async move {
                    while let Some(signal) = rx.recv().await {
                        if signal == WorkerSignal::Kill {
                            break;
                        }
                    }
                });
                Ok(WorkerProcess::new(id, tx))
            })
        });
        let (tx, _rx) = broadcast::channel(16);
        let mut pool = ProcessPool::new(fast_config(), tx, spawner);

        let err = pool.scale(3).await.unwrap_err();
        assert!(matches!(err, PoolError::Spawn { .. }));
        // The first spawn survived the second one failing.
        assert_eq!(pool.len(), 1);
    }

    #[tokio::test]
    async fn terminate_drains_everything() {
        let (mut pool, _events) = pool(Temper::Obedient);
        pool.scale(4).await.unwrap();
        pool.terminate().await;
        assert!(pool.is_empty());
    }
}
