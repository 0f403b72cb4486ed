//! The supervisor orchestrator.
//!
//! One `Supervisor` per replica. It registers itself (fatal if that
//! first write fails: a supervisor that cannot register must not run
//! unregistered), brings the pool to the configured minimum, then runs
//! a fixed-interval tick: stale sweep, autoscale, pool monitor, queue
//! execution, and finally its own heartbeat. Graceful shutdown drains
//! the distributor and the pool before deleting the replica's rows.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use tokio::sync::{Mutex, broadcast, mpsc, watch};
use tracing::{info, warn};

use chatgrid_autoscale::{AutoScaler, ScaleCallback};
use chatgrid_broker::SharedStore;
use chatgrid_core::config::DistributionMode;
use chatgrid_core::{ChatClient, ClusterConfig, ClusterEvent, Command, epoch_ms, random_suffix};
use chatgrid_pool::{ProcessPool, SpawnFn, WorkerProcess, WorkerRunner, current_memory_bytes};
use chatgrid_scheduler::{
    ChannelDistributor, Delivery, DistributorResult, PubSubDelivery, QueueDelivery,
};
use chatgrid_state::{
    ClusterStore, SupervisorId, SupervisorMetrics, SupervisorRecord, WorkerRecord,
};

/// Builds one chat client per spawned worker.
pub type ClientFactory<C> = Arc<dyn Fn() -> C + Send + Sync>;

/// Delivery strategy selected at startup from `distribution.mode`.
pub enum AnyDelivery<S: SharedStore> {
    Queue(QueueDelivery<S>),
    PubSub(PubSubDelivery<S>),
}

impl<S: SharedStore> AnyDelivery<S> {
    fn from_config(config: &ClusterConfig, broker: S) -> Self {
        match config.distribution.mode {
            DistributionMode::Queue => Self::Queue(QueueDelivery::new(broker)),
            DistributionMode::PubSub => Self::PubSub(PubSubDelivery::new(broker)),
        }
    }
}

impl<S: SharedStore> Delivery for AnyDelivery<S> {
    async fn deliver(&self, worker_id: &str, command: &Command) -> DistributorResult<bool> {
        match self {
            Self::Queue(delivery) => delivery.deliver(worker_id, command).await,
            Self::PubSub(delivery) => delivery.deliver(worker_id, command).await,
        }
    }
}

pub struct Supervisor<S: SharedStore> {
    id: SupervisorId,
    config: Arc<ClusterConfig>,
    store: ClusterStore,
    distributor: Arc<ChannelDistributor<S, AnyDelivery<S>>>,
    pool: Arc<Mutex<ProcessPool>>,
    autoscaler: AutoScaler,
    events: broadcast::Sender<ClusterEvent>,
    working: AtomicBool,
}

impl<S: SharedStore> Supervisor<S> {
    /// Register a new replica and bring its pool up to the configured
    /// minimum. The initial registration write is fatal on failure.
    pub async fn spawn<C>(
        config: Arc<ClusterConfig>,
        store: ClusterStore,
        broker: S,
        client_factory: ClientFactory<C>,
    ) -> anyhow::Result<Self>
    where
        C: ChatClient + Clone,
    {
        let id = format!(
            "{}-{}",
            host_identifier(),
            random_suffix(config.supervisor.key_length)
        );
        let now = epoch_ms();
        store.put_supervisor(&SupervisorRecord {
            id: id.clone(),
            last_ping_at: now,
            metrics: SupervisorMetrics::default(),
            created_at: now,
        })?;

        let (events, _) = broadcast::channel(256);

        let spawner: SpawnFn = {
            let store = store.clone();
            let broker = broker.clone();
            let config = config.clone();
            let events = events.clone();
            let supervisor_id = id.clone();
            Box::new(move |worker_id| {
                let store = store.clone();
                let broker = broker.clone();
                let config = config.clone();
                let events = events.clone();
                let supervisor_id = supervisor_id.clone();
                let factory = client_factory.clone();
                Box::pin(async move {
                    store.put_worker(&WorkerRecord::starting(
                        worker_id.clone(),
                        supervisor_id,
                        epoch_ms(),
                    ))?;
                    let (control, control_rx) = mpsc::unbounded_channel();
                    let runner = WorkerRunner::new(
                        worker_id.clone(),
                        (factory)(),
                        store,
                        broker,
                        config,
                        events,
                    );
                    tokio::spawn(runner.run(control_rx));
                    Ok(WorkerProcess::new(worker_id, control))
                })
            })
        };
        let pool = Arc::new(Mutex::new(ProcessPool::new(
            config.clone(),
            events.clone(),
            spawner,
        )));

        let scale: ScaleCallback = {
            let pool = pool.clone();
            Box::new(move |target| {
                let pool = pool.clone();
                Box::pin(async move {
                    pool.lock().await.scale(target).await?;
                    Ok(())
                })
            })
        };
        let autoscaler = AutoScaler::new(config.clone(), scale);

        let distributor = Arc::new(ChannelDistributor::new(
            config.clone(),
            store.clone(),
            broker.clone(),
            AnyDelivery::from_config(&config, broker.clone()),
            events.clone(),
        ));

        pool.lock()
            .await
            .scale(config.autoscale.processes.min)
            .await?;

        info!(supervisor = %id, workers = config.autoscale.processes.min, "supervisor ready");
        let _ = events.send(ClusterEvent::SupervisorReady {
            supervisor_id: id.clone(),
        });

        Ok(Self {
            id,
            config,
            store,
            distributor,
            pool,
            autoscaler,
            events,
            working: AtomicBool::new(true),
        })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// Producer handle for enqueueing joins/parts from the host.
    pub fn distributor(&self) -> Arc<ChannelDistributor<S, AnyDelivery<S>>> {
        self.distributor.clone()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ClusterEvent> {
        self.events.subscribe()
    }

    /// Tick until the shutdown signal flips, then terminate.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        let mut timer = tokio::time::interval(Duration::from_millis(
            self.config.supervisor.update_interval_ms,
        ));
        timer.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = timer.tick() => self.tick().await,
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
        self.terminate().await;
    }

    async fn tick(&self) {
        if self.working.load(Ordering::SeqCst) {
            if let Err(error) = self.distributor.release_stale_supervisors(false).await {
                warn!(%error, "stale sweep failed");
            }

            match self
                .store
                .list_open_workers(epoch_ms(), self.config.process.stale_secs)
            {
                Ok(open) => {
                    let channel_count = open.iter().map(|w| w.channels.len()).sum();
                    if let Err(error) = self.autoscaler.tick(open.len(), channel_count).await {
                        warn!(%error, "autoscale failed");
                    }
                }
                Err(error) => warn!(%error, "failed to read placement view"),
            }

            if let Err(error) = self.pool.lock().await.monitor().await {
                warn!(%error, "pool monitor failed");
            }

            if let Err(error) = self.distributor.execute_queue().await {
                warn!(%error, "queue execution failed");
            }
        }

        // Heartbeat runs even while winding down; the row is only
        // deleted once everything has stopped.
        let metrics = SupervisorMetrics {
            memory_bytes: if self.config.metrics.memory {
                current_memory_bytes()
            } else {
                0
            },
        };
        match self.store.touch_supervisor(&self.id, epoch_ms(), &metrics) {
            Ok(true) => {
                let _ = self.events.send(ClusterEvent::SupervisorPing);
            }
            Ok(false) => {
                warn!(supervisor = %self.id, "own row gone, another replica swept this one as stale")
            }
            Err(error) => warn!(%error, "heartbeat failed"),
        }
    }

    /// Graceful shutdown: stop new work, drain the distributor, drain
    /// the pool, then delete this replica's rows.
    pub async fn terminate(&self) {
        self.working.store(false, Ordering::SeqCst);
        info!(supervisor = %self.id, "terminating");
        let _ = self.events.send(ClusterEvent::SupervisorTerminate {
            supervisor_id: self.id.clone(),
        });

        self.distributor.terminate().await;
        self.pool.lock().await.terminate().await;

        if let Err(error) = self.store.delete_workers_for_supervisor(&self.id) {
            warn!(%error, "failed to delete worker rows");
        }
        if let Err(error) = self.store.delete_supervisor(&self.id) {
            warn!(%error, "failed to delete supervisor row");
        }
        info!(supervisor = %self.id, "terminated");
    }
}

/// Host part of a generated supervisor id.
fn host_identifier() -> String {
    std::env::var("HOSTNAME")
        .ok()
        .or_else(|| {
            std::fs::read_to_string("/etc/hostname")
                .ok()
                .map(|s| s.trim().to_string())
        })
        .filter(|s| !s.is_empty())
        .unwrap_or_else(|| "chatgrid".to_string())
}
