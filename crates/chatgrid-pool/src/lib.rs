//! chatgrid-pool — worker process pool and the worker-side runner.
//!
//! The [`ProcessPool`] lives in the supervisor and owns one
//! [`WorkerProcess`] handle per worker task it has spawned. Scaling is
//! cooperative: scale-down asks workers to terminate and waits for them
//! to disappear, with a force-kill bound for workers that hang. The
//! [`WorkerRunner`] is the other side of the handle: it drives a
//! [`ChatClient`](chatgrid_core::ChatClient), drains command queues, and
//! heartbeats its row in the cluster store.

mod error;
mod pool;
mod process;
mod worker;

pub use error::{PoolError, PoolResult};
pub use pool::{ProcessPool, SpawnFn, SpawnFuture};
pub use process::{WorkerProcess, WorkerSignal};
pub use worker::{WorkerRunner, current_memory_bytes};
