//! Supervisor-side handle to one worker task.

use std::time::{Duration, Instant};

use tokio::sync::mpsc;

use chatgrid_state::WorkerId;

/// Control signals the pool sends down a worker's channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerSignal {
    /// Graceful shutdown: re-queue channels, write a final heartbeat,
    /// then exit.
    Terminate,
    /// Exit immediately, skipping cleanup. Sent when a terminating
    /// worker overruns the process timeout.
    Kill,
}

/// Handle held by the pool for one spawned worker.
///
/// The worker's liveness is the liveness of its control channel: when
/// the worker task ends (for any reason) it drops its receiver and the
/// handle reads as gone.
pub struct WorkerProcess {
    id: WorkerId,
    control: mpsc::UnboundedSender<WorkerSignal>,
    terminate_requested: Option<Instant>,
}

impl WorkerProcess {
    pub fn new(id: WorkerId, control: mpsc::UnboundedSender<WorkerSignal>) -> Self {
        Self {
            id,
            control,
            terminate_requested: None,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// The worker task has exited and dropped its receiver.
    pub fn is_gone(&self) -> bool {
        self.control.is_closed()
    }

    /// A graceful termination has been requested and is still pending.
    pub fn terminating(&self) -> bool {
        self.terminate_requested.is_some()
    }

    /// Best-effort signal; a send to a gone worker is a no-op.
    pub fn signal(&self, signal: WorkerSignal) {
        let _ = self.control.send(signal);
    }

    pub(crate) fn request_terminate(&mut self) {
        if self.terminate_requested.is_none() {
            self.terminate_requested = Some(Instant::now());
        }
        self.signal(WorkerSignal::Terminate);
    }

    /// Terminating for longer than `timeout`, eligible for force-kill.
    pub(crate) fn overdue(&self, timeout: Duration) -> bool {
        self.terminate_requested
            .is_some_and(|at| at.elapsed() >= timeout)
    }
}
