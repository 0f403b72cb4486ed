//! chatgridd — the ChatGrid supervisor daemon.
//!
//! Library surface for the binary and the integration tests: the
//! [`Supervisor`](supervisor::Supervisor) orchestrator and the loopback
//! chat client used for single-node deployments.

pub mod client;
pub mod supervisor;
