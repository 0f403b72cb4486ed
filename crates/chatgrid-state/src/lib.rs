//! chatgrid-state — embedded bookkeeping store for ChatGrid.
//!
//! Backed by [redb](https://docs.rs/redb). Holds the durable rows the
//! cluster coordinates over: one `SupervisorRecord` per supervisor
//! replica, one `WorkerRecord` per worker process, and the
//! `ChannelClient` registrations used for dedicated-client routing.
//!
//! Rows are JSON-serialized into redb's `&[u8]` value columns. Worker
//! rows are single-writer (the worker itself heartbeats them) but read
//! by every supervisor replica for placement; supervisor rows are
//! single-writer per row. The `ClusterStore` is `Clone + Send + Sync`
//! (an `Arc<Database>` inside) and can be shared across tasks.

pub mod error;
pub mod store;
pub mod tables;
pub mod types;

pub use error::{StateError, StateResult};
pub use store::ClusterStore;
pub use types::*;
