use thiserror::Error;

#[derive(Debug, Error)]
pub enum PoolError {
    /// The spawn callback failed; already-spawned siblings stay in the
    /// pool and the caller may retry on its next tick.
    #[error("failed to spawn worker {id}: {source}")]
    Spawn {
        id: String,
        #[source]
        source: anyhow::Error,
    },
}

pub type PoolResult<T> = Result<T, PoolError>;
