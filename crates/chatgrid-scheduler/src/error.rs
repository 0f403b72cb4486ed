use thiserror::Error;

use chatgrid_broker::BrokerError;
use chatgrid_state::StateError;

#[derive(Debug, Error)]
pub enum DistributorError {
    #[error(transparent)]
    Broker(#[from] BrokerError),
    #[error(transparent)]
    State(#[from] StateError),
}

pub type DistributorResult<T> = Result<T, DistributorError>;
