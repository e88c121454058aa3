use tickstore_api::{BufferError, LeaseError};
use store_engine::StoreError;

#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    #[error("config: {0}")]
    Config(String),

    #[error("route table: {0}")]
    RouteTable(String),

    #[error(transparent)]
    Buffer(#[from] BufferError),

    #[error(transparent)]
    Lease(#[from] LeaseError),

    #[error(transparent)]
    Store(#[from] StoreError),
}
