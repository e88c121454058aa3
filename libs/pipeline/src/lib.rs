//! Сборка buffer → drainer → store.
//!
//! - `Router` — запись → `(store file, table)`.
//! - `LeaderLease` — единственный активный drainer.
//! - `Drainer` — drain-циклы с ack-after-commit.
//! - `DrainMonitor` — счётчики для HTTP слоя.

pub mod config;
pub mod error;
mod drainer;
mod lease;
mod monitor;
mod router;

use std::sync::Arc;

use buffer_engine::{MemoryBuffer, SqliteBuffer};
use tickstore_api::{LeaseStore, RecordBuffer};

pub use drainer::{CycleReport, DrainState, Drainer};
pub use error::PipelineError;
pub use lease::LeaderLease;
pub use monitor::{DrainMonitor, DrainSnapshot};
pub use router::{Route, Router};

use config::{BufferConfig, BufferKind};

/// Открытый буфер: один объект в двух ролях.
#[derive(Clone)]
pub struct BufferBackend {
    pub buffer: Arc<dyn RecordBuffer>,
    pub leases: Arc<dyn LeaseStore>,
}

pub fn open_buffer(config: &BufferConfig) -> Result<BufferBackend, PipelineError> {
    config.validate().map_err(PipelineError::Config)?;
    match config.backend {
        BufferKind::Memory => {
            let buffer = Arc::new(MemoryBuffer::new(config.capacity));
            tracing::warn!(capacity = config.capacity, "memory buffer: entries are lost on exit");
            Ok(BufferBackend { buffer: buffer.clone(), leases: buffer })
        }
        BufferKind::Sqlite => {
            let buffer = Arc::new(SqliteBuffer::open(&config.path, config.capacity)?);
            tracing::info!(path = %config.path.display(), capacity = config.capacity, "buffer journal opened");
            Ok(BufferBackend { buffer: buffer.clone(), leases: buffer })
        }
    }
}
