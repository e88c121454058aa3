pub mod serve;
pub mod simulate;

use std::sync::Arc;

use pipeline::{BufferBackend, DrainMonitor, Drainer, Router, open_buffer};
use store_engine::{SchemaRegistry, SqliteBatchWriter, StoreReader, StoreRegistry};

use crate::config::ServerConfig;
use crate::error::ServerError;

/// Собранное ядро: буфер, store, router и монитор drainer'а.
pub(crate) struct Stack {
    pub backend: BufferBackend,
    pub writer: Arc<SqliteBatchWriter>,
    pub router: Arc<Router>,
    pub reader: StoreReader,
    pub monitor: Arc<DrainMonitor>,
}

impl Stack {
    pub fn build(config: &ServerConfig) -> Result<Self, ServerError> {
        let schemas = Arc::new(SchemaRegistry::new(config.schemas.clone())?);
        let router = Arc::new(Router::new(&config.groups, &schemas)?);
        tracing::info!(groups = config.groups.len(), shapes = config.schemas.len(), "route table ready");

        let backend = open_buffer(&config.buffer)?;

        let registry = StoreRegistry::new(&config.store)?;
        let writer = Arc::new(SqliteBatchWriter::new(registry, schemas, config.store.write_timeout()));
        tracing::info!(
            data_dir = %config.store.data_dir.display(),
            max_open = config.store.max_open,
            "store registry ready"
        );

        Ok(Self {
            backend,
            writer,
            router,
            reader: StoreReader::new(&config.store),
            monitor: Arc::new(DrainMonitor::new()),
        })
    }

    pub fn drainer(&self, config: &ServerConfig) -> Drainer {
        Drainer::new(
            self.backend.buffer.clone(),
            self.backend.leases.clone(),
            self.writer.clone(),
            self.router.clone(),
            config.drainer.clone(),
        )
        .with_monitor(self.monitor.clone())
    }
}
