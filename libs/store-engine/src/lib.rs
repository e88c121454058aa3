//! Персистентный слой: store-файлы SQLite, по таблице на тикер.
//!
//! - `StoreRegistry` — пул открытых handles, один writer на файл.
//! - `SchemaRegistry` — объявленные формы таблиц + вывод типов.
//! - `SqliteBatchWriter` — транзакционная запись batch'а (`BatchSink`).
//! - `StoreReader` — read-only доступ к закоммиченным данным.

pub mod config;
mod error;
mod reader;
mod registry;
mod schema;
mod writer;

pub use config::StoreConfig;
pub use error::StoreError;
pub use reader::{StoreReader, StoredRow, TableStats};
pub use registry::{RegistryStats, StoreHandle, StoreRegistry};
pub use schema::{ColumnDef, ColumnType, RESERVED_COLUMNS, SchemaRegistry, ShapeConfig, TableSchema};
pub use writer::SqliteBatchWriter;
