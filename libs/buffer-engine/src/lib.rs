//! Реализации `RecordBuffer` + `LeaseStore`.
//!
//! - `MemoryBuffer` — volatile, для тестов и dev-режима.
//! - `SqliteBuffer` — журнал на диске (WAL), переживает падение процесса:
//!   in-flight записи остаются в журнале и возвращаются через `recover`.

mod memory;
mod sqlite;
mod wait;

pub use memory::MemoryBuffer;
pub use sqlite::SqliteBuffer;
pub use wait::POLL_INTERVAL;
