//! Общие типы и контракты tickstore.
//!
//! Крейт не зависит от tokio и SQLite: здесь только модель данных
//! (`Record`, `BufferEntry`, `Batch`, `WriteResult`, `DeadLetter`),
//! ошибки и трейты на швах между buffer, drainer и store.

mod buffer;
mod error;
mod sink;
mod types;
mod util;

pub use buffer::{LeaseStore, RecordBuffer};
pub use error::{BufferError, LeaseError, UnroutableError, WriteError};
pub use sink::BatchSink;
pub use types::{
    Batch, BatchId, BatchItem, BufferEntry, BufferStats, DeadLetter, DeliveryState, EntryId,
    Failure, FailureKind, Fields, Provenance, Record, RecoverScope, RequeueOutcome, RetryPolicy,
    RouteTarget, RowFailure, WriteResult,
};
pub use util::{date_from_ms, date_parts_from_ms, is_identifier, now_ms, sanitize_identifier};
