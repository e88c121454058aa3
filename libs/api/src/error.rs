use crate::FailureKind;

/// Ошибки буфера на стороне producer'а и drainer'а.
#[derive(Debug, thiserror::Error)]
pub enum BufferError {
    /// Backpressure: producer должен повторить с задержкой.
    #[error("buffer full (capacity {capacity})")]
    Full { capacity: u64 },

    #[error("buffer storage: {0}")]
    Storage(String),

    #[error("buffer codec: {0}")]
    Codec(#[from] serde_json::Error),
}

impl BufferError {
    /// Повтор имеет смысл только при переполнении.
    pub fn is_transient(&self) -> bool {
        matches!(self, BufferError::Full { .. })
    }
}

/// Router не нашёл маршрут для записи.
#[derive(Debug, Clone, thiserror::Error)]
#[error("unroutable record (ticker '{ticker}', provider '{provider}'): {reason}")]
pub struct UnroutableError {
    pub ticker: String,
    pub provider: String,
    pub reason: String,
}

/// Сбой записи batch'а целиком. Строчные сбои идут в `WriteResult.rows_failed`.
#[derive(Debug, thiserror::Error)]
pub enum WriteError {
    #[error("store unavailable ({file}): {detail}")]
    StoreUnavailable { file: String, detail: String },

    #[error("write to {file} timed out after {timeout_ms} ms")]
    Timeout { file: String, timeout_ms: u64 },
}

impl WriteError {
    pub fn kind(&self) -> FailureKind {
        match self {
            WriteError::StoreUnavailable { .. } => FailureKind::StoreUnavailable,
            WriteError::Timeout { .. } => FailureKind::Timeout,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum LeaseError {
    #[error("lease storage: {0}")]
    Storage(String),
}
