#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("store '{file}': {source}")]
    Sqlite {
        file: String,
        #[source]
        source: rusqlite::Error,
    },

    #[error("store '{file}' busy: not acquired within {timeout_ms} ms")]
    Busy { file: String, timeout_ms: u64 },

    #[error("store pool exhausted: all {max_open} handles are leased")]
    PoolExhausted { max_open: usize },

    #[error("invalid {context} name '{name}'")]
    InvalidName { context: &'static str, name: String },

    #[error("store '{0}' not found")]
    NotFound(String),

    #[error("io ({path}): {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("schema: {0}")]
    Schema(String),
}

impl StoreError {
    pub(crate) fn sqlite(file: &str, source: rusqlite::Error) -> Self {
        StoreError::Sqlite { file: file.to_string(), source }
    }
}
