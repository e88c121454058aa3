#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    #[error("config ({context}): {detail}")]
    Config { context: &'static str, detail: String },

    #[error("no {0} configured")]
    NoComponents(&'static str),

    #[error("{0}")]
    Pipeline(#[from] pipeline::PipelineError),

    #[error("store: {0}")]
    Store(#[from] store_engine::StoreError),

    #[error("simulate: {0}")]
    Simulate(String),

    #[error("signal: {0}")]
    Signal(#[from] std::io::Error),
}
