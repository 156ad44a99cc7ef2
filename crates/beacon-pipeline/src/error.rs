use beacon_store::StoreError;

#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    #[error("store error: {0}")]
    Store(#[from] StoreError),

    #[error("config error: {0}")]
    Config(String),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("pipeline shut down")]
    ShutDown,
}

pub type Result<T> = std::result::Result<T, PipelineError>;
