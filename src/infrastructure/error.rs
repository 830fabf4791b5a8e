use thiserror::Error;

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("Invalid input: {0}")]
    InvalidInput(String),
    #[error("Instance not found: {0}")]
    InstanceNotFound(String),
    #[error("Invalid transition: {0}")]
    InvalidTransition(String),
    #[error("Store unavailable: {0}")]
    StoreUnavailable(String),
}
