use std::time::Duration;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("staging store error: {0}")]
    Staging(#[from] converse_staging::Error),
    #[error("message db error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("store task failed: {0}")]
    Task(#[from] tokio::task::JoinError),
}

#[derive(Debug, thiserror::Error)]
pub enum ReconcileError {
    #[error("timed out after {0:?} waiting for the in-flight reconciliation")]
    GuardTimeout(Duration),
    #[error("reconciliation pass exceeded {0:?}")]
    PassTimeout(Duration),
    #[error(transparent)]
    Store(#[from] StoreError),
}

#[derive(Debug, thiserror::Error)]
pub enum PushError {
    #[error("push token unavailable: {0}")]
    TokenUnavailable(String),
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("subscription endpoint returned {0}")]
    Status(reqwest::StatusCode),
    #[error("invalid api url: {0}")]
    Url(#[from] url::ParseError),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}
