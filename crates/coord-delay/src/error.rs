use coord_store::StoreError;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum DelayError {
    #[error("task was not scheduled after {attempts} attempts: {source}")]
    SchedulingFailure {
        attempts: u32,
        #[source]
        source: StoreError,
    },
    #[error("cannot decode '{type_name}' payload: {reason}")]
    PayloadCorrupt { type_name: String, reason: String },
    #[error("cannot encode payload: {0}")]
    Encode(#[from] serde_json::Error),
    #[error("runner loop is already running")]
    AlreadyRunning,
    #[error("blocking store call failed: {0}")]
    Join(String),
    #[error(transparent)]
    Store(#[from] StoreError),
}

impl From<rusqlite::Error> for DelayError {
    fn from(e: rusqlite::Error) -> Self {
        DelayError::Store(e.into())
    }
}

impl From<tokio::task::JoinError> for DelayError {
    fn from(e: tokio::task::JoinError) -> Self {
        DelayError::Join(e.to_string())
    }
}
