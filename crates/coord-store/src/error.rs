use rusqlite::ErrorCode;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum StoreError {
    /// Lock-wait timeout, busy database or lost connection. Retrying may succeed.
    #[error("store temporarily unavailable: {0}")]
    Transient(#[source] rusqlite::Error),
    /// A uniqueness constraint rejected the write; a competitor got there first.
    #[error("integrity conflict: {0}")]
    IntegrityConflict(#[source] rusqlite::Error),
    #[error("store error: {0}")]
    Backend(#[source] rusqlite::Error),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl StoreError {
    pub fn is_transient(&self) -> bool {
        matches!(self, StoreError::Transient(_))
    }

    pub fn is_integrity_conflict(&self) -> bool {
        matches!(self, StoreError::IntegrityConflict(_))
    }
}

impl From<rusqlite::Error> for StoreError {
    fn from(e: rusqlite::Error) -> Self {
        let code = match &e {
            rusqlite::Error::SqliteFailure(err, _) => Some(err.code),
            _ => None,
        };
        match code {
            Some(
                ErrorCode::DatabaseBusy
                | ErrorCode::DatabaseLocked
                | ErrorCode::CannotOpen
                | ErrorCode::SystemIoFailure,
            ) => StoreError::Transient(e),
            Some(ErrorCode::ConstraintViolation) => StoreError::IntegrityConflict(e),
            _ => StoreError::Backend(e),
        }
    }
}
