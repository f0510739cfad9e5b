use coord_model::Seq;
use coord_store::StoreError;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum AllocError {
    #[error("no free sequence left in '{basename}' within {start}..={end}")]
    Exhausted { basename: String, start: Seq, end: Seq },
    #[error("no more names available for '{basename}' with {digits} digits; increase the digits")]
    NoNamesAvailable { basename: String, digits: u32 },
    #[error("could not allocate in '{basename}' after {attempts} attempts")]
    RetriesExhausted { basename: String, attempts: u32 },
    #[error("invalid range {start}..={end}")]
    InvalidRange { start: Seq, end: Seq },
    #[error("digits must be between 1 and {max}, got {digits}")]
    InvalidDigits { digits: u32, max: u32 },
    #[error("'{name}' was not generated from base '{basename}'")]
    InvalidName { basename: String, name: String },
    #[error("invalid mac address: {0}")]
    InvalidMac(String),
    #[error(transparent)]
    Store(#[from] StoreError),
}

impl AllocError {
    /// Returns `true` when the caller has to widen the range (or digits) to make progress.
    pub fn is_exhausted(&self) -> bool {
        matches!(
            self,
            AllocError::Exhausted { .. } | AllocError::NoNamesAvailable { .. }
        )
    }
}

impl From<rusqlite::Error> for AllocError {
    fn from(e: rusqlite::Error) -> Self {
        AllocError::Store(e.into())
    }
}
