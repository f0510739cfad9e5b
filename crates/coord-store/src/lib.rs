//! Clock and transaction adapter over the shared SQLite store.
//!
//! Every cross-process decision in the workspace goes through [`Store::with_transaction`],
//! which opens a `BEGIN IMMEDIATE` transaction. SQLite has no row locks; taking the
//! database write lock before the decision read gives the same guarantee as
//! `SELECT ... FOR UPDATE`: competing lockers block until the holder commits or the
//! configured lock-wait timeout expires, which surfaces as [`StoreError::Transient`].

mod clock;
pub use clock::{Clock, ManualClock, StoreClock};

mod config;
pub use config::StoreConfig;

mod error;
pub use error::StoreError;

mod retry;
pub use retry::{RetryAction, RetryFailure, RetryPolicy};

mod schema;

mod store;
pub use store::{Store, Tx};

