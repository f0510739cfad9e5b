//! Durable delayed tasks.
//!
//! Producers persist a serialized [`TaskPayload`] with a delay through the
//! [`DelayedTaskRunner`]; every process running the runner loop polls the shared
//! store, claims one due record at a time (read and delete in one locking
//! transaction) and executes the decoded [`DelayedTask`] on its own tokio task.
//!
//! A record is executed by at most one process. A process that crashes after the
//! claim commits loses the task.

mod config;
pub use config::RunnerConfig;

mod error;
pub use error::DelayError;

mod task;
pub use task::{DelayedTask, TaskPayload};

mod registry;
pub use registry::TaskRegistry;

mod store;
pub use store::{ClaimedTask, DelayedTaskStore};

mod runner;
pub use runner::DelayedTaskRunner;

pub mod prelude {
    pub use crate::error::DelayError;
    pub use crate::runner::DelayedTaskRunner;
    pub use crate::task::{DelayedTask, TaskPayload};
    pub use crate::{RunnerConfig, TaskRegistry};
}
