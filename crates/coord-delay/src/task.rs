use async_trait::async_trait;
use serde::{Serialize, de::DeserializeOwned};

/// A unit of deferred work.
///
/// Everything the task needs must be carried by `self`: it runs in whatever process
/// claims it, possibly long after and far away from the producer.
#[async_trait]
pub trait DelayedTask: Send + Sync + 'static {
    async fn execute(&self) -> anyhow::Result<()>;
}

/// Serializable form of a task as stored between `insert` and the claim.
pub trait TaskPayload: Serialize + DeserializeOwned + Send + Sync + 'static {
    /// Stable identifier persisted next to the payload. Renaming it strands
    /// already stored records.
    const TYPE_NAME: &'static str;
}
