use anyhow::Context;
use async_trait::async_trait;
use coord_alloc::{MacAllocator, NameAllocator, SequenceAllocator};
use coord_delay::{DelayError, DelayedTask, DelayedTaskStore, TaskPayload, TaskRegistry};
use coord_store::Store;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

/// Tag of the pending sweep; at most one is kept scheduled.
pub const SWEEP_TAG: &str = "coord-workerd.release-idle-slots";

/// Frees the slots an owner has not touched for `idle_secs`, then schedules the
/// next sweep `idle_secs` later.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReleaseIdleSlots {
    pub owner: String,
    pub type_names: Vec<String>,
    pub idle_secs: u64,
}

impl TaskPayload for ReleaseIdleSlots {
    const TYPE_NAME: &'static str = "coord.release-idle-slots";
}

impl ReleaseIdleSlots {
    /// Sweep of every allocator type the worker hands out.
    pub fn for_owner(owner: &str, idle_secs: u64) -> Self {
        Self {
            owner: owner.to_string(),
            type_names: vec![
                NameAllocator::TYPE_NAME.to_string(),
                MacAllocator::TYPE_NAME.to_string(),
            ],
            idle_secs,
        }
    }
}

struct Sweep {
    payload: ReleaseIdleSlots,
    store: Store,
    tasks: DelayedTaskStore,
}

#[async_trait]
impl DelayedTask for Sweep {
    async fn execute(&self) -> anyhow::Result<()> {
        let payload = self.payload.clone();
        let store = self.store.clone();
        let tasks = self.tasks.clone();

        let released = tokio::task::spawn_blocking(move || sweep(&payload, &store, &tasks))
            .await
            .context("sweep did not complete")??;
        info!(owner = %self.payload.owner, released, "idle slots released");
        Ok(())
    }
}

fn sweep(payload: &ReleaseIdleSlots, store: &Store, tasks: &DelayedTaskStore) -> anyhow::Result<usize> {
    let cutoff = store.now()? - i64::try_from(payload.idle_secs).unwrap_or(i64::MAX);

    let mut released = 0;
    for type_name in &payload.type_names {
        let alloc = SequenceAllocator::new(store.clone(), type_name, &payload.owner);
        released += alloc
            .release_older_than(cutoff)
            .with_context(|| format!("release idle '{type_name}' slots"))?;
    }

    schedule_next(tasks, payload).context("reschedule idle slot sweep")?;
    Ok(released)
}

fn schedule_next(tasks: &DelayedTaskStore, payload: &ReleaseIdleSlots) -> Result<(), DelayError> {
    tasks.remove(SWEEP_TAG)?;
    let id = tasks.insert(payload, payload.idle_secs, SWEEP_TAG)?;
    debug!(%id, delay = payload.idle_secs, "next idle slot sweep scheduled");
    Ok(())
}

/// Teach `registry` to run sweeps against `store`.
pub fn register(registry: &mut TaskRegistry, store: Store, tasks: DelayedTaskStore) {
    registry.register_with(move |payload: ReleaseIdleSlots| Sweep {
        payload,
        store: store.clone(),
        tasks: tasks.clone(),
    });
}

/// Schedule the first sweep unless one is already pending (possibly from a previous run).
pub fn ensure_scheduled(tasks: &DelayedTaskStore, payload: &ReleaseIdleSlots) -> Result<bool, DelayError> {
    if tasks.check_exists(SWEEP_TAG) {
        debug!("idle slot sweep already pending");
        return Ok(false);
    }
    tasks.insert(payload, payload.idle_secs, SWEEP_TAG)?;
    Ok(true)
}
