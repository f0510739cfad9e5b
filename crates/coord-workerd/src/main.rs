mod config;
mod sweep;

use std::{sync::Arc, time::Duration};

use anyhow::Context;
use coord_delay::{DelayedTaskRunner, DelayedTaskStore, TaskRegistry};
use coord_observe::{Journal, logger_init};
use coord_store::Store;
use taskvisor::{
    BackoffPolicy, SupervisorConfig, RestartPolicy, Subscribe, Supervisor, TaskError, TaskFn, TaskRef, TaskSpec,
};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::{
    config::WorkerdConfig,
    sweep::{ReleaseIdleSlots, ensure_scheduled},
};

const RUNNER_TASK: &str = "coord-delayed-task-runner";

fn main() -> anyhow::Result<()> {
    let cfg = WorkerdConfig::from_env()?;
    // Before the runtime starts: the local UTC offset is only readable single threaded.
    logger_init(&cfg.logger)?;

    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("build tokio runtime")?
        .block_on(run(cfg))
}

async fn run(cfg: WorkerdConfig) -> anyhow::Result<()> {
    info!(owner = %cfg.owner, db = %cfg.store.path.display(), "coord-workerd starting");

    let store = Store::open(cfg.store.clone()).context("open store")?;
    let tasks = DelayedTaskStore::new(store.clone(), cfg.runner);

    let mut registry = TaskRegistry::new();
    sweep::register(&mut registry, store.clone(), tasks.clone());
    let runner = DelayedTaskRunner::new(store, registry, cfg.runner);

    if cfg.idle_slot_secs > 0 {
        let payload = ReleaseIdleSlots::for_owner(&cfg.owner, cfg.idle_slot_secs);
        if let Err(e) = ensure_scheduled(&tasks, &payload) {
            warn!(error = %e, "idle slot sweep not scheduled");
        }
    }

    let subscribers: Vec<Arc<dyn Subscribe>> = vec![Arc::new(Journal::new())];
    let sup = Supervisor::builder(SupervisorConfig::default())
        .with_subscribers(subscribers)
        .build();
    let res = sup
        .run(vec![runner_spec(runner.clone())])
        .await
        .map_err(|e| anyhow::anyhow!("supervisor: {e}"));

    // Claimed tasks are no longer in the store; let them finish before exiting.
    drain(&runner, cfg.shutdown_grace).await;
    res?;

    info!("coord-workerd stopped");
    Ok(())
}

async fn drain(runner: &DelayedTaskRunner, grace: Duration) {
    let in_flight = runner.in_flight();
    if in_flight > 0 {
        info!(in_flight, grace_secs = grace.as_secs(), "waiting for running delayed tasks");
    }
    if tokio::time::timeout(grace, runner.wait_idle()).await.is_err() {
        warn!(in_flight = runner.in_flight(), "delayed tasks still running at shutdown; abandoning them");
    }
}

fn runner_spec(runner: DelayedTaskRunner) -> TaskSpec {
    let task: TaskRef = TaskFn::arc(RUNNER_TASK, move |ctx: CancellationToken| {
        let runner = runner.clone();

        async move {
            runner.run(ctx).await.map_err(|e| TaskError::Fail {
                reason: format!("delayed task runner: {e}"),
            })
        }
    });

    TaskSpec::new(task, RestartPolicy::OnFailure, BackoffPolicy::default(), None)
}
