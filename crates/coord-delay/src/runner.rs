use std::{
    sync::{
        Arc,
        atomic::{AtomicBool, AtomicUsize, Ordering},
    },
    time::Duration,
};

use coord_model::TaskId;
use coord_store::Store;
use tokio::{sync::Notify, task::JoinHandle};
use tokio_util::{sync::CancellationToken, task::TaskTracker};
use tracing::{debug, error, info, instrument, warn};

use crate::{
    config::RunnerConfig,
    error::DelayError,
    registry::TaskRegistry,
    store::{ClaimedTask, DelayedTaskStore},
    task::TaskPayload,
};

/// Process-wide handle to the delayed task machinery.
///
/// Build one per process and pass clones around; every clone drives the same loop.
#[derive(Clone)]
pub struct DelayedTaskRunner {
    inner: Arc<RunnerInner>,
}

struct RunnerInner {
    tasks: DelayedTaskStore,
    registry: Arc<TaskRegistry>,
    granularity: Duration,
    running: AtomicBool,
    keep_running: AtomicBool,
    wake: Notify,
    in_flight: Arc<AtomicUsize>,
    tracker: TaskTracker,
}

impl DelayedTaskRunner {
    pub fn new(store: Store, registry: TaskRegistry, cfg: RunnerConfig) -> Self {
        Self {
            inner: Arc::new(RunnerInner {
                tasks: DelayedTaskStore::new(store, cfg),
                registry: Arc::new(registry),
                granularity: cfg.granularity,
                running: AtomicBool::new(false),
                keep_running: AtomicBool::new(true),
                wake: Notify::new(),
                in_flight: Arc::new(AtomicUsize::new(0)),
                tracker: TaskTracker::new(),
            }),
        }
    }

    pub fn tasks(&self) -> &DelayedTaskStore {
        &self.inner.tasks
    }

    /// See [`DelayedTaskStore::insert`]. Blocks the calling thread.
    pub fn insert<T: TaskPayload>(&self, task: &T, delay: u64, tag: &str) -> Result<TaskId, DelayError> {
        self.inner.tasks.insert(task, delay, tag)
    }

    /// See [`DelayedTaskStore::remove`]. Blocks the calling thread.
    pub fn remove(&self, tag: &str) -> Result<usize, DelayError> {
        self.inner.tasks.remove(tag)
    }

    /// See [`DelayedTaskStore::check_exists`]. Blocks the calling thread.
    pub fn check_exists(&self, tag: &str) -> bool {
        self.inner.tasks.check_exists(tag)
    }

    /// Number of claimed tasks still executing.
    pub fn in_flight(&self) -> usize {
        self.inner.in_flight.load(Ordering::Acquire)
    }

    pub fn is_running(&self) -> bool {
        self.inner.running.load(Ordering::Acquire)
    }

    /// Ask the loop to exit after its current step. Executing tasks are left alone.
    ///
    /// A stop issued while no loop is running ends the next [`DelayedTaskRunner::run`]
    /// before it claims anything.
    pub fn stop(&self) {
        self.inner.keep_running.store(false, Ordering::Release);
        self.inner.wake.notify_one();
    }

    /// Wait until every claimed task has finished executing.
    ///
    /// Tasks dispatched while waiting are waited for too.
    pub async fn wait_idle(&self) {
        let tracker = &self.inner.tracker;
        tracker.close();
        tracker.wait().await;
        tracker.reopen();
    }

    /// Poll the store until `ctx` is cancelled or [`DelayedTaskRunner::stop`] is called.
    ///
    /// Only one loop may run per runner; a second call fails with
    /// [`DelayError::AlreadyRunning`].
    #[instrument(level = "info", skip(self, ctx), fields(granularity_ms = self.inner.granularity.as_millis() as u64))]
    pub async fn run(&self, ctx: CancellationToken) -> Result<(), DelayError> {
        if self.inner.running.swap(true, Ordering::AcqRel) {
            return Err(DelayError::AlreadyRunning);
        }
        let _running = RunningGuard(&self.inner.running);
        info!("delayed task runner started");

        while self.inner.keep_running.load(Ordering::Acquire) {
            tokio::select! {
                _ = ctx.cancelled() => break,
                _ = self.inner.wake.notified() => {}
                _ = tokio::time::sleep(self.inner.granularity) => {}
            }
            if !self.inner.keep_running.load(Ordering::Acquire) {
                break;
            }

            match self.run_once().await {
                Ok(_) => {}
                Err(DelayError::PayloadCorrupt { type_name, reason }) => {
                    error!(%type_name, %reason, "dropping delayed task with unreadable payload");
                }
                Err(e) => {
                    warn!(error = %e, "delayed task poll failed; resetting store connection");
                    self.reset_store().await;
                }
            }
        }

        // Re-arm so the runner can be started again.
        self.inner.keep_running.store(true, Ordering::Release);
        info!(in_flight = self.in_flight(), "delayed task runner stopped");
        Ok(())
    }

    /// Claim at most one due task and start it.
    ///
    /// Returns the handle of the started execution unit, `None` when nothing was due.
    pub async fn run_once(&self) -> Result<Option<JoinHandle<()>>, DelayError> {
        let tasks = self.inner.tasks.clone();
        let registry = Arc::clone(&self.inner.registry);
        let claimed = tokio::task::spawn_blocking(move || tasks.claim_one_due(&registry)).await??;

        Ok(claimed.map(|c| self.dispatch(c)))
    }

    fn dispatch(&self, claimed: ClaimedTask) -> JoinHandle<()> {
        let ClaimedTask { record, task } = claimed;
        let in_flight = InFlight::enter(&self.inner.in_flight);

        self.inner.tracker.spawn(async move {
            let _in_flight = in_flight;
            debug!(id = %record.id, type_name = %record.type_name, "delayed task started");

            // Inner spawn so a panicking task surfaces as a JoinError here.
            let res = tokio::spawn(async move { task.execute().await }).await;
            match res {
                Ok(Ok(())) => debug!(id = %record.id, "delayed task finished"),
                Ok(Err(e)) => error!(id = %record.id, type_name = %record.type_name, error = %format!("{e:#}"), "delayed task failed"),
                Err(e) if e.is_panic() => error!(id = %record.id, type_name = %record.type_name, "delayed task panicked"),
                Err(e) => warn!(id = %record.id, error = %e, "delayed task aborted"),
            }
        })
    }

    async fn reset_store(&self) {
        let store = self.inner.tasks.store().clone();
        match tokio::task::spawn_blocking(move || store.reset()).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!(error = %e, "failed to reset store connection"),
            Err(e) => warn!(error = %e, "store reset did not complete"),
        }
    }
}

struct RunningGuard<'a>(&'a AtomicBool);

impl Drop for RunningGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

struct InFlight(Arc<AtomicUsize>);

impl InFlight {
    fn enter(counter: &Arc<AtomicUsize>) -> Self {
        counter.fetch_add(1, Ordering::AcqRel);
        Self(Arc::clone(counter))
    }
}

impl Drop for InFlight {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::AcqRel);
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use async_trait::async_trait;
    use coord_store::{ManualClock, RetryPolicy, StoreConfig};
    use serde::{Deserialize, Serialize};
    use tempfile::TempDir;
    use tokio::sync::mpsc;

    use super::*;
    use crate::task::DelayedTask;

    #[derive(Serialize, Deserialize)]
    struct Ping {
        msg: String,
    }

    impl TaskPayload for Ping {
        const TYPE_NAME: &'static str = "test.ping";
    }

    struct PingSender {
        msg: String,
        tx: mpsc::UnboundedSender<String>,
    }

    #[async_trait]
    impl DelayedTask for PingSender {
        async fn execute(&self) -> anyhow::Result<()> {
            self.tx.send(self.msg.clone())?;
            Ok(())
        }
    }

    #[derive(Serialize, Deserialize)]
    struct SlowPing {
        msg: String,
        ms: u64,
    }

    impl TaskPayload for SlowPing {
        const TYPE_NAME: &'static str = "test.slow_ping";
    }

    struct SlowPingSender {
        ping: SlowPing,
        tx: mpsc::UnboundedSender<String>,
    }

    #[async_trait]
    impl DelayedTask for SlowPingSender {
        async fn execute(&self) -> anyhow::Result<()> {
            tokio::time::sleep(Duration::from_millis(self.ping.ms)).await;
            self.tx.send(self.ping.msg.clone())?;
            Ok(())
        }
    }

    #[derive(Serialize, Deserialize)]
    struct Boom;

    impl TaskPayload for Boom {
        const TYPE_NAME: &'static str = "test.boom";
    }

    #[async_trait]
    impl DelayedTask for Boom {
        async fn execute(&self) -> anyhow::Result<()> {
            panic!("boom");
        }
    }

    #[derive(Serialize, Deserialize)]
    struct Fail;

    impl TaskPayload for Fail {
        const TYPE_NAME: &'static str = "test.fail";
    }

    #[async_trait]
    impl DelayedTask for Fail {
        async fn execute(&self) -> anyhow::Result<()> {
            anyhow::bail!("nope")
        }
    }

    fn runner(dir: &TempDir, clock: Arc<ManualClock>) -> (DelayedTaskRunner, mpsc::UnboundedReceiver<String>) {
        let store = Store::open_with_clock(StoreConfig::new(dir.path().join("coord.db")), clock).unwrap();
        let (tx, rx) = mpsc::unbounded_channel();

        let slow_tx = tx.clone();
        let mut registry = TaskRegistry::new();
        registry
            .register_with(move |p: Ping| PingSender {
                msg: p.msg,
                tx: tx.clone(),
            })
            .register_with(move |ping: SlowPing| SlowPingSender {
                ping,
                tx: slow_tx.clone(),
            })
            .register::<Boom>()
            .register::<Fail>();

        let cfg = RunnerConfig::default()
            .with_granularity(Duration::from_millis(10))
            .with_store_retry(RetryPolicy::insert().with_delay(Duration::ZERO));
        (DelayedTaskRunner::new(store, registry, cfg), rx)
    }

    fn ping(msg: &str) -> Ping {
        Ping { msg: msg.into() }
    }

    #[tokio::test]
    async fn run_once_executes_due_task() {
        let dir = TempDir::new().unwrap();
        let clock = Arc::new(ManualClock::new(1_000));
        let (runner, mut rx) = runner(&dir, clock.clone());

        runner.insert(&ping("later"), 5, "").unwrap();
        clock.advance(2);
        assert!(runner.run_once().await.unwrap().is_none());

        clock.advance(4);
        runner.run_once().await.unwrap().unwrap().await.unwrap();
        assert_eq!(rx.recv().await.unwrap(), "later");
        assert_eq!(runner.in_flight(), 0);
    }

    #[tokio::test]
    async fn failing_and_panicking_tasks_are_contained() {
        let dir = TempDir::new().unwrap();
        let clock = Arc::new(ManualClock::new(1_000));
        let (runner, mut rx) = runner(&dir, clock.clone());

        runner.insert(&Boom, 0, "").unwrap();
        clock.advance(1);
        runner.insert(&Fail, 0, "").unwrap();
        clock.advance(1);
        runner.insert(&ping("after"), 0, "").unwrap();
        clock.advance(1);

        for _ in 0..3 {
            let handle = runner.run_once().await.unwrap().unwrap();
            assert!(handle.await.is_ok());
        }
        assert_eq!(rx.recv().await.unwrap(), "after");
        assert_eq!(runner.tasks().pending().unwrap(), 0);
    }

    #[tokio::test]
    async fn loop_runs_until_cancelled() {
        let dir = TempDir::new().unwrap();
        let clock = Arc::new(ManualClock::new(1_000));
        let (runner, mut rx) = runner(&dir, clock);
        let ctx = CancellationToken::new();

        let looping = {
            let runner = runner.clone();
            let ctx = ctx.clone();
            tokio::spawn(async move { runner.run(ctx).await })
        };

        runner.insert(&ping("one"), 0, "").unwrap();
        let got = tokio::time::timeout(Duration::from_secs(5), rx.recv()).await.unwrap();
        assert_eq!(got.unwrap(), "one");

        assert!(runner.is_running());
        assert!(matches!(
            runner.run(CancellationToken::new()).await,
            Err(DelayError::AlreadyRunning)
        ));

        ctx.cancel();
        looping.await.unwrap().unwrap();
        assert!(!runner.is_running());
    }

    #[tokio::test]
    async fn stop_ends_the_loop() {
        let dir = TempDir::new().unwrap();
        let clock = Arc::new(ManualClock::new(1_000));
        let (runner, _rx) = runner(&dir, clock);

        let looping = {
            let runner = runner.clone();
            tokio::spawn(async move { runner.run(CancellationToken::new()).await })
        };
        tokio::time::sleep(Duration::from_millis(30)).await;

        runner.stop();
        tokio::time::timeout(Duration::from_secs(5), looping)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn removed_task_never_runs() {
        let dir = TempDir::new().unwrap();
        let clock = Arc::new(ManualClock::new(1_000));
        let (runner, mut rx) = runner(&dir, clock);

        runner.insert(&ping("cancelled"), 0, "t1").unwrap();
        assert_eq!(runner.remove("t1").unwrap(), 1);
        assert!(!runner.check_exists("t1"));

        assert!(runner.run_once().await.unwrap().is_none());
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn stop_before_run_ends_the_next_run() {
        let dir = TempDir::new().unwrap();
        let clock = Arc::new(ManualClock::new(1_000));
        let (runner, mut rx) = runner(&dir, clock);
        runner.insert(&ping("never"), 0, "").unwrap();

        runner.stop();
        tokio::time::timeout(Duration::from_millis(500), runner.run(CancellationToken::new()))
            .await
            .unwrap()
            .unwrap();

        assert!(rx.try_recv().is_err());
        assert_eq!(runner.tasks().pending().unwrap(), 1);
        assert!(!runner.is_running());
    }

    #[tokio::test]
    async fn runner_restarts_after_stop() {
        let dir = TempDir::new().unwrap();
        let clock = Arc::new(ManualClock::new(1_000));
        let (runner, mut rx) = runner(&dir, clock);

        runner.stop();
        runner.run(CancellationToken::new()).await.unwrap();

        let ctx = CancellationToken::new();
        let looping = {
            let runner = runner.clone();
            let ctx = ctx.clone();
            tokio::spawn(async move { runner.run(ctx).await })
        };
        runner.insert(&ping("again"), 0, "").unwrap();
        let got = tokio::time::timeout(Duration::from_secs(5), rx.recv()).await.unwrap();
        assert_eq!(got.unwrap(), "again");

        ctx.cancel();
        looping.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn cancelled_loop_lets_in_flight_task_finish() {
        let dir = TempDir::new().unwrap();
        let clock = Arc::new(ManualClock::new(1_000));
        let (runner, mut rx) = runner(&dir, clock);
        let ctx = CancellationToken::new();

        runner
            .insert(
                &SlowPing {
                    msg: "slow".into(),
                    ms: 300,
                },
                0,
                "",
            )
            .unwrap();
        let looping = {
            let runner = runner.clone();
            let ctx = ctx.clone();
            tokio::spawn(async move { runner.run(ctx).await })
        };

        tokio::time::timeout(Duration::from_secs(5), async {
            while runner.in_flight() == 0 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();
        assert_eq!(runner.in_flight(), 1);

        ctx.cancel();
        looping.await.unwrap().unwrap();
        tokio::time::timeout(Duration::from_secs(5), runner.wait_idle())
            .await
            .unwrap();

        assert_eq!(rx.try_recv().unwrap(), "slow");
        assert_eq!(runner.in_flight(), 0);
        assert_eq!(runner.tasks().pending().unwrap(), 0);
    }
}
