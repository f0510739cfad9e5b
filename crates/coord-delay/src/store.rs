use coord_model::{DelayedTaskRecord, TaskId, UnixTime};
use coord_store::{RetryAction, Store, StoreError};
use rusqlite::params;
use tracing::{debug, error, instrument, warn};

use crate::{
    config::RunnerConfig,
    error::DelayError,
    registry::TaskRegistry,
    task::{DelayedTask, TaskPayload},
};

/// A record taken out of the store together with its decoded executor.
pub struct ClaimedTask {
    pub record: DelayedTaskRecord,
    pub task: Box<dyn DelayedTask>,
}

/// Persistence side of delayed tasks.
///
/// All methods block on the store; call them from the blocking pool when in async code.
#[derive(Clone)]
pub struct DelayedTaskStore {
    store: Store,
    cfg: RunnerConfig,
}

impl DelayedTaskStore {
    pub fn new(store: Store, cfg: RunnerConfig) -> Self {
        Self { store, cfg }
    }

    pub fn store(&self) -> &Store {
        &self.store
    }

    /// Persist `task` to run `delay` seconds from now (store clock).
    ///
    /// Store failures are retried per [`RunnerConfig::store_retry`]; on
    /// [`DelayError::SchedulingFailure`] the task was not scheduled.
    #[instrument(level = "debug", skip(self, task), fields(type_name = T::TYPE_NAME))]
    pub fn insert<T: TaskPayload>(&self, task: &T, delay: u64, tag: &str) -> Result<TaskId, DelayError> {
        let instance = serde_json::to_string(task)?;
        let id = TaskId::generate();
        let delay_secs = i64::try_from(delay).unwrap_or(i64::MAX);

        let res = self.cfg.store_retry.run(
            &self.store,
            || {
                self.store.with_transaction(|tx| {
                    let now = tx.now();
                    tx.execute(
                        "INSERT INTO delayed_task
                           (id, type_name, instance, insert_date, execution_delay, execution_time, tag)
                         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                        params![
                            id.as_str(),
                            T::TYPE_NAME,
                            instance,
                            now,
                            delay_secs,
                            now.saturating_add(delay_secs),
                            tag
                        ],
                    )?;
                    Ok::<_, StoreError>(())
                })
            },
            |_| RetryAction::AfterPause,
        );

        match res {
            Ok(()) => {
                debug!(%id, delay, tag, "delayed task scheduled");
                Ok(id)
            }
            Err(f) => {
                error!(error = %f.error, attempts = f.attempts, "giving up scheduling delayed task");
                Err(DelayError::SchedulingFailure {
                    attempts: f.attempts,
                    source: f.error,
                })
            }
        }
    }

    /// Delete every pending record carrying `tag`. Already claimed tasks are not affected.
    ///
    /// Lock timeouts are retried per [`RunnerConfig::store_retry`].
    #[instrument(level = "debug", skip(self))]
    pub fn remove(&self, tag: &str) -> Result<usize, DelayError> {
        let classify = |e: &DelayError| match e {
            DelayError::Store(e) if e.is_transient() => RetryAction::AfterPause,
            _ => RetryAction::GiveUp,
        };
        let removed = self
            .cfg
            .store_retry
            .run(
                &self.store,
                || {
                    self.store.with_transaction(|tx| {
                        let ids = tx.select_for_update(
                            "SELECT id FROM delayed_task WHERE tag = ?1",
                            params![tag],
                            |row| row.get::<_, String>(0),
                        )?;
                        if ids.is_empty() {
                            return Ok(0);
                        }
                        let n = tx.execute("DELETE FROM delayed_task WHERE tag = ?1", params![tag])?;
                        Ok::<_, DelayError>(n)
                    })
                },
                classify,
            )
            .map_err(|f| f.error)?;

        debug!(removed, "delayed tasks removed");
        Ok(removed)
    }

    /// Advisory check for a pending record with `tag`.
    ///
    /// Takes no lock; the answer can be stale as soon as it is returned. Store
    /// errors are logged and reported as `false`.
    pub fn check_exists(&self, tag: &str) -> bool {
        if tag.is_empty() {
            return false;
        }

        let res = self.store.with_connection(|conn| {
            conn.query_row(
                "SELECT EXISTS(SELECT 1 FROM delayed_task WHERE tag = ?1)",
                params![tag],
                |row| row.get::<_, bool>(0),
            )
            .map_err(StoreError::from)
        });

        res.unwrap_or_else(|e| {
            warn!(error = %e, tag, "cannot check delayed task existence");
            false
        })
    }

    /// Atomically take the oldest due record out of the store and decode it.
    ///
    /// Returns `Ok(None)` when nothing is due. A record that fails to decode is
    /// already deleted when [`DelayError::PayloadCorrupt`] comes back.
    pub fn claim_one_due(&self, registry: &TaskRegistry) -> Result<Option<ClaimedTask>, DelayError> {
        let tolerance = self.cfg.skew_secs();

        let claimed = self.store.with_transaction(|tx| {
            let now = tx.now();
            let rows = tx.select_for_update(
                "SELECT id, type_name, instance, insert_date, execution_delay, execution_time, tag
                 FROM delayed_task
                 WHERE execution_time <= ?1 OR insert_date > ?2
                 ORDER BY execution_time, rowid
                 LIMIT 1",
                params![now, now.saturating_add(tolerance)],
                record_from_row,
            )?;

            let Some(record) = rows.into_iter().next() else {
                return Ok(None);
            };
            if record.is_skewed(now, tolerance) {
                warn!(
                    id = %record.id,
                    insert_date = record.insert_date,
                    now,
                    "delayed task inserted in the future; store clock moved backwards"
                );
            }

            tx.execute("DELETE FROM delayed_task WHERE id = ?1", params![record.id.as_str()])?;
            Ok::<_, DelayError>(Some(record))
        })?;

        let Some(record) = claimed else {
            return Ok(None);
        };
        debug!(id = %record.id, type_name = %record.type_name, "delayed task claimed");

        let task = registry.decode(&record.type_name, &record.instance)?;
        Ok(Some(ClaimedTask { record, task }))
    }

    /// Number of records waiting to be claimed.
    pub fn pending(&self) -> Result<usize, DelayError> {
        let n: i64 = self.store.with_connection(|conn| {
            conn.query_row("SELECT COUNT(*) FROM delayed_task", [], |row| row.get(0))
                .map_err(StoreError::from)
        })?;
        Ok(usize::try_from(n).unwrap_or(0))
    }
}

fn record_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<DelayedTaskRecord> {
    let id: String = row.get(0)?;
    let delay: i64 = row.get(4)?;
    let execution_time: UnixTime = row.get(5)?;

    Ok(DelayedTaskRecord {
        id: TaskId::from(id),
        type_name: row.get(1)?,
        instance: row.get(2)?,
        insert_date: row.get(3)?,
        execution_delay: u64::try_from(delay).unwrap_or(0),
        execution_time,
        tag: row.get(6)?,
    })
}

#[cfg(test)]
mod tests {
    use std::{
        sync::{
            Arc,
            atomic::{AtomicU32, Ordering},
            mpsc,
        },
        thread,
        time::Duration,
    };

    use async_trait::async_trait;
    use coord_store::{ManualClock, RetryPolicy, StoreConfig};
    use serde::{Deserialize, Serialize};
    use tempfile::TempDir;

    use super::*;

    #[derive(Serialize, Deserialize)]
    struct Bump {
        by: u32,
    }

    impl TaskPayload for Bump {
        const TYPE_NAME: &'static str = "test.bump";
    }

    struct BumpCounter {
        by: u32,
        counter: Arc<AtomicU32>,
    }

    #[async_trait]
    impl DelayedTask for BumpCounter {
        async fn execute(&self) -> anyhow::Result<()> {
            self.counter.fetch_add(self.by, Ordering::SeqCst);
            Ok(())
        }
    }

    fn registry(counter: &Arc<AtomicU32>) -> TaskRegistry {
        let counter = Arc::clone(counter);
        let mut registry = TaskRegistry::new();
        registry.register_with(move |p: Bump| BumpCounter {
            by: p.by,
            counter: Arc::clone(&counter),
        });
        registry
    }

    fn open(dir: &TempDir, clock: &Arc<ManualClock>) -> DelayedTaskStore {
        let store =
            Store::open_with_clock(StoreConfig::new(dir.path().join("coord.db")), clock.clone()).unwrap();
        let cfg = RunnerConfig::default().with_store_retry(RetryPolicy::insert().with_delay(Duration::ZERO));
        DelayedTaskStore::new(store, cfg)
    }

    #[test]
    fn claimed_only_once_delay_elapsed() {
        let dir = TempDir::new().unwrap();
        let clock = Arc::new(ManualClock::new(1_000));
        let tasks = open(&dir, &clock);
        let registry = registry(&Arc::new(AtomicU32::new(0)));

        tasks.insert(&Bump { by: 1 }, 5, "").unwrap();

        clock.set(1_002);
        assert!(tasks.claim_one_due(&registry).unwrap().is_none());
        assert_eq!(tasks.pending().unwrap(), 1);

        clock.set(1_006);
        let claimed = tasks.claim_one_due(&registry).unwrap().unwrap();
        assert_eq!(claimed.record.execution_time, 1_005);
        assert_eq!(claimed.record.execution_delay, 5);
        assert_eq!(tasks.pending().unwrap(), 0);
        assert!(tasks.claim_one_due(&registry).unwrap().is_none());
    }

    #[test]
    fn earliest_execution_time_first() {
        let dir = TempDir::new().unwrap();
        let clock = Arc::new(ManualClock::new(1_000));
        let tasks = open(&dir, &clock);
        let registry = registry(&Arc::new(AtomicU32::new(0)));

        tasks.insert(&Bump { by: 1 }, 10, "late").unwrap();
        tasks.insert(&Bump { by: 2 }, 3, "early").unwrap();

        clock.advance(60);
        assert_eq!(tasks.claim_one_due(&registry).unwrap().unwrap().record.tag, "early");
        assert_eq!(tasks.claim_one_due(&registry).unwrap().unwrap().record.tag, "late");
    }

    #[test]
    fn skewed_record_is_claimed_early() {
        let dir = TempDir::new().unwrap();
        let clock = Arc::new(ManualClock::new(10_000));
        let tasks = open(&dir, &clock);
        let registry = registry(&Arc::new(AtomicU32::new(0)));

        tasks.insert(&Bump { by: 1 }, 3_600, "").unwrap();

        // Clock jumps back by more than the tolerance.
        clock.set(9_000);
        assert!(tasks.claim_one_due(&registry).unwrap().is_some());
    }

    #[test]
    fn removed_task_is_never_claimed() {
        let dir = TempDir::new().unwrap();
        let clock = Arc::new(ManualClock::new(1_000));
        let tasks = open(&dir, &clock);
        let registry = registry(&Arc::new(AtomicU32::new(0)));

        tasks.insert(&Bump { by: 1 }, 0, "t1").unwrap();
        tasks.insert(&Bump { by: 1 }, 0, "t1").unwrap();
        tasks.insert(&Bump { by: 1 }, 0, "t2").unwrap();
        assert!(tasks.check_exists("t1"));

        assert_eq!(tasks.remove("t1").unwrap(), 2);
        assert!(!tasks.check_exists("t1"));
        assert!(!tasks.check_exists(""));
        assert_eq!(tasks.remove("t1").unwrap(), 0);

        let claimed = tasks.claim_one_due(&registry).unwrap().unwrap();
        assert_eq!(claimed.record.tag, "t2");
        assert!(tasks.claim_one_due(&registry).unwrap().is_none());
    }

    #[tokio::test]
    async fn claimed_payload_executes_like_a_direct_call() {
        let dir = TempDir::new().unwrap();
        let clock = Arc::new(ManualClock::new(1_000));
        let tasks = open(&dir, &clock);

        let direct = Arc::new(AtomicU32::new(0));
        BumpCounter {
            by: 4,
            counter: Arc::clone(&direct),
        }
        .execute()
        .await
        .unwrap();

        let stored = Arc::new(AtomicU32::new(0));
        tasks.insert(&Bump { by: 4 }, 0, "").unwrap();
        let claimed = tasks.claim_one_due(&registry(&stored)).unwrap().unwrap();
        claimed.task.execute().await.unwrap();

        assert_eq!(stored.load(Ordering::SeqCst), direct.load(Ordering::SeqCst));
    }

    #[test]
    fn corrupt_payload_is_deleted_and_reported() {
        let dir = TempDir::new().unwrap();
        let clock = Arc::new(ManualClock::new(1_000));
        let tasks = open(&dir, &clock);

        tasks.insert(&Bump { by: 1 }, 0, "").unwrap();
        let err = tasks.claim_one_due(&TaskRegistry::new()).err().unwrap();

        assert!(matches!(err, DelayError::PayloadCorrupt { .. }));
        assert_eq!(tasks.pending().unwrap(), 0);
    }

    #[test]
    fn insert_gives_up_when_store_is_locked() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("coord.db");
        let holder = Store::open(StoreConfig::new(&path)).unwrap();
        let locked = Store::open(StoreConfig::new(&path).with_busy_timeout(Duration::from_millis(20))).unwrap();
        let cfg = RunnerConfig::default().with_store_retry(RetryPolicy::insert().with_delay(Duration::ZERO));
        let tasks = DelayedTaskStore::new(locked, cfg);

        let res: Result<(), StoreError> = holder.with_transaction(|_| {
            let err = tasks.insert(&Bump { by: 1 }, 0, "t").err().unwrap();
            assert!(matches!(err, DelayError::SchedulingFailure { attempts: 3, .. }));
            Ok(())
        });
        res.unwrap();
        assert!(!tasks.check_exists("t"));
    }

    #[test]
    fn remove_waits_out_a_briefly_held_lock() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("coord.db");
        let holder = Store::open(StoreConfig::new(&path)).unwrap();
        let waiter = Store::open(StoreConfig::new(&path).with_busy_timeout(Duration::from_millis(50))).unwrap();
        let cfg = RunnerConfig::default().with_store_retry(
            RetryPolicy::insert()
                .with_max_attempts(20)
                .with_delay(Duration::from_millis(20)),
        );
        let tasks = DelayedTaskStore::new(waiter, cfg);
        tasks.insert(&Bump { by: 1 }, 60, "t").unwrap();

        let (locked_tx, locked_rx) = mpsc::channel();
        let holding = thread::spawn(move || {
            holder
                .with_transaction(|_| {
                    locked_tx.send(()).unwrap();
                    thread::sleep(Duration::from_millis(300));
                    Ok::<_, StoreError>(())
                })
                .unwrap();
        });
        locked_rx.recv().unwrap();

        let removed = tasks.remove("t");
        holding.join().unwrap();

        assert_eq!(removed.unwrap(), 1);
        assert!(!tasks.check_exists("t"));
    }

    #[test]
    fn remove_reports_lock_timeout_once_retries_run_out() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("coord.db");
        let holder = Store::open(StoreConfig::new(&path)).unwrap();
        let locked = Store::open(StoreConfig::new(&path).with_busy_timeout(Duration::from_millis(20))).unwrap();
        let cfg = RunnerConfig::default().with_store_retry(RetryPolicy::insert().with_delay(Duration::ZERO));
        let tasks = DelayedTaskStore::new(locked, cfg);
        tasks.insert(&Bump { by: 1 }, 60, "t").unwrap();

        let res: Result<(), StoreError> = holder.with_transaction(|_| {
            let err = tasks.remove("t").err().unwrap();
            assert!(matches!(err, DelayError::Store(ref e) if e.is_transient()));
            Ok(())
        });
        res.unwrap();
        assert!(tasks.check_exists("t"));
    }
}
