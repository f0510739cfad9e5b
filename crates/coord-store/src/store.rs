use std::{
    ops::Deref,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
};

use coord_model::UnixTime;
use rusqlite::{Connection, Params, Row, Transaction, TransactionBehavior};
use tracing::{debug, info, instrument};

use crate::{
    clock::{Clock, StoreClock},
    config::StoreConfig,
    error::StoreError,
    schema,
};

/// Handle to the shared database.
///
/// Cloning is cheap; clones share one connection. Processes (or threads that want
/// independent lock contention) open their own `Store` on the same path.
#[derive(Clone)]
pub struct Store {
    inner: Arc<StoreInner>,
}

struct StoreInner {
    conn: Mutex<Connection>,
    cfg: StoreConfig,
    clock: Arc<dyn Clock>,
}

impl Store {
    /// Open (and create if needed) the database using the database clock.
    pub fn open(cfg: StoreConfig) -> Result<Self, StoreError> {
        Self::open_with_clock(cfg, Arc::new(StoreClock))
    }

    #[instrument(level = "debug", skip(cfg, clock), fields(path = %cfg.path.display()))]
    pub fn open_with_clock(cfg: StoreConfig, clock: Arc<dyn Clock>) -> Result<Self, StoreError> {
        if let Some(parent) = cfg.path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent)?;
        }

        let conn = connect(&cfg)?;
        schema::ensure(&conn)?;
        info!(path = %cfg.path.display(), "store opened");

        Ok(Self {
            inner: Arc::new(StoreInner {
                conn: Mutex::new(conn),
                cfg,
                clock,
            }),
        })
    }

    pub fn config(&self) -> &StoreConfig {
        &self.inner.cfg
    }

    /// Current time according to the store clock.
    pub fn now(&self) -> Result<UnixTime, StoreError> {
        let conn = self.lock();
        self.inner.clock.now(&*conn)
    }

    /// Run `f` on the connection outside of any explicit transaction.
    ///
    /// Reads issued here take no lock and may be stale by the time they return.
    pub fn with_connection<T, E, F>(&self, f: F) -> Result<T, E>
    where
        F: FnOnce(&Connection) -> Result<T, E>,
        E: From<StoreError>,
    {
        let conn = self.lock();
        f(&*conn)
    }

    /// Run `f` inside one locking transaction.
    ///
    /// The write lock is taken before `f` runs and held until commit. `Ok` commits,
    /// `Err` (or a panic) rolls every statement back.
    pub fn with_transaction<T, E, F>(&self, f: F) -> Result<T, E>
    where
        F: FnOnce(&Tx<'_>) -> Result<T, E>,
        E: From<StoreError>,
    {
        let mut conn = self.lock();
        let inner = conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .map_err(StoreError::from)?;
        let now = self.inner.clock.now(&*inner)?;

        let tx = Tx { inner, now };
        let out = f(&tx)?;
        tx.inner.commit().map_err(StoreError::from)?;
        Ok(out)
    }

    /// Drop the current connection and open a new one.
    ///
    /// Clears sessions left in a bad state by lock timeouts or a dropped link.
    pub fn reset(&self) -> Result<(), StoreError> {
        let mut conn = self.lock();
        *conn = connect(&self.inner.cfg)?;
        debug!(path = %self.inner.cfg.path.display(), "store connection reset");
        Ok(())
    }

    // A panic inside a transaction closure rolls back when the transaction drops,
    // so the connection behind a poisoned lock is still consistent.
    fn lock(&self) -> MutexGuard<'_, Connection> {
        self.inner
            .conn
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }
}

/// An open locking transaction.
///
/// Derefs to [`Connection`] for plain statements.
pub struct Tx<'c> {
    inner: Transaction<'c>,
    now: UnixTime,
}

impl Tx<'_> {
    /// Store time captured when the transaction started.
    pub fn now(&self) -> UnixTime {
        self.now
    }

    /// Read the rows matching `sql` while holding the write lock.
    ///
    /// The lock was taken when the transaction began, so the rows cannot change
    /// under the caller until commit.
    pub fn select_for_update<T, P, F>(&self, sql: &str, params: P, f: F) -> Result<Vec<T>, StoreError>
    where
        P: Params,
        F: FnMut(&Row<'_>) -> rusqlite::Result<T>,
    {
        let mut stmt = self.inner.prepare(sql)?;
        let rows = stmt.query_map(params, f)?;
        let out = rows.collect::<Result<Vec<_>, _>>()?;
        Ok(out)
    }
}

impl Deref for Tx<'_> {
    type Target = Connection;

    fn deref(&self) -> &Connection {
        &*self.inner
    }
}

fn connect(cfg: &StoreConfig) -> Result<Connection, StoreError> {
    let conn = Connection::open(&cfg.path)?;
    conn.busy_timeout(cfg.busy_timeout)?;
    if cfg.wal {
        conn.pragma_update(None, "journal_mode", "WAL")?;
    }
    Ok(conn)
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use rusqlite::params;
    use tempfile::TempDir;

    use super::*;
    use crate::clock::ManualClock;

    fn open(dir: &TempDir) -> Store {
        Store::open(StoreConfig::new(dir.path().join("coord.db"))).unwrap()
    }

    fn count_slots(store: &Store) -> i64 {
        store
            .with_connection(|c| {
                c.query_row("SELECT COUNT(*) FROM sequence_slot", [], |r| r.get(0))
                    .map_err(StoreError::from)
            })
            .unwrap()
    }

    #[test]
    fn open_creates_schema_and_parent_dir() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("nested").join("coord.db");
        let store = Store::open(StoreConfig::new(&path)).unwrap();

        assert!(path.exists());
        assert_eq!(count_slots(&store), 0);
        assert!(store.now().unwrap() > 0);
    }

    #[test]
    fn transaction_commits_on_ok() {
        let dir = TempDir::new().unwrap();
        let store = open(&dir);

        store
            .with_transaction(|tx| {
                tx.execute(
                    "INSERT INTO sequence_slot (basename, seq, owner, assigned, stamp) VALUES ('a', 1, 'o', 1, ?1)",
                    params![tx.now()],
                )
                .map_err(StoreError::from)
            })
            .unwrap();

        assert_eq!(count_slots(&store), 1);
    }

    #[test]
    fn transaction_rolls_back_on_err() {
        let dir = TempDir::new().unwrap();
        let store = open(&dir);

        let res: Result<(), StoreError> = store.with_transaction(|tx| {
            tx.execute(
                "INSERT INTO sequence_slot (basename, seq, owner, assigned, stamp) VALUES ('a', 1, 'o', 1, 0)",
                [],
            )?;
            tx.execute(
                "INSERT INTO sequence_slot (basename, seq, owner, assigned, stamp) VALUES ('a', 1, 'o', 1, 0)",
                [],
            )?;
            Ok(())
        });

        assert!(res.unwrap_err().is_integrity_conflict());
        assert_eq!(count_slots(&store), 0);
    }

    #[test]
    fn second_locker_times_out_as_transient() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("coord.db");
        let holder = Store::open(StoreConfig::new(&path)).unwrap();
        let waiter =
            Store::open(StoreConfig::new(&path).with_busy_timeout(Duration::from_millis(50))).unwrap();

        let inner: Result<(), StoreError> = holder.with_transaction(|_tx| {
            let res: Result<(), StoreError> = waiter.with_transaction(|_| Ok(()));
            assert!(res.unwrap_err().is_transient());
            Ok(())
        });
        inner.unwrap();

        // Lock released after commit.
        let res: Result<(), StoreError> = waiter.with_transaction(|_| Ok(()));
        assert!(res.is_ok());
    }

    #[test]
    fn transaction_sees_manual_clock() {
        let dir = TempDir::new().unwrap();
        let clock = Arc::new(ManualClock::new(1_000));
        let store =
            Store::open_with_clock(StoreConfig::new(dir.path().join("c.db")), clock.clone()).unwrap();

        clock.advance(30);
        let seen: i64 = store
            .with_transaction(|tx| Ok::<_, StoreError>(tx.now()))
            .unwrap();
        assert_eq!(seen, 1_030);
        assert_eq!(store.now().unwrap(), 1_030);
    }

    #[test]
    fn select_for_update_returns_rows() {
        let dir = TempDir::new().unwrap();
        let store = open(&dir);

        let seqs: Vec<i64> = store
            .with_transaction(|tx| {
                for seq in [3, 1, 2] {
                    tx.execute(
                        "INSERT INTO sequence_slot (basename, seq, owner, assigned, stamp) VALUES ('b', ?1, '', 0, 0)",
                        params![seq],
                    )?;
                }
                tx.select_for_update(
                    "SELECT seq FROM sequence_slot WHERE basename = ?1 ORDER BY seq",
                    params!["b"],
                    |r| r.get(0),
                )
            })
            .unwrap();

        assert_eq!(seqs, vec![1, 2, 3]);
    }

    #[test]
    fn reset_keeps_data() {
        let dir = TempDir::new().unwrap();
        let store = open(&dir);
        store
            .with_transaction(|tx| {
                tx.execute(
                    "INSERT INTO sequence_slot (basename, seq, owner, assigned, stamp) VALUES ('a', 1, 'o', 1, 0)",
                    [],
                )
                .map_err(StoreError::from)
            })
            .unwrap();

        store.reset().unwrap();
        assert_eq!(count_slots(&store), 1);
    }
}
