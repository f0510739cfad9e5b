use std::sync::atomic::{AtomicI64, Ordering};

use coord_model::UnixTime;
use rusqlite::Connection;

use crate::error::StoreError;

/// Source of "now" for due-date and stamp decisions.
///
/// Decisions must not depend on the local clock of whichever host runs them,
/// so the default implementation asks the database.
pub trait Clock: Send + Sync + 'static {
    fn now(&self, conn: &Connection) -> Result<UnixTime, StoreError>;
}

/// Reads the current time from SQLite.
#[derive(Debug, Default, Clone, Copy)]
pub struct StoreClock;

impl Clock for StoreClock {
    fn now(&self, conn: &Connection) -> Result<UnixTime, StoreError> {
        conn.query_row("SELECT CAST(strftime('%s', 'now') AS INTEGER)", [], |row| {
            row.get(0)
        })
        .map_err(StoreError::from)
    }
}

/// Clock that only moves when told to.
#[derive(Debug, Default)]
pub struct ManualClock {
    now: AtomicI64,
}

impl ManualClock {
    pub fn new(start: UnixTime) -> Self {
        Self {
            now: AtomicI64::new(start),
        }
    }

    pub fn get(&self) -> UnixTime {
        self.now.load(Ordering::SeqCst)
    }

    pub fn set(&self, now: UnixTime) {
        self.now.store(now, Ordering::SeqCst);
    }

    /// Move the clock by `secs` (negative values move it backwards) and return the new time.
    pub fn advance(&self, secs: i64) -> UnixTime {
        self.now.fetch_add(secs, Ordering::SeqCst) + secs
    }
}

impl Clock for ManualClock {
    fn now(&self, _conn: &Connection) -> Result<UnixTime, StoreError> {
        Ok(self.get())
    }
}
