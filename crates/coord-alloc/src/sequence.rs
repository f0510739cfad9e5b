use std::ops::RangeInclusive;

use coord_model::{Basename, DEFAULT_BASENAME, MAX_SEQ, Owner, SequenceSlot, Seq, UnixTime};
use coord_store::{RetryAction, RetryPolicy, Store, Tx};
use rusqlite::{OptionalExtension, params};
use tracing::{debug, instrument, trace, warn};

use crate::error::AllocError;

/// Allocator of unique integers inside a basename.
///
/// The identity is `owner + type_name`, so two subsystems of the same owner never
/// release each other's slots. Every call re-reads the store under the write lock;
/// nothing about the sequence space is cached in memory.
#[derive(Clone)]
pub struct SequenceAllocator {
    store: Store,
    owner: Owner,
    basename: Basename,
    retry: RetryPolicy,
}

impl SequenceAllocator {
    pub fn new(store: Store, type_name: &str, owner: &str) -> Self {
        Self {
            store,
            owner: format!("{owner}{type_name}"),
            basename: DEFAULT_BASENAME.to_string(),
            retry: RetryPolicy::allocator(),
        }
    }

    /// Same identity, scoped to another basename.
    pub fn with_basename(&self, basename: impl Into<Basename>) -> Self {
        Self {
            basename: basename.into(),
            ..self.clone()
        }
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn owner(&self) -> &str {
        &self.owner
    }

    pub fn basename(&self) -> &str {
        &self.basename
    }

    /// Allocate the lowest available number in `range`.
    ///
    /// Reuses the lowest freed slot if there is one, otherwise creates the slot right
    /// after the highest assigned one (or at the range start).
    #[instrument(level = "debug", skip(self), fields(basename = %self.basename, owner = %self.owner))]
    pub fn get(&self, range: RangeInclusive<Seq>) -> Result<Seq, AllocError> {
        let (start, end) = (*range.start(), *range.end());
        if start < 0 || start > end {
            return Err(AllocError::InvalidRange { start, end });
        }

        let seq = self.retrying(true, || self.try_get(start, end))?;
        trace!(seq, "sequence allocated");
        Ok(seq)
    }

    /// Allocate anywhere in `0..=MAX_SEQ`.
    pub fn get_any(&self) -> Result<Seq, AllocError> {
        self.get(0..=MAX_SEQ)
    }

    /// Return `seq` to the pool. Returns `false` if this identity did not hold it.
    #[instrument(level = "debug", skip(self), fields(basename = %self.basename, owner = %self.owner))]
    pub fn free(&self, seq: Seq) -> Result<bool, AllocError> {
        let freed = self.retrying(false, || {
            self.store.with_transaction(|tx| {
                let n = tx.execute(
                    "UPDATE sequence_slot SET owner = '', assigned = 0, stamp = ?1
                     WHERE basename = ?2 AND owner = ?3 AND seq = ?4",
                    params![tx.now(), self.basename, self.owner, seq],
                )?;
                if n > 0 {
                    purge_in(tx, &self.basename)?;
                }
                Ok::<_, AllocError>(n > 0)
            })
        })?;

        if !freed {
            debug!(seq, "nothing to free");
        }
        Ok(freed)
    }

    /// Hand `seq` over to another identity without making it available to anyone else.
    #[instrument(level = "debug", skip(self, to), fields(basename = %self.basename, owner = %self.owner, to = %to.owner))]
    pub fn transfer(&self, seq: Seq, to: &SequenceAllocator) -> Result<bool, AllocError> {
        self.retrying(false, || {
            self.store.with_transaction(|tx| {
                let n = tx.execute(
                    "UPDATE sequence_slot SET owner = ?1, basename = ?2, stamp = ?3
                     WHERE basename = ?4 AND owner = ?5 AND seq = ?6",
                    params![to.owner, to.basename, tx.now(), self.basename, self.owner, seq],
                )?;
                if n > 0 && to.basename != self.basename {
                    purge_in(tx, &self.basename)?;
                }
                Ok::<_, AllocError>(n > 0)
            })
        })
    }

    /// Free every slot held by this identity, in every basename.
    #[instrument(level = "debug", skip(self), fields(owner = %self.owner))]
    pub fn release(&self) -> Result<usize, AllocError> {
        self.release_where(None)
    }

    /// Free every slot held by this identity whose last change is older than `stamp`.
    #[instrument(level = "debug", skip(self), fields(owner = %self.owner))]
    pub fn release_older_than(&self, stamp: UnixTime) -> Result<usize, AllocError> {
        self.release_where(Some(stamp))
    }

    /// Drop the free tail of this basename.
    pub fn purge(&self) -> Result<usize, AllocError> {
        self.retrying(false, || {
            self.store
                .with_transaction(|tx| purge_in(tx, &self.basename))
        })
    }

    /// Slots of this basename ordered by seq.
    pub fn slots(&self) -> Result<Vec<SequenceSlot>, AllocError> {
        self.store.with_connection(|conn| {
            let mut stmt = conn.prepare(
                "SELECT basename, seq, owner, assigned, stamp FROM sequence_slot
                 WHERE basename = ?1 ORDER BY seq",
            )?;
            let rows = stmt.query_map(params![self.basename], slot_from_row)?;
            let slots = rows.collect::<Result<Vec<_>, _>>()?;
            Ok(slots)
        })
    }

    fn try_get(&self, start: Seq, end: Seq) -> Result<Seq, AllocError> {
        self.store.with_transaction(|tx| {
            let now = tx.now();

            let free = tx
                .select_for_update(
                    "SELECT seq FROM sequence_slot
                     WHERE basename = ?1 AND seq >= ?2 AND seq <= ?3 AND assigned = 0
                     ORDER BY seq LIMIT 1",
                    params![self.basename, start, end],
                    |row| row.get::<_, Seq>(0),
                )?
                .into_iter()
                .next();

            if let Some(seq) = free {
                tx.execute(
                    "UPDATE sequence_slot SET owner = ?1, assigned = 1, stamp = ?2
                     WHERE basename = ?3 AND seq = ?4",
                    params![self.owner, now, self.basename, seq],
                )?;
                return Ok(seq);
            }

            let last: Option<Seq> = tx
                .query_row(
                    "SELECT MAX(seq) FROM sequence_slot
                     WHERE basename = ?1 AND seq >= ?2 AND seq <= ?3 AND assigned = 1",
                    params![self.basename, start, end],
                    |row| row.get(0),
                )
                .optional()?
                .flatten();

            let seq = last.map_or(start, |last| last + 1);
            if seq > end {
                return Err(AllocError::Exhausted {
                    basename: self.basename.clone(),
                    start,
                    end,
                });
            }

            // A racer that created the same seq first makes this insert fail with an
            // integrity conflict; the retry loop then sees its row and moves past it.
            tx.execute(
                "INSERT INTO sequence_slot (basename, seq, owner, assigned, stamp)
                 VALUES (?1, ?2, ?3, 1, ?4)",
                params![self.basename, seq, self.owner, now],
            )?;
            Ok(seq)
        })
    }

    fn release_where(&self, older_than: Option<UnixTime>) -> Result<usize, AllocError> {
        let released = self.retrying(false, || {
            self.store.with_transaction(|tx| {
                let cutoff = older_than.unwrap_or(UnixTime::MAX);
                let basenames = tx.select_for_update(
                    "SELECT DISTINCT basename FROM sequence_slot
                     WHERE owner = ?1 AND assigned = 1 AND stamp < ?2",
                    params![self.owner, cutoff],
                    |row| row.get::<_, String>(0),
                )?;
                let n = tx.execute(
                    "UPDATE sequence_slot SET owner = '', assigned = 0, stamp = ?1
                     WHERE owner = ?2 AND assigned = 1 AND stamp < ?3",
                    params![tx.now(), self.owner, cutoff],
                )?;
                for basename in &basenames {
                    purge_in(tx, basename)?;
                }
                Ok::<_, AllocError>(n)
            })
        })?;

        debug!(released, "released owned slots");
        Ok(released)
    }

    /// Runs `op` under the retry policy: transient store errors pause and retry,
    /// integrity conflicts (when `conflicts` is set) retry immediately.
    fn retrying<T, F>(&self, conflicts: bool, op: F) -> Result<T, AllocError>
    where
        F: FnMut() -> Result<T, AllocError>,
    {
        let classify = |e: &AllocError| match e {
            AllocError::Store(e) if conflicts && e.is_integrity_conflict() => RetryAction::Immediately,
            AllocError::Store(e) if e.is_transient() => RetryAction::AfterPause,
            _ => RetryAction::GiveUp,
        };

        self.retry.run(&self.store, op, classify).map_err(|f| {
            if !f.exhausted {
                return f.error;
            }
            warn!(attempts = f.attempts, basename = %self.basename, error = %f.error, "giving up after repeated store failures");
            AllocError::RetriesExhausted {
                basename: self.basename.clone(),
                attempts: f.attempts,
            }
        })
    }
}

/// Delete every slot of `basename` above the highest assigned one.
fn purge_in(tx: &Tx<'_>, basename: &str) -> Result<usize, AllocError> {
    let last: Option<Seq> = tx.query_row(
        "SELECT MAX(seq) FROM sequence_slot WHERE basename = ?1 AND assigned = 1",
        params![basename],
        |row| row.get(0),
    )?;

    let removed = match last {
        Some(last) => tx.execute(
            "DELETE FROM sequence_slot WHERE basename = ?1 AND seq > ?2",
            params![basename, last],
        )?,
        None => tx.execute(
            "DELETE FROM sequence_slot WHERE basename = ?1",
            params![basename],
        )?,
    };

    if removed > 0 {
        trace!(basename, removed, "purged free tail");
    }
    Ok(removed)
}

fn slot_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<SequenceSlot> {
    Ok(SequenceSlot {
        basename: row.get(0)?,
        seq: row.get(1)?,
        owner: row.get(2)?,
        assigned: row.get(3)?,
        stamp: row.get(4)?,
    })
}
