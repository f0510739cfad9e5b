use serde::{Deserialize, Serialize};

use crate::{TaskId, UnixTime};

/// One pending unit of deferred work as persisted in the store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DelayedTaskRecord {
    /// Internal row identifier.
    pub id: TaskId,
    /// Registered type name used to pick the decoder.
    pub type_name: String,
    /// Opaque serialized payload.
    pub instance: String,
    /// Store time at insertion.
    pub insert_date: UnixTime,
    /// Requested delay in seconds.
    pub execution_delay: u64,
    /// `insert_date + execution_delay`.
    pub execution_time: UnixTime,
    /// Caller supplied dedup/cancellation key; empty when absent.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub tag: String,
}

impl DelayedTaskRecord {
    /// Returns `true` if the record was inserted more than `tolerance` seconds in the future
    /// of `now`, which happens when the store clock moved backwards.
    pub fn is_skewed(&self, now: UnixTime, tolerance: i64) -> bool {
        self.insert_date > now + tolerance
    }

    /// Returns `true` if the record may be claimed at `now`.
    ///
    /// Skewed records are treated as overdue so they are never stranded.
    pub fn is_due(&self, now: UnixTime, tolerance: i64) -> bool {
        self.execution_time <= now || self.is_skewed(now, tolerance)
    }
}
