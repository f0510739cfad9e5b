use serde::{Deserialize, Serialize};

use crate::{Basename, Owner, Seq, UnixTime};

/// One allocated-or-free unit of identifier space.
///
/// `(basename, seq)` is unique. A free slot has an empty owner and `assigned == false`;
/// it stays in the store so the number can be handed out again, unless compaction
/// removes it because no assigned slot sits above it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SequenceSlot {
    /// Namespace the number belongs to.
    pub basename: Basename,
    /// The number itself.
    pub seq: Seq,
    /// Allocator identity holding the slot.
    pub owner: Owner,
    /// Whether the slot is currently handed out.
    pub assigned: bool,
    /// Store time of the last state change.
    pub stamp: UnixTime,
}

impl SequenceSlot {
    /// Returns `true` if the slot can be handed out again.
    pub fn is_free(&self) -> bool {
        !self.assigned
    }
}
