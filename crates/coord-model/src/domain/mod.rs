mod constants;
pub use constants::{DEFAULT_BASENAME, DEFAULT_NAME_DIGITS, MAX_NAME_DIGITS, MAX_SEQ};

mod task_id;
pub use task_id::TaskId;

mod sequence_slot;
pub use sequence_slot::SequenceSlot;

mod delayed_task;
pub use delayed_task::DelayedTaskRecord;

/// Namespace key partitioning the sequence space.
pub type Basename = String;

/// Identity of an allocator holding slots.
///
/// Empty when a slot is free.
pub type Owner = String;

/// Sequence number inside a basename.
pub type Seq = i64;

/// Seconds since the unix epoch, as seen by the store clock.
pub type UnixTime = i64;
