use super::Seq;

/// Default upper bound of an allocation range.
pub const MAX_SEQ: Seq = 1_000_000_000_000_000;

/// Basename used by allocators that were not given one.
pub const DEFAULT_BASENAME: &str = "coord";

/// Default width of the numeric suffix of generated names.
pub const DEFAULT_NAME_DIGITS: u32 = 5;

/// Widest numeric suffix a name can carry while staying below [`MAX_SEQ`].
pub const MAX_NAME_DIGITS: u32 = 15;
