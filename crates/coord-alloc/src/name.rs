use coord_model::{DEFAULT_NAME_DIGITS, MAX_NAME_DIGITS, Seq};
use coord_store::{RetryPolicy, Store};
use tracing::debug;

use crate::{error::AllocError, sequence::SequenceAllocator};

/// Allocator of `<base><zero-padded number>` names, e.g. `ws00042`.
///
/// Each base is its own basename in the sequence space, so `ws` and `vm` count
/// independently.
#[derive(Clone)]
pub struct NameAllocator {
    seq: SequenceAllocator,
}

impl NameAllocator {
    pub const TYPE_NAME: &'static str = "name";

    pub fn new(store: Store, owner: &str) -> Self {
        Self {
            seq: SequenceAllocator::new(store, Self::TYPE_NAME, owner),
        }
    }

    pub fn with_retry(self, retry: RetryPolicy) -> Self {
        Self {
            seq: self.seq.with_retry(retry),
        }
    }

    pub fn owner(&self) -> &str {
        self.seq.owner()
    }

    /// Allocate the lowest free name for `base` with `digits` digits.
    pub fn get(&self, base: &str, digits: u32) -> Result<String, AllocError> {
        let max = max_for_digits(digits)?;
        let seq = self
            .seq
            .with_basename(base)
            .get(0..=max)
            .map_err(|e| match e {
                AllocError::Exhausted { basename, .. } => AllocError::NoNamesAvailable { basename, digits },
                other => other,
            })?;

        let name = format_name(base, seq, digits);
        debug!(%name, "name allocated");
        Ok(name)
    }

    /// [`NameAllocator::get`] with the default number of digits.
    pub fn get_default(&self, base: &str) -> Result<String, AllocError> {
        self.get(base, DEFAULT_NAME_DIGITS)
    }

    /// Return `name` to the pool of `base`.
    pub fn free(&self, base: &str, name: &str) -> Result<bool, AllocError> {
        let seq = parse_name(base, name)?;
        self.seq.with_basename(base).free(seq)
    }

    /// Hand `name` over to another identity.
    pub fn transfer(&self, base: &str, name: &str, to: &NameAllocator) -> Result<bool, AllocError> {
        let seq = parse_name(base, name)?;
        self.seq
            .with_basename(base)
            .transfer(seq, &to.seq.with_basename(base))
    }

    /// Free every name held by this identity.
    pub fn release(&self) -> Result<usize, AllocError> {
        self.seq.release()
    }
}

/// Largest number that fits in `digits` decimal digits.
pub fn max_for_digits(digits: u32) -> Result<Seq, AllocError> {
    if !(1..=MAX_NAME_DIGITS).contains(&digits) {
        return Err(AllocError::InvalidDigits {
            digits,
            max: MAX_NAME_DIGITS,
        });
    }
    Ok(10_i64.pow(digits) - 1)
}

pub fn format_name(base: &str, seq: Seq, digits: u32) -> String {
    format!("{base}{seq:0width$}", width = digits as usize)
}

/// Number encoded in `name`, which must be `base` followed by decimal digits only.
pub fn parse_name(base: &str, name: &str) -> Result<Seq, AllocError> {
    let invalid = || AllocError::InvalidName {
        basename: base.to_string(),
        name: name.to_string(),
    };

    let digits = name.strip_prefix(base).ok_or_else(invalid)?;
    if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return Err(invalid());
    }
    digits.parse().map_err(|_| invalid())
}
