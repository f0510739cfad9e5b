use coord_model::Seq;
use coord_store::{RetryPolicy, Store};

use crate::{error::AllocError, sequence::SequenceAllocator};

const MAC_MAX: Seq = 0xFFFF_FFFF_FFFF;

/// Allocator of MAC addresses inside an operator-supplied range.
#[derive(Clone)]
pub struct MacAllocator {
    seq: SequenceAllocator,
}

impl MacAllocator {
    pub const TYPE_NAME: &'static str = "mac";

    pub fn new(store: Store, owner: &str) -> Self {
        Self {
            seq: SequenceAllocator::new(store, Self::TYPE_NAME, owner).with_basename(Self::TYPE_NAME),
        }
    }

    pub fn with_retry(self, retry: RetryPolicy) -> Self {
        Self {
            seq: self.seq.with_retry(retry),
        }
    }

    /// Allocate the lowest free address of `range` (`"first-last"`).
    pub fn get(&self, range: &str) -> Result<String, AllocError> {
        let (start, end) = parse_mac_range(range)?;
        Ok(format_mac(self.seq.get(start..=end)?))
    }

    pub fn free(&self, mac: &str) -> Result<bool, AllocError> {
        self.seq.free(parse_mac(mac)?)
    }

    pub fn transfer(&self, mac: &str, to: &MacAllocator) -> Result<bool, AllocError> {
        self.seq.transfer(parse_mac(mac)?, &to.seq)
    }

    pub fn release(&self) -> Result<usize, AllocError> {
        self.seq.release()
    }
}

/// Parses `AA:BB:CC:DD:EE:FF` (case-insensitive, `-` also accepted as separator).
pub fn parse_mac(mac: &str) -> Result<Seq, AllocError> {
    let invalid = || AllocError::InvalidMac(mac.to_string());

    let parts: Vec<&str> = mac.trim().split([':', '-']).collect();
    if parts.len() != 6 {
        return Err(invalid());
    }

    parts.iter().try_fold(0_i64, |acc, part| {
        if part.len() != 2 {
            return Err(invalid());
        }
        let byte = u8::from_str_radix(part, 16).map_err(|_| invalid())?;
        Ok((acc << 8) | Seq::from(byte))
    })
}

/// Parses `"<first>-<last>"`, both ends inclusive.
pub fn parse_mac_range(range: &str) -> Result<(Seq, Seq), AllocError> {
    let (first, last) = range
        .split_once('-')
        .filter(|(a, b)| !a.contains('-') && !b.contains('-'))
        .ok_or_else(|| AllocError::InvalidMac(range.to_string()))?;

    let (start, end) = (parse_mac(first)?, parse_mac(last)?);
    if start > end {
        return Err(AllocError::InvalidRange { start, end });
    }
    Ok((start, end))
}

pub fn format_mac(value: Seq) -> String {
    let value = value & MAC_MAX;
    (0..6)
        .rev()
        .map(|i| format!("{:02X}", (value >> (i * 8)) & 0xFF))
        .collect::<Vec<_>>()
        .join(":")
}
