//! Collision-free identifiers drawn from the shared store.
//!
//! [`SequenceAllocator`] hands out integers per basename; [`NameAllocator`] and
//! [`MacAllocator`] format those integers as names and MAC addresses.

mod error;
pub use error::AllocError;

mod sequence;
pub use sequence::SequenceAllocator;

mod name;
pub use name::NameAllocator;

mod mac;
pub use mac::MacAllocator;

pub mod prelude {
    pub use crate::error::AllocError;
    pub use crate::{MacAllocator, NameAllocator, SequenceAllocator};
}
