//! Shared records for the coordination store.
//!
//! Types here describe rows as the store persists them; they carry no store handle
//! and perform no I/O.

mod domain;
pub use domain::*;
