//! `vos-memory` – The external memory of the propagation loop.
//!
//! # Modules
//!
//! - [`bank`] – [`MemoryBank`][bank::MemoryBank]: an append-only arena of
//!   per-frame (key, value) entries with a lazily materialised, time-axis
//!   concatenated [`MemoryView`][bank::MemoryView].
//! - [`retention`] – [`RetentionPolicy`][retention::RetentionPolicy]: decides
//!   which frames are committed to the bank (fixed interval or fixed budget),
//!   and [`RetentionSpec`][retention::RetentionSpec], its raw two-parameter
//!   configuration form.

pub mod bank;
pub mod retention;

pub use bank::{MemoryBank, MemoryEntry, MemoryView};
pub use retention::{RetentionPolicy, RetentionSpec};
