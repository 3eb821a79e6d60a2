//! Memory retention policies.
//!
//! A retention policy answers one question per processed frame: should the
//! (key, value) pair derived from frame `i` be committed to the
//! [`MemoryBank`][crate::bank::MemoryBank]?
//!
//! Two mutually exclusive modes exist:
//!
//! - **Fixed interval** (`mem_every = k`): frame `i` is a memory frame iff
//!   `i mod k == 0`.  Memory grows linearly with sequence length.
//! - **Fixed budget** (`mem_number = m`): the memory frames are
//!   `round(i * num_frames / m)` for `i in 0..m`, i.e. `m` indices evenly
//!   spaced over `[0, num_frames)` with the endpoint excluded.  Rounding is
//!   half-to-even.
//!
//! Both modes always include frame 0.
//!
//! # Example
//!
//! ```rust
//! use vos_memory::retention::RetentionSpec;
//!
//! let policy = RetentionSpec::every(5).resolve().unwrap();
//! assert_eq!(policy.memory_frames(12), vec![0, 5, 10]);
//!
//! let policy = RetentionSpec::number(3).resolve().unwrap();
//! assert_eq!(policy.memory_frames(12), vec![0, 4, 8]);
//!
//! // Supplying both parameters is a configuration error.
//! let both = RetentionSpec { mem_every: Some(5), mem_number: Some(3) };
//! assert!(both.resolve().is_err());
//! ```

use std::num::NonZeroUsize;

use serde::{Deserialize, Serialize};
use vos_types::VosError;

// ─────────────────────────────────────────────────────────────────────────────
// RetentionSpec
// ─────────────────────────────────────────────────────────────────────────────

/// The raw retention parameters as supplied by a caller or config file.
///
/// Exactly one field must be set; [`RetentionSpec::resolve`] enforces this.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct RetentionSpec {
    /// Commit every `k`-th frame.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mem_every: Option<usize>,
    /// Commit exactly `m` evenly spaced frames.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mem_number: Option<usize>,
}

impl RetentionSpec {
    pub fn every(k: usize) -> Self {
        Self {
            mem_every: Some(k),
            mem_number: None,
        }
    }

    pub fn number(m: usize) -> Self {
        Self {
            mem_every: None,
            mem_number: Some(m),
        }
    }

    /// Validate the parameters and produce a [`RetentionPolicy`].
    ///
    /// # Errors
    ///
    /// Returns [`VosError::Configuration`] when both or neither parameter is
    /// set, or when the supplied one is zero.
    pub fn resolve(&self) -> Result<RetentionPolicy, VosError> {
        match (self.mem_every, self.mem_number) {
            (Some(_), Some(_)) => Err(VosError::Configuration(
                "mem_every and mem_number are mutually exclusive; supply exactly one".to_string(),
            )),
            (None, None) => Err(VosError::Configuration(
                "no retention policy: supply mem_every or mem_number".to_string(),
            )),
            (Some(k), None) => NonZeroUsize::new(k)
                .map(RetentionPolicy::FixedInterval)
                .ok_or_else(|| {
                    VosError::Configuration("mem_every must be at least 1".to_string())
                }),
            (None, Some(m)) => NonZeroUsize::new(m)
                .map(RetentionPolicy::FixedBudget)
                .ok_or_else(|| {
                    VosError::Configuration("mem_number must be at least 1".to_string())
                }),
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// RetentionPolicy
// ─────────────────────────────────────────────────────────────────────────────

/// A validated retention policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetentionPolicy {
    FixedInterval(NonZeroUsize),
    FixedBudget(NonZeroUsize),
}

impl RetentionPolicy {
    /// Sorted, de-duplicated indices of the memory frames of a sequence with
    /// `num_frames` frames.
    ///
    /// With a fixed budget larger than `num_frames` every frame is a memory
    /// frame.
    pub fn memory_frames(&self, num_frames: usize) -> Vec<usize> {
        match *self {
            RetentionPolicy::FixedInterval(k) => (0..num_frames).step_by(k.get()).collect(),
            RetentionPolicy::FixedBudget(m) => {
                let m = m.get();
                let step = num_frames as f64 / m as f64;
                let mut frames: Vec<usize> = (0..m)
                    .map(|i| (i as f64 * step).round_ties_even() as usize)
                    .filter(|&i| i < num_frames)
                    .collect();
                frames.dedup();
                frames
            }
        }
    }

    /// `true` if frame `index` of a `num_frames`-long sequence is a memory
    /// frame.
    pub fn is_memory_frame(&self, index: usize, num_frames: usize) -> bool {
        if index >= num_frames {
            return false;
        }
        match *self {
            RetentionPolicy::FixedInterval(k) => index % k.get() == 0,
            RetentionPolicy::FixedBudget(_) => self.memory_frames(num_frames).contains(&index),
        }
    }

    /// Upper bound on the number of commits for a sequence of `num_frames`.
    pub fn capacity_hint(&self, num_frames: usize) -> usize {
        match *self {
            RetentionPolicy::FixedInterval(k) => num_frames.div_ceil(k.get()),
            RetentionPolicy::FixedBudget(m) => m.get().min(num_frames),
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
