//! Append-only memory bank.
//!
//! Stores the (key, value) pairs of committed memory frames for a single
//! video sequence and exposes them as one time-axis concatenation.
//!
//! # Layout
//!
//! Entries live in an arena (`Vec<MemoryEntry>`) and are never mutated or
//! removed.  The concatenated [`MemoryView`] is materialised lazily: each
//! [`MemoryBank::read_all`] copies only the entries appended since the
//! previous read into the cached view, so repeated reads between commits are
//! free and a commit costs one entry's worth of copying rather than a full
//! re-concatenation.
//!
//! # Example
//!
//! ```rust
//! use vos_memory::bank::MemoryBank;
//! use vos_types::{FeatureMap, KeyValue};
//!
//! let kv = KeyValue {
//!     key: FeatureMap::new(1, 1, 2, vec![0.1, 0.2]).unwrap(),
//!     value: FeatureMap::new(2, 1, 2, vec![1.0, 0.0, 0.0, 1.0]).unwrap(),
//! };
//!
//! let mut bank = MemoryBank::new();
//! assert!(bank.read_all().unwrap().is_none());
//!
//! bank.append(0, kv.clone());
//! bank.append(5, kv);
//! let view = bank.read_all().unwrap().unwrap();
//! assert_eq!(view.frames(), &[0, 5]);
//! ```

use tracing::{debug, trace};
use vos_types::{FeatureStack, KeyValue, VosError};

// ─────────────────────────────────────────────────────────────────────────────
// MemoryEntry
// ─────────────────────────────────────────────────────────────────────────────

/// One committed memory frame.
#[derive(Debug, Clone, PartialEq)]
pub struct MemoryEntry {
    /// Index of the frame the pair was derived from.
    pub frame_index: usize,
    pub kv: KeyValue,
}

// ─────────────────────────────────────────────────────────────────────────────
// MemoryView
// ─────────────────────────────────────────────────────────────────────────────

/// All keys and all values of a bank, concatenated in commit order.
#[derive(Debug, Clone, PartialEq)]
pub struct MemoryView {
    pub keys: FeatureStack,
    pub values: FeatureStack,
}

impl MemoryView {
    /// A view holding a single, uncommitted pair.
    ///
    /// Used when a read must happen before anything has been committed.
    pub fn from_candidate(frame_index: usize, kv: &KeyValue) -> Result<Self, VosError> {
        let mut view = Self {
            keys: FeatureStack::empty(kv.key.shape()),
            values: FeatureStack::empty(kv.value.shape()),
        };
        view.push(frame_index, kv)?;
        Ok(view)
    }

    /// A copy of this view with an uncommitted pair appended at the end.
    pub fn with_candidate(&self, frame_index: usize, kv: &KeyValue) -> Result<Self, VosError> {
        let mut view = self.clone();
        view.push(frame_index, kv)?;
        Ok(view)
    }

    /// Frame indices visible through this view, in concatenation order.
    pub fn frames(&self) -> &[usize] {
        self.keys.frames()
    }

    pub fn depth(&self) -> usize {
        self.keys.depth()
    }

    fn push(&mut self, frame_index: usize, kv: &KeyValue) -> Result<(), VosError> {
        self.keys.push(frame_index, &kv.key)?;
        self.values.push(frame_index, &kv.value)
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// MemoryBank
// ─────────────────────────────────────────────────────────────────────────────

/// Append-only store of committed memory entries for one sequence.
///
/// A bank is owned by exactly one propagation run; it holds no shared state
/// and is not meant to outlive the sequence it was built for.
#[derive(Debug, Default)]
pub struct MemoryBank {
    entries: Vec<MemoryEntry>,
    /// Cached concatenation of `entries[..materialized]`.
    view: Option<MemoryView>,
    materialized: usize,
}

impl MemoryBank {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a bank that expects about `capacity` commits.
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            entries: Vec::with_capacity(capacity),
            view: None,
            materialized: 0,
        }
    }

    /// Commit a (key, value) pair derived from frame `frame_index`.
    ///
    /// Always succeeds.  Callers commit in increasing frame order; shape
    /// compatibility is checked when the view is next materialised.
    pub fn append(&mut self, frame_index: usize, kv: KeyValue) {
        debug!(frame_index, committed = self.entries.len() + 1, "memory commit");
        self.entries.push(MemoryEntry { frame_index, kv });
    }

    /// The concatenation of every committed key and value, or `None` if
    /// nothing has been committed yet.
    ///
    /// # Errors
    ///
    /// Returns [`VosError::ShapeMismatch`] if an entry's key or value shape
    /// differs from the first committed entry.
    pub fn read_all(&mut self) -> Result<Option<&MemoryView>, VosError> {
        if self.entries.is_empty() {
            return Ok(None);
        }
        if self.materialized == self.entries.len() {
            trace!(entries = self.materialized, "memory read (cached)");
            return Ok(self.view.as_ref());
        }

        let (mut view, start) = match self.view.take() {
            Some(view) => (view, self.materialized),
            None => {
                let first = &self.entries[0].kv;
                let view = MemoryView {
                    keys: FeatureStack::empty(first.key.shape()),
                    values: FeatureStack::empty(first.value.shape()),
                };
                (view, 0)
            }
        };
        for entry in &self.entries[start..] {
            if let Err(e) = view.push(entry.frame_index, &entry.kv) {
                // The partially extended view was consumed; rebuild from scratch next time.
                self.materialized = 0;
                return Err(e);
            }
        }
        trace!(
            entries = self.entries.len(),
            added = self.entries.len() - start,
            "memory read (materialised)"
        );
        self.materialized = self.entries.len();
        self.view = Some(view);
        Ok(self.view.as_ref())
    }

    /// Number of committed entries.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Frame indices of all commits, in commit order.
    pub fn committed_frames(&self) -> Vec<usize> {
        self.entries.iter().map(|e| e.frame_index).collect()
    }

    pub fn entries(&self) -> &[MemoryEntry] {
        &self.entries
    }

    /// Drop every entry and the cached view.
    pub fn reset(&mut self) {
        self.entries.clear();
        self.view = None;
        self.materialized = 0;
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use vos_types::FeatureMap;

    fn kv(tag: f32) -> KeyValue {
        KeyValue {
            key: FeatureMap::new(2, 1, 1, vec![tag, tag + 0.5]).unwrap(),
            value: FeatureMap::new(1, 1, 1, vec![tag * 10.0]).unwrap(),
        }
    }

    #[test]
    fn empty_bank_reads_none() {
        let mut bank = MemoryBank::new();
        assert!(bank.is_empty());
        assert!(bank.read_all().unwrap().is_none());
    }

    #[test]
    fn read_all_concatenates_in_commit_order() {
        let mut bank = MemoryBank::new();
        bank.append(0, kv(1.0));
        bank.append(5, kv(2.0));
        bank.append(10, kv(3.0));

        let view = bank.read_all().unwrap().unwrap();
        assert_eq!(view.frames(), &[0, 5, 10]);
        assert_eq!(view.keys.data(), &[1.0, 1.5, 2.0, 2.5, 3.0, 3.5]);
        assert_eq!(view.values.data(), &[10.0, 20.0, 30.0]);
    }

    #[test]
    fn view_is_extended_incrementally() {
        let mut bank = MemoryBank::new();
        bank.append(0, kv(1.0));
        assert_eq!(bank.read_all().unwrap().unwrap().depth(), 1);

        // Cached read without new commits returns the same view.
        assert_eq!(bank.read_all().unwrap().unwrap().depth(), 1);

        bank.append(3, kv(2.0));
        let view = bank.read_all().unwrap().unwrap();
        assert_eq!(view.depth(), 2);
        assert_eq!(view.values.data(), &[10.0, 20.0]);
    }

    #[test]
    fn committed_frames_tracks_appends() {
        let mut bank = MemoryBank::with_capacity(2);
        bank.append(0, kv(1.0));
        bank.append(4, kv(1.0));
        assert_eq!(bank.len(), 2);
        assert_eq!(bank.committed_frames(), vec![0, 4]);
        assert_eq!(bank.entries()[1].frame_index, 4);
    }

    #[test]
    fn mismatched_entry_surfaces_on_read() {
        let mut bank = MemoryBank::new();
        bank.append(0, kv(1.0));
        bank.append(
            1,
            KeyValue {
                key: FeatureMap::new(3, 1, 1, vec![0.0; 3]).unwrap(),
                value: FeatureMap::new(1, 1, 1, vec![0.0]).unwrap(),
            },
        );
        let err = bank.read_all().unwrap_err();
        assert!(matches!(err, VosError::ShapeMismatch { .. }));
    }

    #[test]
    fn reset_clears_entries_and_view() {
        let mut bank = MemoryBank::new();
        bank.append(0, kv(1.0));
        bank.read_all().unwrap();
        bank.reset();
        assert!(bank.is_empty());
        assert!(bank.read_all().unwrap().is_none());

        bank.append(0, kv(7.0));
        let view = bank.read_all().unwrap().unwrap();
        assert_eq!(view.values.data(), &[70.0]);
    }

    #[test]
    fn candidate_view_does_not_touch_bank() {
        let mut bank = MemoryBank::new();
        bank.append(0, kv(1.0));
        let extended = bank
            .read_all()
            .unwrap()
            .unwrap()
            .with_candidate(1, &kv(2.0))
            .unwrap();
        assert_eq!(extended.frames(), &[0, 1]);
        assert_eq!(bank.read_all().unwrap().unwrap().frames(), &[0]);
    }

    #[test]
    fn from_candidate_builds_single_entry_view() {
        let view = MemoryView::from_candidate(0, &kv(1.0)).unwrap();
        assert_eq!(view.depth(), 1);
        assert_eq!(view.frames(), &[0]);
    }
}
