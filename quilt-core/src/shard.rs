//! Shard bookkeeping for a peer's event log.
//!
//! A peer's events are spread over numbered shards so that no single
//! store value crosses the per-key size budget. The manager tracks which
//! shard indices are live, which one is being appended to, and decides
//! when an append must open a new shard instead.
//!
//! Sizes are *estimated* as twice the serialized JSON text length - the
//! UTF-16 worst case of the store medium. The estimate may over-report
//! the true byte size but never under-reports it, which is the invariant
//! the per-key budget needs.

use std::collections::BTreeSet;

use serde::Serialize;

use quilt_types::{EventRecord, MAX_KEY_SIZE};

/// Errors from shard bookkeeping.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ShardError {
    /// A single event alone would meet or exceed the per-key limit; it
    /// can never be stored, in any shard.
    EventTooLarge {
        /// Estimated serialized size of the event.
        size: usize,
        /// The per-key limit.
        max: usize,
    },
}

impl std::fmt::Display for ShardError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ShardError::EventTooLarge { size, max } => {
                write!(f, "event of {size} estimated bytes exceeds per-key limit of {max}")
            }
        }
    }
}

impl std::error::Error for ShardError {}

/// Estimated store footprint of a value: twice its JSON text length.
///
/// A value that cannot be serialized at all reports `usize::MAX`, which
/// every size check treats as oversized.
pub fn estimated_value_size<T: Serialize>(value: &T) -> usize {
    serde_json::to_string(value)
        .map(|text| text.len().saturating_mul(2))
        .unwrap_or(usize::MAX)
}

/// Tracks the live shard indices of one peer's event log.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShardManager {
    current: u32,
    active: BTreeSet<u32>,
}

impl ShardManager {
    /// Rebuild the manager from a stored shard index list.
    ///
    /// The append target is the highest listed index, or 0 when the list
    /// is empty (a fully collected log reuses index 0; increments inside
    /// it keep ascending, so intervals stay unambiguous).
    pub fn from_indices(indices: &[u32]) -> Self {
        let active: BTreeSet<u32> = indices.iter().copied().collect();
        let current = active.iter().next_back().copied().unwrap_or(0);
        Self { current, active }
    }

    /// The shard index appends currently go to.
    pub fn current(&self) -> u32 {
        self.current
    }

    /// Mark the current shard live.
    ///
    /// Needed when appending after garbage collection emptied the whole
    /// log, at which point no index is live yet.
    pub fn touch_current(&mut self) {
        self.active.insert(self.current);
    }

    /// Open the next shard and make it the append target.
    pub fn open_new_shard(&mut self) -> u32 {
        self.current += 1;
        self.active.insert(self.current);
        self.current
    }

    /// Never move the append target backwards.
    ///
    /// After garbage collection rebuilds the manager from the surviving
    /// indices, a retried write may still land under the old highest
    /// index; reusing a lower index would let a later append overwrite
    /// it.
    pub fn advance_current_to(&mut self, index: u32) {
        if index > self.current {
            self.current = index;
        }
    }

    /// Live shard indices in ascending order, as stored in the meta.
    pub fn active_sorted(&self) -> Vec<u32> {
        self.active.iter().copied().collect()
    }

    /// Would this event list overflow a single store value?
    ///
    /// Called with the existing shard contents plus the candidate append;
    /// `true` means the candidate must go to a fresh shard.
    pub fn should_roll(&self, events: &[EventRecord]) -> bool {
        estimated_value_size(&events) >= MAX_KEY_SIZE
    }

    /// Reject an event that could never fit a store value on its own.
    pub fn validate_event_size(&self, event: &EventRecord) -> Result<(), ShardError> {
        let size = estimated_value_size(event);
        if size >= MAX_KEY_SIZE {
            return Err(ShardError::EventTooLarge {
                size,
                max: MAX_KEY_SIZE,
            });
        }
        Ok(())
    }
}

impl Default for ShardManager {
    fn default() -> Self {
        Self::from_indices(&[0])
    }
}
