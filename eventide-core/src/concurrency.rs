//! Optimistic concurrency conflicts.
//!
//! Every save compares the version the caller loaded against the version
//! currently persisted. The two must be equal; there is no merging. A
//! mismatch means another writer committed in between, and the caller should
//! reload and retry.

use thiserror::Error;

/// Error indicating a concurrency conflict during save.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("{}", format_conflict(*.expected, *.actual))]
pub struct ConcurrencyConflict {
    /// The version the event source was loaded at.
    pub expected: u64,
    /// The version currently persisted.
    pub actual: u64,
}

/// Build a human-readable message for a [`ConcurrencyConflict`], including an
/// actionable hint for the caller.
fn format_conflict(expected: u64, actual: u64) -> String {
    if expected == 0 {
        format!(
            "concurrency conflict: expected new aggregate, found version {actual} (hint: another \
             process created this aggregate; reload and retry)"
        )
    } else {
        format!(
            "concurrency conflict: expected version {expected}, found {actual} (hint: aggregate \
             was modified; reload and retry)"
        )
    }
}
