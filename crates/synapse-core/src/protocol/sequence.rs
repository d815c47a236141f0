//! Thread-safe sequence counter for protocol message numbering.
//!
//! Every frame carries a monotonically increasing sequence number.  Each
//! connection owns its own counter so the numbers a peer sees are gap-free
//! for that connection.

use std::sync::atomic::{AtomicU64, Ordering};

/// A thread-safe, monotonically increasing counter.
///
/// Starts at 0, increments by 1 with each call to [`SequenceCounter::next`],
/// and wraps at `u64::MAX` without panicking.
///
/// # Examples
///
/// ```rust
/// use synapse_core::protocol::SequenceCounter;
///
/// let counter = SequenceCounter::new();
/// assert_eq!(counter.next(), 0);
/// assert_eq!(counter.next(), 1);
/// ```
#[derive(Debug)]
pub struct SequenceCounter {
    inner: AtomicU64,
}

impl SequenceCounter {
    /// Creates a new counter starting at 0.
    pub const fn new() -> Self {
        Self {
            inner: AtomicU64::new(0),
        }
    }

    /// Returns the next sequence number and atomically increments the counter.
    ///
    /// `Relaxed` is enough: the value orders frames, it does not publish memory.
    pub fn next(&self) -> u64 {
        self.inner.fetch_add(1, Ordering::Relaxed)
    }

    /// Returns the current value without incrementing.
    pub fn current(&self) -> u64 {
        self.inner.load(Ordering::Relaxed)
    }
}

impl Default for SequenceCounter {
    fn default() -> Self {
        Self::new()
    }
}
