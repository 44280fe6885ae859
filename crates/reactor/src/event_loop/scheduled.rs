use std::cmp::Ordering;
use std::fmt;
use std::time::Instant;

use super::Callback;

/// A callback waiting in the timer heap.
///
/// Ordering is reversed so the std max-heap pops the earliest fire time first; callbacks due
/// at the same instant pop in scheduling order thanks to the sequence number.
pub(crate) struct ScheduledCallback {
    when: Instant,
    seq: u64,
    callback: Callback,
}

impl ScheduledCallback {
    pub(crate) fn new(when: Instant, seq: u64, callback: Callback) -> Self {
        Self { when, seq, callback }
    }

    #[inline]
    pub(crate) fn when(&self) -> Instant {
        self.when
    }

    pub(crate) fn into_callback(self) -> Callback {
        self.callback
    }
}

impl fmt::Debug for ScheduledCallback {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ScheduledCallback").field("when", &self.when).field("seq", &self.seq).finish_non_exhaustive()
    }
}

impl PartialEq for ScheduledCallback {
    fn eq(&self, other: &Self) -> bool {
        self.when == other.when && self.seq == other.seq
    }
}

impl Eq for ScheduledCallback {}

impl PartialOrd for ScheduledCallback {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for ScheduledCallback {
    fn cmp(&self, other: &Self) -> Ordering {
        other.when.cmp(&self.when).then_with(|| other.seq.cmp(&self.seq))
    }
}
