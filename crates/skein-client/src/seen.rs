//! Seen-offset tracking.

use std::collections::BTreeSet;

/// Offsets already delivered to the application.
///
/// A contiguous watermark (every offset `1..=watermark` seen) plus the sparse
/// set of seen offsets above it. The watermark is what the client reports as
/// `server_offset` on reconnect, so a hole left by reordering between workers
/// is replayed instead of skipped.
///
/// A hole can outlive a connection: a commit whose acknowledgement was lost is
/// stored but never broadcast live, so nothing fills its offset until the
/// next reconnect. Until then every later offset lands in the sparse set,
/// which grows by one entry per message. Reconnecting presents the watermark
/// below the hole, the replay delivers the missing offset and the set
/// collapses. [`sparse_len`](SeenOffsets::sparse_len) exposes the backlog for
/// callers that want to reconnect early.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SeenOffsets {
    watermark: u64,
    above: BTreeSet<u64>,
}

impl SeenOffsets {
    /// Nothing seen.
    pub fn new() -> Self {
        Self::default()
    }

    /// Record `offset`. Returns false if it was already seen.
    pub fn insert(&mut self, offset: u64) -> bool {
        if offset <= self.watermark || !self.above.insert(offset) {
            return false;
        }
        while self.above.remove(&(self.watermark + 1)) {
            self.watermark += 1;
        }
        true
    }

    /// Whether `offset` was seen.
    pub fn contains(&self, offset: u64) -> bool {
        offset <= self.watermark || self.above.contains(&offset)
    }

    /// Highest offset below which nothing is missing.
    pub fn watermark(&self) -> u64 {
        self.watermark
    }

    /// Highest offset seen at all.
    pub fn highest(&self) -> u64 {
        self.above.last().copied().unwrap_or(self.watermark)
    }

    /// Offsets seen above the watermark.
    pub fn sparse_len(&self) -> usize {
        self.above.len()
    }
}
