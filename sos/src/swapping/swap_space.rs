use sos_shared::mem::PAGE_SIZE;

/// Running totals of swap traffic.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct SwapStats {
    /// Dirty pages written out.
    pub swap_outs: usize,
    /// Clean pages dropped without a write.
    pub clean_evictions: usize,
    pub swap_ins: usize,
    pub bytes_written: usize,
    pub bytes_read: usize,
    /// Number of slots ever handed out.
    pub slots_used: usize,
}

/// Hands out swap slots.
///
/// Slots are assigned in increasing order and never reused while the pager
/// runs. A page keeps its slot for good once it has one, so the region only
/// grows as the set of pages that have ever been evicted grows.
#[derive(Debug, Default)]
pub struct SwapSpace {
    next_slot: usize,
    stats: SwapStats,
}

impl SwapSpace {
    pub fn new() -> Self {
        Self::default()
    }

    /// Byte offset of a fresh slot.
    pub fn assign_slot(&mut self) -> usize {
        let offset = self.next_slot * PAGE_SIZE;
        self.next_slot += 1;
        self.stats.slots_used = self.next_slot;
        offset
    }

    pub fn stats(&self) -> SwapStats {
        self.stats
    }

    pub(super) fn stats_mut(&mut self) -> &mut SwapStats {
        &mut self.stats
    }
}
