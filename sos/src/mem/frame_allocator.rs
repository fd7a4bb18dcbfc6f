//! Stack based frame table.
//!
//! Free frames live on a LIFO stack, so allocating and freeing are both
//! *O(1)*. A parallel bit array records which frames are in use, which lets
//! `free` spot a double free in *O(1)* without searching the stack. Frame
//! contents are reached through a [`FrameWindow`] onto the frames themselves,
//! so they are the bytes user threads see through their mappings.

use super::FrameWindow;
use alloc::vec::Vec;
use core::ops::Range;
use log::{debug, warn};
use sos_shared::{bit_array::BitArray, mem::PAGE_SIZE};

pub struct FrameTable {
    start: usize,
    end: usize,
    free_stack: Vec<usize>,
    used: BitArray,
    window: FrameWindow,
}

impl FrameTable {
    /// Partitions `[low, high)` into frames, all of them free.
    ///
    /// Frames are pushed in descending order so the lowest address is handed
    /// out first.
    pub fn new(window: FrameWindow, low: usize, high: usize) -> Self {
        Self::with_limit(window, low, high, None)
    }

    /// Like [`FrameTable::new`], but manages at most `limit` frames starting at
    /// `low`. Used to force swapping with small workloads.
    pub fn with_limit(window: FrameWindow, low: usize, high: usize, limit: Option<usize>) -> Self {
        assert!(low < high, "empty frame range {low:#X}..{high:#X}");
        assert_eq!(low % PAGE_SIZE, 0, "frame range must start on a page boundary");
        assert_eq!(
            (high - low) % PAGE_SIZE,
            0,
            "frame range length must be a multiple of the page size"
        );

        let mut end = high;
        if let Some(limit) = limit {
            let capped = low + limit * PAGE_SIZE;
            if capped < high {
                warn!("running with artificially decreased frame number: {limit}");
                end = capped;
            }
        }

        assert!(
            window.len() >= end - low,
            "frame window of {:#X} bytes does not cover {low:#X}..{end:#X}",
            window.len()
        );

        let frame_count = (end - low) / PAGE_SIZE;
        let mut free_stack = Vec::with_capacity(frame_count);
        free_stack.extend((low..end).step_by(PAGE_SIZE).rev());

        debug!(
            "frame table: {low:#X}..{end:#X}, {frame_count} frames, {} bytes of bookkeeping",
            frame_count * core::mem::size_of::<usize>() + frame_count.div_ceil(8)
        );

        Self {
            start: low,
            end,
            free_stack,
            used: BitArray::new(frame_count),
            window,
        }
    }

    pub fn range(&self) -> Range<usize> {
        self.start..self.end
    }

    pub fn capacity(&self) -> usize {
        self.used.len()
    }

    pub fn free_count(&self) -> usize {
        self.free_stack.len()
    }

    pub fn is_valid_frame(&self, frame: usize) -> bool {
        self.start <= frame && frame < self.end && frame % PAGE_SIZE == 0
    }

    pub fn is_allocated(&self, frame: usize) -> bool {
        self.used.get(self.index_of(frame))
    }

    /// Takes the frame on top of the free stack and zeroes it.
    ///
    /// Returns `None` when every frame is in use; making room is the caller's
    /// business.
    pub fn alloc(&mut self) -> Option<usize> {
        let Some(frame) = self.free_stack.pop() else {
            warn!("ran out of physical memory");
            return None;
        };

        let index = self.index_of(frame);
        debug_assert!(!self.used.get(index), "free stack held a used frame");
        self.used.set(index, true);
        // Don't leak data between processes.
        self.bytes_mut(frame).fill(0);

        Some(frame)
    }

    /// Returns `frame` to the pool. Freeing a free frame logs a warning and
    /// changes nothing.
    pub fn free(&mut self, frame: usize) {
        assert!(
            self.is_valid_frame(frame),
            "{frame:#X} is not a frame in {:#X}..{:#X}",
            self.start,
            self.end
        );

        let index = self.index_of(frame);
        if !self.used.get(index) {
            warn!("trying to free frame {frame:#X} which is already free");
            return;
        }

        self.used.set(index, false);
        self.free_stack.push(frame);
    }

    pub fn bytes(&self, frame: usize) -> &[u8] {
        self.window.page(self.offset_of(frame))
    }

    pub fn bytes_mut(&mut self, frame: usize) -> &mut [u8] {
        let offset = self.offset_of(frame);
        self.window.page_mut(offset)
    }

    fn offset_of(&self, frame: usize) -> usize {
        assert!(self.is_valid_frame(frame), "{frame:#X} is not a managed frame");
        frame - self.start
    }

    fn index_of(&self, frame: usize) -> usize {
        self.offset_of(frame) / PAGE_SIZE
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{capture_logs, logged, physical_memory};
    use core::ptr::NonNull;

    const LOW: usize = 0x0100_0000;

    fn table(frames: usize) -> FrameTable {
        table_over(physical_memory(frames * PAGE_SIZE), frames)
    }

    fn table_over(memory: NonNull<u8>, frames: usize) -> FrameTable {
        let window = unsafe { FrameWindow::new(memory, frames * PAGE_SIZE) };
        FrameTable::new(window, LOW, LOW + frames * PAGE_SIZE)
    }

    #[test]
    fn test_lowest_frame_first() {
        let mut frames = table(3);
        assert_eq!(frames.capacity(), 3);
        assert_eq!(frames.alloc(), Some(LOW));
        assert_eq!(frames.alloc(), Some(LOW + PAGE_SIZE));
        assert_eq!(frames.alloc(), Some(LOW + 2 * PAGE_SIZE));
        assert_eq!(frames.alloc(), None);
    }

    #[test]
    fn test_alloc_free_round_trip() {
        let mut frames = table(4);
        for _ in 0..100 {
            let before = frames.free_count();
            let frame = frames.alloc().unwrap();
            assert!(frames.is_allocated(frame));
            frames.bytes_mut(frame)[0] = 0x37;
            frames.free(frame);
            assert_eq!(frames.free_count(), before);
            assert!(!frames.is_allocated(frame));
        }
    }

    #[test]
    fn test_allocated_frames_are_zeroed() {
        let mut frames = table(1);
        let frame = frames.alloc().unwrap();
        frames.bytes_mut(frame).fill(0xAB);
        frames.free(frame);

        let frame = frames.alloc().unwrap();
        assert!(frames.bytes(frame).iter().all(|&b| b == 0));
    }

    #[test]
    fn test_frames_live_in_the_window() {
        let memory = physical_memory(2 * PAGE_SIZE);
        let mut frames = table_over(memory, 2);
        frames.alloc().unwrap();
        let frame = frames.alloc().unwrap();

        assert_eq!(frames.bytes(frame).as_ptr(), unsafe { memory.as_ptr().add(PAGE_SIZE) });

        // A user thread scribbles on the frame through its mapping.
        unsafe { memory.as_ptr().add(PAGE_SIZE).write_bytes(0xCD, PAGE_SIZE) };
        assert!(frames.bytes(frame).iter().all(|&b| b == 0xCD));

        // The next owner must not see it.
        frames.free(frame);
        assert_eq!(frames.alloc(), Some(frame));
        assert_eq!(unsafe { *memory.as_ptr().add(PAGE_SIZE + 17) }, 0);
    }

    #[test]
    #[should_panic]
    fn test_window_must_cover_the_range() {
        let window = unsafe { FrameWindow::new(physical_memory(PAGE_SIZE), PAGE_SIZE) };
        FrameTable::new(window, LOW, LOW + 2 * PAGE_SIZE);
    }

    #[test]
    fn test_double_free_is_ignored() {
        capture_logs();
        let mut frames = table(2);
        let a = frames.alloc().unwrap();
        let b = frames.alloc().unwrap();
        assert_eq!(frames.free_count(), 0);

        frames.free(a);
        frames.free(a);
        assert_eq!(frames.free_count(), 1);
        assert!(logged("trying to free frame 0x1000000 which is already free"));

        // The stack must not hand out `a` twice.
        assert_eq!(frames.alloc(), Some(a));
        assert_eq!(frames.alloc(), None);
        frames.free(b);
        assert_eq!(frames.alloc(), Some(b));
    }

    #[test]
    fn test_limit_caps_the_pool() {
        let window = unsafe { FrameWindow::new(physical_memory(2 * PAGE_SIZE), 2 * PAGE_SIZE) };
        let mut frames = FrameTable::with_limit(window, LOW, LOW + 16 * PAGE_SIZE, Some(2));
        assert_eq!(frames.capacity(), 2);
        assert_eq!(frames.range(), LOW..LOW + 2 * PAGE_SIZE);
        assert!(frames.alloc().is_some());
        assert!(frames.alloc().is_some());
        assert!(frames.alloc().is_none());
    }

    #[test]
    #[should_panic]
    fn test_range_must_be_page_multiple() {
        let window = unsafe { FrameWindow::new(physical_memory(2 * PAGE_SIZE), 2 * PAGE_SIZE) };
        FrameTable::new(window, LOW, LOW + PAGE_SIZE + 1);
    }

    #[test]
    #[should_panic]
    fn test_free_misaligned_frame() {
        let mut frames = table(2);
        frames.free(LOW + 12);
    }

    #[test]
    #[should_panic]
    fn test_free_outside_range() {
        let mut frames = table(2);
        frames.free(LOW + 2 * PAGE_SIZE);
    }
}
