use crate::error::VmError;
use crate::paging::policy::RegionTable;
use core::ops::Range;
use sos_shared::mem::{is_page_aligned, PAGE_SIZE};

/// Bytes moved per swap request.
pub const DEFAULT_SWAP_BATCH_SIZE: usize = 512;

/// How the swapper picks the page to evict.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum Replacement {
    /// Skip and unmap pages whose mapping is present, evict the first one
    /// whose mapping is gone.
    #[default]
    SecondChance,
    /// Evict the oldest resident page regardless of use.
    Fifo,
}

#[derive(Clone, Debug)]
pub struct VmConfig {
    /// Physical memory handed to the frame table.
    pub frames: Range<usize>,
    /// Manage at most this many frames, to force swapping early.
    pub frame_limit: Option<usize>,
    pub swap_batch_size: usize,
    pub replacement: Replacement,
    pub regions: RegionTable,
}

impl VmConfig {
    pub fn new(frames: Range<usize>) -> Self {
        Self {
            frames,
            frame_limit: None,
            swap_batch_size: DEFAULT_SWAP_BATCH_SIZE,
            replacement: Replacement::default(),
            regions: RegionTable::default(),
        }
    }

    pub fn with_frame_limit(mut self, limit: usize) -> Self {
        self.frame_limit = Some(limit);
        self
    }

    pub fn with_swap_batch_size(mut self, size: usize) -> Self {
        self.swap_batch_size = size;
        self
    }

    pub fn with_replacement(mut self, replacement: Replacement) -> Self {
        self.replacement = replacement;
        self
    }

    pub fn with_regions(mut self, regions: RegionTable) -> Self {
        self.regions = regions;
        self
    }

    pub fn validate(&self) -> Result<(), VmError> {
        if self.frames.start >= self.frames.end {
            return Err(VmError::InvalidConfig("frame range is empty"));
        }
        if !is_page_aligned(self.frames.start) || !is_page_aligned(self.frames.end) {
            return Err(VmError::InvalidConfig("frame range is not page aligned"));
        }
        if self.frame_limit == Some(0) {
            return Err(VmError::InvalidConfig("frame limit must be at least one"));
        }
        if self.swap_batch_size == 0 || self.swap_batch_size >= PAGE_SIZE {
            return Err(VmError::InvalidConfig(
                "swap batch size must be non-zero and smaller than a page",
            ));
        }
        if PAGE_SIZE % self.swap_batch_size != 0 {
            return Err(VmError::InvalidConfig(
                "page size must be a multiple of the swap batch size",
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const FRAMES: Range<usize> = 0x0100_0000..0x0100_3000;

    #[test]
    fn test_defaults_are_valid() {
        let config = VmConfig::new(FRAMES);
        assert_eq!(config.swap_batch_size, 512);
        assert_eq!(config.replacement, Replacement::SecondChance);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_batch_size_must_divide_page() {
        for size in [0, 3, 1000, PAGE_SIZE, 2 * PAGE_SIZE] {
            let config = VmConfig::new(FRAMES).with_swap_batch_size(size);
            assert!(
                matches!(config.validate(), Err(VmError::InvalidConfig(_))),
                "batch size {size} accepted"
            );
        }
        assert!(VmConfig::new(FRAMES).with_swap_batch_size(1024).validate().is_ok());
    }

    #[test]
    fn test_rejects_empty_pool() {
        assert!(VmConfig::new(0x1000..0x1000).validate().is_err());
        assert!(VmConfig::new(FRAMES).with_frame_limit(0).validate().is_err());
        assert!(VmConfig::new(0x1000..0x2800).validate().is_err());
    }
}
