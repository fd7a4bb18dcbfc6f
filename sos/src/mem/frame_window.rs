use core::ops::Range;
use core::ptr::NonNull;
use core::slice;
use sos_shared::mem::PAGE_SIZE;

/// The managed frames as the server sees them. The first frame of the range
/// sits at `base` and the rest follow contiguously.
pub struct FrameWindow {
    base: NonNull<u8>,
    len: usize,
}

impl FrameWindow {
    /// # Safety
    ///
    /// `len` bytes starting at `base` must stay mapped read-write into the
    /// server for as long as the window lives. Nothing else in the server may
    /// touch them; user threads reach them only through mappings the pager
    /// installs.
    pub unsafe fn new(base: NonNull<u8>, len: usize) -> Self {
        Self { base, len }
    }

    /// The window over `frames` when the server has them mapped one-to-one,
    /// as it does for all of physical memory at boot. `None` for a range
    /// starting at zero.
    ///
    /// # Safety
    ///
    /// Same as [`FrameWindow::new`].
    pub unsafe fn identity(frames: Range<usize>) -> Option<Self> {
        let base = NonNull::new(frames.start as *mut u8)?;
        Some(Self::new(base, frames.len()))
    }

    pub fn len(&self) -> usize {
        self.len
    }

    /// The page `offset` bytes into the window.
    pub fn page(&self, offset: usize) -> &[u8] {
        self.check(offset);
        // SAFETY: in bounds, and `new` made the bytes ours.
        unsafe { slice::from_raw_parts(self.base.as_ptr().add(offset), PAGE_SIZE) }
    }

    pub fn page_mut(&mut self, offset: usize) -> &mut [u8] {
        self.check(offset);
        // SAFETY: as for `page`; `&mut self` keeps the slice unique.
        unsafe { slice::from_raw_parts_mut(self.base.as_ptr().add(offset), PAGE_SIZE) }
    }

    fn check(&self, offset: usize) {
        assert!(
            offset % PAGE_SIZE == 0 && offset + PAGE_SIZE <= self.len,
            "page at {offset:#X} is outside a {:#X} byte window",
            self.len
        );
    }
}
