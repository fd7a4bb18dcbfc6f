//! Asynchronous access to the swap region.
//!
//! The swap region is a flat sequence of `PAGE_SIZE` slots, slot `k` at bytes
//! `[k * PAGE_SIZE, (k + 1) * PAGE_SIZE)`. It holds no metadata of its own.
//! Pages move in fixed-size batches. Every request carries the page it
//! belongs to so the completion can be routed back to the operation in flight.

use crate::paging::PageKey;

/// Outcome of one swap request, as reported by the file service.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum IoStatus {
    Ok,
    /// The backing store is full.
    NoSpace,
    Error(i32),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SwapOp {
    Read,
    Write,
}

/// One batch of a page transfer.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SwapRequest {
    pub key: PageKey,
    pub op: SwapOp,
    /// Byte offset into the swap region.
    pub offset: usize,
    /// Byte offset of this batch within the page.
    pub page_offset: usize,
    pub len: usize,
}

impl SwapRequest {
    pub fn new(key: PageKey, op: SwapOp, slot: usize, page_offset: usize, len: usize) -> Self {
        Self {
            key,
            op,
            offset: slot + page_offset,
            page_offset,
            len,
        }
    }
}

/// The storage collaborator behind the swap region.
///
/// Requests for one page must complete in the order they were issued.
/// Completions are handed back through
/// [`Pager::swap_write_completed`](crate::paging::pager::Pager::swap_write_completed)
/// and [`Pager::swap_read_completed`](crate::paging::pager::Pager::swap_read_completed).
pub trait SwapStorage {
    fn read(&mut self, request: SwapRequest);

    /// `data` holds exactly `request.len` bytes.
    fn write(&mut self, request: SwapRequest, data: &[u8]);

    /// The slot at `offset` no longer backs any page.
    fn release(&mut self, offset: usize);
}
