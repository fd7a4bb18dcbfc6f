pub const KB: usize = 1 << 10;
pub const MB: usize = 1 << 20;

// Page size is 4KB. Frames, pages and swap slots all share it.
pub const PAGE_SIZE: usize = 4 * KB;
pub const PAGE_SIZE_LOG2: usize = 12;

// Everything below VIRTUAL_START is mapped one-to-one onto physical memory and
// never paged.
pub const VIRTUAL_START: usize = 0x0200_0000;

// The first page is never accessible so null pointer dereferences fault.
pub const NULL_GUARD_END: usize = PAGE_SIZE;

pub const HEAP_START: usize = 0x4000_0000;
pub const HEAP_END: usize = HEAP_START + 4 * MB;

// Exactly one page shared with the server for syscall arguments. It is never
// swapped.
pub const IPC_START: usize = 0x6000_0000;
pub const IPC_END: usize = IPC_START + PAGE_SIZE;

pub const STACK_TOP: usize = 0xC000_0000;
pub const STACK_END: usize = STACK_TOP - MB;

#[inline]
pub const fn page_align_down(addr: usize) -> usize {
    addr & !(PAGE_SIZE - 1)
}

#[inline]
pub const fn is_page_aligned(addr: usize) -> bool {
    addr & (PAGE_SIZE - 1) == 0
}
