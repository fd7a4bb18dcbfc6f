// Bit-level layouts shared between the pager and anything that needs to talk
// about virtual addresses, page table words or access rights.

// Addresses are 32-bit words on the target. Truncation from usize is part of
// the encoding, not an accident.
#![allow(clippy::cast_possible_truncation)]

use crate::mem::PAGE_SIZE_LOG2;
use arbitrary_int::{u12, u20};
use bitbybit::bitfield;
use core::fmt;

pub const FIRST_LEVEL_BITS: usize = 12;
pub const FIRST_LEVEL_ENTRIES: usize = 1 << FIRST_LEVEL_BITS;
pub const SECOND_LEVEL_BITS: usize = 8;
pub const SECOND_LEVEL_ENTRIES: usize = 1 << SECOND_LEVEL_BITS;

/// Split of a 32-bit virtual address into the two table indices and the
/// offset within the page.
#[bitfield(u32)]
pub struct VirtualAddress {
    #[bits(20..=31, r)]
    first_level_index: u12,
    #[bits(12..=19, r)]
    second_level_index: u8,
    #[bits(0..=11, r)]
    offset: u12,
}

impl VirtualAddress {
    pub const fn from_usize(addr: usize) -> Self {
        Self::new_with_raw_value(addr as u32)
    }

    pub fn first_level(&self) -> usize {
        usize::from(self.first_level_index().value())
    }

    pub fn second_level(&self) -> usize {
        usize::from(self.second_level_index())
    }

    /// Rebuilds the page-aligned address that the two indices describe.
    pub const fn from_indices(first: usize, second: usize) -> usize {
        (first << (SECOND_LEVEL_BITS + PAGE_SIZE_LOG2)) | (second << PAGE_SIZE_LOG2)
    }
}

/// A page table entry as a single machine word.
///
/// Bit 0 set means the upper bits hold a swap offset. Otherwise the upper bits
/// hold a frame address and bit 1 is the dirty flag. The all-zero word is an
/// unmapped page.
#[bitfield(u32, default = 0)]
#[derive(Debug, PartialEq, Eq)]
pub struct RawPageTableEntry {
    #[bit(0, rw)]
    swapped: bool,
    #[bit(1, rw)]
    dirty: bool,
    #[bits(12..=31, rw)]
    page_address: u20,
}

impl RawPageTableEntry {
    /// Page-aligned payload of the word: a frame address or a swap offset.
    pub fn address(&self) -> usize {
        (self.page_address().value() as usize) << PAGE_SIZE_LOG2
    }

    /// Replaces the payload. `address` must be page aligned and fit in 32 bits.
    pub fn with_address(self, address: usize) -> Self {
        self.with_page_address(u20::new((address >> PAGE_SIZE_LOG2) as u32))
    }

    pub fn is_null(&self) -> bool {
        self.raw_value() == 0
    }
}

/// Access rights in the microkernel's rwx order.
#[bitfield(u8, default = 0)]
#[derive(Debug, PartialEq, Eq)]
pub struct Rights {
    #[bit(2, rw)]
    readable: bool,
    #[bit(1, rw)]
    writable: bool,
    #[bit(0, rw)]
    executable: bool,
}

impl Rights {
    pub const NO_ACCESS: Self = Self::new_with_raw_value(0b000);
    pub const READ: Self = Self::new_with_raw_value(0b100);
    pub const WRITE: Self = Self::new_with_raw_value(0b010);
    pub const EXECUTE: Self = Self::new_with_raw_value(0b001);
    pub const READ_WRITE: Self = Self::new_with_raw_value(0b110);
    pub const FULLY_ACCESSIBLE: Self = Self::new_with_raw_value(0b111);

    /// Builds rights from the low three bits of `bits`; the rest is ignored.
    pub const fn from_bits(bits: u8) -> Self {
        Self::new_with_raw_value(bits & 0b111)
    }

    /// Whether every right in `other` is also granted by `self`.
    pub const fn contains(self, other: Self) -> bool {
        self.raw_value() & other.raw_value() == other.raw_value()
    }

    pub const fn is_empty(self) -> bool {
        self.raw_value() == 0
    }
}

impl fmt::Display for Rights {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let flag = |set: bool, c: char| if set { c } else { '-' };
        write!(
            f,
            "{}{}{}",
            flag(self.readable(), 'r'),
            flag(self.writable(), 'w'),
            flag(self.executable(), 'x')
        )
    }
}
