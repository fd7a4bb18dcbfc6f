//! Per-process two-level page tables.
//!
//! The first level is indexed by the top 12 bits of a virtual address, the
//! second by the next 8. Second-level tables are created on first touch and
//! only go away with the address space that owns them.

pub mod pager;
pub mod policy;

use crate::l4::{SpaceId, Tid};
use alloc::{boxed::Box, vec::Vec};
use core::iter;
use sos_shared::{
    mem::page_align_down,
    paging::{RawPageTableEntry, VirtualAddress, FIRST_LEVEL_ENTRIES, SECOND_LEVEL_ENTRIES},
};

/// Identifies one virtual page in one address space.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct PageKey {
    pub space: SpaceId,
    pub vaddr: usize,
}

impl PageKey {
    /// `vaddr` is rounded down to its page.
    pub fn new(space: SpaceId, vaddr: usize) -> Self {
        Self {
            space,
            vaddr: page_align_down(vaddr),
        }
    }
}

/// Where a virtual page currently lives.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum PageTableEntry {
    #[default]
    Unmapped,
    /// Backed by `frame`. `dirty` is set once the page may differ from its
    /// swap copy (or it never had one).
    Resident { frame: usize, dirty: bool },
    /// Not in memory; its contents are at `offset` in the swap region.
    Swapped { offset: usize },
}

impl PageTableEntry {
    /// Packs the entry into its machine-word form.
    pub fn encode(self) -> RawPageTableEntry {
        match self {
            PageTableEntry::Unmapped => RawPageTableEntry::DEFAULT,
            PageTableEntry::Resident { frame, dirty } => RawPageTableEntry::DEFAULT
                .with_address(frame)
                .with_dirty(dirty),
            PageTableEntry::Swapped { offset } => RawPageTableEntry::DEFAULT
                .with_address(offset)
                .with_swapped(true),
        }
    }

    pub fn decode(raw: RawPageTableEntry) -> Self {
        if raw.is_null() {
            PageTableEntry::Unmapped
        } else if raw.swapped() {
            PageTableEntry::Swapped {
                offset: raw.address(),
            }
        } else {
            PageTableEntry::Resident {
                frame: raw.address(),
                dirty: raw.dirty(),
            }
        }
    }

    pub fn is_unmapped(&self) -> bool {
        matches!(self, PageTableEntry::Unmapped)
    }

    pub fn frame(&self) -> Option<usize> {
        match self {
            PageTableEntry::Resident { frame, .. } => Some(*frame),
            _ => None,
        }
    }
}

type SecondLevelTable = [PageTableEntry; SECOND_LEVEL_ENTRIES];

pub struct AddressSpace {
    id: SpaceId,
    owner: Option<Tid>,
    first_level: Vec<Option<Box<SecondLevelTable>>>,
    pub(crate) dying: bool,
}

impl AddressSpace {
    pub fn new(id: SpaceId, owner: Option<Tid>) -> Self {
        Self {
            id,
            owner,
            first_level: iter::repeat_with(|| None).take(FIRST_LEVEL_ENTRIES).collect(),
            dying: false,
        }
    }

    pub fn id(&self) -> SpaceId {
        self.id
    }

    pub fn owner(&self) -> Option<Tid> {
        self.owner
    }

    pub fn is_dying(&self) -> bool {
        self.dying
    }

    /// Looks up the entry for `vaddr` without creating anything. Returns
    /// `None` if its second-level table does not exist yet.
    pub fn entry(&self, vaddr: usize) -> Option<PageTableEntry> {
        let va = VirtualAddress::from_usize(vaddr);
        let table = self.first_level[va.first_level()].as_ref()?;
        Some(table[va.second_level()])
    }

    pub fn existing_entry_mut(&mut self, vaddr: usize) -> Option<&mut PageTableEntry> {
        let va = VirtualAddress::from_usize(vaddr);
        let table = self.first_level[va.first_level()].as_mut()?;
        Some(&mut table[va.second_level()])
    }

    /// Walks down to the entry for `vaddr`, creating its second-level table
    /// if this is the first page touched in its range.
    pub fn entry_mut(&mut self, vaddr: usize) -> &mut PageTableEntry {
        let va = VirtualAddress::from_usize(vaddr);
        let id = self.id;
        let table = self.first_level[va.first_level()].get_or_insert_with(|| {
            log::trace!("space {id}: creating second level table {}", va.first_level());
            Box::new([PageTableEntry::Unmapped; SECOND_LEVEL_ENTRIES])
        });
        &mut table[va.second_level()]
    }

    /// Payload of the raw entry for `vaddr`: a frame address or swap offset.
    pub fn physical_lookup(&self, vaddr: usize) -> Option<usize> {
        let raw = self.entry(vaddr)?.encode();
        (!raw.is_null()).then(|| raw.address())
    }

    /// Every entry that is not unmapped, with the page address it describes.
    pub fn entries(&self) -> impl Iterator<Item = (usize, PageTableEntry)> + '_ {
        self.first_level
            .iter()
            .enumerate()
            .filter_map(|(first, table)| Some((first, table.as_ref()?)))
            .flat_map(|(first, table)| {
                table
                    .iter()
                    .enumerate()
                    .filter(|(_, entry)| !entry.is_unmapped())
                    .map(move |(second, entry)| {
                        (VirtualAddress::from_indices(first, second), *entry)
                    })
            })
    }

    pub fn second_level_tables(&self) -> usize {
        self.first_level.iter().filter(|t| t.is_some()).count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sos_shared::mem::{HEAP_START, PAGE_SIZE, STACK_END};

    #[test]
    fn test_encoding_is_exclusive() {
        let entries = [
            PageTableEntry::Unmapped,
            PageTableEntry::Resident {
                frame: 0x0100_1000,
                dirty: false,
            },
            PageTableEntry::Resident {
                frame: 0x0100_1000,
                dirty: true,
            },
            PageTableEntry::Swapped { offset: 0 },
            PageTableEntry::Swapped { offset: 0x5000 },
        ];
        for entry in entries {
            assert_eq!(PageTableEntry::decode(entry.encode()), entry);
        }

        // Offset zero still has to read back as swapped, not unmapped.
        assert_eq!(PageTableEntry::Swapped { offset: 0 }.encode().raw_value(), 1);
    }

    #[test]
    fn test_tables_created_lazily() {
        let mut space = AddressSpace::new(1, Some(1));
        assert_eq!(space.entry(HEAP_START), None);
        assert_eq!(space.second_level_tables(), 0);

        *space.entry_mut(HEAP_START + 5) = PageTableEntry::Resident {
            frame: 0x0100_0000,
            dirty: true,
        };
        assert_eq!(space.second_level_tables(), 1);
        assert_eq!(
            space.entry(HEAP_START),
            Some(PageTableEntry::Resident {
                frame: 0x0100_0000,
                dirty: true
            })
        );
        // Same second-level table, different slot.
        assert_eq!(space.entry(HEAP_START + PAGE_SIZE), Some(PageTableEntry::Unmapped));

        space.entry_mut(STACK_END);
        assert_eq!(space.second_level_tables(), 2);
    }

    #[test]
    fn test_physical_lookup() {
        let mut space = AddressSpace::new(1, None);
        *space.entry_mut(HEAP_START) = PageTableEntry::Resident {
            frame: 0x0100_2000,
            dirty: true,
        };
        *space.entry_mut(HEAP_START + PAGE_SIZE) = PageTableEntry::Swapped { offset: 0x3000 };

        assert_eq!(space.physical_lookup(HEAP_START + 0x10), Some(0x0100_2000));
        assert_eq!(space.physical_lookup(HEAP_START + PAGE_SIZE), Some(0x3000));
        assert_eq!(space.physical_lookup(HEAP_START + 2 * PAGE_SIZE), None);
        assert_eq!(space.physical_lookup(STACK_END), None);
    }

    #[test]
    fn test_entries_walk() {
        let mut space = AddressSpace::new(1, None);
        *space.entry_mut(STACK_END) = PageTableEntry::Swapped { offset: 0 };
        *space.entry_mut(HEAP_START + PAGE_SIZE) = PageTableEntry::Resident {
            frame: 0x0100_0000,
            dirty: false,
        };

        let entries: Vec<_> = space.entries().collect();
        assert_eq!(
            entries,
            [
                (
                    HEAP_START + PAGE_SIZE,
                    PageTableEntry::Resident {
                        frame: 0x0100_0000,
                        dirty: false
                    }
                ),
                (STACK_END, PageTableEntry::Swapped { offset: 0 }),
            ]
        );
    }
}
