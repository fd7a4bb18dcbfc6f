//! Static access control: which rights each part of the address space grants.

use alloc::vec::Vec;
use core::ops::Range;
use sos_shared::{
    mem::{
        HEAP_END, HEAP_START, IPC_END, IPC_START, NULL_GUARD_END, STACK_END, STACK_TOP,
        VIRTUAL_START,
    },
    paging::Rights,
};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RegionKind {
    NullGuard,
    /// Mapped one-to-one onto physical memory and never paged.
    Physical,
    Heap,
    Ipc,
    Stack,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Region {
    pub kind: RegionKind,
    pub range: Range<usize>,
    pub rights: Rights,
}

impl Region {
    pub const fn new(kind: RegionKind, range: Range<usize>, rights: Rights) -> Self {
        Self {
            kind,
            range,
            rights,
        }
    }
}

/// Default layout of every process.
pub const SOS_REGIONS: [Region; 5] = [
    Region::new(RegionKind::NullGuard, 0..NULL_GUARD_END, Rights::NO_ACCESS),
    Region::new(
        RegionKind::Physical,
        NULL_GUARD_END..VIRTUAL_START,
        Rights::FULLY_ACCESSIBLE,
    ),
    Region::new(RegionKind::Heap, HEAP_START..HEAP_END, Rights::READ_WRITE),
    Region::new(RegionKind::Ipc, IPC_START..IPC_END, Rights::READ_WRITE),
    Region::new(RegionKind::Stack, STACK_END..STACK_TOP, Rights::READ_WRITE),
];

/// Addresses outside every region grant nothing.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RegionTable {
    regions: Vec<Region>,
}

impl RegionTable {
    pub fn new(regions: Vec<Region>) -> Self {
        Self { regions }
    }

    pub fn regions(&self) -> &[Region] {
        &self.regions
    }

    pub fn region_for(&self, addr: usize) -> Option<&Region> {
        self.regions.iter().find(|r| r.range.contains(&addr))
    }

    pub fn rights_for(&self, addr: usize) -> Rights {
        self.region_for(addr)
            .map_or(Rights::NO_ACCESS, |region| region.rights)
    }

    pub fn is_granted(&self, addr: usize, requested: Rights) -> bool {
        self.rights_for(addr).contains(requested)
    }
}

impl Default for RegionTable {
    fn default() -> Self {
        Self::new(SOS_REGIONS.to_vec())
    }
}
