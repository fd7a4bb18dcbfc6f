//! Page-fault handling for user address spaces.

use super::{
    policy::{RegionKind, RegionTable},
    AddressSpace, PageKey, PageTableEntry,
};
use crate::config::VmConfig;
use crate::error::VmError;
use crate::io::{IoStatus, SwapRequest, SwapStorage};
use crate::l4::{Microkernel, PageFault, SpaceId, Tid};
use crate::mem::{FrameTable, FrameWindow};
use crate::swapping::{swap_space::SwapStats, Parked, SwapContext, SwapOutcome, Swapper};
use alloc::collections::{btree_map::Entry, BTreeMap};
use log::{debug, error, info, trace, warn};
use sos_shared::{
    mem::{page_align_down, VIRTUAL_START},
    paging::Rights,
};

/// How a fault was left.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FaultOutcome {
    /// A mapping is installed and the thread has been replied to.
    Replied,
    /// The thread is suspended and will be resumed by a swap completion. It
    /// faults again on resumption.
    Suspended,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Teardown {
    Complete,
    /// Transfers for the space are still in flight. It is marked dying and
    /// torn down after the last of them completes.
    Deferred,
}

pub struct Pager<K: Microkernel, S: SwapStorage> {
    frames: FrameTable,
    spaces: BTreeMap<SpaceId, AddressSpace>,
    regions: RegionTable,
    swapper: Swapper,
    kernel: K,
    storage: S,
}

impl<K: Microkernel, S: SwapStorage> Pager<K, S> {
    /// `window` must cover the whole of `config.frames`.
    pub fn new(
        config: VmConfig,
        window: FrameWindow,
        kernel: K,
        storage: S,
    ) -> Result<Self, VmError> {
        config.validate()?;
        if window.len() < config.frames.len() {
            return Err(VmError::InvalidConfig("frame window is smaller than the frame range"));
        }
        let frames = FrameTable::with_limit(
            window,
            config.frames.start,
            config.frames.end,
            config.frame_limit,
        );
        let swapper = Swapper::new(&config);
        info!(
            "pager up: {} frames, swap batches of {} bytes, {:?} replacement",
            frames.capacity(),
            config.swap_batch_size,
            config.replacement
        );

        Ok(Self {
            frames,
            spaces: BTreeMap::new(),
            regions: config.regions,
            swapper,
            kernel,
            storage,
        })
    }

    /// Registers an address space and the thread that owns it. Faults against
    /// spaces nobody registered create them on the spot; registering one of
    /// those later only records its owner.
    pub fn create_space(&mut self, space: SpaceId, owner: Tid) {
        match self.spaces.entry(space) {
            Entry::Vacant(entry) => {
                entry.insert(AddressSpace::new(space, Some(owner)));
            }
            Entry::Occupied(mut entry) => entry.get_mut().owner = Some(owner),
        }
    }

    /// Decodes a raw fault IPC from `tid` and handles it.
    pub fn dispatch_fault(
        &mut self,
        tid: Tid,
        space: SpaceId,
        message: &[u8],
    ) -> Result<FaultOutcome, VmError> {
        let fault = PageFault::decode(tid, space, message).inspect_err(|_| {
            error!("thread {tid} sent a message that is not a page fault");
        })?;
        self.handle_fault(&fault)
    }

    pub fn handle_fault(&mut self, fault: &PageFault) -> Result<FaultOutcome, VmError> {
        trace!(
            "fault: thread {} space {} addr {:#X} ip {:#X} access {}",
            fault.tid,
            fault.space,
            fault.addr,
            fault.ip,
            fault.access
        );

        // An empty request would be granted by any region, the null guard
        // included.
        let allowed = self.regions.rights_for(fault.addr);
        if fault.access.is_empty() || !self.regions.is_granted(fault.addr, fault.access) {
            error!(
                "access violation: thread {} at ip {:#X} tried {} on {:#X}, allowed {}",
                fault.tid, fault.ip, fault.access, fault.addr, allowed
            );
            return Err(VmError::AccessViolation {
                tid: fault.tid,
                addr: fault.addr,
                ip: fault.ip,
                requested: fault.access,
                allowed,
            });
        }

        if fault.addr < VIRTUAL_START {
            let page = page_align_down(fault.addr);
            self.kernel
                .map(fault.space, page, page, Rights::FULLY_ACCESSIBLE)
                .map_err(VmError::kernel("map", fault.space, page))?;
            self.kernel.reply(fault.tid);
            return Ok(FaultOutcome::Replied);
        }

        if self.spaces.get(&fault.space).is_some_and(AddressSpace::is_dying) {
            warn!(
                "thread {} faulted in space {} which is being torn down",
                fault.tid, fault.space
            );
            return Err(VmError::SpaceTornDown(fault.space));
        }

        let key = PageKey::new(fault.space, fault.addr);
        let thread = Parked::new(fault.tid, fault.space);
        if self.swapper.park(key, thread, &mut self.kernel) {
            return Ok(FaultOutcome::Suspended);
        }

        let entry = *self.space_mut(fault.space).entry_mut(key.vaddr);
        match entry {
            PageTableEntry::Unmapped => {
                let Some(frame) = self.obtain_frame(thread)? else {
                    return Ok(FaultOutcome::Suspended);
                };
                // Nothing has ever been written for a new page.
                *self.space_mut(key.space).entry_mut(key.vaddr) =
                    PageTableEntry::Resident { frame, dirty: true };
                if self.is_pageable(key.vaddr) {
                    self.swapper.track(key);
                }
                debug!("new page {:#X} of space {} in frame {frame:#X}", key.vaddr, key.space);
                self.install(fault, key, frame)
            }
            PageTableEntry::Swapped { offset } => {
                let Some(frame) = self.obtain_frame(thread)? else {
                    return Ok(FaultOutcome::Suspended);
                };
                let (swapper, mut ctx) = self.split();
                swapper.swap_in(thread, key, offset, frame, &mut ctx);
                Ok(FaultOutcome::Suspended)
            }
            PageTableEntry::Resident { frame, dirty } => {
                if !dirty && fault.access.contains(Rights::WRITE) {
                    *self.space_mut(key.space).entry_mut(key.vaddr) =
                        PageTableEntry::Resident { frame, dirty: true };
                }
                self.install(fault, key, frame)
            }
        }
    }

    /// Removes every hardware mapping of `space` and flushes the caches.
    /// Frames and page tables are left alone. No reply is sent, so this also
    /// serves the debug request a thread makes about its own space.
    pub fn unmap_all(&mut self, space: SpaceId) -> Result<(), VmError> {
        if let Some(address_space) = self.spaces.get(&space) {
            for (vaddr, entry) in address_space.entries() {
                if let PageTableEntry::Resident { .. } = entry {
                    self.kernel
                        .unmap(space, vaddr)
                        .map_err(VmError::kernel("unmap", space, vaddr))?;
                }
            }
        }
        self.kernel
            .cache_flush()
            .map_err(VmError::kernel("cache_flush", space, 0))
    }

    /// Gives back every frame and swap slot held by `space` and drops its page
    /// tables. Unknown spaces are already torn down.
    pub fn teardown(&mut self, space: SpaceId) -> Result<Teardown, VmError> {
        let Some(address_space) = self.spaces.get_mut(&space) else {
            return Ok(Teardown::Complete);
        };
        if !self.swapper.has_pending(space) {
            self.finish_teardown(space);
            return Ok(Teardown::Complete);
        }

        address_space.dying = true;
        for offset in self.swapper.forget_space(space) {
            self.storage.release(offset);
        }
        info!("teardown of space {space} deferred until its swap transfers finish");
        Ok(Teardown::Deferred)
    }

    pub fn physical_lookup(&self, space: SpaceId, vaddr: usize) -> Option<usize> {
        self.spaces.get(&space)?.physical_lookup(vaddr)
    }

    /// The entry for `vaddr`, or `None` if its second-level table does not
    /// exist.
    pub fn table_lookup(&self, space: SpaceId, vaddr: usize) -> Option<PageTableEntry> {
        self.spaces.get(&space)?.entry(vaddr)
    }

    /// Bytes of a resident page that is not mid-transfer.
    pub fn page_contents(&self, space: SpaceId, vaddr: usize) -> Option<&[u8]> {
        let key = PageKey::new(space, vaddr);
        if self.swapper.is_pending(key) {
            return None;
        }
        let frame = self.table_lookup(space, key.vaddr)?.frame()?;
        Some(self.frames.bytes(frame))
    }

    /// Like [`Pager::page_contents`], but for writing. The page is marked
    /// dirty.
    pub fn page_contents_mut(&mut self, space: SpaceId, vaddr: usize) -> Option<&mut [u8]> {
        let key = PageKey::new(space, vaddr);
        if self.swapper.is_pending(key) {
            return None;
        }
        let entry = self.spaces.get_mut(&space)?.existing_entry_mut(key.vaddr)?;
        let PageTableEntry::Resident { frame, dirty } = entry else {
            return None;
        };
        *dirty = true;
        let frame = *frame;
        Some(self.frames.bytes_mut(frame))
    }

    pub fn swap_write_completed(
        &mut self,
        request: SwapRequest,
        status: IoStatus,
    ) -> Result<(), VmError> {
        let (swapper, mut ctx) = self.split();
        swapper.write_completed(request, status, &mut ctx)?;
        self.finish_deferred(request.key.space);
        Ok(())
    }

    pub fn swap_read_completed(
        &mut self,
        request: SwapRequest,
        status: IoStatus,
        data: &[u8],
    ) -> Result<(), VmError> {
        let (swapper, mut ctx) = self.split();
        swapper.read_completed(request, status, data, &mut ctx)?;
        self.finish_deferred(request.key.space);
        Ok(())
    }

    pub fn stats(&self) -> SwapStats {
        self.swapper.stats()
    }

    pub fn frames(&self) -> &FrameTable {
        &self.frames
    }

    pub fn swapper(&self) -> &Swapper {
        &self.swapper
    }

    pub fn space(&self, space: SpaceId) -> Option<&AddressSpace> {
        self.spaces.get(&space)
    }

    pub fn kernel(&self) -> &K {
        &self.kernel
    }

    pub fn kernel_mut(&mut self) -> &mut K {
        &mut self.kernel
    }

    pub fn storage(&self) -> &S {
        &self.storage
    }

    pub fn storage_mut(&mut self) -> &mut S {
        &mut self.storage
    }

    fn split(&mut self) -> (&mut Swapper, SwapContext<'_>) {
        (
            &mut self.swapper,
            SwapContext {
                frames: &mut self.frames,
                spaces: &mut self.spaces,
                kernel: &mut self.kernel,
                storage: &mut self.storage,
            },
        )
    }

    fn space_mut(&mut self, space: SpaceId) -> &mut AddressSpace {
        self.spaces.entry(space).or_insert_with(|| {
            debug!("creating address space {space} on first fault");
            AddressSpace::new(space, None)
        })
    }

    /// The shared IPC buffer must stay where the kernel expects it.
    fn is_pageable(&self, vaddr: usize) -> bool {
        !matches!(
            self.regions.region_for(vaddr),
            Some(region) if region.kind == RegionKind::Ipc
        )
    }

    /// A free frame, evicting pages until one is available. `None` means the
    /// thread has been suspended behind a swap-out.
    fn obtain_frame(&mut self, thread: Parked) -> Result<Option<usize>, VmError> {
        loop {
            if let Some(frame) = self.frames.alloc() {
                return Ok(Some(frame));
            }
            let (swapper, mut ctx) = self.split();
            if swapper.swap_out(thread, &mut ctx)? == SwapOutcome::Pending {
                return Ok(None);
            }
        }
    }

    fn install(
        &mut self,
        fault: &PageFault,
        key: PageKey,
        frame: usize,
    ) -> Result<FaultOutcome, VmError> {
        self.kernel
            .map(key.space, key.vaddr, frame, fault.access)
            .map_err(VmError::kernel("map", key.space, key.vaddr))?;
        self.kernel.reply(fault.tid);
        Ok(FaultOutcome::Replied)
    }

    fn finish_deferred(&mut self, space: SpaceId) {
        let dying = self.spaces.get(&space).is_some_and(AddressSpace::is_dying);
        if dying && !self.swapper.has_pending(space) {
            info!("finishing deferred teardown of space {space}");
            self.finish_teardown(space);
        }
    }

    fn finish_teardown(&mut self, space: SpaceId) {
        let Some(address_space) = self.spaces.remove(&space) else {
            return;
        };
        let tables = address_space.second_level_tables();
        let (mut frames, mut slots) = (0, 0);
        for (_, entry) in address_space.entries() {
            match entry {
                PageTableEntry::Resident { frame, .. } => {
                    self.frames.free(frame);
                    frames += 1;
                }
                PageTableEntry::Swapped { offset } => {
                    self.storage.release(offset);
                    slots += 1;
                }
                PageTableEntry::Unmapped => {}
            }
        }
        for offset in self.swapper.forget_space(space) {
            self.storage.release(offset);
            slots += 1;
        }
        debug!("space {space} torn down: {frames} frames, {slots} slots and {tables} tables released");
    }
}
