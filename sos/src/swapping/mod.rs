//! Second-chance swapping.
//!
//! Every pageable resident page sits in one queue. When the frame table runs
//! dry, the swapper picks a victim from that queue and either drops it (its
//! swap copy is current) or writes it out in batches. Pages come back in the
//! same batched way. Both directions are asynchronous: the thread that needs
//! the frame or the page is suspended, the transfer is recorded as a pending
//! operation keyed by the page, and the storage completions drive it to the
//! end, where the page table is rewritten before anyone is resumed.

pub mod page_replacement;
pub mod swap_space;

use crate::config::VmConfig;
use crate::error::VmError;
use crate::io::{IoStatus, SwapOp, SwapRequest, SwapStorage};
use crate::l4::{Microkernel, SpaceId, Tid};
use crate::mem::FrameTable;
use crate::paging::{AddressSpace, PageKey, PageTableEntry};
use alloc::{boxed::Box, collections::BTreeMap, vec, vec::Vec};
use log::{debug, error, trace};
use page_replacement::{policy_for, PageReplacementPolicy, ResidentPage, ResidentQueue};
use sos_shared::mem::PAGE_SIZE;
use swap_space::{SwapSpace, SwapStats};

/// Everything outside the swapper that a transfer touches.
pub struct SwapContext<'a> {
    pub frames: &'a mut FrameTable,
    pub spaces: &'a mut BTreeMap<SpaceId, AddressSpace>,
    pub kernel: &'a mut dyn Microkernel,
    pub storage: &'a mut dyn SwapStorage,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SwapOutcome {
    /// The initiator has been suspended and will be resumed once a frame has
    /// been freed.
    Pending,
    /// A frame was freed synchronously.
    Complete,
}

/// A suspended thread and the address space it faulted in.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Parked {
    pub tid: Tid,
    pub space: SpaceId,
}

impl Parked {
    pub fn new(tid: Tid, space: SpaceId) -> Self {
        Self { tid, space }
    }
}

/// A page in the middle of a transfer.
#[derive(Debug)]
struct PendingOp {
    op: SwapOp,
    frame: usize,
    page: ResidentPage,
    offset: usize,
    /// Bytes not yet acknowledged by the store.
    remaining: usize,
    /// Resumed once the transfer is done. The first one is the thread the
    /// transfer was started for.
    waiters: Vec<Parked>,
    issued: u64,
}

pub struct Swapper {
    queue: ResidentQueue,
    policy: Box<dyn PageReplacementPolicy>,
    swap_space: SwapSpace,
    pending: BTreeMap<PageKey, PendingOp>,
    batch_size: usize,
    issued: u64,
}

impl Swapper {
    pub fn new(config: &VmConfig) -> Self {
        Self {
            queue: ResidentQueue::new(),
            policy: policy_for(config.replacement),
            swap_space: SwapSpace::new(),
            pending: BTreeMap::new(),
            batch_size: config.swap_batch_size,
            issued: 0,
        }
    }

    pub fn stats(&self) -> SwapStats {
        self.swap_space.stats()
    }

    pub fn queue(&self) -> &ResidentQueue {
        &self.queue
    }

    /// Makes a freshly resident page a candidate for eviction.
    pub fn track(&mut self, key: PageKey) {
        self.queue.push_back(ResidentPage::new(key, None));
    }

    pub fn is_pending(&self, key: PageKey) -> bool {
        self.pending.contains_key(&key)
    }

    pub fn has_pending(&self, space: SpaceId) -> bool {
        self.pending.keys().any(|key| key.space == space)
    }

    /// If `key` is mid-transfer, suspends `thread` until the transfer is over
    /// and returns `true`.
    pub fn park(&mut self, key: PageKey, thread: Parked, kernel: &mut dyn Microkernel) -> bool {
        let Some(op) = self.pending.get_mut(&key) else {
            return false;
        };
        debug!(
            "thread {} waits for {:?} of {:#X} in space {}",
            thread.tid, op.op, key.vaddr, key.space
        );
        kernel.suspend(thread.tid);
        op.waiters.push(thread);
        true
    }

    /// Removes every queued page of `space`, returning the swap slots they
    /// still remember.
    pub fn forget_space(&mut self, space: SpaceId) -> Vec<usize> {
        self.queue
            .remove_space(space)
            .into_iter()
            .filter_map(|page| page.swap_offset)
            .collect()
    }

    /// Frees a frame by evicting a resident page on behalf of `initiator`.
    pub fn swap_out(
        &mut self,
        initiator: Parked,
        ctx: &mut SwapContext<'_>,
    ) -> Result<SwapOutcome, VmError> {
        let Some(mut victim) = self.policy.select_victim(&mut self.queue, &mut *ctx.kernel)?
        else {
            return self.park_on_oldest(initiator, &mut *ctx.kernel);
        };
        let key = victim.key();
        debug!("evicting {:#X} of space {}", key.vaddr, key.space);

        let entry = resident_entry(ctx.spaces, key);
        let PageTableEntry::Resident { frame, dirty } = *entry else {
            panic!("queued page {:#X} of space {} is {entry:?}", key.vaddr, key.space);
        };
        assert!(
            dirty || victim.swap_offset.is_some(),
            "clean page {:#X} of space {} has no swap copy",
            key.vaddr,
            key.space
        );

        let offset = *victim
            .swap_offset
            .get_or_insert_with(|| self.swap_space.assign_slot());

        if !dirty {
            *entry = PageTableEntry::Swapped { offset };
            ctx.frames.free(frame);
            self.swap_space.stats_mut().clean_evictions += 1;
            debug!("dropped clean page {:#X} of space {}", key.vaddr, key.space);
            return Ok(SwapOutcome::Complete);
        }

        ctx.kernel.suspend(initiator.tid);
        let data = ctx.frames.bytes(frame);
        for page_offset in (0..PAGE_SIZE).step_by(self.batch_size) {
            let request =
                SwapRequest::new(key, SwapOp::Write, offset, page_offset, self.batch_size);
            ctx.storage
                .write(request, &data[page_offset..page_offset + self.batch_size]);
        }
        debug!(
            "writing {:#X} of space {} to swap offset {offset:#X}",
            key.vaddr, key.space
        );

        self.start(key, SwapOp::Write, frame, victim, offset, initiator);
        Ok(SwapOutcome::Pending)
    }

    /// Stages the page at `offset` into `frame` and suspends `owner` until it
    /// is in. The page table entry is rewritten to `frame` right away; the page
    /// stays off the queue until the last batch arrives.
    pub fn swap_in(
        &mut self,
        owner: Parked,
        key: PageKey,
        offset: usize,
        frame: usize,
        ctx: &mut SwapContext<'_>,
    ) {
        *resident_entry(ctx.spaces, key) = PageTableEntry::Resident {
            frame,
            dirty: false,
        };

        ctx.kernel.suspend(owner.tid);
        for page_offset in (0..PAGE_SIZE).step_by(self.batch_size) {
            ctx.storage.read(SwapRequest::new(
                key,
                SwapOp::Read,
                offset,
                page_offset,
                self.batch_size,
            ));
        }
        debug!(
            "reading {:#X} of space {} from swap offset {offset:#X}",
            key.vaddr, key.space
        );

        let page = ResidentPage::new(key, Some(offset));
        self.start(key, SwapOp::Read, frame, page, offset, owner);
    }

    pub fn write_completed(
        &mut self,
        request: SwapRequest,
        status: IoStatus,
        ctx: &mut SwapContext<'_>,
    ) -> Result<(), VmError> {
        check_status(&request, status)?;
        let remaining = self.acknowledge(&request, SwapOp::Write)?.remaining;
        self.swap_space.stats_mut().bytes_written += request.len;
        if remaining > 0 {
            return Ok(());
        }

        let Some(op) = self.pending.remove(&request.key) else {
            return Err(VmError::UnexpectedCompletion(request.key));
        };
        *resident_entry(ctx.spaces, request.key) = PageTableEntry::Swapped { offset: op.offset };
        ctx.frames.free(op.frame);
        self.swap_space.stats_mut().swap_outs += 1;
        debug!(
            "{:#X} of space {} is out at offset {:#X}",
            request.key.vaddr, request.key.space, op.offset
        );

        wake(op.waiters, ctx);
        Ok(())
    }

    /// `data` holds the bytes the store returned for `request`.
    pub fn read_completed(
        &mut self,
        request: SwapRequest,
        status: IoStatus,
        data: &[u8],
        ctx: &mut SwapContext<'_>,
    ) -> Result<(), VmError> {
        check_status(&request, status)?;
        if data.len() < request.len {
            error!(
                "swap read at {:#X} came back with {} of {} bytes",
                request.offset,
                data.len(),
                request.len
            );
            return Err(VmError::ShortRead {
                offset: request.offset,
                expected: request.len,
                actual: data.len(),
            });
        }

        let op = self.acknowledge(&request, SwapOp::Read)?;
        let (frame, done) = (op.frame, op.remaining == 0);
        ctx.frames.bytes_mut(frame)[request.page_offset..request.page_offset + request.len]
            .copy_from_slice(&data[..request.len]);
        self.swap_space.stats_mut().bytes_read += request.len;
        if !done {
            return Ok(());
        }

        let Some(op) = self.pending.remove(&request.key) else {
            return Err(VmError::UnexpectedCompletion(request.key));
        };
        // A space being torn down gets no new eviction candidates. Its
        // frame goes with the rest of the space; the slot goes now.
        if ctx.spaces.get(&request.key.space).is_some_and(AddressSpace::is_dying) {
            if let Some(offset) = op.page.swap_offset {
                ctx.storage.release(offset);
            }
        } else {
            self.queue.push_back(op.page);
        }
        self.swap_space.stats_mut().swap_ins += 1;
        debug!(
            "{:#X} of space {} is back in frame {frame:#X}",
            request.key.vaddr, request.key.space
        );

        wake(op.waiters, ctx);
        Ok(())
    }

    fn start(
        &mut self,
        key: PageKey,
        op: SwapOp,
        frame: usize,
        page: ResidentPage,
        offset: usize,
        thread: Parked,
    ) {
        self.issued += 1;
        let previous = self.pending.insert(
            key,
            PendingOp {
                op,
                frame,
                page,
                offset,
                remaining: PAGE_SIZE,
                waiters: vec![thread],
                issued: self.issued,
            },
        );
        assert!(
            previous.is_none(),
            "second transfer started for {:#X} of space {}",
            key.vaddr,
            key.space
        );
    }

    /// Counts a batch against the page's pending operation.
    fn acknowledge(&mut self, request: &SwapRequest, op: SwapOp) -> Result<&PendingOp, VmError> {
        let pending = match self.pending.get_mut(&request.key) {
            Some(pending) if pending.op == op => pending,
            _ => {
                error!(
                    "{op:?} completion for {:#X} of space {} with nothing in flight",
                    request.key.vaddr, request.key.space
                );
                return Err(VmError::UnexpectedCompletion(request.key));
            }
        };
        assert!(
            request.len <= pending.remaining,
            "more bytes acknowledged than requested for {:#X}",
            request.key.vaddr
        );
        pending.remaining -= request.len;
        trace!(
            "{op:?} batch at {:#X} done, {} bytes left",
            request.offset,
            pending.remaining
        );
        Ok(pending)
    }

    /// Nothing left to evict. If a transfer is in flight the initiator waits
    /// for it, preferring the oldest write since that one frees a frame.
    fn park_on_oldest(
        &mut self,
        initiator: Parked,
        kernel: &mut dyn Microkernel,
    ) -> Result<SwapOutcome, VmError> {
        let oldest = self
            .pending
            .values_mut()
            .min_by_key(|op| (op.op != SwapOp::Write, op.issued));
        let Some(op) = oldest else {
            error!("out of frames and nothing to evict");
            return Err(VmError::NoVictim);
        };

        debug!(
            "no victim, thread {} waits for {:?} at offset {:#X}",
            initiator.tid, op.op, op.offset
        );
        kernel.suspend(initiator.tid);
        op.waiters.push(initiator);
        Ok(SwapOutcome::Pending)
    }
}

fn resident_entry(
    spaces: &mut BTreeMap<SpaceId, AddressSpace>,
    key: PageKey,
) -> &mut PageTableEntry {
    match spaces.get_mut(&key.space) {
        Some(space) => space.entry_mut(key.vaddr),
        None => panic!("page {:#X} belongs to unknown space {}", key.vaddr, key.space),
    }
}

fn check_status(request: &SwapRequest, status: IoStatus) -> Result<(), VmError> {
    match status {
        IoStatus::Ok => Ok(()),
        IoStatus::NoSpace => {
            match request.op {
                SwapOp::Write => error!(
                    "out of physical memory and swap space at offset {:#X}",
                    request.offset
                ),
                SwapOp::Read => error!(
                    "swap read at offset {:#X} reported the store full",
                    request.offset
                ),
            }
            Err(VmError::SwapFull {
                offset: request.offset,
            })
        }
        IoStatus::Error(_) => {
            error!(
                "swap {:?} at offset {:#X} failed: {status:?}",
                request.op, request.offset
            );
            Err(VmError::SwapIo {
                offset: request.offset,
                status,
            })
        }
    }
}

/// Resumes everyone parked on a finished transfer, except threads of spaces
/// that are gone or being torn down.
fn wake(waiters: Vec<Parked>, ctx: &mut SwapContext<'_>) {
    for thread in waiters {
        match ctx.spaces.get(&thread.space) {
            Some(space) if !space.is_dying() => ctx.kernel.resume(thread.tid),
            _ => trace!("not resuming thread {} of dead space {}", thread.tid, thread.space),
        }
    }
}
