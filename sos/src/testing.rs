//! In-memory stand-ins for physical memory, the microkernel and the swap
//! file.

use crate::error::VmError;
use crate::io::{IoStatus, SwapRequest, SwapStorage};
use crate::l4::{KernelError, MappingStatus, Microkernel, PageFault, SpaceId, Tid};
use crate::logging;
use crate::mem::FrameWindow;
use crate::paging::pager::{FaultOutcome, Pager};
use crate::VmConfig;
use alloc::collections::{BTreeMap, VecDeque};
use core::fmt;
use core::ops::Range;
use core::ptr::NonNull;
use log::LevelFilter;
use sos_shared::{
    mem::{page_align_down, PAGE_SIZE},
    paging::Rights,
};
use std::sync::{Mutex, Once};

pub const FRAME_START: usize = 0x0100_0000;

/// Zeroed memory that lives for the rest of the test run.
pub fn physical_memory(len: usize) -> NonNull<u8> {
    NonNull::from(Box::leak(vec![0u8; len].into_boxed_slice())).cast()
}

static LOG_LINES: Mutex<Vec<String>> = Mutex::new(Vec::new());

fn record(args: fmt::Arguments<'_>) {
    LOG_LINES.lock().unwrap().push(args.to_string());
}

/// Routes every log line of the test run into memory. Call before the code
/// whose output is checked.
pub fn capture_logs() {
    static INIT: Once = Once::new();
    INIT.call_once(|| logging::init_with_level(record, LevelFilter::Trace));
}

/// Whether any captured line contains `text`. Tests run in parallel, so
/// lines from other tests are in there too.
pub fn logged(text: &str) -> bool {
    LOG_LINES.lock().unwrap().iter().any(|line| line.contains(text))
}

pub struct FakeKernel {
    /// Physical memory backing the managed frames, as user threads reach it.
    ram: NonNull<u8>,
    frames: Range<usize>,
    mappings: BTreeMap<(SpaceId, usize), (usize, Rights)>,
    pub suspended: Vec<Tid>,
    pub resumed: Vec<Tid>,
    pub replies: Vec<Tid>,
    pub flushes: usize,
    /// Returned by the next `map` instead of mapping.
    pub fail_map: Option<KernelError>,
}

impl FakeKernel {
    pub fn new(ram: NonNull<u8>, frames: Range<usize>) -> Self {
        Self {
            ram,
            frames,
            mappings: BTreeMap::new(),
            suspended: Vec::new(),
            resumed: Vec::new(),
            replies: Vec::new(),
            flushes: 0,
            fail_map: None,
        }
    }

    /// The physical address `vaddr` of `space` reaches, if it is mapped with
    /// `needed`.
    fn translate(&self, space: SpaceId, vaddr: usize, needed: Rights) -> usize {
        let page = page_align_down(vaddr);
        let Some(&(frame, rights)) = self.mappings.get(&(space, page)) else {
            panic!("{vaddr:#X} is not mapped in space {space}");
        };
        assert!(rights.contains(needed), "{vaddr:#X} is mapped {rights}");
        assert!(self.frames.contains(&frame), "{frame:#X} is not a managed frame");
        frame - self.frames.start + (vaddr - page)
    }

    /// A store by a user thread, through its hardware mapping.
    pub fn user_write(&mut self, space: SpaceId, vaddr: usize, data: &[u8]) {
        let at = self.translate(space, vaddr, Rights::WRITE);
        assert!(vaddr - page_align_down(vaddr) + data.len() <= PAGE_SIZE);
        unsafe {
            self.ram
                .as_ptr()
                .add(at)
                .copy_from_nonoverlapping(data.as_ptr(), data.len());
        }
    }

    /// A load by a user thread, through its hardware mapping.
    pub fn user_read(&self, space: SpaceId, vaddr: usize, len: usize) -> Vec<u8> {
        let at = self.translate(space, vaddr, Rights::READ);
        assert!(vaddr - page_align_down(vaddr) + len <= PAGE_SIZE);
        unsafe { std::slice::from_raw_parts(self.ram.as_ptr().add(at), len) }.to_vec()
    }

    pub fn is_mapped(&self, space: SpaceId, vaddr: usize) -> bool {
        self.mappings.contains_key(&(space, vaddr))
    }

    pub fn mapping(&self, space: SpaceId, vaddr: usize) -> Option<(usize, Rights)> {
        self.mappings.get(&(space, vaddr)).copied()
    }

    pub fn mapped_count(&self) -> usize {
        self.mappings.len()
    }
}

impl Microkernel for FakeKernel {
    fn map(
        &mut self,
        space: SpaceId,
        vaddr: usize,
        frame: usize,
        rights: Rights,
    ) -> Result<(), KernelError> {
        if let Some(error) = self.fail_map.take() {
            return Err(error);
        }
        self.mappings.insert((space, vaddr), (frame, rights));
        Ok(())
    }

    fn unmap(&mut self, space: SpaceId, vaddr: usize) -> Result<(), KernelError> {
        self.mappings.remove(&(space, vaddr));
        Ok(())
    }

    fn mapping_status(
        &mut self,
        space: SpaceId,
        vaddr: usize,
    ) -> Result<MappingStatus, KernelError> {
        Ok(match self.mappings.get(&(space, vaddr)) {
            Some(&(_, rights)) => MappingStatus {
                present: true,
                rights,
            },
            None => MappingStatus::ABSENT,
        })
    }

    fn cache_flush(&mut self) -> Result<(), KernelError> {
        self.flushes += 1;
        Ok(())
    }

    fn suspend(&mut self, tid: Tid) {
        self.suspended.push(tid);
    }

    fn resume(&mut self, tid: Tid) {
        self.resumed.push(tid);
    }

    fn reply(&mut self, tid: Tid) {
        self.replies.push(tid);
    }
}

enum Issued {
    Read(SwapRequest),
    Write(SwapRequest, Vec<u8>),
}

/// Swap file backed by a byte vector. Requests are held until delivered.
#[derive(Default)]
pub struct FakeStorage {
    pub region: Vec<u8>,
    issued: VecDeque<Issued>,
    pub released: Vec<usize>,
    pub reads: usize,
    pub writes: usize,
    /// Report every write as failing for lack of space.
    pub full: bool,
    /// Status of the next completion delivered, whatever its kind.
    pub fail_next: Option<IoStatus>,
    /// Deliver reads one byte short.
    pub short_reads: bool,
}

impl FakeStorage {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn in_flight(&self) -> usize {
        self.issued.len()
    }

    pub fn written_offsets(&self) -> Vec<usize> {
        self.issued
            .iter()
            .filter_map(|issued| match issued {
                Issued::Write(request, _) => Some(request.offset),
                Issued::Read(_) => None,
            })
            .collect()
    }

    pub fn slot(&self, offset: usize) -> &[u8] {
        &self.region[offset..offset + PAGE_SIZE]
    }
}

impl SwapStorage for FakeStorage {
    fn read(&mut self, request: SwapRequest) {
        self.reads += 1;
        self.issued.push_back(Issued::Read(request));
    }

    fn write(&mut self, request: SwapRequest, data: &[u8]) {
        assert_eq!(data.len(), request.len);
        self.writes += 1;
        self.issued.push_back(Issued::Write(request, data.to_vec()));
    }

    fn release(&mut self, offset: usize) {
        self.released.push(offset);
    }
}

pub type TestPager = Pager<FakeKernel, FakeStorage>;

pub fn pager(frames: usize) -> TestPager {
    pager_with(VmConfig::new(FRAME_START..FRAME_START + frames * PAGE_SIZE))
}

pub fn pager_with(config: VmConfig) -> TestPager {
    let ram = physical_memory(config.frames.len());
    let window = unsafe { FrameWindow::new(ram, config.frames.len()) };
    let kernel = FakeKernel::new(ram, config.frames.clone());
    Pager::new(config, window, kernel, FakeStorage::new()).unwrap()
}

pub fn fault(
    pager: &mut TestPager,
    tid: Tid,
    space: SpaceId,
    addr: usize,
    access: Rights,
) -> Result<FaultOutcome, VmError> {
    pager.handle_fault(&PageFault::new(tid, space, addr, 0x0200_0000, access))
}

/// Delivers the oldest outstanding request. Returns `None` if there is none.
pub fn complete_next(pager: &mut TestPager) -> Option<Result<(), VmError>> {
    let storage = pager.storage_mut();
    let issued = storage.issued.pop_front()?;
    if let Some(status) = storage.fail_next.take() {
        return Some(match issued {
            Issued::Write(request, _) => pager.swap_write_completed(request, status),
            Issued::Read(request) => pager.swap_read_completed(request, status, &[]),
        });
    }
    match issued {
        Issued::Write(request, data) => {
            let status = if storage.full {
                IoStatus::NoSpace
            } else {
                let end = request.offset + request.len;
                if storage.region.len() < end {
                    storage.region.resize(end, 0);
                }
                storage.region[request.offset..end].copy_from_slice(&data);
                IoStatus::Ok
            };
            Some(pager.swap_write_completed(request, status))
        }
        Issued::Read(request) => {
            let mut data = storage.region[request.offset..request.offset + request.len].to_vec();
            if storage.short_reads {
                data.pop();
            }
            Some(pager.swap_read_completed(request, IoStatus::Ok, &data))
        }
    }
}

/// Delivers everything outstanding, in issue order.
pub fn complete_all(pager: &mut TestPager) -> Result<(), VmError> {
    while let Some(result) = complete_next(pager) {
        result?;
    }
    Ok(())
}
