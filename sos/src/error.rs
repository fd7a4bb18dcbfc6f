use crate::io::IoStatus;
use crate::l4::{KernelError, SpaceId, Tid};
use crate::paging::PageKey;
use core::error::Error;
use core::fmt::{self, Display, Formatter};
use sos_shared::paging::Rights;

/// Conditions the memory manager cannot recover from locally.
///
/// Transient conditions (frame shortage, swap staging, double frees) are
/// handled internally and never show up here. Anything that does is meant for
/// the fatal path of the dispatch loop.
#[derive(Debug)]
pub enum VmError {
    /// A thread touched memory its region does not grant.
    AccessViolation {
        tid: Tid,
        addr: usize,
        ip: usize,
        requested: Rights,
        allowed: Rights,
    },
    /// A map, unmap, status or cache primitive failed.
    Kernel {
        operation: &'static str,
        space: SpaceId,
        vaddr: usize,
        error: KernelError,
    },
    /// The swap store has no room left, so nothing more can be evicted.
    SwapFull { offset: usize },
    /// The swap store failed a read or write for another reason.
    SwapIo { offset: usize, status: IoStatus },
    /// A swap read returned fewer bytes than were requested.
    ShortRead {
        offset: usize,
        expected: usize,
        actual: usize,
    },
    /// A completion arrived for a page with no operation in flight.
    UnexpectedCompletion(PageKey),
    /// Frames are exhausted and no resident page can be evicted.
    NoVictim,
    /// The bytes handed to the pager were not a page-fault message.
    MalformedFault { tid: Tid, tag: u32 },
    /// A fault arrived for an address space that is being torn down.
    SpaceTornDown(SpaceId),
    InvalidConfig(&'static str),
}

impl VmError {
    pub(crate) fn kernel(
        operation: &'static str,
        space: SpaceId,
        vaddr: usize,
    ) -> impl FnOnce(KernelError) -> VmError {
        move |error| {
            log::error!("{operation}(space {space}, {vaddr:#X}) failed: {error}");
            VmError::Kernel {
                operation,
                space,
                vaddr,
                error,
            }
        }
    }
}

impl Display for VmError {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            VmError::AccessViolation {
                tid,
                addr,
                ip,
                requested,
                allowed,
            } => write!(
                f,
                "thread {tid} at ip {ip:#X} tried {requested} access to {addr:#X}, region only allows {allowed}"
            ),
            VmError::Kernel {
                operation,
                space,
                vaddr,
                error,
            } => write!(f, "{operation} of {vaddr:#X} in space {space} failed: {error}"),
            VmError::SwapFull { offset } => {
                write!(f, "out of physical memory and swap space (offset {offset:#X})")
            }
            VmError::SwapIo { offset, status } => {
                write!(f, "swap I/O at offset {offset:#X} failed: {status:?}")
            }
            VmError::ShortRead {
                offset,
                expected,
                actual,
            } => write!(
                f,
                "swap read at offset {offset:#X} returned {actual} of {expected} bytes"
            ),
            VmError::UnexpectedCompletion(key) => write!(
                f,
                "swap completion for page {:#X} in space {} with nothing in flight",
                key.vaddr, key.space
            ),
            VmError::NoVictim => write!(f, "out of frames with no page left to evict"),
            VmError::MalformedFault { tid, tag } => {
                write!(f, "thread {tid} sent a non page-fault message (tag {tag:#X})")
            }
            VmError::SpaceTornDown(space) => {
                write!(f, "fault in address space {space} which is being torn down")
            }
            VmError::InvalidConfig(reason) => write!(f, "invalid configuration: {reason}"),
        }
    }
}

impl Error for VmError {}
