//! The narrow slice of the microkernel the memory manager talks to: thread
//! and address-space identities, the mapping primitives, thread control and
//! the page-fault message format.

// Message words are 32 bits on the target.
#![allow(clippy::cast_possible_truncation)]

use crate::error::VmError;
use arbitrary_int::{u12, u4, u6};
use bitbybit::bitfield;
use core::fmt::{self, Display, Formatter};
use sos_shared::paging::Rights;
use zerocopy::{AsBytes, FromBytes, FromZeroes};

pub type Tid = u16;
pub type SpaceId = u16;

/// Upper twelve bits of the 16-bit label of a page-fault message (-2).
pub const PAGE_FAULT_LABEL: u16 = 0xFFE;

/// Error codes reported by the microkernel's map, unmap, status and cache
/// primitives.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum KernelError {
    NoPrivilege,
    InvalidThread,
    InvalidSpace,
    InvalidParameter,
    OutOfMemory,
    Other(u32),
}

impl KernelError {
    pub fn code(&self) -> u32 {
        match self {
            KernelError::NoPrivilege => 1,
            KernelError::InvalidThread => 2,
            KernelError::InvalidSpace => 3,
            KernelError::InvalidParameter => 5,
            KernelError::OutOfMemory => 8,
            KernelError::Other(code) => *code,
        }
    }
}

impl Display for KernelError {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        let description = match self {
            KernelError::NoPrivilege => "no privilege",
            KernelError::InvalidThread => "invalid thread",
            KernelError::InvalidSpace => "invalid space",
            KernelError::InvalidParameter => "invalid parameter",
            KernelError::OutOfMemory => "out of memory",
            KernelError::Other(_) => "unknown error",
        };
        write!(f, "{description} (code {})", self.code())
    }
}

/// What the kernel knows about one hardware mapping.
///
/// `present` stands in for the hardware reference bit: the swapper tears
/// mappings down to clear it and treats a mapping that is back as referenced.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct MappingStatus {
    pub present: bool,
    pub rights: Rights,
}

impl MappingStatus {
    pub const ABSENT: Self = Self {
        present: false,
        rights: Rights::NO_ACCESS,
    };
}

/// Primitives the pager and swapper need from the microkernel.
///
/// A suspended thread has its outstanding fault aborted. Resuming it makes it
/// re-execute the faulting instruction, so it faults again unless the page
/// has been mapped in the meantime.
pub trait Microkernel {
    fn map(
        &mut self,
        space: SpaceId,
        vaddr: usize,
        frame: usize,
        rights: Rights,
    ) -> Result<(), KernelError>;

    fn unmap(&mut self, space: SpaceId, vaddr: usize) -> Result<(), KernelError>;

    fn mapping_status(&mut self, space: SpaceId, vaddr: usize)
        -> Result<MappingStatus, KernelError>;

    /// Flushes the whole data and instruction cache.
    fn cache_flush(&mut self) -> Result<(), KernelError>;

    fn suspend(&mut self, tid: Tid);

    fn resume(&mut self, tid: Tid);

    /// Completes an outstanding fault with an empty reply.
    fn reply(&mut self, tid: Tid);
}

#[bitfield(u32)]
pub struct MessageTag {
    #[bits(20..=31, r)]
    label: u12,
    #[bits(16..=19, r)]
    access: u4,
    #[bits(0..=5, r)]
    untyped_words: u6,
}

/// Page-fault IPC as delivered to the pager: the message tag followed by the
/// faulting address and instruction pointer.
#[repr(C)]
#[derive(Clone, Copy, Debug, FromZeroes, FromBytes, AsBytes)]
pub struct FaultMessage {
    pub tag: u32,
    pub addr: u32,
    pub ip: u32,
}

impl FaultMessage {
    pub fn new(addr: usize, ip: usize, access: Rights) -> Self {
        let tag = (u32::from(PAGE_FAULT_LABEL) << 20) | (u32::from(access.raw_value()) << 16) | 2;
        Self {
            tag,
            addr: addr as u32,
            ip: ip as u32,
        }
    }
}

/// A decoded page fault.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PageFault {
    pub tid: Tid,
    pub space: SpaceId,
    pub addr: usize,
    pub ip: usize,
    pub access: Rights,
}

impl PageFault {
    pub fn new(tid: Tid, space: SpaceId, addr: usize, ip: usize, access: Rights) -> Self {
        Self {
            tid,
            space,
            addr,
            ip,
            access,
        }
    }

    /// Decodes the raw bytes of a fault IPC sent on behalf of `tid`.
    pub fn decode(tid: Tid, space: SpaceId, bytes: &[u8]) -> Result<Self, VmError> {
        let message = FaultMessage::read_from_prefix(bytes).ok_or(VmError::MalformedFault {
            tid,
            tag: 0,
        })?;
        let tag = MessageTag::new_with_raw_value(message.tag);
        // A fault always reports the access that caused it.
        if tag.label().value() != PAGE_FAULT_LABEL
            || tag.untyped_words().value() < 2
            || tag.access().value() == 0
        {
            return Err(VmError::MalformedFault {
                tid,
                tag: message.tag,
            });
        }

        Ok(Self {
            tid,
            space,
            addr: message.addr as usize,
            ip: message.ip as usize,
            access: Rights::from_bits(tag.access().value()),
        })
    }
}
