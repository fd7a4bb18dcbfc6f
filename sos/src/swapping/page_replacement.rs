use crate::config::Replacement;
use crate::error::VmError;
use crate::l4::{Microkernel, SpaceId};
use crate::paging::PageKey;
use alloc::{boxed::Box, collections::VecDeque};

/// A page in the eviction queue.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ResidentPage {
    pub space: SpaceId,
    pub vaddr: usize,
    /// The slot this page was last written to, if any. Kept across swap-ins
    /// so a clean page can be dropped without another write.
    pub swap_offset: Option<usize>,
}

impl ResidentPage {
    pub fn new(key: PageKey, swap_offset: Option<usize>) -> Self {
        Self {
            space: key.space,
            vaddr: key.vaddr,
            swap_offset,
        }
    }

    pub fn key(&self) -> PageKey {
        PageKey::new(self.space, self.vaddr)
    }
}

/// Every pageable resident page, oldest first.
#[derive(Debug, Default)]
pub struct ResidentQueue(VecDeque<ResidentPage>);

impl ResidentQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push_back(&mut self, page: ResidentPage) {
        debug_assert!(
            !self.0.iter().any(|p| p.key() == page.key()),
            "page {:#X} of space {} queued twice",
            page.vaddr,
            page.space
        );
        self.0.push_back(page);
    }

    pub fn pop_front(&mut self) -> Option<ResidentPage> {
        self.0.pop_front()
    }

    /// Drops every page of `space`, returning them.
    pub fn remove_space(&mut self, space: SpaceId) -> VecDeque<ResidentPage> {
        let (removed, kept) = self.0.drain(..).partition(|p| p.space == space);
        self.0 = kept;
        removed
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &ResidentPage> {
        self.0.iter()
    }
}

pub trait PageReplacementPolicy {
    /// Removes and returns the page to evict next, or `None` if the queue is
    /// empty. On return the victim's mapping has been removed.
    fn select_victim(
        &mut self,
        queue: &mut ResidentQueue,
        kernel: &mut dyn Microkernel,
    ) -> Result<Option<ResidentPage>, VmError>;
}

pub fn policy_for(replacement: Replacement) -> Box<dyn PageReplacementPolicy> {
    match replacement {
        Replacement::SecondChance => Box::new(SecondChance),
        Replacement::Fifo => Box::new(Fifo),
    }
}

/// Clock over the resident queue, using the presence of the hardware mapping
/// as the reference bit.
///
/// A page whose mapping is present has been touched since the last pass: it
/// is unmapped and moved to the back. The first page found without a mapping
/// is the victim. Every page is unmapped after one full pass, so this always
/// terminates within two.
pub struct SecondChance;

impl PageReplacementPolicy for SecondChance {
    fn select_victim(
        &mut self,
        queue: &mut ResidentQueue,
        kernel: &mut dyn Microkernel,
    ) -> Result<Option<ResidentPage>, VmError> {
        while let Some(page) = queue.pop_front() {
            let status = kernel
                .mapping_status(page.space, page.vaddr)
                .map_err(VmError::kernel("mapping_status", page.space, page.vaddr))?;
            if !status.present {
                return Ok(Some(page));
            }

            log::trace!("second chance for {:#X} in space {}", page.vaddr, page.space);
            kernel
                .unmap(page.space, page.vaddr)
                .map_err(VmError::kernel("unmap", page.space, page.vaddr))?;
            queue.push_back(page);
        }

        Ok(None)
    }
}

/// Evicts the oldest page.
pub struct Fifo;

impl PageReplacementPolicy for Fifo {
    fn select_victim(
        &mut self,
        queue: &mut ResidentQueue,
        kernel: &mut dyn Microkernel,
    ) -> Result<Option<ResidentPage>, VmError> {
        let Some(page) = queue.pop_front() else {
            return Ok(None);
        };
        let status = kernel
            .mapping_status(page.space, page.vaddr)
            .map_err(VmError::kernel("mapping_status", page.space, page.vaddr))?;
        if status.present {
            kernel
                .unmap(page.space, page.vaddr)
                .map_err(VmError::kernel("unmap", page.space, page.vaddr))?;
        }
        Ok(Some(page))
    }
}
