//! Virtual memory for the SOS server: frames, per-process page tables, the
//! fault handler and second-chance swapping to a file-backed swap region.
//!
//! The crate does not talk to the microkernel or the file service directly.
//! Both come in through [`l4::Microkernel`] and [`io::SwapStorage`], and the
//! dispatch loop hands faults and swap completions to [`paging::pager::Pager`].

#![cfg_attr(not(test), no_std)]

extern crate alloc;

pub mod config;
pub mod error;
pub mod io;
pub mod l4;
pub mod logging;
pub mod mem;
pub mod paging;
pub mod swapping;

#[cfg(test)]
mod testing;

pub use config::VmConfig;
pub use error::VmError;
pub use paging::pager::{FaultOutcome, Pager, Teardown};
