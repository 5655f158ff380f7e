//! AMD64 paging definitions for the shadow MMU.
//!
//! Describes the guest paging modes the MMU can shadow, the levels of the
//! shadow hierarchy and the bit layout of a shadow page table entry.

mod paging;
mod spte;

pub use self::{
    paging::{ENTRIES_PER_TABLE, LEVEL_BITS, PageTableLevel, PagingMode},
    spte::{MemoryType, Spte},
};
