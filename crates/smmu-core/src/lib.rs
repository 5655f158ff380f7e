//! Core vocabulary of the shadow MMU.
//!
//! Architecture-neutral newtypes for frame numbers and addresses, access
//! rights, fault error codes and the common error type shared by every crate
//! in the workspace.

mod core;
mod error;

pub use self::{
    core::{
        Access, FaultErrorCode, Gfn, Gpa, Gva, Hva, PAGE_OFFSET_MASK, PAGE_SHIFT, PAGE_SIZE, Pfn,
        VcpuId,
    },
    error::{GuestFault, MmuError},
};
