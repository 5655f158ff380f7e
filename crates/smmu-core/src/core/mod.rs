mod access;
mod address;
pub(crate) mod macros;
mod vcpu_id;

pub use self::{
    access::{Access, FaultErrorCode},
    address::{Gfn, Gpa, Gva, Hva, PAGE_OFFSET_MASK, PAGE_SHIFT, PAGE_SIZE, Pfn},
    vcpu_id::VcpuId,
};
