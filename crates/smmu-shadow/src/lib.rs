//! Shadow page table engine.
//!
//! Builds and maintains the translation tables a CPU without (or not using)
//! nested paging walks on behalf of a guest. With two-dimensional addressing
//! the tables map guest physical to host physical addresses directly; while
//! shadowing, they mirror the guest's own page tables, which are kept
//! write-protected so the shadow can follow every change.
//!
//! The entry point is [`ShadowMmu`], shared by all vCPUs of a VM. Each vCPU
//! owns a [`Vcpu`] holding its roots and allocation pools. Everything the
//! engine needs from the surrounding hypervisor is described by the
//! [`MmuHost`] traits; guest page tables are read through a
//! [`GuestWalker`].
//!
//! # Example
//!
//! ```no_run
//! # use smmu_core::{FaultErrorCode, Gva, MmuError};
//! # use smmu_shadow::{FaultOutcome, MmuConfig, MmuContext, MmuHost, NoGuestWalker, ShadowMmu};
//! # fn example(host: impl MmuHost) -> Result<(), MmuError> {
//! let mmu = ShadowMmu::new(host, MmuConfig::default());
//! let mut vcpu = mmu.create_vcpu(0, MmuContext::tdp());
//!
//! match mmu.handle_page_fault(&mut vcpu, &NoGuestWalker, Gva(0x1000), FaultErrorCode::WRITE)? {
//!     FaultOutcome::Retry => {}
//!     outcome => println!("{outcome:?}"),
//! }
//!
//! mmu.destroy_vcpu(vcpu)?;
//! # Ok(())
//! # }
//! ```

mod arena;
mod cache;
mod config;
mod epoch;
mod fault;
mod host;
mod mmu;
mod notifier;
mod page;
mod pool;
mod pte_list;
mod reclaim;
mod rmap;
mod roots;
mod slab;
mod slot;
mod state;
mod stats;
mod sync;
mod vcpu;
mod walk;
mod write;
mod zap;

#[cfg(test)]
extern crate self as smmu_shadow;

#[cfg(test)]
mod tests;

pub use self::{
    config::MmuConfig,
    fault::FaultOutcome,
    host::{
        ChangeNotifier, GfnRange, GuestPte, GuestRoot, GuestTable, GuestWalk, GuestWalker,
        HostFrames, HostOps, MemorySlots, MmuHost, NoGuestWalker, ResolveMode, ResolvedFrame,
    },
    mmu::{ShadowMmu, ShadowPageInfo},
    reclaim::{ShrinkRegistry, Shrinkable},
    slot::{DefaultCell, NativeCell, PageTable, SplitCell, SpteCell},
    stats::{MmuStats, MmuStatsSnapshot},
    vcpu::{MmioInfo, MmuContext, Vcpu},
    walk::{ShadowTranslation, ShadowTranslationEntry},
};
