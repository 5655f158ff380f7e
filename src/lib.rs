//! A shadow memory management unit for CPU virtualization.
//!
//! This crate re-exports the workspace members behind cargo features:
//!
//! - `arch-amd64` - x86 paging vocabulary ([`arch::amd64`])
//! - `shadow` - the shadow page table engine ([`shadow`])
//!
//! The core vocabulary shared by every member is always available at the
//! crate root.

#![cfg_attr(docsrs, feature(doc_cfg))]

pub use smmu_core::*;

/// Architecture definitions.
pub mod arch {
    #[cfg(feature = "arch-amd64")]
    #[cfg_attr(docsrs, doc(cfg(feature = "arch-amd64")))]
    pub use smmu_arch_amd64 as amd64;
}

#[cfg(feature = "shadow")]
#[cfg_attr(docsrs, doc(cfg(feature = "shadow")))]
pub use smmu_shadow as shadow;

#[cfg(feature = "shadow")]
#[cfg_attr(docsrs, doc(cfg(feature = "shadow")))]
pub use smmu_shadow::{FaultOutcome, MmuConfig, MmuContext, MmuHost, ShadowMmu, Vcpu};
