use serde::{Deserialize, Serialize};
use smmu_arch_amd64::{PageTableLevel, PagingMode};
use smmu_core::{Access, Gfn, Gva, VcpuId};

use crate::{
    arena::TableId,
    config::MmuConfig,
    page::{PageId, Role},
    pool::VcpuPools,
};

/// The paging context a vCPU translates under.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MmuContext {
    /// The guest address is a guest physical address (two-dimensional
    /// addressing). Otherwise the guest page tables are shadowed.
    pub direct_map: bool,

    /// The guest paging mode.
    pub mode: PagingMode,

    /// Supervisor writes honor the write-protect bit.
    pub cr0_wp: bool,

    /// Execute-disable is enabled.
    pub nxe: bool,
}

impl MmuContext {
    /// Creates a context for two-dimensional addressing.
    pub fn tdp() -> Self {
        Self {
            direct_map: true,
            mode: PagingMode::Ia32e,
            cr0_wp: true,
            nxe: true,
        }
    }

    /// Creates a context shadowing guest page tables in `mode`.
    pub fn shadow(mode: PagingMode) -> Self {
        Self {
            direct_map: false,
            mode,
            cr0_wp: true,
            nxe: !matches!(mode, PagingMode::Legacy),
        }
    }

    pub(crate) fn root_level(&self, config: &MmuConfig) -> PageTableLevel {
        if self.direct_map {
            config.tdp_level
        }
        else {
            self.mode.shadow_root_level()
        }
    }

    pub(crate) fn base_role(&self) -> Role {
        Role {
            level: PageTableLevel::Pt,
            direct: self.direct_map,
            quadrant: 0,
            access: Access::ALL,
            has_4_byte_gpte: !self.direct_map && self.mode.has_4_byte_gpte(),
            cr0_wp: self.cr0_wp,
            nxe: self.nxe,
        }
    }
}

/// The shadow root of a vCPU.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Root {
    /// One root page at the root level.
    Single(PageId, TableId),

    /// Four roots at the page directory level, one per 1GB of a 32-bit
    /// address space.
    Pae([Option<(PageId, TableId)>; 4]),
}

impl Root {
    pub fn pages(&self) -> impl Iterator<Item = PageId> + '_ {
        let (single, pae) = match self {
            Self::Single(page, _) => (Some(*page), None),
            Self::Pae(roots) => (None, Some(roots)),
        };

        single
            .into_iter()
            .chain(pae.into_iter().flatten().flatten().map(|(page, _)| *page))
    }
}

/// MMIO information recorded by the last MMIO fault of a vCPU.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MmioInfo {
    /// The page of the faulting address.
    pub gva: Gva,

    /// The MMIO frame.
    pub gfn: Gfn,

    /// Access rights recorded in the MMIO entry.
    pub access: Access,

    pub(crate) generation: u64,
}

/// Per-vCPU MMU state.
///
/// Created by [`ShadowMmu::create_vcpu`](crate::ShadowMmu::create_vcpu) and
/// handed back to [`ShadowMmu::destroy_vcpu`](crate::ShadowMmu::destroy_vcpu).
pub struct Vcpu {
    pub(crate) id: VcpuId,
    pub(crate) ctx: MmuContext,
    pub(crate) root: Option<Root>,
    pub(crate) pools: VcpuPools,
    pub(crate) mmio: Option<MmioInfo>,
}

impl Vcpu {
    pub(crate) fn new(id: VcpuId, ctx: MmuContext, config: &MmuConfig) -> Self {
        Self {
            id,
            ctx,
            root: None,
            pools: VcpuPools::new(config),
            mmio: None,
        }
    }

    /// Returns the vCPU identifier.
    pub fn id(&self) -> VcpuId {
        self.id
    }

    /// Returns the paging context.
    pub fn context(&self) -> &MmuContext {
        &self.ctx
    }

    /// Checks if the vCPU has loaded roots.
    pub fn has_root(&self) -> bool {
        self.root.is_some()
    }

    /// Returns the cached MMIO information if it covers `gva`.
    pub fn mmio_info(&self, gva: Gva) -> Option<MmioInfo> {
        self.mmio
            .filter(|info| info.gva == gva.align_down(smmu_core::PAGE_SIZE))
    }

    /// Forgets the cached MMIO information.
    pub fn clear_mmio_info(&mut self) {
        self.mmio = None;
    }
}

impl std::fmt::Debug for Vcpu {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.debug_struct("Vcpu")
            .field("id", &self.id)
            .field("ctx", &self.ctx)
            .field("root", &self.root)
            .finish_non_exhaustive()
    }
}
