use serde::{Deserialize, Serialize};
use smmu_arch_amd64::PageTableLevel;

/// Configuration of a [`ShadowMmu`](crate::ShadowMmu).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MmuConfig {
    /// Maximum number of shadow pages in use.
    pub max_pages: usize,

    /// Capacity of the table arena.
    ///
    /// Must cover `max_pages` plus the tables held by the per-vCPU pools.
    pub max_tables: usize,

    /// Root level used under two-dimensional addressing.
    pub tdp_level: PageTableLevel,

    /// Largest level a leaf may be installed at.
    pub max_huge_level: PageTableLevel,

    /// Allow leaf shadow pages to go out of sync with the guest table instead
    /// of write-protecting it.
    pub unsync: bool,

    /// Speculatively map neighbours of a faulting leaf.
    pub prefetch: bool,

    /// Report non-resident frames to the caller instead of waiting.
    pub async_page_faults: bool,

    /// Per-vCPU pool minimum of shadow pages and tables.
    pub pool_min_pages: usize,

    /// Per-vCPU pool minimum of reverse-map descriptors.
    pub pool_min_descs: usize,

    /// Reverse-map bucket size that triggers recycling of the bucket.
    pub rmap_recycle_threshold: usize,

    /// Number of times a fault retries after a host mapping change before
    /// giving up with [`FaultOutcome::Retry`](crate::FaultOutcome::Retry).
    pub max_fault_retries: usize,
}

impl Default for MmuConfig {
    fn default() -> Self {
        Self {
            max_pages: 4096,
            max_tables: 1 << 16,
            tdp_level: PageTableLevel::Pml4,
            max_huge_level: PageTableLevel::Pdpt,
            unsync: true,
            prefetch: true,
            async_page_faults: false,
            pool_min_pages: PageTableLevel::MAX_DEPTH,
            pool_min_descs: 24,
            rmap_recycle_threshold: 1000,
            max_fault_retries: 8,
        }
    }
}

impl MmuConfig {
    /// Shadow pages allowed per 1000 guest pages.
    pub const PAGES_PER_MILLE: u64 = 20;

    /// Lower bound of the default page limit.
    pub const MIN_PAGES: usize = 64;

    /// Derives the default page limit from the guest memory size.
    pub fn default_max_pages(total_guest_pages: u64) -> usize {
        let pages = total_guest_pages.saturating_mul(Self::PAGES_PER_MILLE) / 1000;
        (pages as usize).max(Self::MIN_PAGES)
    }

    /// Sets the shadow page limit.
    pub fn with_max_pages(self, max_pages: usize) -> Self {
        Self { max_pages, ..self }
    }

    /// Sets the table arena capacity.
    pub fn with_max_tables(self, max_tables: usize) -> Self {
        Self { max_tables, ..self }
    }

    /// Sets the root level used under two-dimensional addressing.
    pub fn with_tdp_level(self, tdp_level: PageTableLevel) -> Self {
        Self { tdp_level, ..self }
    }

    /// Sets the largest leaf level.
    pub fn with_max_huge_level(self, max_huge_level: PageTableLevel) -> Self {
        Self {
            max_huge_level,
            ..self
        }
    }

    /// Enables or disables unsync leaf pages.
    pub fn with_unsync(self, unsync: bool) -> Self {
        Self { unsync, ..self }
    }

    /// Enables or disables neighbour prefetch.
    pub fn with_prefetch(self, prefetch: bool) -> Self {
        Self { prefetch, ..self }
    }

    /// Enables or disables asynchronous page faults.
    pub fn with_async_page_faults(self, async_page_faults: bool) -> Self {
        Self {
            async_page_faults,
            ..self
        }
    }

    /// Sets the reverse-map recycle threshold.
    pub fn with_rmap_recycle_threshold(self, rmap_recycle_threshold: usize) -> Self {
        Self {
            rmap_recycle_threshold,
            ..self
        }
    }

    /// Sets the fault retry bound.
    pub fn with_max_fault_retries(self, max_fault_retries: usize) -> Self {
        Self {
            max_fault_retries,
            ..self
        }
    }
}
