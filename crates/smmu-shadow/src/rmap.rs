//! Reverse map from guest frames to the leaf entries mapping them.

use std::collections::HashMap;

use smmu_arch_amd64::{PageTableLevel, Spte};
use smmu_core::{Gfn, MmuError};

use crate::{
    MmuHost, ShadowMmu,
    page::SptePtr,
    pool::ObjectPool,
    pte_list::{PteList, PteListDesc},
    slab::Slab,
    state::MmuState,
    stats::MmuStats,
};

/// Levels that may hold leaf entries.
pub const LEAF_LEVELS: [PageTableLevel; 3] =
    [PageTableLevel::Pt, PageTableLevel::Pd, PageTableLevel::Pdpt];

/// Identifies one reverse-map bucket.
///
/// Huge leaves are keyed by the first frame of the range they map.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RmapKey {
    pub gfn: Gfn,
    pub level: PageTableLevel,
}

impl RmapKey {
    pub fn new(gfn: Gfn, level: PageTableLevel) -> Self {
        Self {
            gfn: level.round_gfn(gfn),
            level,
        }
    }
}

#[derive(Default)]
pub struct Rmap {
    buckets: HashMap<RmapKey, PteList>,
}

impl Rmap {
    /// Adds `ptr` to the bucket and returns the previous bucket size.
    pub fn add(
        &mut self,
        key: RmapKey,
        ptr: SptePtr,
        descs: &mut Slab<PteListDesc>,
        pool: &mut ObjectPool<Box<PteListDesc>>,
    ) -> Result<usize, MmuError> {
        self.buckets.entry(key).or_default().add(ptr, descs, pool)
    }

    pub fn remove(
        &mut self,
        key: RmapKey,
        ptr: SptePtr,
        descs: &mut Slab<PteListDesc>,
    ) -> Result<(), MmuError> {
        let list = self
            .buckets
            .get_mut(&key)
            .ok_or(MmuError::InvariantViolation("reverse map bucket missing"))?;

        list.remove(ptr, descs)?;
        if list.is_empty() {
            self.buckets.remove(&key);
        }

        Ok(())
    }

    pub fn get(
        &self,
        key: RmapKey,
        n: usize,
        descs: &Slab<PteListDesc>,
    ) -> Result<Option<SptePtr>, MmuError> {
        match self.buckets.get(&key) {
            Some(list) => list.get(n, descs),
            None => Ok(None),
        }
    }

    pub fn len(&self, key: RmapKey) -> usize {
        self.buckets.get(&key).map_or(0, PteList::len)
    }

    pub fn is_empty(&self) -> bool {
        self.buckets.is_empty()
    }
}

impl<Host> ShadowMmu<Host>
where
    Host: MmuHost,
{
    /// Returns the bucket a leaf slot belongs to.
    pub(crate) fn rmap_key(&self, state: &MmuState, ptr: SptePtr) -> Result<RmapKey, MmuError> {
        let page = state.page(ptr.page)?;
        Ok(RmapKey::new(page.gfn_at(ptr.index()), page.level()))
    }

    /// Records a newly installed leaf, recycling the bucket when it grows
    /// past the threshold.
    pub(crate) fn rmap_add(
        &self,
        state: &mut MmuState,
        pool: &mut ObjectPool<Box<PteListDesc>>,
        ptr: SptePtr,
    ) -> Result<(), MmuError> {
        let key = self.rmap_key(state, ptr)?;
        let count = state.rmap.add(key, ptr, &mut state.descs, pool)?;

        if count > self.config.rmap_recycle_threshold {
            tracing::warn!(gfn = %key.gfn, level = %key.level, count, "recycling reverse map bucket");
            MmuStats::inc(&self.stats.rmap_recycled);

            if self.unmap_rmap(state, key)? {
                self.flush_remote_tlbs();
            }
        }

        Ok(())
    }

    /// Clears a leaf slot and removes it from the reverse map.
    ///
    /// Returns `true` if a present entry was removed.
    pub(crate) fn drop_spte(&self, state: &mut MmuState, ptr: SptePtr) -> Result<bool, MmuError> {
        let table = self.table_of(state, ptr.page)?;
        if !table.clear_tracked(ptr.index(), &self.host, self.hardware_ad()) {
            return Ok(false);
        }

        let key = self.rmap_key(state, ptr)?;
        state.rmap.remove(key, ptr, &mut state.descs)?;
        Ok(true)
    }

    /// Drops every leaf in a bucket.
    pub(crate) fn unmap_rmap(&self, state: &mut MmuState, key: RmapKey) -> Result<bool, MmuError> {
        let mut flush = false;

        while let Some(ptr) = state.rmap.get(key, 0, &state.descs)? {
            if !self.drop_spte(state, ptr)? {
                return Err(MmuError::InvariantViolation(
                    "reverse map references an absent entry",
                ));
            }

            tracing::trace!(gfn = %key.gfn, level = %key.level, page = %ptr.page, index = ptr.index, "unmapped");
            flush = true;
        }

        Ok(flush)
    }

    /// Clears the writable bit of every leaf in a bucket.
    pub(crate) fn write_protect_rmap(
        &self,
        state: &mut MmuState,
        key: RmapKey,
    ) -> Result<bool, MmuError> {
        let mut flush = false;
        let mut n = 0;

        while let Some(ptr) = state.rmap.get(key, n, &state.descs)? {
            n += 1;

            let table = self.table_of(state, ptr.page)?;
            let spte = table.get(ptr.index());
            if !spte.writable() {
                continue;
            }

            let protected = spte.without(Spte::WRITABLE | Spte::MMU_WRITABLE);
            flush |= table.update(ptr.index(), protected, &self.host, self.hardware_ad())?;
        }

        Ok(flush)
    }

    /// Write-protects every leaf mapping `gfn`, at every level.
    pub(crate) fn rmap_write_protect(&self, state: &mut MmuState, gfn: Gfn) -> Result<bool, MmuError> {
        let mut flush = false;

        for level in LEAF_LEVELS {
            flush |= self.write_protect_rmap(state, RmapKey::new(gfn, level))?;
        }

        Ok(flush)
    }
}
