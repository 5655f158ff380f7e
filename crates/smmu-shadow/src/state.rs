use std::collections::HashMap;

use indexmap::IndexMap;
use lru::LruCache;
use smallvec::SmallVec;
use smmu_arch_amd64::{PageTableLevel, Spte};
use smmu_core::{Gfn, MmuError};

use crate::{
    arena::TableId,
    page::{PageId, ShadowPage, SptePtr},
    pool::ObjectPool,
    pte_list::PteListDesc,
    rmap::Rmap,
    slab::Slab,
};

const STALE_PAGE: MmuError = MmuError::InvariantViolation("stale shadow page reference");
const UNOWNED_TABLE: MmuError = MmuError::InvariantViolation("link to a table without a page");

/// Everything guarded by the structural lock.
pub struct MmuState {
    pub pages: Slab<ShadowPage>,
    pub descs: Slab<PteListDesc>,

    /// Shadow pages by the guest frame they shadow (or map, for direct
    /// pages), in creation order.
    pub hash: IndexMap<Gfn, SmallVec<[PageId; 4]>>,

    /// Valid pages, most recently used first.
    pub active: LruCache<PageId, ()>,

    pub rmap: Rmap,

    /// The page owning each table.
    pub owners: HashMap<TableId, PageId>,

    /// Number of indirect pages inside each huge-page range.
    pub lpage_disallow: HashMap<(Gfn, PageTableLevel), u32>,
    pub indirect_pages: usize,

    pub used_pages: usize,
    pub max_pages: usize,

    /// Tables of pages released while lockless readers were active.
    pub graveyard: Vec<TableId>,
}

impl MmuState {
    pub fn new(max_pages: usize) -> Self {
        Self {
            pages: Slab::default(),
            descs: Slab::default(),
            hash: IndexMap::new(),
            active: LruCache::unbounded(),
            rmap: Rmap::default(),
            owners: HashMap::new(),
            lpage_disallow: HashMap::new(),
            indirect_pages: 0,
            used_pages: 0,
            max_pages,
            graveyard: Vec::new(),
        }
    }

    pub fn page(&self, id: PageId) -> Result<&ShadowPage, MmuError> {
        self.pages.get(id).ok_or(STALE_PAGE)
    }

    pub fn page_mut(&mut self, id: PageId) -> Result<&mut ShadowPage, MmuError> {
        self.pages.get_mut(id).ok_or(STALE_PAGE)
    }

    /// Returns the page a non-leaf entry links to.
    pub fn child_of(&self, spte: Spte) -> Result<PageId, MmuError> {
        self.owners
            .get(&TableId::from_pfn(spte.pfn()))
            .copied()
            .ok_or(UNOWNED_TABLE)
    }

    /// Returns the valid pages with the given frame.
    pub fn pages_for(&self, gfn: Gfn) -> SmallVec<[PageId; 4]> {
        let Some(bucket) = self.hash.get(&gfn)
        else {
            return SmallVec::new();
        };

        bucket
            .iter()
            .copied()
            .filter(|&id| matches!(self.pages.get(id), Some(page) if !page.invalid && page.gfn == gfn))
            .collect()
    }

    /// Returns the valid pages shadowing the guest table at `gfn`.
    pub fn indirect_pages_for(&self, gfn: Gfn) -> SmallVec<[PageId; 4]> {
        let mut pages = self.pages_for(gfn);
        pages.retain(|id| matches!(self.pages.get(*id), Some(page) if !page.role.direct));
        pages
    }

    pub fn parents_of(&self, id: PageId) -> Result<Vec<SptePtr>, MmuError> {
        self.page(id)?.parent_ptes.to_vec(&self.descs)
    }

    pub fn add_parent(
        &mut self,
        child: PageId,
        parent: SptePtr,
        pool: &mut ObjectPool<Box<PteListDesc>>,
    ) -> Result<(), MmuError> {
        let page = self.pages.get_mut(child).ok_or(STALE_PAGE)?;
        page.parent_ptes.add(parent, &mut self.descs, pool)?;
        Ok(())
    }

    pub fn remove_parent(&mut self, child: PageId, parent: SptePtr) -> Result<(), MmuError> {
        let page = self.pages.get_mut(child).ok_or(STALE_PAGE)?;
        page.parent_ptes.remove(parent, &mut self.descs)
    }

    pub fn account_shadowed(&mut self, gfn: Gfn) {
        for level in PageTableLevel::HUGE {
            *self
                .lpage_disallow
                .entry((level.round_gfn(gfn), level))
                .or_default() += 1;
        }

        self.indirect_pages += 1;
    }

    pub fn unaccount_shadowed(&mut self, gfn: Gfn) -> Result<(), MmuError> {
        for level in PageTableLevel::HUGE {
            let key = (level.round_gfn(gfn), level);
            let count = self
                .lpage_disallow
                .get_mut(&key)
                .ok_or(MmuError::InvariantViolation("unbalanced large page accounting"))?;

            *count -= 1;
            if *count == 0 {
                self.lpage_disallow.remove(&key);
            }
        }

        self.indirect_pages -= 1;
        Ok(())
    }

    /// Checks if a shadowed guest table lies inside the huge-page range of
    /// `gfn` at `level`.
    pub fn lpage_shadowed(&self, gfn: Gfn, level: PageTableLevel) -> bool {
        self.lpage_disallow
            .get(&(level.round_gfn(gfn), level))
            .is_some_and(|&count| count > 0)
    }

    /// Removes a page from the hash index.
    pub fn unhash(&mut self, id: PageId, gfn: Gfn) {
        if let Some(bucket) = self.hash.get_mut(&gfn) {
            bucket.retain(|entry| *entry != id);
            if bucket.is_empty() {
                self.hash.shift_remove(&gfn);
            }
        }
    }
}
