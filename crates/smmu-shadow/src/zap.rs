//! Removal of shadow pages.
//!
//! Zapping is split in two phases. [`ShadowMmu::prepare_zap`] detaches a page
//! from the hierarchy: its entries are cleared, its parents stop linking to
//! it and it drops out of the valid page count. [`ShadowMmu::commit_zap`]
//! then flushes remote TLBs once for the whole batch and releases the
//! detached pages. Between the phases no vCPU can reach a detached page
//! through the hierarchy, but a hardware walker may still hold a stale
//! translation.

use indexmap::IndexSet;
use smmu_arch_amd64::{ENTRIES_PER_TABLE, PageTableLevel};
use smmu_core::{Gfn, MmuError};

use crate::{
    MmuHost, ShadowMmu,
    page::{PageId, SptePtr},
    state::MmuState,
    stats::MmuStats,
};

/// Pages detached by `prepare_zap` and waiting for `commit_zap`.
#[derive(Debug, Default)]
pub(crate) struct ZapList {
    pages: IndexSet<PageId>,
}

impl ZapList {
    pub fn is_empty(&self) -> bool {
        self.pages.is_empty()
    }

    pub fn len(&self) -> usize {
        self.pages.len()
    }

    pub fn insert(&mut self, id: PageId) {
        self.pages.insert(id);
    }
}

impl<Host> ShadowMmu<Host>
where
    Host: MmuHost,
{
    /// Clears a non-leaf entry linking to `child` and forgets the link.
    pub(crate) fn drop_parent_pte(
        &self,
        state: &mut MmuState,
        child: PageId,
        parent: SptePtr,
    ) -> Result<(), MmuError> {
        state.remove_parent(child, parent)?;
        self.table_of(state, parent.page)?
            .clear_untracked(parent.index());

        // The parent may still advertise unsync descendants through this
        // slot.
        state.page_mut(parent.page)?.clear_unsync_child(parent.index());
        Ok(())
    }

    /// Clears one entry of a page being zapped.
    ///
    /// Children left without parents are pushed to `orphans`. Returns
    /// `true` if a present entry was removed.
    pub(crate) fn zap_pte(
        &self,
        state: &mut MmuState,
        ptr: SptePtr,
        orphans: &mut Vec<PageId>,
    ) -> Result<bool, MmuError> {
        let level = state.page(ptr.page)?.level();
        let spte = self.spte(state, ptr)?;

        if spte.is_shadow_present() {
            if spte.is_leaf(level) {
                self.drop_spte(state, ptr)?;
            }
            else {
                let child = state.child_of(spte)?;
                self.drop_parent_pte(state, child, ptr)?;

                let page = state.page(child)?;
                if page.parent_ptes.is_empty() && page.root_count == 0 && !page.invalid {
                    orphans.push(child);
                }
            }

            return Ok(true);
        }

        if spte.is_mmio() {
            self.table_of(state, ptr.page)?.clear_untracked(ptr.index());
        }

        Ok(false)
    }

    /// Detaches `id` and every page that becomes unreachable because of it.
    ///
    /// Returns the number of pages moved to `zap`. Pages still used as a
    /// root are only marked invalid; their vCPUs are asked to reload and the
    /// page is released by the last `unload_roots`.
    pub(crate) fn prepare_zap(
        &self,
        state: &mut MmuState,
        id: PageId,
        zap: &mut ZapList,
    ) -> Result<usize, MmuError> {
        let mut work = vec![id];
        let mut count = 0;

        while let Some(id) = work.pop() {
            match state.pages.get(id) {
                Some(page) if !page.invalid => {}
                _ => continue,
            }

            count += self.zap_one(state, id, zap, &mut work)?;
        }

        Ok(count)
    }

    fn zap_one(
        &self,
        state: &mut MmuState,
        id: PageId,
        zap: &mut ZapList,
        work: &mut Vec<PageId>,
    ) -> Result<usize, MmuError> {
        MmuStats::inc(&self.stats.pages_zapped);

        let (level, gfn, direct) = {
            let page = state.page(id)?;
            (page.level(), page.gfn, page.role.direct)
        };

        tracing::debug!(page = %id, %gfn, %level, direct, "zapping shadow page");

        // Unsync leaves below this page would lose their only path to a
        // sync; zap them with it.
        if level > PageTableLevel::Pt && state.page(id)?.unsync_children > 0 {
            for leaf in self.collect_unsync(state, id, usize::MAX)? {
                work.push(leaf.page);
            }
        }

        for index in 0..ENTRIES_PER_TABLE {
            self.zap_pte(state, SptePtr::new(id, index), work)?;
        }

        while let Some(parent) = state.page(id)?.parent_ptes.first(&state.descs)? {
            self.drop_parent_pte(state, id, parent)?;
        }

        if !direct {
            state.unaccount_shadowed(gfn)?;
        }

        let page = state.page_mut(id)?;
        page.unsync = false;
        page.invalid = true;
        page.unsync_children = 0;
        page.unsync_child_bitmap = Default::default();

        let root_count = page.root_count;
        let root_vcpus = page.root_vcpus.clone();

        state.active.pop(&id);
        self.account_used(state, -1);

        if root_count == 0 {
            zap.insert(id);
            return Ok(1);
        }

        for vcpu in root_vcpus {
            tracing::debug!(page = %id, %vcpu, "zapped root, requesting reload");
            self.host.request_reload(vcpu);
        }

        Ok(0)
    }

    /// Flushes remote TLBs and releases the pages in `zap`.
    pub(crate) fn commit_zap(&self, state: &mut MmuState, zap: ZapList) -> Result<(), MmuError> {
        if zap.is_empty() {
            return Ok(());
        }

        self.flush_remote_tlbs();

        let defer = self.epoch.readers_active();

        for id in zap.pages {
            let page = state
                .pages
                .remove(id)
                .ok_or(MmuError::InvariantViolation("committed page already released"))?;

            if !page.parent_ptes.is_empty() || page.root_count != 0 {
                return Err(MmuError::InvariantViolation(
                    "released page is still referenced",
                ));
            }

            state.unhash(id, page.gfn);
            state.owners.remove(&page.table);

            let table = page.table;
            if defer {
                state.graveyard.push(table);
            }
            else {
                self.tables.release(table);
            }
        }

        if !defer && !state.graveyard.is_empty() && !self.epoch.readers_active() {
            self.release_retired(state);
        }

        Ok(())
    }

    /// Zaps every valid page.
    pub fn zap_all(&self) -> Result<(), MmuError> {
        self.guarded(|| {
            let mut state = self.lock();
            if state.pages.is_empty() {
                return Ok(());
            }

            let mut zap = ZapList::default();
            let ids = state.pages.iter().map(|(id, _)| id).collect::<Vec<_>>();
            for id in ids {
                self.prepare_zap(&mut state, id, &mut zap)?;
            }

            tracing::debug!(pages = zap.len(), "zapped all shadow pages");
            self.commit_zap(&mut state, zap)
        })
    }

    /// Zaps every page shadowing the guest table at `gfn`, so the guest may
    /// write the frame without faults.
    ///
    /// Returns `true` if any page was zapped.
    pub fn unprotect_page(&self, gfn: Gfn) -> Result<bool, MmuError> {
        self.guarded(|| {
            let mut state = self.lock();
            let mut zap = ZapList::default();
            let mut zapped = false;

            for id in state.indirect_pages_for(gfn) {
                tracing::debug!(%gfn, page = %id, "unprotecting");
                self.prepare_zap(&mut state, id, &mut zap)?;
                zapped = true;
            }

            self.commit_zap(&mut state, zap)?;
            Ok(zapped)
        })
    }
}
