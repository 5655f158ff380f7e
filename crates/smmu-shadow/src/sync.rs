//! Out-of-sync leaf pages.
//!
//! A leaf shadow page may stop write-protecting the guest table it shadows.
//! The guest then edits the table freely and the page goes "unsync". Every
//! ancestor records, per slot, whether unsync pages lie below it, so a sync
//! starting at a root finds them without scanning whole tables.

use smallvec::SmallVec;
use smmu_arch_amd64::{ENTRIES_PER_TABLE, PageTableLevel};
use smmu_core::{Gfn, MmuError};

use crate::{
    MmuHost, ShadowMmu,
    fault::LeafRequest,
    host::GuestWalker,
    page::{PageId, SptePtr},
    pool::VcpuPools,
    state::MmuState,
    stats::MmuStats,
    vcpu::MmuContext,
    zap::ZapList,
};

/// Number of unsync pages synced between two TLB flushes.
const SYNC_BATCH: usize = 16;

/// An unsync page found below a root, with the slots leading to it.
#[derive(Debug)]
pub(crate) struct UnsyncLeaf {
    pub page: PageId,

    /// The linking slots from the walk origin down to the page.
    pub parents: SmallVec<[SptePtr; PageTableLevel::MAX_DEPTH]>,
}

impl<Host> ShadowMmu<Host>
where
    Host: MmuHost,
{
    /// Marks the slot `ptr` as leading to unsync pages, propagating to the
    /// roots.
    pub(crate) fn mark_unsync(&self, state: &mut MmuState, ptr: SptePtr) -> Result<(), MmuError> {
        let mut work: SmallVec<[SptePtr; 8]> = SmallVec::new();
        work.push(ptr);

        while let Some(ptr) = work.pop() {
            let page = state.page_mut(ptr.page)?;
            if !page.set_unsync_child(ptr.index()) || page.unsync_children != 1 {
                continue;
            }

            // First unsync child: the page's own parents learn about it.
            work.extend(state.parents_of(ptr.page)?);
        }

        Ok(())
    }

    pub(crate) fn mark_parents_unsync(
        &self,
        state: &mut MmuState,
        id: PageId,
    ) -> Result<(), MmuError> {
        for parent in state.parents_of(id)? {
            self.mark_unsync(state, parent)?;
        }

        Ok(())
    }

    /// Lets the leaf page `id` go out of sync with its guest table.
    pub(crate) fn unsync_page(&self, state: &mut MmuState, id: PageId) -> Result<(), MmuError> {
        let page = state.page_mut(id)?;
        page.unsync = true;

        tracing::debug!(page = %id, gfn = %page.gfn, "page unsync");
        MmuStats::inc(&self.stats.unsync_pages);

        self.mark_parents_unsync(state, id)
    }

    /// Finds up to `max` unsync pages below `root`.
    ///
    /// Stale bits met on the way are cleared.
    pub(crate) fn collect_unsync(
        &self,
        state: &mut MmuState,
        root: PageId,
        max: usize,
    ) -> Result<Vec<UnsyncLeaf>, MmuError> {
        let mut result = Vec::new();

        if state.page(root)?.unsync_children == 0 {
            return Ok(result);
        }

        // (page, next slot to inspect)
        let mut stack: SmallVec<[(PageId, usize); PageTableLevel::MAX_DEPTH]> = SmallVec::new();
        stack.push((root, 0));

        while let Some(&(page_id, next)) = stack.last() {
            let page = state.page(page_id)?;

            let Some(index) = page.next_unsync_child(next)
            else {
                stack.pop();

                // A fully cleared page stops advertising itself upwards.
                if page.unsync_children == 0
                    && let Some(&(parent, next)) = stack.last()
                {
                    state.page_mut(parent)?.clear_unsync_child(next - 1);
                }

                continue;
            };

            if let Some(top) = stack.last_mut() {
                top.1 = index + 1;
            }

            let level = page.level();
            let spte = self.spte(state, SptePtr::new(page_id, index))?;
            if !spte.is_shadow_present() || spte.is_leaf(level) {
                state.page_mut(page_id)?.clear_unsync_child(index);
                continue;
            }

            let child_id = state.child_of(spte)?;
            let child = state.page(child_id)?;

            if child.unsync_children > 0 && stack.len() < PageTableLevel::MAX_DEPTH {
                stack.push((child_id, 0));
                continue;
            }

            if child.unsync {
                let parents = stack
                    .iter()
                    .map(|&(page, next)| SptePtr::new(page, next - 1))
                    .collect();

                result.push(UnsyncLeaf {
                    page: child_id,
                    parents,
                });

                if result.len() >= max {
                    break;
                }
            }
            else if child.unsync_children == 0 {
                state.page_mut(page_id)?.clear_unsync_child(index);
            }
        }

        Ok(result)
    }

    /// Clears the unsync bits on the path to a synced page, stopping at the
    /// first ancestor that still has other unsync descendants.
    fn clear_parents(&self, state: &mut MmuState, parents: &[SptePtr]) {
        for ptr in parents.iter().rev() {
            let Some(page) = state.pages.get_mut(ptr.page)
            else {
                break;
            };

            page.clear_unsync_child(ptr.index());
            if page.unsync_children > 0 {
                break;
            }
        }
    }

    /// Syncs every unsync page below `parent`.
    pub(crate) fn sync_children(
        &self,
        state: &mut MmuState,
        pools: &mut VcpuPools,
        ctx: &MmuContext,
        walker: &dyn GuestWalker,
        parent: PageId,
    ) -> Result<(), MmuError> {
        loop {
            let leaves = self.collect_unsync(state, parent, SYNC_BATCH)?;
            if leaves.is_empty() {
                return Ok(());
            }

            let mut flush = false;
            for leaf in &leaves {
                let gfn = state.page(leaf.page)?.gfn;
                flush |= self.rmap_write_protect(state, gfn)?;
            }

            if flush {
                self.flush_remote_tlbs();
            }

            let mut zap = ZapList::default();

            for leaf in &leaves {
                let pending = matches!(
                    state.pages.get(leaf.page),
                    Some(page) if page.unsync && !page.invalid
                );

                if pending {
                    self.sync_page(state, pools, ctx, walker, leaf.page, &mut zap)?;
                }

                self.clear_parents(state, &leaf.parents);
            }

            self.commit_zap(state, zap)?;
        }
    }

    /// Brings the unsync page `id` back in sync with its guest table.
    ///
    /// Pages created under an incompatible paging mode are zapped instead.
    /// Returns `false` if the page was zapped.
    pub(crate) fn sync_page(
        &self,
        state: &mut MmuState,
        pools: &mut VcpuPools,
        ctx: &MmuContext,
        walker: &dyn GuestWalker,
        id: PageId,
        zap: &mut ZapList,
    ) -> Result<bool, MmuError> {
        let page = state.page(id)?;
        let (role, gfn) = (page.role, page.gfn);

        if role.direct || ctx.direct_map || !role.same_base(&ctx.base_role()) {
            tracing::debug!(page = %id, ?role, "paging mode changed, zapping unsync page");
            self.prepare_zap(state, id, zap)?;
            return Ok(false);
        }

        // The guest table is trapped again before its entries are read.
        if self.rmap_write_protect(state, gfn)? {
            self.flush_remote_tlbs();
        }

        state.page_mut(id)?.unsync = false;

        let mut flush = false;

        for index in 0..ENTRIES_PER_TABLE {
            let ptr = SptePtr::new(id, index);
            let spte = self.spte(state, ptr)?;

            if spte.is_mmio() {
                self.table_of(state, id)?.clear_untracked(index);
                continue;
            }

            if !spte.is_shadow_present() {
                continue;
            }

            let page = state.page(id)?;
            let expected = page.gfns[index];

            match walker.read_pte(page.gfn, page.guest_index(index)) {
                Some(gpte) if gpte.present && gpte.gfn == expected => {
                    let outcome = self.set_leaf(
                        state,
                        pools,
                        ctx,
                        ptr,
                        LeafRequest {
                            gfn: expected,
                            pfn: spte.pfn(),
                            level: PageTableLevel::Pt,
                            access: role.access & gpte.access,
                            dirty: gpte.dirty,
                            write_fault: false,
                            speculative: true,
                            host_writable: spte.host_writable(),
                            can_unsync: false,
                        },
                    )?;

                    flush |= outcome.flush;
                }
                _ => {
                    tracing::trace!(page = %id, index, "guest entry changed, dropping");
                    flush |= self.drop_spte(state, ptr)?;
                }
            }
        }

        if flush {
            self.flush_remote_tlbs();
        }

        MmuStats::inc(&self.stats.pages_synced);
        tracing::debug!(page = %id, %gfn, "page synced");
        Ok(true)
    }

    /// Syncs every unsync page shadowing the guest table at `gfn`.
    pub(crate) fn sync_pages(
        &self,
        state: &mut MmuState,
        pools: &mut VcpuPools,
        ctx: &MmuContext,
        walker: &dyn GuestWalker,
        gfn: Gfn,
        zap: &mut ZapList,
    ) -> Result<(), MmuError> {
        for id in state.indirect_pages_for(gfn) {
            let unsync = state.page(id)?.unsync;
            if unsync {
                self.sync_page(state, pools, ctx, walker, id, zap)?;
            }
        }

        Ok(())
    }
}
