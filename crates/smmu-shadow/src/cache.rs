//! The shadow-page cache.

use smmu_arch_amd64::{PageTableLevel, Spte};
use smmu_core::{Gfn, MmuError};

use crate::{
    MmuHost, ShadowMmu,
    host::GuestWalker,
    page::{PageId, Role, SptePtr},
    pool::VcpuPools,
    state::MmuState,
    stats::MmuStats,
    vcpu::MmuContext,
    zap::ZapList,
};

impl<Host> ShadowMmu<Host>
where
    Host: MmuHost,
{
    /// Returns the shadow page with `role` for `gfn`, creating it on a miss.
    ///
    /// If `parent` is given, the slot is linked to the page. A new indirect
    /// page write-protects the guest table it shadows.
    #[expect(clippy::too_many_arguments)]
    pub(crate) fn get_or_create(
        &self,
        state: &mut MmuState,
        pools: &mut VcpuPools,
        ctx: &MmuContext,
        walker: &dyn GuestWalker,
        role: Role,
        gfn: Gfn,
        parent: Option<SptePtr>,
    ) -> Result<PageId, MmuError> {
        let mut zap = ZapList::default();
        let mut need_sync = false;
        let mut hit = None;

        for id in state.pages_for(gfn) {
            let page = match state.pages.get(id) {
                Some(page) if !page.invalid => page,
                _ => continue,
            };

            let (page_role, unsync) = (page.role, page.unsync);

            if !role.direct && unsync {
                need_sync = true;
            }

            if page_role != role {
                // The guest table is about to be shadowed as a directory;
                // an unsync leaf shadow of it cannot stay.
                if !role.direct && role.level > PageTableLevel::Pt && unsync {
                    self.prepare_zap(state, id, &mut zap)?;
                }

                continue;
            }

            if unsync && !self.sync_page(state, pools, ctx, walker, id, &mut zap)? {
                break;
            }

            hit = Some(id);
            break;
        }

        if let Some(id) = hit {
            tracing::trace!(page = %id, %gfn, level = %role.level, "shadow page hit");

            if let Some(parent) = parent {
                self.link(state, pools, parent, id)?;
            }

            state.page_mut(id)?.write_flooding_count = 0;
            state.active.promote(&id);

            self.commit_zap(state, zap)?;
            return Ok(id);
        }

        let table = pools.tables.alloc();
        let mut page = pools.pages.alloc();
        page.reset(role, gfn, table);

        let id = state.pages.insert(page);
        state.hash.entry(gfn).or_default().push(id);
        state.active.push(id, ());
        state.owners.insert(table, id);
        self.account_used(state, 1);

        tracing::debug!(page = %id, %gfn, ?role, %table, "created shadow page");
        MmuStats::inc(&self.stats.pages_created);

        if !role.direct {
            state.account_shadowed(gfn);

            if self.rmap_write_protect(state, gfn)? {
                self.flush_remote_tlbs();
            }

            if role.level > PageTableLevel::Pt && need_sync {
                self.sync_pages(state, pools, ctx, walker, gfn, &mut zap)?;
            }
        }

        if let Some(parent) = parent {
            self.link(state, pools, parent, id)?;
        }

        self.commit_zap(state, zap)?;
        Ok(id)
    }

    /// Points the empty slot `parent` at `child`.
    pub(crate) fn link(
        &self,
        state: &mut MmuState,
        pools: &mut VcpuPools,
        parent: SptePtr,
        child: PageId,
    ) -> Result<(), MmuError> {
        let frame = state.page(child)?.table.frame();

        self.table_of(state, parent.page)?
            .set(parent.index(), Spte::link(frame))?;

        state.add_parent(child, parent, &mut pools.descs)?;

        let page = state.page(child)?;
        if page.unsync || page.unsync_children > 0 {
            self.mark_unsync(state, parent)?;
        }

        Ok(())
    }
}
