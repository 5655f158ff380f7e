//! vCPU roots.

use smmu_arch_amd64::{PageTableLevel, PagingMode};
use smmu_core::{Access, Gfn, MmuError, VcpuId};

use crate::{
    MmuHost, ShadowMmu,
    host::{GuestRoot, GuestWalker},
    page::PageId,
    state::MmuState,
    vcpu::{Root, Vcpu},
    zap::ZapList,
};

impl<Host> ShadowMmu<Host>
where
    Host: MmuHost,
{
    /// Loads the shadow roots `vcpu` translates through.
    ///
    /// Unsync pages reachable from the new roots are synced before the
    /// call returns.
    pub fn load_roots(&self, vcpu: &mut Vcpu, walker: &dyn GuestWalker) -> Result<(), MmuError> {
        self.guarded(|| self.load_roots_inner(vcpu, walker))
    }

    /// Drops the shadow roots of `vcpu`.
    pub fn unload_roots(&self, vcpu: &mut Vcpu) -> Result<(), MmuError> {
        self.guarded(|| self.unload_roots_inner(vcpu))
    }

    /// Syncs every unsync page reachable from the roots of `vcpu`.
    pub fn sync_roots(&self, vcpu: &mut Vcpu, walker: &dyn GuestWalker) -> Result<(), MmuError> {
        self.guarded(|| {
            if vcpu.ctx.direct_map {
                return Ok(());
            }

            let Some(root) = vcpu.root
            else {
                return Ok(());
            };

            vcpu.pools.top_up(&self.tables)?;

            let mut state = self.lock();
            for id in root.pages() {
                self.sync_children(&mut state, &mut vcpu.pools, &vcpu.ctx, walker, id)?;
            }

            Ok(())
        })
    }

    pub(crate) fn load_roots_inner(
        &self,
        vcpu: &mut Vcpu,
        walker: &dyn GuestWalker,
    ) -> Result<(), MmuError> {
        if vcpu.root.is_some() {
            self.unload_roots_inner(vcpu)?;
        }

        let level = vcpu.ctx.root_level(&self.config);
        if vcpu.ctx.direct_map && level < PageTableLevel::Pml4 {
            return Err(MmuError::NotSupported);
        }

        vcpu.pools.top_up(&self.tables)?;

        let mut state = self.lock();
        self.make_pages_available(&mut state)?;

        let root = match vcpu.ctx.direct_map {
            true => {
                let id = self.root_page(&mut state, vcpu, walker, level, true, Gfn(0), 0)?;
                Root::Single(id, state.page(id)?.table)
            }
            false => match (vcpu.ctx.mode, walker.root()) {
                (PagingMode::Ia32e | PagingMode::Ia32eLA57, GuestRoot::Table(gfn)) => {
                    let id = self.root_page(&mut state, vcpu, walker, level, false, gfn, 0)?;
                    Root::Single(id, state.page(id)?.table)
                }
                (PagingMode::Legacy, GuestRoot::Table(gfn)) => {
                    // One quadrant of the 4-byte page directory per root.
                    let mut roots = [None; 4];
                    for (i, slot) in roots.iter_mut().enumerate() {
                        let addr = (i as u64) << 30;
                        let id = self.root_page(&mut state, vcpu, walker, level, false, gfn, addr)?;
                        *slot = Some((id, state.page(id)?.table));
                    }

                    Root::Pae(roots)
                }
                (PagingMode::PAE, GuestRoot::Pae(pdptrs)) => {
                    let mut roots = [None; 4];
                    for (i, (slot, pdptr)) in roots.iter_mut().zip(pdptrs).enumerate() {
                        let Some(gfn) = pdptr
                        else {
                            continue;
                        };

                        let addr = (i as u64) << 30;
                        let id = self.root_page(&mut state, vcpu, walker, level, false, gfn, addr)?;
                        *slot = Some((id, state.page(id)?.table));
                    }

                    Root::Pae(roots)
                }
                _ => return Err(MmuError::Other("guest root does not match the paging mode")),
            },
        };

        for id in root.pages() {
            self.pin_root(&mut state, id, vcpu.id)?;
        }

        tracing::debug!(vcpu = %vcpu.id, ?root, %level, "loaded roots");

        if !vcpu.ctx.direct_map {
            for id in root.pages() {
                self.sync_children(&mut state, &mut vcpu.pools, &vcpu.ctx, walker, id)?;
            }
        }

        vcpu.root = Some(root);
        Ok(())
    }

    pub(crate) fn unload_roots_inner(&self, vcpu: &mut Vcpu) -> Result<(), MmuError> {
        vcpu.mmio = None;

        let Some(root) = vcpu.root.take()
        else {
            return Ok(());
        };

        let mut state = self.lock();
        let mut zap = ZapList::default();

        for id in root.pages() {
            let page = state.page_mut(id)?;
            page.root_count = page
                .root_count
                .checked_sub(1)
                .ok_or(MmuError::InvariantViolation("root count underflow"))?;

            if let Some(position) = page.root_vcpus.iter().position(|&v| v == vcpu.id) {
                page.root_vcpus.remove(position);
            }

            // Zapped while in use; the last user releases it.
            if page.root_count == 0 && page.invalid {
                zap.insert(id);
            }
        }

        tracing::debug!(vcpu = %vcpu.id, released = zap.len(), "unloaded roots");
        self.commit_zap(&mut state, zap)
    }

    #[expect(clippy::too_many_arguments)]
    fn root_page(
        &self,
        state: &mut MmuState,
        vcpu: &mut Vcpu,
        walker: &dyn GuestWalker,
        level: PageTableLevel,
        direct: bool,
        gfn: Gfn,
        addr: u64,
    ) -> Result<PageId, MmuError> {
        let role = self.role_for(&vcpu.ctx, level, direct, Access::ALL, addr);
        self.get_or_create(state, &mut vcpu.pools, &vcpu.ctx, walker, role, gfn, None)
    }

    fn pin_root(&self, state: &mut MmuState, id: PageId, vcpu: VcpuId) -> Result<(), MmuError> {
        let page = state.page_mut(id)?;
        page.root_count += 1;
        page.root_vcpus.push(vcpu);
        Ok(())
    }
}
