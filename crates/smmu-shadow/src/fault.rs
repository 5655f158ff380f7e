//! Page fault resolution.

use smallvec::SmallVec;
use smmu_arch_amd64::{PageTableLevel, Spte};
use smmu_core::{
    Access, FaultErrorCode, Gfn, GuestFault, Gva, MmuError, PAGE_SIZE, Pfn,
};

use crate::{
    MmuHost, ShadowMmu,
    host::{GuestWalk, GuestWalker, ResolveMode, ResolvedFrame},
    page::{PageId, SptePtr},
    state::MmuState,
    stats::MmuStats,
    vcpu::{MmioInfo, MmuContext, Vcpu},
    walk::ShadowWalk,
};

/// Number of neighbouring slots considered by prefetch, aligned.
const PREFETCH_SLOTS: usize = 8;

/// What the caller does after a page fault.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultOutcome {
    /// Re-execute the faulting instruction.
    ///
    /// Either a translation was installed, or the fault raced with another
    /// change and faulting again will make progress.
    Retry,

    /// Emulate the faulting instruction; the write hit a guest page table
    /// the MMU keeps write-protected.
    Emulate,

    /// The access targets MMIO; emulate it against the device model.
    Mmio {
        /// The MMIO frame.
        gfn: Gfn,

        /// Access rights of the guest translation.
        access: Access,
    },

    /// The backing frame is being fetched asynchronously; the caller may
    /// run something else and retry later.
    AsyncPending {
        /// The frame being fetched.
        gfn: Gfn,
    },

    /// The guest's own translation failed; inject the fault.
    GuestFault(GuestFault),
}

/// A fault after guest translation and frame resolution.
#[derive(Debug, Clone, Copy)]
struct Fault {
    addr: Gva,
    gfn: Gfn,
    write: bool,

    /// The guest leaf entry is dirty. Always set without guest tables.
    dirty: bool,

    /// `None` for MMIO frames.
    frame: Option<ResolvedFrame>,
    max_level: PageTableLevel,
}

/// A leaf entry to install.
#[derive(Debug, Clone, Copy)]
pub(crate) struct LeafRequest {
    pub gfn: Gfn,
    pub pfn: Pfn,
    pub level: PageTableLevel,
    pub access: Access,

    /// Clean guest entries are mapped read-only so the first write faults
    /// and lets the guest walker set the dirty bit.
    pub dirty: bool,
    pub write_fault: bool,
    pub speculative: bool,
    pub host_writable: bool,
    pub can_unsync: bool,
}

#[derive(Debug, Clone, Copy, Default)]
pub(crate) struct LeafOutcome {
    /// Remote TLBs must be flushed.
    pub flush: bool,

    /// Write access was withheld because the frame holds a shadowed guest
    /// page table.
    pub write_protected: bool,
}

impl<Host> ShadowMmu<Host>
where
    Host: MmuHost,
{
    /// Resolves a page fault taken by `vcpu` at `addr`.
    ///
    /// `walker` translates through the guest page tables when the vCPU
    /// shadows them; it is ignored under two-dimensional addressing.
    pub fn handle_page_fault(
        &self,
        vcpu: &mut Vcpu,
        walker: &dyn GuestWalker,
        addr: Gva,
        error_code: FaultErrorCode,
    ) -> Result<FaultOutcome, MmuError> {
        self.guarded(|| self.page_fault(vcpu, walker, addr, error_code))
    }

    fn page_fault(
        &self,
        vcpu: &mut Vcpu,
        walker: &dyn GuestWalker,
        addr: Gva,
        error_code: FaultErrorCode,
    ) -> Result<FaultOutcome, MmuError> {
        tracing::trace!(vcpu = %vcpu.id, %addr, ?error_code, "page fault");

        if error_code.contains(FaultErrorCode::RSVD)
            && let Some(outcome) = self.mmio_fault(vcpu, addr)?
        {
            return Ok(outcome);
        }

        let walk = match vcpu.ctx.direct_map {
            true => None,
            false => match walker.translate(addr, error_code) {
                Ok(walk) => Some(walk),
                Err(fault) => {
                    tracing::trace!(vcpu = %vcpu.id, %addr, ?fault, "guest fault");
                    MmuStats::inc(&self.stats.pf_guest);
                    return Ok(FaultOutcome::GuestFault(fault));
                }
            },
        };

        let (gfn, max_level) = match &walk {
            Some(walk) => (walk.gfn, walk.level.min(self.config.max_huge_level)),
            None => (addr.as_gfn(), self.config.max_huge_level),
        };

        let write = error_code.is_write();
        let mmio = self.host.is_mmio(gfn);

        for _ in 0..self.config.max_fault_retries.max(1) {
            if vcpu.root.is_none() {
                self.load_roots_inner(vcpu, walker)?;
            }

            let sequence = self.host.current_sequence();

            let frame = match mmio {
                true => None,
                false => match self.resolve_frame(gfn, write)? {
                    Some(frame) => Some(frame),
                    None => {
                        MmuStats::inc(&self.stats.pf_async);
                        return Ok(FaultOutcome::AsyncPending { gfn });
                    }
                },
            };

            vcpu.pools.top_up(&self.tables)?;

            let mut state = self.lock();

            if self.host.current_sequence() != sequence {
                drop(state);
                tracing::trace!(vcpu = %vcpu.id, %gfn, "host mapping changed, retrying");
                MmuStats::inc(&self.stats.pf_retry);
                continue;
            }

            if !self.roots_usable(&state, vcpu, addr) {
                drop(state);
                tracing::debug!(vcpu = %vcpu.id, "obsolete root, reloading");
                self.unload_roots_inner(vcpu)?;
                continue;
            }

            self.make_pages_available(&mut state)?;

            let fault = Fault {
                addr,
                gfn,
                write,
                dirty: walk.as_ref().is_none_or(|walk| walk.dirty),
                frame,
                max_level,
            };

            return match &walk {
                Some(walk) => self.shadow_fetch(&mut state, vcpu, walker, walk, &fault),
                None => self.direct_map(&mut state, vcpu, walker, &fault),
            };
        }

        MmuStats::inc(&self.stats.pf_retry);
        Ok(FaultOutcome::Retry)
    }

    /// Resolves the host frame, waiting for it unless the caller accepts
    /// asynchronous faults. Returns `None` for an asynchronous fault.
    fn resolve_frame(&self, gfn: Gfn, write: bool) -> Result<Option<ResolvedFrame>, MmuError> {
        let frame = self.host.resolve(gfn, write, ResolveMode::NoWait)?;
        if !frame.needs_async {
            return Ok(Some(frame));
        }

        if self.config.async_page_faults {
            tracing::debug!(%gfn, "frame not resident, deferring");
            return Ok(None);
        }

        self.host.resolve(gfn, write, ResolveMode::Wait).map(Some)
    }

    /// Services a reserved-bit fault from the MMIO entry that caused it,
    /// without the structural lock.
    ///
    /// Returns `None` if the entry is stale and the fault must take the
    /// normal path.
    fn mmio_fault(&self, vcpu: &mut Vcpu, addr: Gva) -> Result<Option<FaultOutcome>, MmuError> {
        let translation = self.walk_shadow_lockless(vcpu, addr);

        let Some(terminal) = translation.terminal()
        else {
            return Ok(None);
        };

        let spte = terminal.spte;

        if spte.is_mmio() {
            let generation = self.host.generation();
            if spte.mmio_generation() != generation & Spte::MMIO_GEN_MASK {
                tracing::trace!(%addr, "stale MMIO entry");
                return Ok(None);
            }

            let gfn = spte.mmio_gfn();
            let access = spte.mmio_access();

            vcpu.mmio = Some(MmioInfo {
                gva: addr.align_down(PAGE_SIZE),
                gfn,
                access,
                generation,
            });

            MmuStats::inc(&self.stats.pf_mmio);
            return Ok(Some(FaultOutcome::Mmio { gfn, access }));
        }

        // Zapped concurrently: the normal path rebuilds the entry.
        if !spte.is_shadow_present() {
            return Ok(None);
        }

        Err(MmuError::ReservedBits { addr })
    }

    /// Checks if the roots of `vcpu` are valid and cover `addr`.
    fn roots_usable(&self, state: &MmuState, vcpu: &Vcpu, addr: Gva) -> bool {
        let Some(root) = &vcpu.root
        else {
            return false;
        };

        let valid = root
            .pages()
            .all(|id| matches!(state.pages.get(id), Some(page) if !page.invalid));

        valid && ShadowWalk::new(root, vcpu.ctx.root_level(&self.config), addr.0).is_some()
    }

    fn root_walk(&self, vcpu: &Vcpu, addr: Gva) -> Result<ShadowWalk, MmuError> {
        vcpu.root
            .as_ref()
            .and_then(|root| ShadowWalk::new(root, vcpu.ctx.root_level(&self.config), addr.0))
            .ok_or(MmuError::InvariantViolation("fault without a usable root"))
    }

    /// Picks the largest level the fault may be mapped at.
    fn mapping_level(&self, state: &MmuState, fault: &Fault) -> PageTableLevel {
        if fault.frame.is_none() {
            return PageTableLevel::Pt;
        }

        let mut level = fault
            .max_level
            .min(self.host.host_mapping_level(fault.gfn))
            .min(self.config.max_huge_level);

        while level > PageTableLevel::Pt
            && (state.lpage_shadowed(fault.gfn, level)
                || self.host.write_protect_count(fault.gfn, level) > 0)
        {
            level = level.next().unwrap_or(PageTableLevel::Pt);
        }

        level
    }

    /// Builds the hierarchy for a fault under two-dimensional addressing.
    fn direct_map(
        &self,
        state: &mut MmuState,
        vcpu: &mut Vcpu,
        walker: &dyn GuestWalker,
        fault: &Fault,
    ) -> Result<FaultOutcome, MmuError> {
        let level = self.mapping_level(state, fault);
        let mut it = self.root_walk(vcpu, fault.addr)?;

        while it.level() > level {
            let ptr = it.ptr();
            self.drop_large_spte(state, ptr, it.level())?;

            let child_level = it.level().next().ok_or(MmuError::InvariantViolation(
                "walk below the last level",
            ))?;

            let table = walk
                .table(child_level)
                .ok_or(MmuError::Other("guest walk is missing a table level"))?;

            let mut spte = self.spte(state, ptr)?;
            let child = if spte.is_shadow_present() {
                None
            }
            else {
                let role = self.role_for(&vcpu.ctx, child_level, false, table.access, fault.addr.0);
                Some(self.get_or_create(
                    state,
                    &mut vcpu.pools,
                    &vcpu.ctx,
                    walker,
                    role,
                    table.gfn,
                    None,
                )?)
            };

            // The guest table is shadowed now; the walk must still match it.
            let current = walker.read_pte(table.gfn, table.index).map(|gpte| gpte.raw);
            if current != Some(table.pte) {
                tracing::debug!(
                    vcpu = %vcpu.id,
                    addr = %fault.addr,
                    table = %table.gfn,
                    level = %child_level,
                    "guest entry changed during the fault"
                );

                MmuStats::inc(&self.stats.pf_retry);
                return Ok(FaultOutcome::Retry);
            }

            if let Some(child) = child {
                self.link(state, &mut vcpu.pools, ptr, child)?;
                spte = self.spte(state, ptr)?;
            }

            it.step(state, spte)?;
        }

        // Direct levels below a guest huge page the host cannot map as huge.
        let level = self.mapping_level(state, fault);

        while it.level() > level {
            let ptr = it.ptr();
            self.clear_write_flooding(state, ptr.page)?;
            self.validate_direct_spte(state, ptr, walk.access)?;
            self.drop_large_spte(state, ptr, it.level())?;

            let mut spte = self.spte(state, ptr)?;
            if !spte.is_shadow_present() {
                let child_level = it.level().next().ok_or(MmuError::InvariantViolation(
                    "walk below the last level",
                ))?;

                let role = self.role_for(&vcpu.ctx, child_level, true, walk.access, fault.addr.0);
                let gfn = it.level().round_gfn(fault.gfn);
                self.get_or_create(state, &mut vcpu.pools, &vcpu.ctx, walker, role, gfn, Some(ptr))?;

                spte = self.spte(state, ptr)?;
            }

            it.step(state, spte)?;
        }

        self.clear_write_flooding(state, it.ptr().page)?;
        self.install(state, vcpu, walker, it.ptr(), fault, level, walk.access)
    }

    /// Installs the leaf of a fault and finishes it.
    #[expect(clippy::too_many_arguments)]
    fn install(
        &self,
        state: &mut MmuState,
        vcpu: &mut Vcpu,
        walker: &dyn GuestWalker,
        ptr: SptePtr,
        fault: &Fault,
        level: PageTableLevel,
        access: Access,
    ) -> Result<FaultOutcome, MmuError> {
        let Some(frame) = fault.frame
        else {
            let generation = self.host.generation();
            self.set_mmio_spte(state, ptr, level, fault.gfn, access, generation)?;

            vcpu.mmio = Some(MmioInfo {
                gva: fault.addr.align_down(PAGE_SIZE),
                gfn: fault.gfn,
                access,
                generation,
            });

            tracing::debug!(vcpu = %vcpu.id, gfn = %fault.gfn, %access, "installed MMIO entry");
            MmuStats::inc(&self.stats.pf_mmio);
            return Ok(FaultOutcome::Mmio {
                gfn: fault.gfn,
                access,
            });
        };

        let outcome = self.set_leaf(
            state,
            &mut vcpu.pools,
            &vcpu.ctx,
            ptr,
            LeafRequest {
                gfn: level.round_gfn(fault.gfn),
                pfn: frame.pfn.align_down(level.pages()),
                level,
                access,
                dirty: fault.dirty || fault.write,
                write_fault: fault.write,
                speculative: false,
                host_writable: frame.writable,
                can_unsync: self.config.unsync && !vcpu.ctx.direct_map,
            },
        )?;

        if outcome.flush {
            self.flush_remote_tlbs();
        }

        tracing::trace!(
            vcpu = %vcpu.id,
            addr = %fault.addr,
            gfn = %fault.gfn,
            pfn = %frame.pfn,
            %level,
            %access,
            "installed leaf"
        );

        if level == PageTableLevel::Pt {
            self.prefetch(state, vcpu, walker, ptr)?;
        }

        if outcome.write_protected && fault.write {
            MmuStats::inc(&self.stats.pf_emulate);
            return Ok(FaultOutcome::Emulate);
        }

        MmuStats::inc(&self.stats.pf_fixed);
        Ok(FaultOutcome::Retry)
    }

    /// Writes a leaf entry, keeping the reverse map and the write protection
    /// of shadowed guest tables consistent.
    pub(crate) fn set_leaf(
        &self,
        state: &mut MmuState,
        pools: &mut crate::pool::VcpuPools,
        ctx: &MmuContext,
        ptr: SptePtr,
        req: LeafRequest,
    ) -> Result<LeafOutcome, MmuError> {
        let mut outcome = LeafOutcome::default();
        let mut was_rmapped = false;

        let (direct_page, mapped_gfn) = {
            let page = state.page(ptr.page)?;
            (page.role.direct, page.gfn_at(ptr.index()))
        };

        let old = self.spte(state, ptr)?;
        if old.is_shadow_present() {
            if !old.is_leaf(req.level) {
                let child = state.child_of(old)?;
                self.drop_parent_pte(state, child, ptr)?;
                outcome.flush = true;
            }
            else if old.pfn() != req.pfn || mapped_gfn != req.gfn {
                self.drop_spte(state, ptr)?;
                outcome.flush = true;
            }
            else {
                was_rmapped = true;
            }
        }

        let mut access = req.access;
        let mut spte = Spte::leaf(req.pfn);

        if !req.speculative {
            spte = spte.with(Spte::ACCESSED);
        }

        if !access.contains(Access::EXEC) {
            spte = spte.with(Spte::NX);
        }

        if access.contains(Access::USER) {
            spte = spte.with(Spte::USER);
        }

        if req.level > PageTableLevel::Pt {
            spte = spte.with(Spte::LARGE);
        }

        if ctx.direct_map {
            spte = spte.with_memory_type(self.host.memory_type_for(req.gfn));
        }

        if req.host_writable {
            spte = spte.with(Spte::HOST_WRITABLE);
        }
        else {
            access.remove(Access::WRITE);
        }

        if !req.dirty {
            access.remove(Access::WRITE);
        }

        if access.contains(Access::WRITE) {
            spte = spte.with(Spte::WRITABLE | Spte::MMU_WRITABLE);

            // A sync keeps an entry that is already writable; protection
            // was settled when the entry was made writable.
            let keep = !req.can_unsync && was_rmapped && old.writable();

            if !keep && self.need_write_protect(state, req.gfn, req.can_unsync)? {
                tracing::trace!(gfn = %req.gfn, "write-protecting shadowed guest table");
                outcome.write_protected = true;
                spte = spte.without(Spte::WRITABLE | Spte::MMU_WRITABLE);
            }

            if spte.writable() && req.write_fault {
                self.host.mark_page_dirty(req.gfn);
                spte = spte.with(Spte::DIRTY);
            }
        }

        if !direct_page {
            state.page_mut(ptr.page)?.gfns[ptr.index()] = req.gfn;
        }

        let table = self.table_of(state, ptr.page)?;
        outcome.flush |= table.update(ptr.index(), spte, &self.host, self.hardware_ad())?;

        if !was_rmapped {
            self.rmap_add(state, &mut pools.descs, ptr)?;
        }

        Ok(outcome)
    }

    /// Checks if `gfn` must stay write-protected, letting shadowing leaf
    /// pages go unsync when allowed.
    fn need_write_protect(
        &self,
        state: &mut MmuState,
        gfn: Gfn,
        can_unsync: bool,
    ) -> Result<bool, MmuError> {
        if self.host.write_protect_count(gfn, PageTableLevel::Pt) > 0 {
            return Ok(true);
        }

        let pages = state.indirect_pages_for(gfn);

        for &id in &pages {
            if state.page(id)?.level() != PageTableLevel::Pt {
                return Ok(true);
            }
        }

        for id in pages {
            if !can_unsync {
                return Ok(true);
            }

            if !state.page(id)?.unsync {
                self.unsync_page(state, id)?;
            }
        }

        Ok(false)
    }

    /// Writes an MMIO entry at `ptr`.
    fn set_mmio_spte(
        &self,
        state: &mut MmuState,
        ptr: SptePtr,
        level: PageTableLevel,
        gfn: Gfn,
        access: Access,
        generation: u64,
    ) -> Result<(), MmuError> {
        let old = self.spte(state, ptr)?;

        if old.is_shadow_present() {
            if old.is_leaf(level) {
                self.drop_spte(state, ptr)?;
            }
            else {
                let child = state.child_of(old)?;
                self.drop_parent_pte(state, child, ptr)?;
            }

            self.flush_remote_tlbs();
        }

        self.table_of(state, ptr.page)?
            .set(ptr.index(), Spte::mmio(gfn, access, generation))
    }

    /// Removes a huge leaf standing where the walk needs a table.
    fn drop_large_spte(
        &self,
        state: &mut MmuState,
        ptr: SptePtr,
        level: PageTableLevel,
    ) -> Result<(), MmuError> {
        let spte = self.spte(state, ptr)?;

        if level > PageTableLevel::Pt && spte.is_shadow_present() && spte.large() {
            tracing::trace!(page = %ptr.page, index = ptr.index, %level, "dropping huge leaf");
            self.drop_spte(state, ptr)?;
            self.flush_remote_tlbs();
        }

        Ok(())
    }

    /// Unlinks a direct child whose access rights no longer match the guest
    /// translation.
    fn validate_direct_spte(
        &self,
        state: &mut MmuState,
        ptr: SptePtr,
        access: Access,
    ) -> Result<(), MmuError> {
        let spte = self.spte(state, ptr)?;
        if !spte.is_shadow_present() || spte.large() {
            return Ok(());
        }

        let child = state.child_of(spte)?;
        if state.page(child)?.role.access == access {
            return Ok(());
        }

        self.drop_parent_pte(state, child, ptr)?;
        self.flush_remote_tlbs();
        Ok(())
    }

    fn clear_write_flooding(&self, state: &mut MmuState, id: PageId) -> Result<(), MmuError> {
        state.page_mut(id)?.write_flooding_count = 0;
        Ok(())
    }

    /// Speculatively maps resident neighbours of a freshly installed leaf.
    fn prefetch(
        &self,
        state: &mut MmuState,
        vcpu: &mut Vcpu,
        walker: &dyn GuestWalker,
        ptr: SptePtr,
    ) -> Result<(), MmuError> {
        // Without a hardware accessed bit a prefetched entry looks like a
        // real access to ageing.
        if !self.config.prefetch || !self.hardware_ad() {
            return Ok(());
        }

        let start = ptr.index() & !(PREFETCH_SLOTS - 1);

        // (slot, frame, access, guest entry dirty)
        let mut candidates: SmallVec<[(usize, Gfn, Access, bool); PREFETCH_SLOTS]> = SmallVec::new();
        {
            let page = state.page(ptr.page)?;
            if page.level() != PageTableLevel::Pt {
                return Ok(());
            }

            let table = self.tables.table(page.table);

            for index in start..start + PREFETCH_SLOTS {
                if index == ptr.index() || !table.get(index).is_absent() {
                    continue;
                }

                if page.role.direct {
                    candidates.push((index, page.gfn_at(index), page.role.access, true));
                    continue;
                }

                match walker.read_pte(page.gfn, page.guest_index(index)) {
                    Some(gpte) if gpte.present => {
                        candidates.push((index, gpte.gfn, page.role.access & gpte.access, gpte.dirty));
                    }
                    _ => {}
                }
            }
        }

        for (index, gfn, access, dirty) in candidates {
            if self.host.is_mmio(gfn) {
                continue;
            }

            let frame = match self.host.resolve(gfn, false, ResolveMode::NoWait) {
                Ok(frame) if !frame.needs_async => frame,
                _ => continue,
            };

            self.set_leaf(
                state,
                &mut vcpu.pools,
                &vcpu.ctx,
                SptePtr::new(ptr.page, index),
                LeafRequest {
                    gfn,
                    pfn: frame.pfn,
                    level: PageTableLevel::Pt,
                    access,
                    dirty,
                    write_fault: false,
                    speculative: true,
                    host_writable: frame.writable,
                    can_unsync: self.config.unsync && !vcpu.ctx.direct_map,
                },
            )?;

            tracing::trace!(vcpu = %vcpu.id, %gfn, index, "prefetched");
            MmuStats::inc(&self.stats.prefetched);
        }

        Ok(())
    }
}
