use std::sync::{
    Arc, OnceLock,
    atomic::{AtomicBool, Ordering},
};

use serde::{Deserialize, Serialize};
use smmu_arch_amd64::{PageTableLevel, Spte};
use smmu_core::{Gfn, MmuError, VcpuId};

use crate::{
    MmuHost,
    arena::TableArena,
    config::MmuConfig,
    epoch::Epoch,
    page::{PageId, Role, SptePtr},
    reclaim::ShrinkRegistry,
    rmap::RmapKey,
    slot::PageTable,
    state::MmuState,
    stats::{MmuStats, MmuStatsSnapshot},
    vcpu::{MmuContext, Vcpu},
};

/// A summary of one shadow page, for diagnostics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShadowPageInfo {
    /// The frame the page shadows (or maps, for direct pages).
    pub gfn: Gfn,

    /// The level of the page.
    pub level: PageTableLevel,

    /// The page maps a frame range instead of shadowing a guest table.
    pub direct: bool,

    /// The quadrant of a page shadowing a table with 4-byte entries.
    pub quadrant: u8,

    /// The page is out of sync with the guest table.
    pub unsync: bool,

    /// Number of entries linking to unsync descendants.
    pub unsync_children: u32,

    /// Number of vCPUs using the page as a root.
    pub root_count: u32,

    /// Number of entries linking to the page.
    pub parents: usize,

    /// The page was zapped but is still referenced as a root.
    pub invalid: bool,
}

/// The shadow MMU of one virtual machine.
///
/// Shared by all vCPUs of the VM. Structural changes are serialized by one
/// lock; lockless walks and the hardware read the shadow tables
/// concurrently.
pub struct ShadowMmu<Host>
where
    Host: MmuHost,
{
    pub(crate) host: Host,
    pub(crate) config: MmuConfig,
    pub(crate) state: spin::Mutex<MmuState>,
    pub(crate) tables: TableArena,
    pub(crate) epoch: Epoch,
    pub(crate) stats: MmuStats,
    dead: AtomicBool,
    pub(crate) registry: OnceLock<Arc<ShrinkRegistry>>,
}

impl<Host> ShadowMmu<Host>
where
    Host: MmuHost,
{
    /// Creates the MMU of a virtual machine.
    pub fn new(host: Host, config: MmuConfig) -> Self {
        tracing::debug!(
            max_pages = config.max_pages,
            max_tables = config.max_tables,
            unsync = config.unsync,
            prefetch = config.prefetch,
            "creating shadow MMU"
        );

        Self {
            state: spin::Mutex::new(MmuState::new(config.max_pages)),
            tables: TableArena::new(config.max_tables),
            epoch: Epoch::default(),
            stats: MmuStats::default(),
            dead: AtomicBool::new(false),
            registry: OnceLock::new(),
            host,
            config,
        }
    }

    /// Returns the host.
    pub fn host(&self) -> &Host {
        &self.host
    }

    /// Returns the configuration.
    pub fn config(&self) -> &MmuConfig {
        &self.config
    }

    /// Returns a snapshot of the statistics.
    pub fn stats(&self) -> MmuStatsSnapshot {
        self.stats.snapshot()
    }

    /// Returns the number of valid shadow pages.
    pub fn used_pages(&self) -> usize {
        self.state.lock().used_pages
    }

    /// Returns the shadow page limit.
    pub fn max_pages(&self) -> usize {
        self.state.lock().max_pages
    }

    /// Returns the number of zapped pages whose tables wait for lockless
    /// readers to leave.
    pub fn deferred_pages(&self) -> usize {
        self.state.lock().graveyard.len()
    }

    /// Returns the number of arena tables in use, including the ones held
    /// by vCPU pools.
    pub fn tables_in_use(&self) -> usize {
        self.tables.in_use()
    }

    /// Checks if the VM was stopped after an invariant violation.
    pub fn is_dead(&self) -> bool {
        self.dead.load(Ordering::Acquire)
    }

    /// Creates the MMU state of a vCPU.
    pub fn create_vcpu(&self, id: impl Into<VcpuId>, ctx: MmuContext) -> Vcpu {
        Vcpu::new(id.into(), ctx, &self.config)
    }

    /// Releases the MMU state of a vCPU.
    pub fn destroy_vcpu(&self, mut vcpu: Vcpu) -> Result<(), MmuError> {
        let result = self.unload_roots(&mut vcpu);
        vcpu.pools.release(&self.tables);
        result
    }

    /// Switches a vCPU to a new paging context, dropping its roots.
    pub fn reset_context(&self, vcpu: &mut Vcpu, ctx: MmuContext) -> Result<(), MmuError> {
        self.unload_roots(vcpu)?;
        vcpu.ctx = ctx;
        vcpu.mmio = None;
        Ok(())
    }

    /// Returns a summary of every valid or root-pinned shadow page.
    pub fn shadow_pages(&self) -> Vec<ShadowPageInfo> {
        let state = self.state.lock();

        state
            .pages
            .iter()
            .map(|(_, page)| ShadowPageInfo {
                gfn: page.gfn,
                level: page.level(),
                direct: page.role.direct,
                quadrant: page.role.quadrant,
                unsync: page.unsync,
                unsync_children: page.unsync_children,
                root_count: page.root_count,
                parents: page.parent_ptes.len(),
                invalid: page.invalid,
            })
            .collect()
    }

    /// Returns the number of leaf entries mapping `gfn` at `level`.
    pub fn rmap_len(&self, gfn: Gfn, level: PageTableLevel) -> usize {
        self.state.lock().rmap.len(RmapKey::new(gfn, level))
    }

    /// Dumps the shadow pages and their present entries.
    pub fn dump(&self) {
        println!("==================== <DUMP> ====================");
        let state = self.state.lock();
        println!(
            "{} pages, {} parent descriptors, {} deferred tables",
            state.pages.len(),
            state.descs.len(),
            state.graveyard.len()
        );

        let mut pages = state.pages.iter().collect::<Vec<_>>();
        pages.sort_by_key(|&(_, page)| (page.gfn, std::cmp::Reverse(page.level())));

        for (id, page) in pages {
            println!(
                "Page {} gfn {:#x?} {} {:?}{}{}",
                id,
                page.gfn,
                page.level(),
                page.role,
                if page.unsync { " unsync" } else { "" },
                if page.invalid { " invalid" } else { "" },
            );

            let table = self.tables.table(page.table);
            for index in 0..smmu_arch_amd64::ENTRIES_PER_TABLE {
                let spte = table.get(index);
                if spte.is_absent() {
                    continue;
                }

                println!("  [{:3}] {:?}", index, spte);
            }
        }

        println!("==================== </DUMP> ====================");
    }

    // Internal helpers shared by the engine modules.

    /// Takes the structural lock, releasing parked tables once no lockless
    /// reader is left.
    pub(crate) fn lock(&self) -> spin::MutexGuard<'_, MmuState> {
        let mut state = self.state.lock();

        if !state.graveyard.is_empty() && !self.epoch.readers_active() {
            self.release_retired(&mut state);
        }

        state
    }

    pub(crate) fn release_retired(&self, state: &mut MmuState) {
        for table in state.graveyard.drain(..) {
            self.tables.release(table);
        }
    }

    /// Runs an exposed operation, stopping the VM on invariant violations.
    pub(crate) fn guarded<T>(
        &self,
        op: impl FnOnce() -> Result<T, MmuError>,
    ) -> Result<T, MmuError> {
        if self.is_dead() {
            return Err(MmuError::VmDead);
        }

        let result = op();

        if let Err(err) = &result
            && err.is_fatal()
        {
            tracing::error!(%err, "stopping the virtual machine");
            self.dead.store(true, Ordering::Release);
        }

        result
    }

    pub(crate) fn table_of(&self, state: &MmuState, page: PageId) -> Result<&PageTable, MmuError> {
        Ok(self.tables.table(state.page(page)?.table))
    }

    pub(crate) fn spte(&self, state: &MmuState, ptr: SptePtr) -> Result<Spte, MmuError> {
        Ok(self.table_of(state, ptr.page)?.get(ptr.index()))
    }

    pub(crate) fn hardware_ad(&self) -> bool {
        self.host.has_accessed_bit()
    }

    pub(crate) fn flush_remote_tlbs(&self) {
        MmuStats::inc(&self.stats.tlb_flushes);
        self.host.flush_remote_tlbs();
    }

    /// Adjusts the valid page count and the process-wide total.
    pub(crate) fn account_used(&self, state: &mut MmuState, delta: isize) {
        state.used_pages = state.used_pages.wrapping_add_signed(delta);

        if let Some(registry) = self.registry.get() {
            registry.account(delta);
        }
    }

    pub(crate) fn role_for(
        &self,
        ctx: &MmuContext,
        level: PageTableLevel,
        direct: bool,
        access: smmu_core::Access,
        addr: u64,
    ) -> Role {
        let mut role = ctx.base_role();
        role.level = level;
        role.direct = direct;
        role.access = access;

        if direct {
            role.has_4_byte_gpte = false;
        }
        else if role.has_4_byte_gpte {
            role.quadrant = Role::quadrant_for(level, addr);
        }

        role
    }
}

impl<Host> Drop for ShadowMmu<Host>
where
    Host: MmuHost,
{
    fn drop(&mut self) {
        let used = self.state.get_mut().used_pages;

        if let Some(registry) = self.registry.get() {
            registry.account(-(used as isize));
        }
    }
}
