use smmu_arch_amd64::PageTableLevel;
use smmu_core::{Access, Gfn, Gpa, Gva, MmuError, Pfn, VcpuId};

use super::{
    READ, WRITE, check_consistency, common, fault, fault_tdp, rmap_entries, shadow_mmu,
    terminal, tdp_mmu,
};
use crate::{FaultOutcome, MmuConfig, MmuContext, NoGuestWalker, page::SptePtr, pool::VcpuPools};
use common::{GuestTables, P, U, W, pfn_of};

///////////////////////////////////////////////////////////////////////////////
// Lookup
///////////////////////////////////////////////////////////////////////////////

#[test]
fn identical_role_and_frame_hit_the_same_page() -> Result<(), MmuError> {
    let (mmu, _) = tdp_mmu(MmuConfig::default());
    let ctx = MmuContext::tdp();

    let mut pools = VcpuPools::new(mmu.config());
    pools.top_up(&mmu.tables)?;

    let mut state = mmu.lock();

    let parent_role = mmu.role_for(&ctx, PageTableLevel::Pd, true, Access::ALL, 0);
    let parent = mmu.get_or_create(
        &mut state,
        &mut pools,
        &ctx,
        &NoGuestWalker,
        parent_role,
        Gfn(0),
        None,
    )?;

    let role = mmu.role_for(&ctx, PageTableLevel::Pt, true, Access::ALL, 0);
    let first = mmu.get_or_create(
        &mut state,
        &mut pools,
        &ctx,
        &NoGuestWalker,
        role,
        Gfn(0x200),
        Some(SptePtr::new(parent, 1)),
    )?;
    assert_eq!(state.page(first)?.parent_ptes.len(), 1);

    let second = mmu.get_or_create(
        &mut state,
        &mut pools,
        &ctx,
        &NoGuestWalker,
        role,
        Gfn(0x200),
        Some(SptePtr::new(parent, 2)),
    )?;
    assert_eq!(first, second);
    assert_eq!(state.page(first)?.parent_ptes.len(), 2);

    // Another access mask is another page.
    let mut restricted = role;
    restricted.access = Access::USER | Access::EXEC;
    let third = mmu.get_or_create(
        &mut state,
        &mut pools,
        &ctx,
        &NoGuestWalker,
        restricted,
        Gfn(0x200),
        None,
    )?;
    assert_ne!(first, third);
    assert_eq!(state.used_pages, 3);

    drop(state);
    pools.release(&mmu.tables);
    check_consistency(&mmu);
    Ok(())
}

#[test]
fn legacy_roots_shadow_four_quadrants() -> Result<(), MmuError> {
    let guest = GuestTables::legacy();
    guest.map(Gva(0xc000_0000), Gfn(0x77), P | W | U);

    let (mmu, mut vcpu) = shadow_mmu(MmuConfig::default(), &guest);
    mmu.load_roots(&mut vcpu, &guest)?;

    let root = guest.root_gfn();
    let mut quadrants = mmu
        .shadow_pages()
        .into_iter()
        .filter(|page| page.gfn == root)
        .map(|page| (page.level, page.quadrant, page.root_count))
        .collect::<Vec<_>>();
    quadrants.sort();

    assert_eq!(
        quadrants,
        (0..4)
            .map(|quadrant| (PageTableLevel::Pd, quadrant, 1))
            .collect::<Vec<_>>()
    );

    assert_eq!(fault(&mmu, &mut vcpu, &guest, 0xc000_0000, READ)?, FaultOutcome::Retry);

    let (level, spte) = terminal(&mmu, &vcpu, 0xc000_0000).unwrap();
    assert_eq!(level, PageTableLevel::Pt);
    assert_eq!(spte.pfn(), pfn_of(Gfn(0x77)));

    // The 4MB directory entry 768 is shadowed by entries 0 and 1 of the
    // last quadrant. Rewriting it drops them.
    mmu.track_write(Gpa((root.0 << 12) + 768 * 4), 4)?;

    let (level, spte) = terminal(&mmu, &vcpu, 0xc000_0000).unwrap();
    assert_eq!(level, PageTableLevel::Pd);
    assert!(spte.is_absent());

    check_consistency(&mmu);
    mmu.destroy_vcpu(vcpu)
}

///////////////////////////////////////////////////////////////////////////////
// Write protection
///////////////////////////////////////////////////////////////////////////////

#[test]
fn shadowing_a_table_write_protects_its_mappings() -> Result<(), MmuError> {
    let guest = GuestTables::ia32e();
    guest.map(Gva(0x1000), Gfn(0x50), P | W | U);

    let (mmu, mut vcpu) = shadow_mmu(MmuConfig::default().with_prefetch(false), &guest);

    assert_eq!(fault(&mmu, &mut vcpu, &guest, 0x1000, WRITE)?, FaultOutcome::Retry);
    let (_, spte) = terminal(&mmu, &vcpu, 0x1000).unwrap();
    assert!(spte.writable());

    // The guest turns the data page into a page table and links it.
    guest.map(Gva(0x4000_0000), Gfn(0x60), P | W | U);
    let (pd, index) = guest.table_for(Gva(0x4000_0000), PageTableLevel::Pd);
    guest.set_pte(pd, index, common::pte(Gfn(0x50), P | W | U));
    guest.set_pte(Gfn(0x50), 0, common::pte(Gfn(0x60), P | W | U));

    assert_eq!(fault(&mmu, &mut vcpu, &guest, 0x4000_0000, READ)?, FaultOutcome::Retry);

    // The existing writable alias lost write access.
    let (_, spte) = terminal(&mmu, &vcpu, 0x1000).unwrap();
    assert!(spte.is_shadow_present());
    assert!(!spte.writable());

    check_consistency(&mmu);
    mmu.destroy_vcpu(vcpu)
}

#[test]
fn write_protected_frame_stays_read_only() -> Result<(), MmuError> {
    let guest = GuestTables::ia32e();
    guest.map(Gva(0x1000), Gfn(0x50), P | W | U);
    guest.map(Gva(0x2000_0000), Gfn(0x50), P | W | U);

    let (mmu, mut vcpu) = shadow_mmu(MmuConfig::default().with_prefetch(false), &guest);

    for addr in [0x1000, 0x2000_0000] {
        assert_eq!(fault(&mmu, &mut vcpu, &guest, addr, WRITE)?, FaultOutcome::Retry);
    }

    let entries = rmap_entries(&mmu, Gfn(0x50), PageTableLevel::Pt);
    assert_eq!(entries.len(), 2);
    assert!(entries.iter().all(|(_, spte)| spte.writable()));

    let flushes = mmu.host().flushes();
    assert!(mmu.write_protect_gfn(Gfn(0x50))?);
    assert!(mmu.host().flushes() > flushes);

    let entries = rmap_entries(&mmu, Gfn(0x50), PageTableLevel::Pt);
    assert_eq!(entries.len(), 2);
    assert!(entries.iter().all(|(_, spte)| !spte.writable()));

    // Nothing left to protect.
    assert!(!mmu.write_protect_gfn(Gfn(0x50))?);

    // While the host tracks writes, a write fault is emulated and the entry
    // stays read-only.
    mmu.host().track_writes(Gfn(0x50), PageTableLevel::Pt);
    assert_eq!(fault(&mmu, &mut vcpu, &guest, 0x1000, WRITE)?, FaultOutcome::Emulate);
    assert_eq!(mmu.stats().pf_emulate, 1);

    let entries = rmap_entries(&mmu, Gfn(0x50), PageTableLevel::Pt);
    assert!(entries.iter().all(|(_, spte)| !spte.writable()));

    check_consistency(&mmu);
    mmu.destroy_vcpu(vcpu)
}

#[test]
fn huge_pages_avoid_shadowed_tables() -> Result<(), MmuError> {
    let guest = GuestTables::ia32e();

    // Huge page over the guest's own page tables.
    let shadowed = Gva(0x4000_0000);
    guest.map(shadowed, Gfn(0), P);
    let (pd, index) = guest.table_for(shadowed, PageTableLevel::Pd);
    guest.set_pte(pd, index, common::pte(Gfn(GuestTables::TABLE_BASE), P | W | U | common::PS));

    // Huge page over plain data.
    let plain = Gva(0x8000_0000);
    guest.map(plain, Gfn(0), P);
    let (pd, index) = guest.table_for(plain, PageTableLevel::Pd);
    guest.set_pte(pd, index, common::pte(Gfn(0x4000), P | W | U | common::PS));

    let (mmu, mut vcpu) = shadow_mmu(MmuConfig::default().with_prefetch(false), &guest);
    mmu.host().set_mapping_level(PageTableLevel::Pdpt);

    assert_eq!(fault(&mmu, &mut vcpu, &guest, shadowed.0 + 0x3000, READ)?, FaultOutcome::Retry);
    let (level, spte) = terminal(&mmu, &vcpu, shadowed.0 + 0x3000).unwrap();
    assert_eq!(level, PageTableLevel::Pt);
    assert_eq!(spte.pfn(), pfn_of(Gfn(GuestTables::TABLE_BASE + 3)));

    assert_eq!(fault(&mmu, &mut vcpu, &guest, plain.0 + 0x3000, WRITE)?, FaultOutcome::Retry);
    let (level, spte) = terminal(&mmu, &vcpu, plain.0 + 0x3000).unwrap();
    assert_eq!(level, PageTableLevel::Pd);
    assert!(spte.large());
    assert_eq!(spte.pfn(), pfn_of(Gfn(0x4000)));
    assert_eq!(mmu.rmap_len(Gfn(0x4000), PageTableLevel::Pd), 1);

    check_consistency(&mmu);
    mmu.destroy_vcpu(vcpu)
}

///////////////////////////////////////////////////////////////////////////////
// Zapping
///////////////////////////////////////////////////////////////////////////////

#[test]
fn zap_under_lockless_readers_defers_tables() -> Result<(), MmuError> {
    let (mmu, mut vcpu) = tdp_mmu(MmuConfig::default());

    assert_eq!(fault_tdp(&mmu, &mut vcpu, 0x1000, WRITE)?, FaultOutcome::Retry);
    mmu.unload_roots(&mut vcpu)?;

    let tables = mmu.tables_in_use();
    let reader = mmu.epoch.enter();
    mmu.zap_all()?;

    assert_eq!(mmu.used_pages(), 0);
    assert_eq!(mmu.deferred_pages(), 4);
    assert_eq!(mmu.tables_in_use(), tables);

    drop(reader);

    // The next structural lock hands the tables back.
    drop(mmu.lock());
    assert_eq!(mmu.deferred_pages(), 0);
    assert_eq!(mmu.tables_in_use(), tables - 4);

    // Nothing left to zap.
    mmu.zap_all()?;
    assert!(mmu.shadow_pages().is_empty());

    mmu.destroy_vcpu(vcpu)
}

#[test]
fn zap_releases_every_structure() -> Result<(), MmuError> {
    let (mmu, mut vcpu) = tdp_mmu(MmuConfig::default());

    for i in 0..16 {
        assert_eq!(fault_tdp(&mmu, &mut vcpu, i * 0x20_1000, WRITE)?, FaultOutcome::Retry);
    }

    check_consistency(&mmu);

    mmu.unload_roots(&mut vcpu)?;
    mmu.zap_all()?;

    {
        let state = mmu.lock();
        assert!(state.pages.is_empty());
        assert!(state.descs.is_empty());
        assert!(state.rmap.is_empty());
        assert!(state.hash.is_empty());
        assert!(state.owners.is_empty());
        assert!(state.active.is_empty());
        assert!(state.graveyard.is_empty());
        assert_eq!(state.used_pages, 0);
    }

    // Only the vCPU pool still holds tables.
    assert_eq!(mmu.tables_in_use(), vcpu.pools.tables.len());

    mmu.destroy_vcpu(vcpu)?;
    assert_eq!(mmu.tables_in_use(), 0);
    Ok(())
}

#[test]
fn zapped_roots_wait_for_their_vcpus() -> Result<(), MmuError> {
    let (mmu, mut vcpu) = tdp_mmu(MmuConfig::default());
    let mut other = mmu.create_vcpu(1, MmuContext::tdp());

    assert_eq!(fault_tdp(&mmu, &mut vcpu, 0x1000, READ)?, FaultOutcome::Retry);
    assert_eq!(fault_tdp(&mmu, &mut other, 0x2000, READ)?, FaultOutcome::Retry);

    // Both vCPUs share one root.
    let roots = mmu.shadow_pages().into_iter().filter(|page| page.root_count > 0).count();
    assert_eq!(roots, 1);

    mmu.zap_all()?;
    assert_eq!(mmu.used_pages(), 0);

    let mut reloads = mmu.host().reloads.lock().unwrap().clone();
    reloads.sort();
    assert_eq!(reloads, [VcpuId(0), VcpuId(1)]);

    let pages = mmu.shadow_pages();
    assert_eq!(pages.len(), 1);
    assert!(pages[0].invalid);
    assert_eq!(pages[0].root_count, 2);

    // The next fault moves to a new root; the old one is released with its
    // last user.
    assert_eq!(fault_tdp(&mmu, &mut vcpu, 0x1000, READ)?, FaultOutcome::Retry);
    mmu.unload_roots(&mut other)?;

    assert!(mmu.shadow_pages().iter().all(|page| !page.invalid));
    check_consistency(&mmu);

    mmu.destroy_vcpu(other)?;
    mmu.destroy_vcpu(vcpu)
}

#[test]
fn unprotect_page_zaps_its_shadows() -> Result<(), MmuError> {
    let guest = GuestTables::ia32e();
    guest.map(Gva(0x1000), Gfn(0x50), P | W | U);

    let (mmu, mut vcpu) = shadow_mmu(MmuConfig::default(), &guest);
    assert_eq!(fault(&mmu, &mut vcpu, &guest, 0x1000, READ)?, FaultOutcome::Retry);

    let (pt, _) = guest.table_for(Gva(0x1000), PageTableLevel::Pt);
    assert!(mmu.shadow_pages().iter().any(|page| page.gfn == pt && !page.direct));

    assert!(mmu.unprotect_page(pt)?);
    assert!(!mmu.shadow_pages().iter().any(|page| page.gfn == pt));
    assert!(!mmu.unprotect_page(pt)?);

    // The translation is rebuilt on the next fault.
    assert_eq!(fault(&mmu, &mut vcpu, &guest, 0x1000, READ)?, FaultOutcome::Retry);
    assert!(mmu.walk_shadow_lockless(&vcpu, Gva(0x1000)).is_present());

    check_consistency(&mmu);
    mmu.destroy_vcpu(vcpu)
}

///////////////////////////////////////////////////////////////////////////////
// Unsync
///////////////////////////////////////////////////////////////////////////////

#[test]
fn writable_page_table_goes_unsync() -> Result<(), MmuError> {
    let guest = GuestTables::ia32e();
    let va = Gva(0x40_0000);
    guest.map(va, Gfn(0x500), P | W | U);

    // The guest maps its own leaf table writable right after `va`.
    let (pt, _) = guest.table_for(va, PageTableLevel::Pt);
    guest.map(Gva(va.0 + 0x1000), pt, P | W | U);

    let (mmu, mut vcpu) = shadow_mmu(MmuConfig::default(), &guest);

    assert_eq!(fault(&mmu, &mut vcpu, &guest, va.0 + 0x1000, WRITE)?, FaultOutcome::Retry);
    assert_eq!(mmu.stats().unsync_pages, 1);

    let (_, spte) = terminal(&mmu, &vcpu, va.0 + 0x1000).unwrap();
    assert!(spte.writable());

    {
        let state = mmu.lock();
        let page = state.indirect_pages_for(pt)[0];
        assert!(state.page(page)?.unsync);

        // Every ancestor advertises the unsync page.
        let mut id = page;
        while let Some(parent) = state.parents_of(id)?.first().copied() {
            assert!(state.page(parent.page)?.unsync_children > 0);
            id = parent.page;
        }
    }

    // The guest edits the table behind the shadow's back.
    guest.set_pte(pt, 0, common::pte(Gfn(0x600), P | W | U));

    mmu.sync_roots(&mut vcpu, &guest)?;

    assert!(mmu.shadow_pages().iter().all(|page| !page.unsync && page.unsync_children == 0));
    assert_eq!(mmu.stats().pages_synced, 1);

    // The stale prefetched entry is gone and the table is write-protected
    // again.
    let stale = terminal(&mmu, &vcpu, va.0).unwrap().1;
    assert!(!stale.is_shadow_present() || stale.pfn() == pfn_of(Gfn(0x600)));

    let (_, spte) = terminal(&mmu, &vcpu, va.0 + 0x1000).unwrap();
    assert!(spte.is_shadow_present());
    assert!(!spte.writable());

    check_consistency(&mmu);
    mmu.destroy_vcpu(vcpu)
}

#[test]
fn unsync_hit_restores_write_protection() -> Result<(), MmuError> {
    let guest = GuestTables::ia32e();
    let va = Gva(0x40_0000);
    guest.map(va, Gfn(0x500), P | W | U);

    let (pt, _) = guest.table_for(va, PageTableLevel::Pt);
    let window = va.0 + 0x1000;
    guest.map(Gva(window), pt, P | W | U);

    let (mmu, mut vcpu) = shadow_mmu(MmuConfig::default(), &guest);
    assert_eq!(fault(&mmu, &mut vcpu, &guest, window, WRITE)?, FaultOutcome::Retry);
    assert!(terminal(&mmu, &vcpu, window).unwrap().1.writable());

    // The guest edits the unsync table, then links it from a second
    // directory entry.
    guest.set_pte(pt, 0, common::pte(Gfn(0x600), P | W | U));

    let (pd, _) = guest.table_for(va, PageTableLevel::Pd);
    let alias = 0x60_0000;
    guest.set_pte(pd, PageTableLevel::Pd.index_for(alias), common::pte(pt, P | W | U));

    assert_eq!(fault(&mmu, &mut vcpu, &guest, alias, READ)?, FaultOutcome::Retry);
    assert_eq!(mmu.stats().pages_synced, 1);

    let pages = mmu.shadow_pages();
    let page = pages
        .iter()
        .find(|page| page.gfn == pt && page.level == PageTableLevel::Pt)
        .unwrap();
    assert!(!page.unsync);
    assert_eq!(page.parents, 2);

    // The synced table is trapped again.
    let (_, spte) = terminal(&mmu, &vcpu, window).unwrap();
    assert!(spte.is_shadow_present());
    assert!(!spte.writable());

    for addr in [va.0, alias] {
        let (_, spte) = terminal(&mmu, &vcpu, addr).unwrap();
        assert_eq!(spte.pfn(), pfn_of(Gfn(0x600)));
    }

    // A later guest write reaches the shadow through the trap.
    guest.set_pte(pt, 0, common::pte(Gfn(0x700), P | W | U));
    mmu.track_write(Gpa(pt.0 << 12), 8)?;
    assert!(!mmu.walk_shadow_lockless(&vcpu, va).is_present());

    assert_eq!(fault(&mmu, &mut vcpu, &guest, va.0, READ)?, FaultOutcome::Retry);
    let (_, spte) = terminal(&mmu, &vcpu, va.0).unwrap();
    assert_eq!(spte.pfn(), pfn_of(Gfn(0x700)));

    check_consistency(&mmu);
    mmu.destroy_vcpu(vcpu)
}

#[test]
fn unsync_disabled_emulates_page_table_writes() -> Result<(), MmuError> {
    let guest = GuestTables::ia32e();
    let va = Gva(0x40_0000);
    guest.map(va, Gfn(0x500), P | W | U);

    let (pt, _) = guest.table_for(va, PageTableLevel::Pt);
    guest.map(Gva(va.0 + 0x1000), pt, P | W | U);

    let (mmu, mut vcpu) = shadow_mmu(MmuConfig::default().with_unsync(false), &guest);

    assert_eq!(fault(&mmu, &mut vcpu, &guest, va.0 + 0x1000, WRITE)?, FaultOutcome::Emulate);
    assert_eq!(mmu.stats().unsync_pages, 0);
    assert!(mmu.shadow_pages().iter().all(|page| !page.unsync));

    check_consistency(&mmu);
    mmu.destroy_vcpu(vcpu)
}

#[test]
fn directory_use_zaps_unsync_leaf() -> Result<(), MmuError> {
    let guest = GuestTables::ia32e();
    let va = Gva(0x40_0000);
    guest.map(va, Gfn(0x500), P | W | U);

    let (pt, _) = guest.table_for(va, PageTableLevel::Pt);
    guest.map(Gva(va.0 + 0x1000), pt, P | W | U);

    let (mmu, mut vcpu) = shadow_mmu(MmuConfig::default(), &guest);
    assert_eq!(fault(&mmu, &mut vcpu, &guest, va.0 + 0x1000, WRITE)?, FaultOutcome::Retry);
    assert!(mmu.shadow_pages().iter().any(|page| page.unsync));

    // The guest reuses the unsync table as a page directory.
    let table = guest.alloc_table();
    guest.set_pte(table, 0, common::pte(Gfn(0x700), P | W | U));
    guest.set_pte(pt, 2, common::pte(table, P | W | U));

    let (pdpt, _) = guest.table_for(va, PageTableLevel::Pdpt);
    guest.set_pte(pdpt, 1, common::pte(pt, P | W | U));

    assert_eq!(fault(&mmu, &mut vcpu, &guest, 0x4040_0000, READ)?, FaultOutcome::Retry);

    let pages = mmu.shadow_pages();
    assert!(pages.iter().all(|page| !page.unsync));
    assert!(
        !pages
            .iter()
            .any(|page| page.gfn == pt && page.level == PageTableLevel::Pt)
    );
    assert!(
        pages
            .iter()
            .any(|page| page.gfn == pt && page.level == PageTableLevel::Pd)
    );
    assert_eq!(mmu.stats().pages_synced, 0);

    // The leaf shadow went with the page.
    let (level, spte) = terminal(&mmu, &vcpu, va.0 + 0x1000).unwrap();
    assert_eq!(level, PageTableLevel::Pd);
    assert!(spte.is_absent());

    check_consistency(&mmu);
    mmu.destroy_vcpu(vcpu)
}

#[test]
fn refault_keeps_one_reverse_mapping() -> Result<(), MmuError> {
    let (mmu, mut vcpu) = tdp_mmu(MmuConfig::default().with_prefetch(false));

    assert_eq!(fault_tdp(&mmu, &mut vcpu, 0x5000, WRITE)?, FaultOutcome::Retry);
    assert_eq!(fault_tdp(&mmu, &mut vcpu, 0x5000, WRITE)?, FaultOutcome::Retry);

    let entries = rmap_entries(&mmu, Gfn(5), PageTableLevel::Pt);
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].1.pfn(), Pfn(common::PFN_BASE + 5));

    mmu.destroy_vcpu(vcpu)
}
