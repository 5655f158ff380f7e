#[path = "../../tests/common/mod.rs"]
mod common;

mod cache;

use smmu_arch_amd64::{PageTableLevel, PagingMode, Spte};
use smmu_core::{FaultErrorCode, Gfn, Gva, MmuError};

use self::common::{GuestTables, MockHost};
use crate::{
    FaultOutcome, GuestWalker, MmuConfig, MmuContext, NoGuestWalker, ShadowMmu, Vcpu,
    page::SptePtr, rmap::RmapKey,
};

///////////////////////////////////////////////////////////////////////////////
// Test Helpers
///////////////////////////////////////////////////////////////////////////////

const READ: FaultErrorCode = FaultErrorCode::empty();
const WRITE: FaultErrorCode = FaultErrorCode::WRITE;

fn tdp_mmu(config: MmuConfig) -> (ShadowMmu<MockHost>, Vcpu) {
    common::init_tracing();

    let mmu = ShadowMmu::new(MockHost::default(), config);
    let vcpu = mmu.create_vcpu(0, MmuContext::tdp());
    (mmu, vcpu)
}

fn shadow_mmu(config: MmuConfig, guest: &GuestTables) -> (ShadowMmu<MockHost>, Vcpu) {
    common::init_tracing();

    let mmu = ShadowMmu::new(MockHost::default(), config);
    let vcpu = mmu.create_vcpu(0, MmuContext::shadow(guest.mode()));
    (mmu, vcpu)
}

fn fault_tdp(
    mmu: &ShadowMmu<MockHost>,
    vcpu: &mut Vcpu,
    addr: u64,
    error_code: FaultErrorCode,
) -> Result<FaultOutcome, MmuError> {
    mmu.handle_page_fault(vcpu, &NoGuestWalker, Gva(addr), error_code)
}

fn fault(
    mmu: &ShadowMmu<MockHost>,
    vcpu: &mut Vcpu,
    walker: &dyn GuestWalker,
    addr: u64,
    error_code: FaultErrorCode,
) -> Result<FaultOutcome, MmuError> {
    mmu.handle_page_fault(vcpu, walker, Gva(addr), error_code)
}

/// Returns the last shadow entry translating `addr`.
fn terminal(mmu: &ShadowMmu<MockHost>, vcpu: &Vcpu, addr: u64) -> Option<(PageTableLevel, Spte)> {
    mmu.walk_shadow_lockless(vcpu, Gva(addr))
        .terminal()
        .map(|entry| (entry.level, entry.spte))
}

/// Returns every leaf entry the reverse map holds for `gfn` at `level`.
fn rmap_entries(mmu: &ShadowMmu<MockHost>, gfn: Gfn, level: PageTableLevel) -> Vec<(SptePtr, Spte)> {
    let state = mmu.lock();
    let key = RmapKey::new(gfn, level);

    let mut result = Vec::new();
    let mut n = 0;

    while let Some(ptr) = state.rmap.get(key, n, &state.descs).unwrap() {
        result.push((ptr, mmu.spte(&state, ptr).unwrap()));
        n += 1;
    }

    result
}

/// Checks the bookkeeping that must hold whenever the structural lock is
/// free.
fn check_consistency(mmu: &ShadowMmu<MockHost>) {
    let state = mmu.lock();

    let valid = state.pages.iter().filter(|(_, page)| !page.invalid).count();
    assert_eq!(state.used_pages, valid);
    assert_eq!(state.active.len(), valid);

    for (id, page) in state.pages.iter() {
        assert_eq!(state.owners.get(&page.table), Some(&id));

        for parent in page.parent_ptes.to_vec(&state.descs).unwrap() {
            let spte = mmu.spte(&state, parent).unwrap();
            assert!(spte.is_shadow_present());
            assert_eq!(state.child_of(spte).unwrap(), id);
        }

        let level = page.level();
        let table = mmu.tables.table(page.table);

        for index in 0..smmu_arch_amd64::ENTRIES_PER_TABLE {
            let spte = table.get(index);
            if !spte.is_shadow_present() || !spte.is_leaf(level) {
                continue;
            }

            let key = RmapKey::new(page.gfn_at(index), level);
            let ptr = SptePtr::new(id, index);
            let len = state.rmap.len(key);

            let found = (0..len).any(|n| state.rmap.get(key, n, &state.descs).unwrap() == Some(ptr));
            assert!(found, "leaf {id}[{index}] missing from the reverse map");
        }
    }
}

#[test]
fn guarded_operations_fail_once_dead() {
    let (mmu, mut vcpu) = tdp_mmu(MmuConfig::default());

    let result = mmu.guarded(|| -> Result<(), MmuError> {
        Err(MmuError::InvariantViolation("test"))
    });

    assert_eq!(result, Err(MmuError::InvariantViolation("test")));
    assert!(mmu.is_dead());
    assert_eq!(fault_tdp(&mmu, &mut vcpu, 0x1000, READ), Err(MmuError::VmDead));
    assert_eq!(mmu.zap_all(), Err(MmuError::VmDead));
}

#[test]
fn recoverable_errors_keep_the_vm_alive() {
    let (mmu, _) = tdp_mmu(MmuConfig::default());

    let result = mmu.guarded(|| -> Result<(), MmuError> { Err(MmuError::NoMemory) });
    assert_eq!(result, Err(MmuError::NoMemory));
    assert!(!mmu.is_dead());
}

#[test]
fn tdp_requires_four_levels() {
    let (mmu, _) = tdp_mmu(MmuConfig::default().with_tdp_level(PageTableLevel::Pdpt));
    let mut vcpu = mmu.create_vcpu(1, MmuContext::tdp());

    assert_eq!(
        mmu.load_roots(&mut vcpu, &NoGuestWalker),
        Err(MmuError::NotSupported)
    );
    assert!(!mmu.is_dead());
}

#[test]
fn guest_root_must_match_the_mode() {
    let guest = GuestTables::ia32e();
    let (mmu, _) = shadow_mmu(MmuConfig::default(), &guest);
    let mut vcpu = mmu.create_vcpu(1, MmuContext::shadow(PagingMode::PAE));

    assert!(matches!(
        mmu.load_roots(&mut vcpu, &guest),
        Err(MmuError::Other(_))
    ));
}
