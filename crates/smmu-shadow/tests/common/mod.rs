//! A mock host and in-memory guest page tables.

#![allow(dead_code)]

use std::{
    collections::{HashMap, HashSet},
    sync::{
        Mutex,
        atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering},
    },
};

use smallvec::{SmallVec, smallvec};
use smmu_arch_amd64::{PageTableLevel, PagingMode};
use smmu_core::{
    Access, FaultErrorCode, Gfn, GuestFault, Gva, Hva, MmuError, PAGE_SHIFT, PAGE_SIZE, Pfn,
    VcpuId,
};
use smmu_shadow::{
    ChangeNotifier, GfnRange, GuestPte, GuestRoot, GuestTable, GuestWalk, GuestWalker,
    HostFrames, HostOps, MemorySlots, ResolveMode, ResolvedFrame,
};

/// Host frames back guest frames at this offset.
pub const PFN_BASE: u64 = 0x10_0000;

/// Guest memory is mapped into the host at this address.
pub const HVA_BASE: u64 = 0x7f00_0000_0000;

pub fn pfn_of(gfn: Gfn) -> Pfn {
    Pfn(gfn.0 + PFN_BASE)
}

pub fn hva_of(gfn: Gfn) -> Hva {
    Hva(HVA_BASE + (gfn.0 << PAGE_SHIFT))
}

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_max_level(tracing::Level::DEBUG)
        .with_test_writer()
        .try_init();
}

#[derive(Default)]
pub struct MockHost {
    pub mmio: Mutex<HashSet<Gfn>>,
    pub read_only: Mutex<HashSet<Gfn>>,
    pub non_resident: Mutex<HashSet<Gfn>>,
    pub write_tracked: Mutex<HashMap<(Gfn, PageTableLevel), u32>>,
    pub mapping_level: Mutex<Option<PageTableLevel>>,
    pub no_accessed_bit: AtomicBool,

    pub generation: AtomicU64,
    pub sequence: AtomicU64,

    /// Number of upcoming resolves that race with a host mapping change.
    pub racing_resolves: AtomicUsize,

    pub flushes: AtomicUsize,
    pub reloads: Mutex<Vec<VcpuId>>,
    pub accessed: Mutex<Vec<Pfn>>,
    pub dirty: Mutex<Vec<Pfn>>,
    pub dirty_log: Mutex<Vec<Gfn>>,
}

impl MockHost {
    pub fn flushes(&self) -> usize {
        self.flushes.load(Ordering::SeqCst)
    }

    pub fn add_mmio(&self, gfn: Gfn) {
        self.mmio.lock().unwrap().insert(gfn);
    }

    pub fn track_writes(&self, gfn: Gfn, level: PageTableLevel) {
        *self
            .write_tracked
            .lock()
            .unwrap()
            .entry((level.round_gfn(gfn), level))
            .or_default() += 1;
    }

    pub fn set_mapping_level(&self, level: PageTableLevel) {
        *self.mapping_level.lock().unwrap() = Some(level);
    }

    pub fn bump_generation(&self) {
        self.generation.fetch_add(1, Ordering::SeqCst);
    }
}

impl HostFrames for MockHost {
    fn resolve(
        &self,
        gfn: Gfn,
        _write: bool,
        mode: ResolveMode,
    ) -> Result<ResolvedFrame, MmuError> {
        if self.mmio.lock().unwrap().contains(&gfn) {
            return Err(MmuError::BadFrame { gfn });
        }

        let racing = self
            .racing_resolves
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();

        if racing {
            self.sequence.fetch_add(1, Ordering::SeqCst);
        }

        let mut non_resident = self.non_resident.lock().unwrap();
        let needs_async = match mode {
            ResolveMode::NoWait => non_resident.contains(&gfn),
            ResolveMode::Wait => {
                non_resident.remove(&gfn);
                false
            }
        };

        Ok(ResolvedFrame {
            pfn: pfn_of(gfn),
            writable: !self.read_only.lock().unwrap().contains(&gfn),
            needs_async,
        })
    }

    fn host_mapping_level(&self, _gfn: Gfn) -> PageTableLevel {
        self.mapping_level
            .lock()
            .unwrap()
            .unwrap_or(PageTableLevel::Pt)
    }

    fn mark_accessed(&self, pfn: Pfn) {
        self.accessed.lock().unwrap().push(pfn);
    }

    fn mark_dirty(&self, pfn: Pfn) {
        self.dirty.lock().unwrap().push(pfn);
    }
}

impl HostOps for MockHost {
    fn flush_remote_tlbs(&self) {
        self.flushes.fetch_add(1, Ordering::SeqCst);
    }

    fn request_reload(&self, vcpu: VcpuId) {
        self.reloads.lock().unwrap().push(vcpu);
    }

    fn has_accessed_bit(&self) -> bool {
        !self.no_accessed_bit.load(Ordering::SeqCst)
    }
}

impl MemorySlots for MockHost {
    fn write_protect_count(&self, gfn: Gfn, level: PageTableLevel) -> u32 {
        self.write_tracked
            .lock()
            .unwrap()
            .get(&(level.round_gfn(gfn), level))
            .copied()
            .unwrap_or(0)
    }

    fn mark_page_dirty(&self, gfn: Gfn) {
        self.dirty_log.lock().unwrap().push(gfn);
    }

    fn is_mmio(&self, gfn: Gfn) -> bool {
        self.mmio.lock().unwrap().contains(&gfn)
    }

    fn generation(&self) -> u64 {
        self.generation.load(Ordering::SeqCst)
    }

    fn hva_to_gfns(&self, start: Hva, end: Hva) -> SmallVec<[GfnRange; 2]> {
        if end.0 <= HVA_BASE {
            return SmallVec::new();
        }

        let start = start.0.max(HVA_BASE) - HVA_BASE;
        let end = end.0 - HVA_BASE;

        smallvec![GfnRange {
            start: Gfn(start >> PAGE_SHIFT),
            end: Gfn(end.div_ceil(PAGE_SIZE)),
        }]
    }
}

impl ChangeNotifier for MockHost {
    fn current_sequence(&self) -> u64 {
        self.sequence.load(Ordering::SeqCst)
    }
}

pub const P: u64 = 1 << 0;
pub const W: u64 = 1 << 1;
pub const U: u64 = 1 << 2;
pub const D: u64 = 1 << 6;
pub const PS: u64 = 1 << 7;
pub const NX: u64 = 1 << 63;

const FRAME_MASK: u64 = 0x000f_ffff_ffff_f000;

/// Builds a guest entry.
pub fn pte(gfn: Gfn, flags: u64) -> u64 {
    (gfn.0 << PAGE_SHIFT) | flags
}

fn entry_access(raw: u64) -> Access {
    let mut access = Access::empty();

    if raw & W != 0 {
        access |= Access::WRITE;
    }

    if raw & U != 0 {
        access |= Access::USER;
    }

    if raw & NX == 0 {
        access |= Access::EXEC;
    }

    access
}

/// Guest page tables held in memory.
pub struct GuestTables {
    mode: PagingMode,
    root: Mutex<GuestRoot>,
    tables: Mutex<HashMap<Gfn, Vec<u64>>>,
    next_table: AtomicU64,
}

impl GuestTables {
    /// First frame handed out for tables created by [`GuestTables::map`].
    pub const TABLE_BASE: u64 = 0x800;

    pub fn new(mode: PagingMode, root: GuestRoot) -> Self {
        Self {
            mode,
            root: Mutex::new(root),
            tables: Mutex::new(HashMap::new()),
            next_table: AtomicU64::new(Self::TABLE_BASE),
        }
    }

    /// 4-level tables rooted at a fresh frame.
    pub fn ia32e() -> Self {
        let tables = Self::new(PagingMode::Ia32e, GuestRoot::Table(Gfn(0)));
        let root = tables.alloc_table();
        tables.set_root(GuestRoot::Table(root));
        tables
    }

    /// 2-level tables with 4-byte entries rooted at a fresh frame.
    pub fn legacy() -> Self {
        let tables = Self::new(PagingMode::Legacy, GuestRoot::Table(Gfn(0)));
        let root = tables.alloc_table();
        tables.set_root(GuestRoot::Table(root));
        tables
    }

    pub fn mode(&self) -> PagingMode {
        self.mode
    }

    pub fn root_gfn(&self) -> Gfn {
        match *self.root.lock().unwrap() {
            GuestRoot::Table(gfn) => gfn,
            GuestRoot::Pae(pdptrs) => pdptrs.iter().flatten().copied().next().unwrap_or(Gfn(0)),
        }
    }

    pub fn set_root(&self, root: GuestRoot) {
        *self.root.lock().unwrap() = root;
    }

    fn entries(&self) -> usize {
        match self.mode {
            PagingMode::Legacy => 1024,
            _ => 512,
        }
    }

    pub fn alloc_table(&self) -> Gfn {
        let gfn = Gfn(self.next_table.fetch_add(1, Ordering::SeqCst));
        let entries = self.entries();
        self.tables.lock().unwrap().insert(gfn, vec![0; entries]);
        gfn
    }

    pub fn set_pte(&self, table: Gfn, index: usize, raw: u64) {
        let entries = self.entries();
        self.tables
            .lock()
            .unwrap()
            .entry(table)
            .or_insert_with(|| vec![0; entries])[index] = raw;
    }

    pub fn get_pte(&self, table: Gfn, index: usize) -> u64 {
        self.tables
            .lock()
            .unwrap()
            .get(&table)
            .and_then(|table| table.get(index).copied())
            .unwrap_or(0)
    }

    fn index_for(&self, level: PageTableLevel, addr: u64) -> usize {
        match self.mode {
            PagingMode::Legacy => match level {
                PageTableLevel::Pd => ((addr >> 22) & 0x3ff) as usize,
                _ => ((addr >> 12) & 0x3ff) as usize,
            },
            _ => level.index_for(addr),
        }
    }

    fn frame(&self, raw: u64) -> Gfn {
        match self.mode {
            PagingMode::Legacy => Gfn((raw & 0xffff_f000) >> PAGE_SHIFT),
            _ => Gfn((raw & FRAME_MASK) >> PAGE_SHIFT),
        }
    }

    fn start(&self, addr: u64) -> Option<(Gfn, PageTableLevel)> {
        match (self.mode, *self.root.lock().unwrap()) {
            (PagingMode::PAE, GuestRoot::Pae(pdptrs)) => {
                pdptrs[((addr >> 30) & 3) as usize].map(|gfn| (gfn, PageTableLevel::Pd))
            }
            (PagingMode::Legacy, GuestRoot::Table(gfn)) => Some((gfn, PageTableLevel::Pd)),
            (PagingMode::Ia32eLA57, GuestRoot::Table(gfn)) => Some((gfn, PageTableLevel::Pml5)),
            (_, GuestRoot::Table(gfn)) => Some((gfn, PageTableLevel::Pml4)),
            _ => None,
        }
    }

    /// Maps the 4KB page at `va` to `gfn`, creating intermediate tables as
    /// needed. Intermediate entries grant every access.
    pub fn map(&self, va: Gva, gfn: Gfn, flags: u64) {
        let Some((mut table, mut level)) = self.start(va.0)
        else {
            panic!("no root for {va}");
        };

        while level != PageTableLevel::Pt {
            let index = self.index_for(level, va.0);
            let raw = self.get_pte(table, index);

            let next = match raw & P {
                0 => {
                    let next = self.alloc_table();
                    self.set_pte(table, index, pte(next, P | W | U));
                    next
                }
                _ => self.frame(raw),
            };

            table = next;
            level = level.next().unwrap();
        }

        self.set_pte(table, self.index_for(level, va.0), pte(gfn, flags));
    }

    /// Returns the table holding the entry at `level` for `va`, and the
    /// index of the entry.
    pub fn table_for(&self, va: Gva, level: PageTableLevel) -> (Gfn, usize) {
        let (mut table, mut current) = self.start(va.0).unwrap();

        while current != level {
            let raw = self.get_pte(table, self.index_for(current, va.0));
            table = self.frame(raw);
            current = current.next().unwrap();
        }

        (table, self.index_for(level, va.0))
    }
}

impl GuestWalker for GuestTables {
    fn root(&self) -> GuestRoot {
        *self.root.lock().unwrap()
    }

    fn translate(&self, addr: Gva, error_code: FaultErrorCode) -> Result<GuestWalk, GuestFault> {
        let fault = |present: bool| {
            let mut code = error_code;
            code.set(FaultErrorCode::PRESENT, present);
            GuestFault::from((addr, code))
        };

        let Some((mut table, mut level)) = self.start(addr.0)
        else {
            return Err(fault(false));
        };

        let mut access = Access::ALL;
        let mut tables = SmallVec::new();

        loop {
            let index = self.index_for(level, addr.0);
            let mut raw = self.get_pte(table, index);

            // The walker dirties a writable leaf it translates a write
            // through.
            let leaf = level == PageTableLevel::Pt || (raw & PS != 0 && level.supports_huge());
            if leaf && raw & P != 0 && raw & D == 0 && error_code.is_write() {
                let allowed = access & entry_access(raw);
                if allowed.contains(error_code.required_access()) {
                    raw |= D;
                    self.set_pte(table, index, raw);
                }
            }

            tables.push(GuestTable {
                level,
                gfn: table,
                index,
                pte: raw,
                access,
            });

            if raw & P == 0 {
                return Err(fault(false));
            }

            access &= entry_access(raw);
            let frame = self.frame(raw);
            let large = raw & PS != 0 && level.supports_huge();

            if level == PageTableLevel::Pt || large {
                if !access.contains(error_code.required_access()) {
                    return Err(fault(true));
                }

                let gfn = match (large, self.mode) {
                    (false, _) => frame,
                    (true, PagingMode::Legacy) => {
                        Gfn((frame.0 & !0x3ff) + ((addr.0 >> PAGE_SHIFT) & 0x3ff))
                    }
                    (true, _) => {
                        let mask = level.pages() - 1;
                        Gfn((frame.0 & !mask) + ((addr.0 >> PAGE_SHIFT) & mask))
                    }
                };

                return Ok(GuestWalk {
                    gfn,
                    level,
                    access,
                    dirty: raw & D != 0,
                    tables,
                });
            }

            table = frame;
            level = level.next().unwrap();
        }
    }

    fn read_pte(&self, table: Gfn, index: usize) -> Option<GuestPte> {
        let raw = self.get_pte(table, index);

        Some(GuestPte {
            raw,
            present: raw & P != 0,
            gfn: self.frame(raw),
            access: entry_access(raw),
            dirty: raw & D != 0,
        })
    }
}
