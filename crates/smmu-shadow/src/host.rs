//! Capabilities the MMU consumes from its host.
//!
//! The engine never touches guest memory, host frames or other vCPUs
//! directly. Everything it needs from the surrounding hypervisor is expressed
//! by the traits in this module and bundled by [`MmuHost`].

use smallvec::SmallVec;
use smmu_arch_amd64::{MemoryType, PageTableLevel};
use smmu_core::{Access, FaultErrorCode, Gfn, GuestFault, Gva, Hva, MmuError, Pfn, VcpuId};

/// How [`HostFrames::resolve`] may wait for the backing frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResolveMode {
    /// Only frames that are resident right now are returned.
    NoWait,

    /// The call may block until the frame is resident.
    Wait,
}

/// A host frame backing a guest frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResolvedFrame {
    /// The host frame.
    pub pfn: Pfn,

    /// The host allows the guest to write to the frame.
    pub writable: bool,

    /// The frame is not resident and resolving it would block.
    ///
    /// Only reported in [`ResolveMode::NoWait`].
    pub needs_async: bool,
}

/// Resolves guest frames to host frames and tracks host frame metadata.
pub trait HostFrames {
    /// Resolves `gfn` to the host frame backing it.
    fn resolve(&self, gfn: Gfn, write: bool, mode: ResolveMode)
    -> Result<ResolvedFrame, MmuError>;

    /// Returns the largest level at which the host backs `gfn` with
    /// contiguous frames.
    fn host_mapping_level(&self, gfn: Gfn) -> PageTableLevel;

    /// Records that the guest accessed the host frame.
    fn mark_accessed(&self, pfn: Pfn);

    /// Records that the guest wrote to the host frame.
    fn mark_dirty(&self, pfn: Pfn);
}

/// Hypervisor services used by the MMU.
pub trait HostOps {
    /// Invalidates cached translations on every vCPU of the VM.
    fn flush_remote_tlbs(&self);

    /// Asks `vcpu` to reload its roots before its next guest entry.
    fn request_reload(&self, vcpu: VcpuId);

    /// Returns the memory type of `gfn` under two-dimensional addressing.
    fn memory_type_for(&self, gfn: Gfn) -> MemoryType {
        let _ = gfn;
        MemoryType::WriteBack
    }

    /// Checks if the hardware maintains accessed and dirty bits in shadow
    /// entries.
    fn has_accessed_bit(&self) -> bool {
        true
    }
}

/// A range of guest frames, end exclusive.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GfnRange {
    /// The first frame.
    pub start: Gfn,

    /// The frame past the last one.
    pub end: Gfn,
}

impl GfnRange {
    /// Iterates over the frames of the range.
    pub fn iter(self) -> impl Iterator<Item = Gfn> {
        (self.start.0..self.end.0).map(Gfn)
    }
}

/// Guest memory layout as registered with the hypervisor.
pub trait MemorySlots {
    /// Returns the number of reasons `gfn` must not be mapped by a writable
    /// entry at `level` (external write tracking, dirty logging, slot
    /// boundaries).
    ///
    /// At [`PageTableLevel::Pt`] a non-zero count write-protects the frame
    /// itself; at a huge level it disallows huge mappings covering it.
    fn write_protect_count(&self, gfn: Gfn, level: PageTableLevel) -> u32;

    /// Records a guest write to `gfn` for dirty logging.
    fn mark_page_dirty(&self, gfn: Gfn);

    /// Checks if `gfn` is not backed by a memory slot.
    fn is_mmio(&self, gfn: Gfn) -> bool;

    /// Returns the memory slot generation.
    ///
    /// Every change to the slot layout advances the generation and thereby
    /// invalidates cached MMIO entries.
    fn generation(&self) -> u64;

    /// Returns the guest frames backed by the host virtual range
    /// `start..end`.
    fn hva_to_gfns(&self, start: Hva, end: Hva) -> SmallVec<[GfnRange; 2]>;
}

/// Host mapping change notifications.
pub trait ChangeNotifier {
    /// Returns a counter advanced by every host mapping change.
    ///
    /// A fault sampling the counter before resolving a frame and finding it
    /// changed under the structural lock must not install its result.
    fn current_sequence(&self) -> u64;
}

/// Everything the MMU needs from its host.
pub trait MmuHost: HostFrames + HostOps + MemorySlots + ChangeNotifier {}

impl<T> MmuHost for T where T: HostFrames + HostOps + MemorySlots + ChangeNotifier {}

/// The guest page-table root a vCPU translates through.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GuestRoot {
    /// A single root table.
    Table(Gfn),

    /// The four page-directory pointers of a PAE guest.
    Pae([Option<Gfn>; 4]),
}

/// One guest page table visited by a guest walk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GuestTable {
    /// The level of the table.
    pub level: PageTableLevel,

    /// The frame holding the table.
    pub gfn: Gfn,

    /// The index of the entry used by the walk.
    pub index: usize,

    /// The raw entry used by the walk.
    pub pte: u64,

    /// Access rights accumulated by the entries above this table.
    pub access: Access,
}

/// A successful guest walk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GuestWalk {
    /// The guest frame containing the translated address.
    pub gfn: Gfn,

    /// The level of the guest leaf entry.
    pub level: PageTableLevel,

    /// Effective access rights of the translation.
    pub access: Access,

    /// The guest leaf entry is dirty. A walk for a write sets the bit.
    pub dirty: bool,

    /// The guest tables visited, root first.
    pub tables: SmallVec<[GuestTable; 5]>,
}

impl GuestWalk {
    /// Returns the visited table at `level`.
    pub fn table(&self, level: PageTableLevel) -> Option<&GuestTable> {
        self.tables.iter().find(|table| table.level == level)
    }
}

/// A guest page-table entry read by the guest walker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GuestPte {
    /// The raw entry.
    pub raw: u64,

    /// The entry is present and free of reserved bits.
    pub present: bool,

    /// The frame the entry maps.
    pub gfn: Gfn,

    /// Access rights granted by the entry.
    pub access: Access,

    /// The entry's dirty bit is set.
    pub dirty: bool,
}

/// Walks the guest's own page tables.
///
/// Only needed while shadowing; under two-dimensional addressing the guest
/// address is already a guest physical address.
pub trait GuestWalker {
    /// Returns the current guest root.
    fn root(&self) -> GuestRoot;

    /// Translates `addr` for an access described by `error_code`.
    ///
    /// Returns the fault to inject into the guest when the translation fails
    /// or denies the access.
    fn translate(&self, addr: Gva, error_code: FaultErrorCode) -> Result<GuestWalk, GuestFault>;

    /// Reads entry `index` of the guest page table held in `table`.
    ///
    /// Tables with 4-byte entries are indexed in 4-byte units.
    fn read_pte(&self, table: Gfn, index: usize) -> Option<GuestPte>;
}

/// A walker for vCPUs that do not shadow guest page tables.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoGuestWalker;

impl GuestWalker for NoGuestWalker {
    fn root(&self) -> GuestRoot {
        GuestRoot::Table(Gfn(0))
    }

    fn translate(&self, addr: Gva, error_code: FaultErrorCode) -> Result<GuestWalk, GuestFault> {
        Err(GuestFault::from((addr, error_code)))
    }

    fn read_pte(&self, _table: Gfn, _index: usize) -> Option<GuestPte> {
        None
    }
}
