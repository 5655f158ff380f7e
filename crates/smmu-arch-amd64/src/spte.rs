use smmu_core::{Access, Gfn, PAGE_SHIFT, Pfn};
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout};

use crate::PageTableLevel;

/// Memory type programmed into a leaf entry under two-dimensional addressing.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum MemoryType {
    /// Write-back (the default for guest RAM).
    #[default]
    WriteBack = 0,

    /// Write-through.
    WriteThrough = 1,

    /// Uncacheable.
    Uncacheable = 2,

    /// Write-combining.
    WriteCombining = 3,
}

impl MemoryType {
    fn from_bits(bits: u64) -> Self {
        match bits & 0b11 {
            0 => Self::WriteBack,
            1 => Self::WriteThrough,
            2 => Self::Uncacheable,
            _ => Self::WriteCombining,
        }
    }
}

/// A shadow page table entry.
///
/// Bit layout:
///
/// | Bits   | Meaning                                                  |
/// |--------|----------------------------------------------------------|
/// | 0      | present                                                  |
/// | 1      | writable                                                 |
/// | 2      | user                                                     |
/// | 3-4    | memory type                                              |
/// | 5      | accessed                                                 |
/// | 6      | dirty                                                    |
/// | 7      | large page                                               |
/// | 9      | host writable (software)                                 |
/// | 10     | MMU writable (software)                                  |
/// | 11     | shadow present (software)                                |
/// | 12-50  | frame number                                             |
/// | 51     | reserved, set in MMIO entries to force a reserved fault  |
/// | 52-61  | MMIO generation                                          |
/// | 63     | execute disable                                          |
///
/// An MMIO entry reuses bits 1-3 for the recorded access rights.
#[repr(transparent)]
#[derive(
    Default, Clone, Copy, PartialEq, Eq, Hash, FromBytes, IntoBytes, Immutable, KnownLayout,
)]
pub struct Spte(pub u64);

impl Spte {
    /// The not-present value.
    pub const EMPTY: Self = Self(0);

    /// Present bit.
    pub const PRESENT: u64 = 1 << 0;
    /// Writable bit.
    pub const WRITABLE: u64 = 1 << 1;
    /// User bit.
    pub const USER: u64 = 1 << 2;
    /// Accessed bit.
    pub const ACCESSED: u64 = 1 << 5;
    /// Dirty bit.
    pub const DIRTY: u64 = 1 << 6;
    /// Large page bit.
    pub const LARGE: u64 = 1 << 7;
    /// The host allows writes to the backing frame.
    pub const HOST_WRITABLE: u64 = 1 << 9;
    /// The MMU allows the entry to become writable without a fault.
    pub const MMU_WRITABLE: u64 = 1 << 10;
    /// The entry is a valid shadow translation.
    pub const SHADOW_PRESENT: u64 = 1 << 11;
    /// Execute disable bit.
    pub const NX: u64 = 1 << 63;

    const MEMTYPE_SHIFT: u64 = 3;
    const MEMTYPE_MASK: u64 = 0b11 << Self::MEMTYPE_SHIFT;
    const FRAME_MASK: u64 = ((1 << 51) - 1) & !((1 << PAGE_SHIFT) - 1);

    const MMIO_RESERVED: u64 = 1 << 51;
    const MMIO_MASK: u64 = Self::MMIO_RESERVED | Self::PRESENT;
    const MMIO_ACCESS_SHIFT: u64 = 1;
    const MMIO_ACCESS_MASK: u64 = 0b111 << Self::MMIO_ACCESS_SHIFT;
    const MMIO_GEN_SHIFT: u64 = 52;
    const MMIO_GEN_BITS: u64 = 10;

    /// Mask of generation bits an MMIO entry can hold.
    pub const MMIO_GEN_MASK: u64 = (1 << Self::MMIO_GEN_BITS) - 1;

    /// Creates a leaf entry mapping `pfn`.
    ///
    /// The entry is present but grants neither write nor user access.
    pub const fn leaf(pfn: Pfn) -> Self {
        Self(Self::SHADOW_PRESENT | Self::PRESENT | ((pfn.0 << PAGE_SHIFT) & Self::FRAME_MASK))
    }

    /// Creates a non-leaf entry pointing to the child table `frame`.
    ///
    /// Non-leaf entries grant full access; permissions are enforced at the
    /// leaf.
    pub const fn link(frame: u64) -> Self {
        Self(
            Self::SHADOW_PRESENT
                | Self::PRESENT
                | Self::WRITABLE
                | Self::USER
                | Self::ACCESSED
                | ((frame << PAGE_SHIFT) & Self::FRAME_MASK),
        )
    }

    /// Creates an MMIO entry recording the frame, the access rights and the
    /// memory slot generation.
    pub const fn mmio(gfn: Gfn, access: Access, generation: u64) -> Self {
        Self(
            Self::MMIO_MASK
                | ((gfn.0 << PAGE_SHIFT) & Self::FRAME_MASK)
                | (((access.bits() as u64) << Self::MMIO_ACCESS_SHIFT) & Self::MMIO_ACCESS_MASK)
                | ((generation & Self::MMIO_GEN_MASK) << Self::MMIO_GEN_SHIFT),
        )
    }

    /// Checks if the entry is a valid shadow translation.
    pub const fn is_shadow_present(self) -> bool {
        self.0 & Self::SHADOW_PRESENT != 0
    }

    /// Checks if the entry is an MMIO marker.
    pub const fn is_mmio(self) -> bool {
        !self.is_shadow_present() && self.0 & Self::MMIO_MASK == Self::MMIO_MASK
    }

    /// Checks if the entry is absent (neither present nor MMIO).
    pub const fn is_absent(self) -> bool {
        !self.is_shadow_present() && !self.is_mmio()
    }

    /// Checks if the entry maps a large page.
    pub const fn large(self) -> bool {
        self.0 & Self::LARGE != 0
    }

    /// Checks if the entry is the last one of a translation at `level`.
    pub fn is_leaf(self, level: PageTableLevel) -> bool {
        level == PageTableLevel::Pt || self.large()
    }

    /// Checks if the page is writable.
    pub const fn writable(self) -> bool {
        self.0 & Self::WRITABLE != 0
    }

    /// Checks if the page is accessible in user mode.
    pub const fn user(self) -> bool {
        self.0 & Self::USER != 0
    }

    /// Checks if instruction fetches are disallowed.
    pub const fn nx(self) -> bool {
        self.0 & Self::NX != 0
    }

    /// Checks if the page has been accessed.
    pub const fn accessed(self) -> bool {
        self.0 & Self::ACCESSED != 0
    }

    /// Checks if the page has been written to.
    pub const fn dirty(self) -> bool {
        self.0 & Self::DIRTY != 0
    }

    /// Checks if the host allows writes to the backing frame.
    pub const fn host_writable(self) -> bool {
        self.0 & Self::HOST_WRITABLE != 0
    }

    /// Checks if the MMU allows the entry to be made writable.
    pub const fn mmu_writable(self) -> bool {
        self.0 & Self::MMU_WRITABLE != 0
    }

    /// Extracts the host frame number (or child table frame for non-leaf
    /// entries).
    pub const fn pfn(self) -> Pfn {
        Pfn((self.0 & Self::FRAME_MASK) >> PAGE_SHIFT)
    }

    /// Returns the memory type of a leaf entry.
    pub fn memory_type(self) -> MemoryType {
        MemoryType::from_bits((self.0 & Self::MEMTYPE_MASK) >> Self::MEMTYPE_SHIFT)
    }

    /// Returns the access rights granted by a present entry.
    pub fn access(self) -> Access {
        let mut access = Access::empty();

        if self.writable() {
            access |= Access::WRITE;
        }
        if self.user() {
            access |= Access::USER;
        }
        if !self.nx() {
            access |= Access::EXEC;
        }

        access
    }

    /// Returns the frame recorded in an MMIO entry.
    pub const fn mmio_gfn(self) -> Gfn {
        Gfn((self.0 & Self::FRAME_MASK) >> PAGE_SHIFT)
    }

    /// Returns the access rights recorded in an MMIO entry.
    pub fn mmio_access(self) -> Access {
        Access::from_bits_truncate(
            ((self.0 & Self::MMIO_ACCESS_MASK) >> Self::MMIO_ACCESS_SHIFT) as u8,
        )
    }

    /// Returns the generation recorded in an MMIO entry.
    pub const fn mmio_generation(self) -> u64 {
        (self.0 >> Self::MMIO_GEN_SHIFT) & Self::MMIO_GEN_MASK
    }

    /// Returns the entry with the bits in `mask` set.
    pub const fn with(self, mask: u64) -> Self {
        Self(self.0 | mask)
    }

    /// Returns the entry with the bits in `mask` cleared.
    pub const fn without(self, mask: u64) -> Self {
        Self(self.0 & !mask)
    }

    /// Returns the entry with the memory type replaced.
    pub const fn with_memory_type(self, memory_type: MemoryType) -> Self {
        Self((self.0 & !Self::MEMTYPE_MASK) | ((memory_type as u64) << Self::MEMTYPE_SHIFT))
    }

    /// Checks if the entry carries bits the hardware (or a lockless path) may
    /// change behind the back of the structural lock.
    ///
    /// `hardware_ad` tells whether the hardware maintains the accessed and
    /// dirty bits of shadow entries.
    pub const fn has_volatile_bits(self, hardware_ad: bool) -> bool {
        if !self.is_shadow_present() {
            return false;
        }

        if self.host_writable() && self.mmu_writable() && !self.writable() {
            return true;
        }

        if !hardware_ad {
            return false;
        }

        !self.accessed() || (self.writable() && !self.dirty())
    }
}

impl std::fmt::Debug for Spte {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        if self.is_mmio() {
            return f
                .debug_struct("Spte::Mmio")
                .field("gfn", &self.mmio_gfn())
                .field("access", &self.mmio_access())
                .field("generation", &self.mmio_generation())
                .finish();
        }

        f.debug_struct("Spte")
            .field("present", &self.is_shadow_present())
            .field("write", &self.writable())
            .field("user", &self.user())
            .field("nx", &self.nx())
            .field("accessed", &self.accessed())
            .field("dirty", &self.dirty())
            .field("large", &self.large())
            .field("host_writable", &self.host_writable())
            .field("mmu_writable", &self.mmu_writable())
            .field("pfn", &self.pfn())
            .finish()
    }
}
