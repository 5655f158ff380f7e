use serde::{Deserialize, Serialize};
use smmu_core::{Gfn, PAGE_SHIFT};

/// Number of entries in one page-table page.
pub const ENTRIES_PER_TABLE: usize = 512;

/// Number of address bits translated per paging level.
pub const LEVEL_BITS: u64 = 9;

/// Supported guest paging modes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PagingMode {
    /// 32-bit paging (4KB pages, 4-byte entries).
    Legacy,

    /// Physical Address Extension (3 levels, 4 page-directory pointers).
    PAE,

    /// 64-bit paging (4-level paging).
    Ia32e,

    /// 64-bit paging with 5-level paging (allows for 57-bit linear addresses).
    Ia32eLA57,
}

impl PagingMode {
    /// Returns the address width (i.e. pointer size) of the paging mode in
    /// bytes.
    pub fn address_width(self) -> usize {
        match self {
            Self::Legacy => 4,
            Self::PAE => 4,
            Self::Ia32e => 8,
            Self::Ia32eLA57 => 8,
        }
    }

    /// Checks if guest page-table entries are 4 bytes wide.
    ///
    /// A shadow table holds 512 8-byte entries, so it covers only part of a
    /// guest table with 1024 4-byte entries. The part is selected by the
    /// quadrant of the shadow page role.
    pub fn has_4_byte_gpte(self) -> bool {
        matches!(self, Self::Legacy)
    }

    /// Returns the level of the shadow root used to shadow this mode.
    ///
    /// 32-bit and PAE guests are shadowed with four PAE roots at the page
    /// directory level.
    pub fn shadow_root_level(self) -> PageTableLevel {
        match self {
            Self::Legacy | Self::PAE => PageTableLevel::Pd,
            Self::Ia32e => PageTableLevel::Pml4,
            Self::Ia32eLA57 => PageTableLevel::Pml5,
        }
    }
}

/// The levels in the page table hierarchy.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[repr(u8)]
pub enum PageTableLevel {
    /// Page Table (PT) - the lowest level, pointing directly to 4KB pages.
    Pt = 1,

    /// Page Directory (PD) - can point to PTs or 2MB large pages.
    Pd = 2,

    /// Page Directory Pointer Table (PDPT) - can point to PDs or 1GB large
    /// pages.
    Pdpt = 3,

    /// Page Map Level 4 (PML4) - the highest level in 4-level paging.
    Pml4 = 4,

    /// Page Map Level 5 (PML5) - the highest level in 5-level paging.
    Pml5 = 5,
}

impl PageTableLevel {
    /// The deepest level a shadow hierarchy can have.
    pub const MAX_DEPTH: usize = 5;

    /// Levels that may hold a huge-page leaf, smallest first.
    pub const HUGE: [Self; 2] = [Self::Pd, Self::Pdpt];

    /// Converts a numeric level (1 for PT) to a level.
    pub fn from_u8(level: u8) -> Option<Self> {
        match level {
            1 => Some(Self::Pt),
            2 => Some(Self::Pd),
            3 => Some(Self::Pdpt),
            4 => Some(Self::Pml4),
            5 => Some(Self::Pml5),
            _ => None,
        }
    }

    /// Returns the numeric level (1 for PT).
    pub fn as_u8(self) -> u8 {
        self as u8
    }

    /// Returns the next lower level in the page table hierarchy.
    pub fn next(self) -> Option<Self> {
        Self::from_u8(self.as_u8() - 1)
    }

    /// Returns the next higher level in the page table hierarchy.
    pub fn previous(self) -> Option<Self> {
        Self::from_u8(self.as_u8() + 1)
    }

    /// Returns the shift of the address bits indexing this level.
    pub fn shift(self) -> u64 {
        PAGE_SHIFT + (self.as_u8() as u64 - 1) * LEVEL_BITS
    }

    /// Returns the number of base pages mapped by one entry at this level.
    pub fn pages(self) -> u64 {
        1 << ((self.as_u8() as u64 - 1) * LEVEL_BITS)
    }

    /// Returns the index of `addr` in a table at this level.
    pub fn index_for(self, addr: u64) -> usize {
        ((addr >> self.shift()) & (ENTRIES_PER_TABLE as u64 - 1)) as usize
    }

    /// Rounds a frame number down to the first frame mapped by the entry at
    /// this level.
    pub fn round_gfn(self, gfn: Gfn) -> Gfn {
        gfn.align_down(self.pages())
    }

    /// Checks if an entry at this level may map a huge page.
    pub fn supports_huge(self) -> bool {
        Self::HUGE.contains(&self)
    }
}

impl std::fmt::Display for PageTableLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        let name = match self {
            Self::Pt => "PT",
            Self::Pd => "PD",
            Self::Pdpt => "PDPT",
            Self::Pml4 => "PML4",
            Self::Pml5 => "PML5",
        };

        f.write_str(name)
    }
}
