use smallvec::SmallVec;
use smmu_arch_amd64::{ENTRIES_PER_TABLE, LEVEL_BITS, PageTableLevel};
use smmu_core::{Access, Gfn, VcpuId};

use crate::{arena::TableId, pte_list::PteList, slab::Key};

/// Handle of a shadow page.
pub type PageId = Key<ShadowPage>;

/// Reference to one slot of a shadow page.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SptePtr {
    /// The page holding the slot.
    pub page: PageId,

    /// The slot index.
    pub index: u16,
}

impl SptePtr {
    pub fn new(page: PageId, index: usize) -> Self {
        Self {
            page,
            index: index as u16,
        }
    }

    pub fn index(self) -> usize {
        self.index as usize
    }
}

/// Everything that makes two shadow pages of the same guest frame
/// interchangeable.
///
/// Pages are shared only between faults whose roles compare equal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Role {
    /// The level of the page.
    pub level: PageTableLevel,

    /// The page maps a contiguous frame range instead of shadowing a guest
    /// table.
    pub direct: bool,

    /// Which part of a guest table with 4-byte entries the page shadows.
    pub quadrant: u8,

    /// Access rights accumulated above the page.
    pub access: Access,

    /// Guest entries are 4 bytes wide.
    pub has_4_byte_gpte: bool,

    /// Supervisor writes honor the write-protect bit.
    pub cr0_wp: bool,

    /// Execute-disable is enabled.
    pub nxe: bool,
}

impl Default for Role {
    fn default() -> Self {
        Self {
            level: PageTableLevel::Pt,
            direct: true,
            quadrant: 0,
            access: Access::ALL,
            has_4_byte_gpte: false,
            cr0_wp: false,
            nxe: false,
        }
    }
}

impl Role {
    /// Checks if the paging-mode bits of two roles agree.
    pub fn same_base(&self, other: &Role) -> bool {
        self.has_4_byte_gpte == other.has_4_byte_gpte
            && self.cr0_wp == other.cr0_wp
            && self.nxe == other.nxe
    }

    /// Computes the quadrant of a page shadowing part of a guest table with
    /// 4-byte entries.
    ///
    /// A page at level `n` covers `1 / 2^n` of the guest table; `addr`
    /// selects the part.
    pub fn quadrant_for(level: PageTableLevel, addr: u64) -> u8 {
        let level = level.as_u8() as u64;
        let shift = smmu_core::PAGE_SHIFT + LEVEL_BITS * level;
        ((addr >> shift) & ((1 << level) - 1)) as u8
    }
}

/// A shadow page: one shadow table plus the bookkeeping that ties it to the
/// guest frame it shadows.
#[derive(Debug)]
pub struct ShadowPage {
    pub role: Role,
    pub gfn: Gfn,
    pub table: TableId,

    /// Guest frame mapped by each leaf slot of an indirect page.
    pub gfns: Box<[Gfn; ENTRIES_PER_TABLE]>,

    /// Non-leaf entries linking to this page.
    pub parent_ptes: PteList,

    pub unsync: bool,
    pub unsync_children: u32,
    pub unsync_child_bitmap: [u64; ENTRIES_PER_TABLE / 64],

    /// Number of vCPUs using the page as a root.
    pub root_count: u32,
    pub root_vcpus: SmallVec<[VcpuId; 2]>,

    pub write_flooding_count: u32,

    /// The page was zapped and only waits for its last root user.
    pub invalid: bool,
}

impl Default for ShadowPage {
    fn default() -> Self {
        Self {
            role: Role::default(),
            gfn: Gfn(0),
            table: TableId::from_pfn(smmu_core::Pfn(u32::MAX as u64)),
            gfns: Box::new([Gfn(0); ENTRIES_PER_TABLE]),
            parent_ptes: PteList::Empty,
            unsync: false,
            unsync_children: 0,
            unsync_child_bitmap: [0; ENTRIES_PER_TABLE / 64],
            root_count: 0,
            root_vcpus: SmallVec::new(),
            write_flooding_count: 0,
            invalid: false,
        }
    }
}

impl ShadowPage {
    /// Reinitializes a pooled page.
    pub fn reset(&mut self, role: Role, gfn: Gfn, table: TableId) {
        self.role = role;
        self.gfn = gfn;
        self.table = table;
        self.parent_ptes = PteList::Empty;
        self.unsync = false;
        self.unsync_children = 0;
        self.unsync_child_bitmap = [0; ENTRIES_PER_TABLE / 64];
        self.root_count = 0;
        self.root_vcpus.clear();
        self.write_flooding_count = 0;
        self.invalid = false;
    }

    pub fn level(&self) -> PageTableLevel {
        self.role.level
    }

    /// Returns the guest frame mapped by slot `index`.
    pub fn gfn_at(&self, index: usize) -> Gfn {
        if self.role.direct {
            return self.gfn + ((index as u64) << ((self.level().as_u8() as u64 - 1) * LEVEL_BITS));
        }

        self.gfns[index]
    }

    /// Returns the index, in the guest table, of the entry shadowed by slot
    /// `index`.
    pub fn guest_index(&self, index: usize) -> usize {
        if self.role.has_4_byte_gpte {
            return index + ((self.role.quadrant as usize) << LEVEL_BITS);
        }

        index
    }

    /// Marks slot `index` as linking to a page with unsync descendants.
    ///
    /// Returns `true` if the bit was newly set.
    pub fn set_unsync_child(&mut self, index: usize) -> bool {
        let (word, bit) = (index / 64, 1u64 << (index % 64));
        if self.unsync_child_bitmap[word] & bit != 0 {
            return false;
        }

        self.unsync_child_bitmap[word] |= bit;
        self.unsync_children += 1;
        true
    }

    /// Clears the unsync bit of slot `index`.
    ///
    /// Returns `true` if the bit was set.
    pub fn clear_unsync_child(&mut self, index: usize) -> bool {
        let (word, bit) = (index / 64, 1u64 << (index % 64));
        if self.unsync_child_bitmap[word] & bit == 0 {
            return false;
        }

        self.unsync_child_bitmap[word] &= !bit;
        self.unsync_children -= 1;
        true
    }

    /// Returns the first slot at or after `from` marked as linking to unsync
    /// descendants.
    pub fn next_unsync_child(&self, from: usize) -> Option<usize> {
        let mut index = from;

        while index < ENTRIES_PER_TABLE {
            let word = self.unsync_child_bitmap[index / 64] >> (index % 64);
            if word != 0 {
                return Some(index + word.trailing_zeros() as usize);
            }

            index = (index / 64 + 1) * 64;
        }

        None
    }
}
