use smallvec::SmallVec;
use smmu_arch_amd64::{PageTableLevel, Spte};
use smmu_core::{Gva, MmuError};

use crate::{
    MmuHost, ShadowMmu,
    arena::TableId,
    page::{PageId, SptePtr},
    state::MmuState,
    vcpu::{Root, Vcpu},
};

/// A cursor descending a shadow hierarchy for one address.
#[derive(Debug, Clone, Copy)]
pub(crate) struct ShadowWalk {
    addr: u64,
    page: PageId,
    table: TableId,
    level: PageTableLevel,
}

impl ShadowWalk {
    /// Starts a walk at the root covering `addr`.
    ///
    /// Returns `None` if the PAE root covering `addr` is missing.
    pub fn new(root: &Root, level: PageTableLevel, addr: u64) -> Option<Self> {
        let (page, table, level) = match root {
            Root::Single(page, table) => (*page, *table, level),
            Root::Pae(roots) => {
                let (page, table) = roots[((addr >> 30) & 3) as usize]?;
                (page, table, PageTableLevel::Pd)
            }
        };

        Some(Self {
            addr,
            page,
            table,
            level,
        })
    }

    pub fn level(&self) -> PageTableLevel {
        self.level
    }

    pub fn table(&self) -> TableId {
        self.table
    }

    pub fn index(&self) -> usize {
        self.level.index_for(self.addr)
    }

    pub fn ptr(&self) -> SptePtr {
        SptePtr::new(self.page, self.index())
    }

    /// Follows the link in `spte` to the next level.
    ///
    /// Returns `false` at a leaf, at a not-present entry, or below the last
    /// level.
    pub fn descend(&mut self, spte: Spte) -> bool {
        if !spte.is_shadow_present() || spte.is_leaf(self.level) {
            return false;
        }

        let Some(next) = self.level.next()
        else {
            return false;
        };

        self.table = TableId::from_pfn(spte.pfn());
        self.level = next;
        true
    }

    /// Follows the link in `spte`, resolving the owning page.
    pub fn step(&mut self, state: &MmuState, spte: Spte) -> Result<bool, MmuError> {
        if !self.descend(spte) {
            return Ok(false);
        }

        self.page = state.child_of(spte)?;
        Ok(true)
    }
}

/// One level of a [`ShadowTranslation`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ShadowTranslationEntry {
    /// The level of the entry.
    pub level: PageTableLevel,

    /// The index of the entry in its table.
    pub index: usize,

    /// The entry.
    pub spte: Spte,
}

/// The shadow entries visited translating one address.
#[derive(Debug, Default, Clone)]
pub struct ShadowTranslation {
    entries: SmallVec<[ShadowTranslationEntry; PageTableLevel::MAX_DEPTH]>,
}

impl ShadowTranslation {
    /// Returns the visited entries, root first.
    pub fn entries(&self) -> &[ShadowTranslationEntry] {
        &self.entries
    }

    /// Returns the last entry of the walk.
    pub fn terminal(&self) -> Option<&ShadowTranslationEntry> {
        self.entries.last()
    }

    /// Checks if the walk ended at a present leaf.
    pub fn is_present(&self) -> bool {
        self.terminal()
            .is_some_and(|entry| entry.spte.is_shadow_present() && entry.spte.is_leaf(entry.level))
    }

    /// Checks if the walk ended at an MMIO entry.
    pub fn is_mmio(&self) -> bool {
        self.terminal().is_some_and(|entry| entry.spte.is_mmio())
    }
}

impl IntoIterator for ShadowTranslation {
    type Item = ShadowTranslationEntry;
    type IntoIter = smallvec::IntoIter<[ShadowTranslationEntry; PageTableLevel::MAX_DEPTH]>;

    fn into_iter(self) -> Self::IntoIter {
        self.entries.into_iter()
    }
}

impl<Host> ShadowMmu<Host>
where
    Host: MmuHost,
{
    /// Walks the shadow hierarchy of `vcpu` for `addr` without the
    /// structural lock.
    ///
    /// Tables visited by the walk are not reused until the walk finishes,
    /// so the result reflects entries that were present at some point
    /// during the walk.
    pub fn walk_shadow_lockless(&self, vcpu: &Vcpu, addr: Gva) -> ShadowTranslation {
        let mut result = ShadowTranslation::default();

        let Some(root) = &vcpu.root
        else {
            return result;
        };

        let _guard = self.epoch.enter();

        let level = vcpu.ctx.root_level(&self.config);
        let Some(mut walk) = ShadowWalk::new(root, level, addr.0)
        else {
            return result;
        };

        loop {
            let index = walk.index();
            let spte = self.tables.table(walk.table()).get_lockless(index);

            result.entries.push(ShadowTranslationEntry {
                level: walk.level(),
                index,
                spte,
            });

            if !walk.descend(spte) {
                break;
            }
        }

        result
    }
}
