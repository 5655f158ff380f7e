//! Host mapping change callbacks.
//!
//! The host calls these when a host virtual range backing guest memory is
//! unmapped, remapped or aged. Shadow entries mapping the affected guest
//! frames are found through the reverse map.

use indexmap::IndexSet;
use smmu_core::{Gfn, Hva, MmuError, PAGE_SIZE};

use crate::{
    MmuHost, ShadowMmu,
    rmap::{LEAF_LEVELS, RmapKey},
    state::MmuState,
};

impl<Host> ShadowMmu<Host>
where
    Host: MmuHost,
{
    /// Unmaps every shadow entry backed by the host page at `hva`.
    pub fn invalidate_page(&self, hva: Hva) -> Result<(), MmuError> {
        let start = hva.page();
        self.invalidate_range(start, start + PAGE_SIZE)
    }

    /// Unmaps every shadow entry backed by the host range `start..end`.
    pub fn invalidate_range(&self, start: Hva, end: Hva) -> Result<(), MmuError> {
        self.guarded(|| {
            let mut state = self.lock();
            let mut flush = false;

            for key in self.rmap_keys(start, end) {
                flush |= self.unmap_rmap(&mut state, key)?;
            }

            if flush {
                tracing::debug!(%start, %end, "invalidated host range");
                self.flush_remote_tlbs();
            }

            Ok(())
        })
    }

    /// Clears the accessed state of every shadow entry backed by the host
    /// page at `hva`.
    ///
    /// Returns `true` if any of them was accessed since the last call.
    /// Without hardware accessed bits the entries are unmapped instead, so
    /// the next access faults.
    pub fn age_page(&self, hva: Hva) -> Result<bool, MmuError> {
        self.guarded(|| {
            let mut state = self.lock();
            let start = hva.page();
            let mut young = false;

            for key in self.rmap_keys(start, start + PAGE_SIZE) {
                young |= match self.hardware_ad() {
                    true => self.age_rmap(&state, key)?,
                    false => self.unmap_rmap(&mut state, key)?,
                };
            }

            if young && !self.hardware_ad() {
                self.flush_remote_tlbs();
            }

            tracing::trace!(%hva, young, "aged host page");
            Ok(young)
        })
    }

    /// Checks if any shadow entry backed by the host page at `hva` was
    /// accessed, without clearing anything.
    pub fn test_age_page(&self, hva: Hva) -> Result<bool, MmuError> {
        self.guarded(|| {
            let state = self.lock();
            let start = hva.page();

            for key in self.rmap_keys(start, start + PAGE_SIZE) {
                let mut n = 0;

                while let Some(ptr) = state.rmap.get(key, n, &state.descs)? {
                    n += 1;

                    let spte = self.spte(&state, ptr)?;
                    if !self.hardware_ad() || spte.accessed() {
                        return Ok(true);
                    }
                }
            }

            Ok(false)
        })
    }

    /// Removes write access from every shadow entry mapping `gfn`.
    ///
    /// Returns `true` if any entry lost write access.
    pub fn write_protect_gfn(&self, gfn: Gfn) -> Result<bool, MmuError> {
        self.guarded(|| {
            let mut state = self.lock();

            let flush = self.rmap_write_protect(&mut state, gfn)?;
            if flush {
                tracing::debug!(%gfn, "write-protected");
                self.flush_remote_tlbs();
            }

            Ok(flush)
        })
    }

    /// Returns the reverse-map buckets covering the host range.
    fn rmap_keys(&self, start: Hva, end: Hva) -> IndexSet<RmapKey> {
        let mut keys = IndexSet::new();

        for range in self.host.hva_to_gfns(start, end) {
            for gfn in range.iter() {
                for level in LEAF_LEVELS {
                    keys.insert(RmapKey::new(gfn, level));
                }
            }
        }

        keys
    }

    fn age_rmap(&self, state: &MmuState, key: RmapKey) -> Result<bool, MmuError> {
        let mut young = false;
        let mut n = 0;

        while let Some(ptr) = state.rmap.get(key, n, &state.descs)? {
            n += 1;
            young |= self
                .table_of(state, ptr.page)?
                .test_and_clear_accessed(ptr.index());
        }

        Ok(young)
    }
}
