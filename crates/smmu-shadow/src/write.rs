//! Emulated writes to shadowed guest page tables.

use smmu_arch_amd64::PageTableLevel;
use smmu_core::{Gpa, MmuError, PAGE_SHIFT, PAGE_SIZE};

use crate::{
    MmuHost, ShadowMmu,
    page::{Role, SptePtr},
    stats::MmuStats,
    zap::ZapList,
};

/// Writes to a shadowed directory without an intervening use of it, after
/// which the shadow page is zapped.
const FLOOD_THRESHOLD: u32 = 3;

/// Checks if a write of `bytes` at `offset` does not cover whole guest
/// entries.
///
/// Single-byte writes to the first byte of an entry are tolerated; guests
/// use them to update status bits.
fn write_misaligned(role: &Role, offset: u64, bytes: u64) -> bool {
    let pte_size = if role.has_4_byte_gpte { 4 } else { 8 };

    if offset & (pte_size - 1) == 0 && bytes == 1 {
        return false;
    }

    let misaligned = (offset ^ (offset + bytes - 1)) & !(pte_size - 1);
    misaligned != 0 || bytes < 4
}

/// Returns the first shadow slot and the number of slots affected by a
/// write at `offset` of the guest table, or `None` if the write lies outside
/// the quadrant the page shadows.
fn written_sptes(role: &Role, offset: u64) -> Option<(usize, usize)> {
    let mut offset = offset;
    let mut count = 1;

    if role.has_4_byte_gpte {
        offset <<= 1;

        // A 4-byte directory entry maps 4MB; two shadow entries cover it.
        if role.level == PageTableLevel::Pd {
            offset &= !7;
            offset <<= 1;
            count = 2;
        }

        let quadrant = offset >> PAGE_SHIFT;
        offset &= PAGE_SIZE - 1;

        if quadrant != role.quadrant as u64 {
            return None;
        }
    }

    Some(((offset / 8) as usize, count))
}

impl<Host> ShadowMmu<Host>
where
    Host: MmuHost,
{
    /// Handles an emulated guest write of `bytes` bytes at `gpa`.
    ///
    /// Shadow entries derived from the written guest entries are dropped,
    /// so the next access rebuilds them from the new contents. Shadow pages
    /// hit by misaligned writes, or written repeatedly without being used,
    /// are zapped.
    pub fn track_write(&self, gpa: Gpa, bytes: usize) -> Result<(), MmuError> {
        self.guarded(|| {
            if bytes == 0 {
                return Ok(());
            }

            let mut state = self.lock();
            if state.indirect_pages == 0 {
                return Ok(());
            }

            MmuStats::inc(&self.stats.pte_writes);

            let gfn = gpa.gfn();
            let offset = gpa.offset();
            let bytes = bytes as u64;

            let mut zap = ZapList::default();
            let mut flush = false;

            for id in state.indirect_pages_for(gfn) {
                let page = match state.pages.get_mut(id) {
                    Some(page) if !page.invalid => page,
                    _ => continue,
                };

                let role = page.role;

                let flooded = match role.level != PageTableLevel::Pt || !self.config.unsync {
                    true => {
                        page.write_flooding_count += 1;
                        page.write_flooding_count >= FLOOD_THRESHOLD
                    }
                    false => false,
                };

                if flooded || write_misaligned(&role, offset, bytes) {
                    if flooded {
                        tracing::warn!(page = %id, %gfn, level = %role.level, "guest page table flooded");
                        MmuStats::inc(&self.stats.flooded);
                    }
                    else {
                        tracing::debug!(page = %id, %gpa, bytes, "misaligned page table write");
                    }

                    self.prepare_zap(&mut state, id, &mut zap)?;
                    continue;
                }

                let Some((first, count)) = written_sptes(&role, offset)
                else {
                    continue;
                };

                let mut orphans = Vec::new();
                for index in first..first + count {
                    flush |= self.zap_pte(&mut state, SptePtr::new(id, index), &mut orphans)?;
                }

                tracing::trace!(page = %id, %gpa, first, count, "dropped written entries");

                for orphan in orphans {
                    self.prepare_zap(&mut state, orphan, &mut zap)?;
                }
            }

            if flush && zap.is_empty() {
                self.flush_remote_tlbs();
            }

            self.commit_zap(&mut state, zap)
        })
    }
}
