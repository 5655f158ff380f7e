use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};

macro_rules! mmu_stats {
    ($($(#[$meta:meta])* $name:ident),* $(,)?) => {
        /// Event counters of a [`ShadowMmu`](crate::ShadowMmu).
        #[derive(Debug, Default)]
        pub struct MmuStats {
            $(
                $(#[$meta])*
                pub $name: AtomicU64,
            )*
        }

        /// A point-in-time copy of [`MmuStats`].
        #[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
        pub struct MmuStatsSnapshot {
            $(
                $(#[$meta])*
                pub $name: u64,
            )*
        }

        impl MmuStats {
            /// Copies the current counter values.
            pub fn snapshot(&self) -> MmuStatsSnapshot {
                MmuStatsSnapshot {
                    $($name: self.$name.load(Ordering::Relaxed),)*
                }
            }
        }
    };
}

mmu_stats! {
    /// Faults fixed by installing a translation.
    pf_fixed,
    /// Faults that require emulating the faulting instruction.
    pf_emulate,
    /// Faults on MMIO frames.
    pf_mmio,
    /// Faults reflected into the guest.
    pf_guest,
    /// Faults retried after a host mapping change.
    pf_retry,
    /// Faults deferred to asynchronous frame resolution.
    pf_async,
    /// Shadow pages created.
    pages_created,
    /// Shadow pages zapped.
    pages_zapped,
    /// Unsync pages brought back in sync.
    pages_synced,
    /// Pages marked unsync.
    unsync_pages,
    /// Shadow pages zapped because of write flooding or misaligned writes.
    flooded,
    /// Tracked guest page-table writes.
    pte_writes,
    /// Reverse-map buckets recycled.
    rmap_recycled,
    /// Entries installed by neighbour prefetch.
    prefetched,
    /// Remote TLB flushes requested.
    tlb_flushes,
    /// Pages zapped to honor the page limit.
    pages_reclaimed,
}

impl MmuStats {
    pub(crate) fn inc(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn add(counter: &AtomicU64, value: u64) {
        counter.fetch_add(value, Ordering::Relaxed);
    }
}
