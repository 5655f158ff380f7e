//! Shadow page limits and reclaim.
//!
//! Each VM keeps its valid shadow pages under [`MmuConfig::max_pages`],
//! zapping the least recently used pages when a fault or root load runs
//! short. Independently, a [`ShrinkRegistry`] shared by all VMs of a process
//! tracks the total page count and lets the host shrink VMs under memory
//! pressure.
//!
//! [`MmuConfig::max_pages`]: crate::MmuConfig::max_pages

use std::{
    collections::VecDeque,
    sync::{
        Arc, Weak,
        atomic::{AtomicUsize, Ordering},
    },
};

use smmu_core::MmuError;

use crate::{MmuHost, ShadowMmu, page::PageId, state::MmuState, stats::MmuStats, zap::ZapList};

/// Below this many free pages a fault reclaims before building.
const MIN_FREE_PAGES: usize = 5;

/// Number of free pages a reclaim aims for.
const REFILL_PAGES: usize = 25;

/// A VM whose shadow pages can be reclaimed under memory pressure.
pub trait Shrinkable: Send + Sync {
    /// Returns the number of valid shadow pages.
    fn used_pages(&self) -> usize;

    /// Zaps up to `nr` of the least recently used shadow pages.
    ///
    /// Returns the number of pages freed.
    fn shrink(&self, nr: usize) -> usize;
}

/// The set of VMs sharing a process, with their total shadow page count.
#[derive(Default)]
pub struct ShrinkRegistry {
    total: AtomicUsize,
    vms: spin::Mutex<VecDeque<Weak<dyn Shrinkable>>>,
}

impl ShrinkRegistry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a VM to the registry.
    ///
    /// The registry holds a weak reference; dropped VMs are forgotten on the
    /// next scan.
    pub fn register(&self, vm: Weak<dyn Shrinkable>) {
        self.vms.lock().push_back(vm);
    }

    /// Returns the number of valid shadow pages of all registered VMs.
    pub fn count(&self) -> usize {
        self.total.load(Ordering::Relaxed)
    }

    /// Returns the number of live registered VMs.
    pub fn len(&self) -> usize {
        self.vms
            .lock()
            .iter()
            .filter(|vm| vm.strong_count() > 0)
            .count()
    }

    /// Checks if no live VM is registered.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Shrinks the first VM holding shadow pages by up to `nr` pages and
    /// moves it to the back of the queue.
    ///
    /// Returns the number of pages freed.
    pub fn scan(&self, nr: usize) -> usize {
        let mut vms = self.vms.lock();
        vms.retain(|vm| vm.strong_count() > 0);

        for _ in 0..vms.len() {
            let Some(weak) = vms.pop_front()
            else {
                break;
            };

            let Some(vm) = weak.upgrade()
            else {
                continue;
            };

            vms.push_back(weak);

            if vm.used_pages() == 0 {
                continue;
            }

            let freed = vm.shrink(nr);
            tracing::debug!(nr, freed, total = self.count(), "shrunk shadow pages");
            return freed;
        }

        0
    }

    pub(crate) fn account(&self, delta: isize) {
        match delta.is_negative() {
            true => self.total.fetch_sub(delta.unsigned_abs(), Ordering::Relaxed),
            false => self.total.fetch_add(delta.unsigned_abs(), Ordering::Relaxed),
        };
    }
}

impl<Host> ShadowMmu<Host>
where
    Host: MmuHost,
{
    /// Changes the shadow page limit, zapping the least recently used pages
    /// down to it.
    ///
    /// Pages in use as roots are not reclaimed; if they alone exceed `n`,
    /// the limit settles at the number of pages left.
    pub fn set_max_pages(&self, n: usize) -> Result<(), MmuError> {
        self.guarded(|| {
            let mut state = self.lock();

            if state.used_pages > n {
                let excess = state.used_pages - n;
                self.zap_oldest(&mut state, excess)?;
            }

            state.max_pages = n.max(state.used_pages);
            tracing::debug!(max_pages = state.max_pages, used = state.used_pages, "set page limit");
            Ok(())
        })
    }

    /// Makes room for the pages a fault or root load may create.
    pub(crate) fn make_pages_available(&self, state: &mut MmuState) -> Result<(), MmuError> {
        let available = state.max_pages.saturating_sub(state.used_pages);
        if available >= MIN_FREE_PAGES {
            return Ok(());
        }

        self.zap_oldest(state, REFILL_PAGES - available)?;

        if state.max_pages.saturating_sub(state.used_pages) == 0 {
            tracing::warn!(used = state.used_pages, max = state.max_pages, "no reclaimable shadow pages");
            return Err(MmuError::NoMemory);
        }

        Ok(())
    }

    /// Zaps the least recently used pages until `nr` pages were freed.
    ///
    /// Returns the number of pages freed.
    pub(crate) fn zap_oldest(&self, state: &mut MmuState, nr: usize) -> Result<usize, MmuError> {
        let before = state.used_pages;
        let mut zap = ZapList::default();

        let candidates = state
            .active
            .iter()
            .rev()
            .map(|(&id, _)| id)
            .collect::<Vec<PageId>>();

        for id in candidates {
            if before - state.used_pages >= nr {
                break;
            }

            match state.pages.get(id) {
                Some(page) if !page.invalid && page.root_count == 0 => {}
                _ => continue,
            }

            self.prepare_zap(state, id, &mut zap)?;
        }

        self.commit_zap(state, zap)?;

        let freed = before.saturating_sub(state.used_pages);
        MmuStats::add(&self.stats.pages_reclaimed, freed as u64);
        tracing::debug!(nr, freed, "reclaimed shadow pages");
        Ok(freed)
    }

    /// Registers the VM with a process-wide shrink registry.
    ///
    /// A VM joins at most one registry.
    pub fn register_shrinker(self: &Arc<Self>, registry: &Arc<ShrinkRegistry>) -> Result<(), MmuError>
    where
        Host: Send + Sync + 'static,
    {
        {
            // Page accounting reads the registry under the structural lock.
            let state = self.lock();

            self.registry
                .set(registry.clone())
                .map_err(|_| MmuError::Other("already registered with a shrink registry"))?;

            registry.account(state.used_pages as isize);
        }

        let vm: Weak<dyn Shrinkable> = Arc::downgrade(self) as Weak<dyn Shrinkable>;
        registry.register(vm);
        Ok(())
    }
}

impl<Host> Shrinkable for ShadowMmu<Host>
where
    Host: MmuHost + Send + Sync,
{
    fn used_pages(&self) -> usize {
        ShadowMmu::used_pages(self)
    }

    fn shrink(&self, nr: usize) -> usize {
        let result = self.guarded(|| {
            let mut state = self.lock();
            self.zap_oldest(&mut state, nr)
        });

        result.unwrap_or_else(|err| {
            tracing::warn!(%err, "shrink failed");
            0
        })
    }
}
