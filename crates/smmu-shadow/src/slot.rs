//! Atomic storage for shadow page table entries.
//!
//! Every slot of a shadow table is read concurrently by the hardware walker
//! (which may also set the accessed and dirty bits) and by lockless software
//! walks. Writers hold the structural lock and go through the codec on
//! [`PageTable`], which never lets a reader observe a torn entry.
//!
//! Targets with 64-bit atomics store each slot in a single [`AtomicU64`].
//! Other targets split the slot into two 32-bit halves ([`SplitCell`]) and
//! order the halves so that the low half, which carries the present bit,
//! is the one that publishes or retracts an entry.

use std::sync::atomic::{AtomicU32, AtomicU64, Ordering, fence};

use smmu_arch_amd64::{ENTRIES_PER_TABLE, Spte};
use smmu_core::MmuError;

use crate::host::HostFrames;

/// Raw storage of one shadow table slot.
pub trait SpteCell: Send + Sync {
    /// Creates a not-present slot.
    fn new() -> Self;

    /// Reads the slot. Callers hold the structural lock.
    fn load(&self) -> u64;

    /// Publishes a value into a slot that holds no present entry.
    fn store_new(&self, value: u64);

    /// Replaces a value whose bits cannot change behind the lock.
    ///
    /// `clear_count` is bumped when the new value retracts a present entry.
    fn store_fast(&self, value: u64, clear_count: &AtomicU32);

    /// Atomically swaps the value, returning the previous one including any
    /// bits the hardware set concurrently.
    fn exchange(&self, value: u64, clear_count: &AtomicU32) -> u64;

    /// Atomically clears `mask`, returning the previous value.
    fn fetch_clear(&self, mask: u64) -> u64;

    /// Reads the slot without the structural lock.
    fn load_lockless(&self, clear_count: &AtomicU32) -> u64;
}

/// A slot stored in one 64-bit atomic word.
#[derive(Debug, Default)]
pub struct NativeCell(AtomicU64);

impl SpteCell for NativeCell {
    fn new() -> Self {
        Self(AtomicU64::new(0))
    }

    fn load(&self) -> u64 {
        self.0.load(Ordering::Acquire)
    }

    fn store_new(&self, value: u64) {
        self.0.store(value, Ordering::Release);
    }

    fn store_fast(&self, value: u64, _clear_count: &AtomicU32) {
        self.0.store(value, Ordering::Release);
    }

    fn exchange(&self, value: u64, _clear_count: &AtomicU32) -> u64 {
        self.0.swap(value, Ordering::AcqRel)
    }

    fn fetch_clear(&self, mask: u64) -> u64 {
        self.0.fetch_and(!mask, Ordering::AcqRel)
    }

    fn load_lockless(&self, _clear_count: &AtomicU32) -> u64 {
        self.0.load(Ordering::Acquire)
    }
}

/// A slot stored as two 32-bit halves.
///
/// The low half holds the present bit and the volatile accessed and dirty
/// bits. A new entry is published by writing the high half first; an entry
/// is retracted by clearing the low half first. A present entry whose high
/// half changes is retracted, then republished.
#[derive(Debug, Default)]
pub struct SplitCell {
    low: AtomicU32,
    high: AtomicU32,
}

impl SplitCell {
    const fn halves(value: u64) -> (u32, u32) {
        (value as u32, (value >> 32) as u32)
    }

    const fn join(low: u32, high: u32) -> u64 {
        (low as u64) | ((high as u64) << 32)
    }

    fn count_clear(value: u64, clear_count: &AtomicU32) {
        if Spte(value).is_shadow_present() {
            return;
        }

        // Readers sampling the halves must see the counter move after the
        // low half is gone.
        fence(Ordering::Release);
        clear_count.fetch_add(1, Ordering::Release);
    }

    /// Clears the low half, returning its previous value.
    fn retract(&self, clear_count: &AtomicU32) -> u32 {
        let old = self.low.swap(0, Ordering::AcqRel);
        fence(Ordering::Release);
        clear_count.fetch_add(1, Ordering::Release);
        old
    }
}

impl SpteCell for SplitCell {
    fn new() -> Self {
        Self::default()
    }

    fn load(&self) -> u64 {
        let low = self.low.load(Ordering::Acquire);
        let high = self.high.load(Ordering::Acquire);
        Self::join(low, high)
    }

    fn store_new(&self, value: u64) {
        let (low, high) = Self::halves(value);
        self.high.store(high, Ordering::Relaxed);
        fence(Ordering::Release);
        self.low.store(low, Ordering::Release);
    }

    fn store_fast(&self, value: u64, clear_count: &AtomicU32) {
        let (low, high) = Self::halves(value);

        if !Spte(value).is_shadow_present() {
            self.low.store(low, Ordering::Release);
            fence(Ordering::Release);
            self.high.store(high, Ordering::Release);
            Self::count_clear(value, clear_count);
            return;
        }

        if high != self.high.load(Ordering::Acquire) {
            if Spte(self.load()).is_shadow_present() {
                self.retract(clear_count);
            }

            self.high.store(high, Ordering::Relaxed);
            fence(Ordering::Release);
        }

        self.low.store(low, Ordering::Release);
    }

    fn exchange(&self, value: u64, clear_count: &AtomicU32) -> u64 {
        let (low, high) = Self::halves(value);

        if Spte(value).is_shadow_present() && high != self.high.load(Ordering::Acquire) {
            let old_low = self.retract(clear_count);
            let old_high = self.high.swap(high, Ordering::AcqRel);
            fence(Ordering::Release);
            self.low.store(low, Ordering::Release);
            return Self::join(old_low, old_high);
        }

        let old_low = self.low.swap(low, Ordering::AcqRel);
        let old_high = self.high.load(Ordering::Acquire);
        self.high.store(high, Ordering::Release);
        Self::count_clear(value, clear_count);
        Self::join(old_low, old_high)
    }

    fn fetch_clear(&self, mask: u64) -> u64 {
        let (low_mask, high_mask) = Self::halves(mask);
        let old_low = self.low.fetch_and(!low_mask, Ordering::AcqRel);
        let old_high = self.high.fetch_and(!high_mask, Ordering::AcqRel);
        Self::join(old_low, old_high)
    }

    fn load_lockless(&self, clear_count: &AtomicU32) -> u64 {
        loop {
            let count = clear_count.load(Ordering::Acquire);
            fence(Ordering::Acquire);

            let low = self.low.load(Ordering::Acquire);
            fence(Ordering::Acquire);

            let high = self.high.load(Ordering::Acquire);
            fence(Ordering::Acquire);

            if low != self.low.load(Ordering::Acquire)
                || count != clear_count.load(Ordering::Acquire)
            {
                std::hint::spin_loop();
                continue;
            }

            return Self::join(low, high);
        }
    }
}

/// The slot representation for the build target.
#[cfg(target_has_atomic = "64")]
pub type DefaultCell = NativeCell;

/// The slot representation for the build target.
#[cfg(not(target_has_atomic = "64"))]
pub type DefaultCell = SplitCell;

/// One shadow page table: 512 slots and the counter split-word readers use to
/// detect a concurrent clear.
pub struct PageTable<C = DefaultCell>
where
    C: SpteCell,
{
    entries: [C; ENTRIES_PER_TABLE],
    clear_count: AtomicU32,
}

impl<C> PageTable<C>
where
    C: SpteCell,
{
    /// Creates a table with every slot not present.
    pub fn new() -> Self {
        Self {
            entries: std::array::from_fn(|_| C::new()),
            clear_count: AtomicU32::new(0),
        }
    }

    /// Reads the entry at `index`. Callers hold the structural lock.
    pub fn get(&self, index: usize) -> Spte {
        Spte(self.entries[index].load())
    }

    /// Reads the entry at `index` without the structural lock.
    pub fn get_lockless(&self, index: usize) -> Spte {
        Spte(self.entries[index].load_lockless(&self.clear_count))
    }

    /// Checks if every slot is not present.
    pub fn is_clear(&self) -> bool {
        self.entries.iter().all(|entry| entry.load() == 0)
    }

    /// Resets every slot to not present.
    ///
    /// Only valid for tables no walker can reach.
    pub fn zero(&self) {
        for entry in &self.entries {
            entry.store_fast(0, &self.clear_count);
        }
    }

    /// Writes a new entry into a slot that holds no present entry.
    pub fn set(&self, index: usize, spte: Spte) -> Result<(), MmuError> {
        let cell = &self.entries[index];
        if Spte(cell.load()).is_shadow_present() {
            return Err(MmuError::InvariantViolation(
                "set on a slot holding a present entry",
            ));
        }

        cell.store_new(spte.0);
        Ok(())
    }

    /// Replaces the entry at `index`, keeping the frame.
    ///
    /// Accessed and dirty bits dropped by the update are propagated to the
    /// host frame. Returns `true` if remote TLBs must be flushed before the
    /// update is complete.
    pub fn update<F>(
        &self,
        index: usize,
        new: Spte,
        frames: &F,
        hardware_ad: bool,
    ) -> Result<bool, MmuError>
    where
        F: HostFrames + ?Sized,
    {
        let cell = &self.entries[index];
        let mut old = Spte(cell.load());

        if !old.is_shadow_present() {
            cell.store_new(new.0);
            return Ok(false);
        }

        if old.has_volatile_bits(hardware_ad) {
            old = Spte(cell.exchange(new.0, &self.clear_count));
        }
        else {
            cell.store_fast(new.0, &self.clear_count);
        }

        if new.is_shadow_present() && old.pfn() != new.pfn() {
            return Err(MmuError::InvariantViolation(
                "update changed the frame of a present entry",
            ));
        }

        let mut flush = false;

        if old.writable() && !new.writable() {
            flush = true;
        }

        if old.accessed() && !new.accessed() {
            flush = true;
            frames.mark_accessed(old.pfn());
        }

        if old.dirty() && !new.dirty() {
            flush = true;
            frames.mark_dirty(old.pfn());
        }

        Ok(flush)
    }

    /// Clears the entry at `index` and propagates its accessed and dirty
    /// state to the host frame.
    ///
    /// Returns `true` if a present entry was removed. Clearing a slot that
    /// holds no present entry is a no-op returning `false`.
    pub fn clear_tracked<F>(&self, index: usize, frames: &F, hardware_ad: bool) -> bool
    where
        F: HostFrames + ?Sized,
    {
        let cell = &self.entries[index];
        let mut old = Spte(cell.load());

        if old.has_volatile_bits(hardware_ad) {
            old = Spte(cell.exchange(0, &self.clear_count));
        }
        else {
            cell.store_fast(0, &self.clear_count);
        }

        if !old.is_shadow_present() {
            return false;
        }

        let pfn = old.pfn();

        if !hardware_ad || old.accessed() {
            frames.mark_accessed(pfn);
        }

        if old.dirty() || (!hardware_ad && old.writable()) {
            frames.mark_dirty(pfn);
        }

        true
    }

    /// Clears the entry at `index` without touching host frame metadata.
    ///
    /// Used for non-leaf links and MMIO entries. Returns the previous value.
    pub fn clear_untracked(&self, index: usize) -> Spte {
        let cell = &self.entries[index];
        let old = Spte(cell.load());
        cell.store_fast(0, &self.clear_count);
        old
    }

    /// Atomically clears the accessed bit of the entry at `index`.
    ///
    /// Returns `true` if the bit was set.
    pub fn test_and_clear_accessed(&self, index: usize) -> bool {
        Spte(self.entries[index].fetch_clear(Spte::ACCESSED)).accessed()
    }

    /// Simulates a hardware walker setting bits in the entry at `index`.
    #[cfg(test)]
    pub(crate) fn hardware_set(&self, index: usize, mask: u64) {
        let cell = &self.entries[index];
        let value = cell.load() | mask;
        cell.store_new(value);
    }
}

impl<C> Default for PageTable<C>
where
    C: SpteCell,
{
    fn default() -> Self {
        Self::new()
    }
}
