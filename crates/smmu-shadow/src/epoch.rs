use std::sync::atomic::{AtomicUsize, Ordering, fence};

/// Tracks lockless readers of shadow tables.
///
/// While any reader is active, tables removed from the hierarchy are parked
/// instead of being handed back to the arena for reuse.
#[derive(Debug, Default)]
pub struct Epoch {
    readers: AtomicUsize,
}

impl Epoch {
    /// Enters a lockless section.
    pub fn enter(&self) -> LocklessGuard<'_> {
        self.readers.fetch_add(1, Ordering::SeqCst);

        // Pairs with the fence in `readers_active`: either the zapper sees
        // this reader, or the reader sees the cleared link.
        fence(Ordering::SeqCst);

        LocklessGuard { epoch: self }
    }

    /// Checks if a lockless reader may still hold a table reference.
    pub fn readers_active(&self) -> bool {
        fence(Ordering::SeqCst);
        self.readers.load(Ordering::SeqCst) != 0
    }
}

/// An active lockless section.
pub struct LocklessGuard<'a> {
    epoch: &'a Epoch,
}

impl Drop for LocklessGuard<'_> {
    fn drop(&mut self) {
        self.epoch.readers.fetch_sub(1, Ordering::Release);
    }
}
