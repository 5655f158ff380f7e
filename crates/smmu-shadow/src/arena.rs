use std::sync::{
    OnceLock,
    atomic::{AtomicUsize, Ordering},
};

use smmu_core::{MmuError, Pfn};

use crate::slot::PageTable;

/// Number of tables allocated together.
const TABLES_PER_CHUNK: usize = 64;

/// Identifies one table in the [`TableArena`].
///
/// The identifier doubles as the frame number stored in non-leaf entries
/// pointing to the table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TableId(u32);

impl TableId {
    /// Returns the frame number a link entry stores for this table.
    pub fn frame(self) -> u64 {
        self.0 as u64
    }

    /// Recovers the table from the frame of a link entry.
    pub fn from_pfn(pfn: Pfn) -> Self {
        Self(pfn.0 as u32)
    }
}

impl std::fmt::Display for TableId {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "T{}", self.0)
    }
}

/// Backing store for shadow tables.
///
/// Tables are carved out of chunks that are never returned, so a table
/// reference obtained by a lockless walker stays dereferenceable for the
/// lifetime of the arena. Reuse of a released table is gated by the caller
/// (see the lockless reader epoch).
pub struct TableArena {
    chunks: Box<[OnceLock<Box<[PageTable]>>]>,
    free: spin::Mutex<Vec<TableId>>,
    next: AtomicUsize,
    in_use: AtomicUsize,
}

impl TableArena {
    /// Creates an arena able to hold up to `capacity` tables.
    pub fn new(capacity: usize) -> Self {
        let chunks = capacity.div_ceil(TABLES_PER_CHUNK).max(1);

        Self {
            chunks: (0..chunks).map(|_| OnceLock::new()).collect(),
            free: spin::Mutex::new(Vec::new()),
            next: AtomicUsize::new(0),
            in_use: AtomicUsize::new(0),
        }
    }

    /// Returns the number of tables handed out and not yet released.
    pub fn in_use(&self) -> usize {
        self.in_use.load(Ordering::Relaxed)
    }

    /// Allocates a cleared table.
    pub fn alloc(&self) -> Result<TableId, MmuError> {
        let id = {
            let mut free = self.free.lock();

            match free.pop() {
                Some(id) => id,
                None => {
                    let index = self.next.load(Ordering::Relaxed);
                    if index >= self.chunks.len() * TABLES_PER_CHUNK {
                        return Err(MmuError::NoMemory);
                    }

                    self.next.store(index + 1, Ordering::Relaxed);
                    TableId(index as u32)
                }
            }
        };

        self.table(id).zero();
        self.in_use.fetch_add(1, Ordering::Relaxed);
        Ok(id)
    }

    /// Returns a table to the arena.
    ///
    /// No walker may still hold a reference to the table.
    pub fn release(&self, id: TableId) {
        debug_assert!(self.table(id).is_clear(), "released table {id} is not clear");

        self.in_use.fetch_sub(1, Ordering::Relaxed);
        self.free.lock().push(id);
    }

    /// Returns the table identified by `id`.
    pub fn table(&self, id: TableId) -> &PageTable {
        let index = id.0 as usize;
        let chunk = self.chunks[index / TABLES_PER_CHUNK]
            .get_or_init(|| (0..TABLES_PER_CHUNK).map(|_| PageTable::new()).collect());

        &chunk[index % TABLES_PER_CHUNK]
    }
}
