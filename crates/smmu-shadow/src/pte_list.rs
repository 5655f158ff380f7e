//! Compact multi-set of shadow entry references.
//!
//! Used for the reverse map (which leaf entries map a guest frame) and for
//! the parent list of a shadow page (which non-leaf entries link to it).
//! Most lists hold exactly one entry, which is stored inline. Longer lists
//! spill into a chain of fixed-size descriptors.
//!
//! The chain is kept dense: every descriptor but the last is full, so entry
//! `n` always lives in descriptor `n / DESC_CAPACITY`. Removal moves the last
//! entry into the hole. A caller iterating by position therefore re-reads the
//! same position after removing the entry found there and advances
//! otherwise; every entry present for the whole iteration is visited
//! exactly once.

use smmu_core::MmuError;

use crate::{
    page::SptePtr,
    pool::ObjectPool,
    slab::{Key, Slab},
};

/// Entries held by one descriptor.
pub const DESC_CAPACITY: usize = 4;

/// Handle of a descriptor.
pub type DescId = Key<PteListDesc>;

/// A spill descriptor of a [`PteList`].
#[derive(Debug, Default)]
pub struct PteListDesc {
    entries: [Option<SptePtr>; DESC_CAPACITY],
    more: Option<DescId>,
}

/// A multi-set of shadow entry references.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub enum PteList {
    /// No entry.
    #[default]
    Empty,

    /// Exactly one entry, stored inline.
    Single(SptePtr),

    /// Two or more entries in a descriptor chain.
    Many {
        /// The first descriptor.
        head: DescId,

        /// The number of entries.
        len: usize,
    },
}

const MISSING_DESC: MmuError = MmuError::InvariantViolation("stale pte list descriptor");
const MISSING_ENTRY: MmuError = MmuError::InvariantViolation("pte list entry not found");

impl PteList {
    /// Returns the number of entries.
    pub fn len(&self) -> usize {
        match self {
            Self::Empty => 0,
            Self::Single(_) => 1,
            Self::Many { len, .. } => *len,
        }
    }

    /// Checks if the list holds no entry.
    pub fn is_empty(&self) -> bool {
        matches!(self, Self::Empty)
    }

    /// Returns the descriptor holding position `n` of a chain.
    fn desc_at(head: DescId, n: usize, descs: &Slab<PteListDesc>) -> Result<DescId, MmuError> {
        let mut id = head;

        for _ in 0..n / DESC_CAPACITY {
            id = descs.get(id).and_then(|desc| desc.more).ok_or(MISSING_DESC)?;
        }

        Ok(id)
    }

    /// Returns the entry at position `n`.
    pub fn get(&self, n: usize, descs: &Slab<PteListDesc>) -> Result<Option<SptePtr>, MmuError> {
        match *self {
            Self::Empty => Ok(None),
            Self::Single(ptr) => Ok((n == 0).then_some(ptr)),
            Self::Many { head, len } => {
                if n >= len {
                    return Ok(None);
                }

                let id = Self::desc_at(head, n, descs)?;
                let desc = descs.get(id).ok_or(MISSING_DESC)?;
                desc.entries[n % DESC_CAPACITY]
                    .map(Some)
                    .ok_or(MmuError::InvariantViolation("hole in pte list"))
            }
        }
    }

    /// Returns the first entry.
    pub fn first(&self, descs: &Slab<PteListDesc>) -> Result<Option<SptePtr>, MmuError> {
        self.get(0, descs)
    }

    /// Collects every entry.
    pub fn to_vec(&self, descs: &Slab<PteListDesc>) -> Result<Vec<SptePtr>, MmuError> {
        let mut result = Vec::with_capacity(self.len());

        for n in 0..self.len() {
            result.extend(self.get(n, descs)?);
        }

        Ok(result)
    }

    /// Appends `ptr` and returns the number of entries before the append.
    ///
    /// Descriptors come from `pool`, which the caller tops up before taking
    /// the structural lock.
    pub fn add(
        &mut self,
        ptr: SptePtr,
        descs: &mut Slab<PteListDesc>,
        pool: &mut ObjectPool<Box<PteListDesc>>,
    ) -> Result<usize, MmuError> {
        match *self {
            Self::Empty => {
                *self = Self::Single(ptr);
                Ok(0)
            }

            Self::Single(first) => {
                let mut desc = pool.alloc();
                desc.entries = [Some(first), Some(ptr), None, None];
                desc.more = None;

                *self = Self::Many {
                    head: descs.insert(desc),
                    len: 2,
                };
                Ok(1)
            }

            Self::Many { head, len } => {
                if len % DESC_CAPACITY == 0 {
                    let tail = Self::desc_at(head, len - 1, descs)?;

                    let mut desc = pool.alloc();
                    desc.entries = [Some(ptr), None, None, None];
                    desc.more = None;

                    let id = descs.insert(desc);
                    descs.get_mut(tail).ok_or(MISSING_DESC)?.more = Some(id);
                }
                else {
                    let tail = Self::desc_at(head, len, descs)?;
                    descs.get_mut(tail).ok_or(MISSING_DESC)?.entries[len % DESC_CAPACITY] =
                        Some(ptr);
                }

                *self = Self::Many { head, len: len + 1 };
                Ok(len)
            }
        }
    }

    /// Removes one occurrence of `ptr`.
    ///
    /// Removing an entry that is not in the list is an invariant violation.
    pub fn remove(&mut self, ptr: SptePtr, descs: &mut Slab<PteListDesc>) -> Result<(), MmuError> {
        let position = (0..self.len())
            .find(|&n| matches!(self.get(n, descs), Ok(Some(entry)) if entry == ptr))
            .ok_or(MISSING_ENTRY)?;

        self.remove_at(position, descs)
    }

    /// Removes the entry at position `n`, moving the last entry into its
    /// place.
    pub fn remove_at(&mut self, n: usize, descs: &mut Slab<PteListDesc>) -> Result<(), MmuError> {
        match *self {
            Self::Empty => Err(MISSING_ENTRY),

            Self::Single(_) => {
                if n != 0 {
                    return Err(MISSING_ENTRY);
                }

                *self = Self::Empty;
                Ok(())
            }

            Self::Many { head, len } => {
                if n >= len {
                    return Err(MISSING_ENTRY);
                }

                let last = len - 1;
                let tail = Self::desc_at(head, last, descs)?;
                let moved = descs.get_mut(tail).ok_or(MISSING_DESC)?.entries
                    [last % DESC_CAPACITY]
                    .take();

                if n != last {
                    let hole = Self::desc_at(head, n, descs)?;
                    descs.get_mut(hole).ok_or(MISSING_DESC)?.entries[n % DESC_CAPACITY] = moved;
                }

                if last % DESC_CAPACITY == 0 {
                    // The tail descriptor emptied; `last` is at least 4 here
                    // since a chain holds two or more entries.
                    let previous = Self::desc_at(head, last - 1, descs)?;
                    descs.get_mut(previous).ok_or(MISSING_DESC)?.more = None;
                    descs.remove(tail);
                }

                if last == 1 {
                    let desc = descs.remove(head).ok_or(MISSING_DESC)?;
                    *self = Self::Single(desc.entries[0].ok_or(MISSING_ENTRY)?);
                }
                else {
                    *self = Self::Many { head, len: last };
                }

                Ok(())
            }
        }
    }
}
