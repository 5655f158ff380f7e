use smmu_core::MmuError;

use crate::{
    arena::{TableArena, TableId},
    config::MmuConfig,
    page::ShadowPage,
    pte_list::PteListDesc,
};

/// Pre-allocated objects a vCPU consumes under the structural lock.
///
/// Allocation may sleep, the structural lock must not be held while
/// sleeping, so every operation that allocates under the lock first tops up
/// its pools to the worst-case need of one operation.
pub struct ObjectPool<T> {
    name: &'static str,
    min: usize,
    objects: Vec<T>,
}

impl<T> ObjectPool<T> {
    /// Creates an empty pool refilled up to `min` objects.
    pub fn new(name: &'static str, min: usize) -> Self {
        Self {
            name,
            min,
            objects: Vec::with_capacity(min),
        }
    }

    /// Returns the number of available objects.
    pub fn len(&self) -> usize {
        self.objects.len()
    }

    /// Checks if no object is available.
    pub fn is_empty(&self) -> bool {
        self.objects.is_empty()
    }

    /// Refills the pool up to its minimum.
    pub fn top_up(
        &mut self,
        mut alloc: impl FnMut() -> Result<T, MmuError>,
    ) -> Result<(), MmuError> {
        while self.objects.len() < self.min {
            self.objects.push(alloc()?);
        }

        Ok(())
    }

    /// Takes an object out of the pool.
    ///
    /// # Panics
    ///
    /// Panics if the pool is empty. Callers size their top-up for the worst
    /// case, so an empty pool is a programming error.
    pub fn alloc(&mut self) -> T {
        match self.objects.pop() {
            Some(object) => object,
            None => panic!("{} pool exhausted under the structural lock", self.name),
        }
    }

    /// Removes every object from the pool.
    pub fn drain(&mut self) -> std::vec::Drain<'_, T> {
        self.objects.drain(..)
    }
}

/// The pools owned by one vCPU.
pub struct VcpuPools {
    pub tables: ObjectPool<TableId>,
    pub pages: ObjectPool<Box<ShadowPage>>,
    pub descs: ObjectPool<Box<PteListDesc>>,
}

impl VcpuPools {
    pub fn new(config: &MmuConfig) -> Self {
        Self {
            tables: ObjectPool::new("table", config.pool_min_pages),
            pages: ObjectPool::new("shadow page", config.pool_min_pages),
            descs: ObjectPool::new("pte list descriptor", config.pool_min_descs),
        }
    }

    /// Refills every pool. Must be called without the structural lock.
    pub fn top_up(&mut self, arena: &TableArena) -> Result<(), MmuError> {
        self.descs.top_up(|| Ok(Box::default()))?;
        self.pages.top_up(|| Ok(Box::default()))?;
        self.tables.top_up(|| arena.alloc())
    }

    /// Returns pooled tables to the arena.
    pub fn release(&mut self, arena: &TableArena) {
        for table in self.tables.drain() {
            arena.release(table);
        }

        drop(self.pages.drain());
        drop(self.descs.drain());
    }
}
