//! Uncached arena (ARENA): the single contiguous DMA-coherent block the
//! lifecycle carves into page-aligned sub-allocations (spec §2 item 2,
//! §4.1, §3 "Lifecycles").
//!
//! Grounded on `examples/original_source/nvme2k.h`'s
//! `UncachedExtensionPhys`/`Base`/`Size` fields and `PAGE_SIZE` constant;
//! the teacher's standalone `drivers/storage/nvme` crate carves its queues
//! out of callback-provided memory the same bump-allocator way (`malloc`
//! callback in `NvMeController::new`).

use crate::error::{Error, LifecycleError, Result};
use crate::host::DmaAllocator;

pub const PAGE_SIZE: usize = 0x1000;

/// A page-aligned virtual/physical pair returned by one arena allocation.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct DmaRegion {
    pub virt: usize,
    pub phys: u64,
    pub pages: usize,
}

impl DmaRegion {
    pub fn len(&self) -> usize {
        self.pages * PAGE_SIZE
    }
}

/// A bump allocator over one contiguous uncached block obtained from the
/// host port. Never frees individual allocations; the whole block is
/// released with the device (§4.1).
pub struct Arena {
    virt_base: usize,
    phys_base: u64,
    total_pages: usize,
    next_page: usize,
}

impl Arena {
    /// Obtains a block sized `(prp_pool_pages + 4) * PAGE_SIZE` plus one
    /// page of slack from `dma`, per §4.1. On failure, the caller retries
    /// with a smaller `prp_pool_pages` count (§4.1, §9 supplemented
    /// "DSTRD/MQES-driven queue sizing").
    pub fn new(dma: &dyn DmaAllocator, prp_pool_pages: usize) -> Result<Self> {
        let total_pages = prp_pool_pages + 4 + 1;
        let region = dma
            .allocate_uncached(total_pages * PAGE_SIZE)
            .ok_or(Error::Lifecycle(LifecycleError::ArenaAllocationFailed))?;
        Ok(Arena {
            virt_base: region.virt,
            phys_base: region.phys,
            total_pages,
            next_page: 0,
        })
    }

    /// Carves `pages` page-aligned pages off the front of the remaining
    /// block.
    pub fn take_pages(&mut self, pages: usize) -> Result<DmaRegion> {
        if self.next_page + pages > self.total_pages {
            return Err(Error::Lifecycle(LifecycleError::ArenaAllocationFailed));
        }
        let region = DmaRegion {
            virt: self.virt_base + self.next_page * PAGE_SIZE,
            phys: self.phys_base + (self.next_page * PAGE_SIZE) as u64,
            pages,
        };
        self.next_page += pages;
        Ok(region)
    }

    pub fn remaining_pages(&self) -> usize {
        self.total_pages - self.next_page
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::host::tests::FakeDma;

    #[test]
    fn take_pages_advances_virt_and_phys_together() {
        let dma = FakeDma::new(64 * PAGE_SIZE);
        let mut arena = Arena::new(&dma, 16).unwrap();
        let a = arena.take_pages(1).unwrap();
        let b = arena.take_pages(2).unwrap();
        assert_eq!(b.virt, a.virt + PAGE_SIZE);
        assert_eq!(b.phys, a.phys + PAGE_SIZE as u64);
        assert_eq!(b.pages, 2);
    }

    #[test]
    fn exhausting_the_block_fails_cleanly() {
        let dma = FakeDma::new(4 * PAGE_SIZE);
        let mut arena = Arena::new(&dma, 0).unwrap();
        assert_eq!(arena.remaining_pages(), 5);
        assert!(arena.take_pages(5).is_ok());
        assert!(arena.take_pages(1).is_err());
    }
}
