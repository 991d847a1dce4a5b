//! PRP page pool (PRP): a fixed-size pool of 4 KiB pages with a bitmap
//! allocator (spec §2 item 3, §3 "PrpPagePool", §4.3).
//!
//! Grounded on `examples/original_source/nvme2k.h`'s `PrpListPageBitmap`
//! field and `0xFF` none-sentinel convention, reworked with `heapless` fixed
//! storage in place of the original's raw bit array, matching this crate's
//! ambient-stack choice to use `heapless` for bounded in-flight bookkeeping.

use heapless::consts::U32;
use heapless::Vec as HVec;

use crate::arena::{Arena, DmaRegion, PAGE_SIZE};
use crate::error::{Error, Result};

/// Sentinel meaning "no PRP page owned", matching the original driver's
/// `0xFF` (§3 "RequestShadow").
pub const NONE: u8 = 0xFF;

/// Up to 32 pages, chosen at allocation time (§3 "PrpPagePool: fixed-count
/// pages (16 or 32)").
pub struct PrpPagePool {
    pages: HVec<DmaRegion, U32>,
    /// One bit per page; bit set means allocated.
    bitmap: u32,
}

impl PrpPagePool {
    /// Carves `count` (16 or 32) page-aligned pages out of `arena`.
    pub fn new(arena: &mut Arena, count: usize) -> Result<Self> {
        debug_assert!(count <= 32);
        let mut pages = HVec::new();
        for _ in 0..count {
            let region = arena.take_pages(1)?;
            // capacity is fixed at 32 above; push cannot fail for count<=32
            let _ = pages.push(region);
        }
        Ok(PrpPagePool { pages, bitmap: 0 })
    }

    pub fn capacity(&self) -> usize {
        self.pages.len()
    }

    /// Finds the first free page, marks it allocated, and returns its index,
    /// or `NONE` on exhaustion (§4.3).
    pub fn allocate(&mut self) -> u8 {
        for i in 0..self.pages.len() {
            if self.bitmap & (1 << i) == 0 {
                self.bitmap |= 1 << i;
                return i as u8;
            }
        }
        NONE
    }

    /// Clears the allocated bit for `index`. A no-op if `index == NONE`.
    pub fn free(&mut self, index: u8) {
        if index == NONE {
            return;
        }
        self.bitmap &= !(1 << index);
    }

    pub fn virt_of(&self, index: u8) -> usize {
        self.pages[index as usize].virt
    }

    pub fn phys_of(&self, index: u8) -> u64 {
        self.pages[index as usize].phys
    }

    pub fn is_empty(&self) -> bool {
        self.bitmap == 0
    }

    /// Writes `bytes` (must be `<= PAGE_SIZE`) into the page at `index`.
    ///
    /// # Safety
    /// Caller must ensure no concurrent access to the same page.
    pub unsafe fn write(&self, index: u8, bytes: &[u8]) {
        debug_assert!(bytes.len() <= PAGE_SIZE);
        let dst = self.virt_of(index) as *mut u8;
        core::ptr::copy_nonoverlapping(bytes.as_ptr(), dst, bytes.len());
    }
}
