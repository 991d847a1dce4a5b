//! Scatter/gather builder (SG): turns one host-virtual buffer span into
//! PRP1/PRP2 or PRP1 + PRP-list (spec §2 item 7, §4.6).
//!
//! Grounded on `examples/original_source/nvme2k_nvme.c`'s
//! `NvmeBuildReadWriteCommand` (the embedded PRP1/PRP2/PRP-list assembly,
//! lines 419-701), reworked into a standalone function so RW and the
//! translation layer's admin-adjacent transfers (Get Log Page, Identify)
//! can share it.

use crate::arena::PAGE_SIZE;
use crate::error::{Error, Result};
use crate::host::HostPort;
use crate::prp::{self, PrpPagePool};

/// Maximum PRP-list entries that fit in one page (§4.6 "Hard cap").
pub const MAX_LIST_ENTRIES: usize = PAGE_SIZE / 8;

/// The two PRP fields to place in a command's CDW6..9 plus, if a PRP list
/// was needed, the pool index backing it (`prp::NONE` otherwise) so the
/// caller can record it in the request's shadow.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct ScatterGather {
    pub prp1: u64,
    pub prp2: u64,
    pub list_page: u8,
}

/// Builds PRP1/PRP2(/list) for a transfer of `len` bytes starting at host
/// virtual address `virt` (§4.6). Returns `Error::ResourceTransient` if a
/// PRP-list page is needed but the pool is exhausted, and
/// `Error::InvalidRequest` if `len` would need more than
/// [`MAX_LIST_ENTRIES`] list entries — callers are expected to have already
/// rejected such transfers against `MaxTransferSizeBytes` (§4.6 "Hard cap").
pub fn build(
    host: &dyn HostPort,
    pool: &mut PrpPagePool,
    virt: usize,
    len: usize,
) -> Result<ScatterGather> {
    let phys1 = host.virt_to_phys(virt);
    let off = (phys1 as usize) & (PAGE_SIZE - 1);
    let first = PAGE_SIZE - off;

    if len <= first {
        return Ok(ScatterGather {
            prp1: phys1,
            prp2: 0,
            list_page: prp::NONE,
        });
    }

    if len <= first + PAGE_SIZE {
        let phys2 = host.virt_to_phys(virt + first);
        return Ok(ScatterGather {
            prp1: phys1,
            prp2: phys2,
            list_page: prp::NONE,
        });
    }

    let remaining = len - first;
    let entries = (remaining + PAGE_SIZE - 1) / PAGE_SIZE;
    if entries > MAX_LIST_ENTRIES {
        return Err(Error::InvalidRequest);
    }

    let index = pool.allocate();
    if index == prp::NONE {
        return Err(Error::ResourceTransient);
    }

    let mut list = [0u8; PAGE_SIZE];
    for i in 0..entries {
        let page_virt = virt + first + i * PAGE_SIZE;
        let page_phys = host.virt_to_phys(page_virt);
        list[i * 8..i * 8 + 8].copy_from_slice(&page_phys.to_le_bytes());
    }
    // SAFETY: `index` was just allocated from `pool` and is not shared.
    unsafe { pool.write(index, &list[..entries * 8]) };

    Ok(ScatterGather {
        prp1: phys1,
        prp2: pool.phys_of(index),
        list_page: index,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::host::tests::FakeHostPort;

    fn pool(count: usize) -> PrpPagePool {
        let dma = crate::host::tests::FakeDma::new(64 * PAGE_SIZE);
        let mut arena = crate::arena::Arena::new(&dma, count).unwrap();
        PrpPagePool::new(&mut arena, count).unwrap()
    }

    #[test]
    fn single_page_transfer_leaves_prp2_zero() {
        // spec.md §8 boundary behavior: exactly-one-page transfer -> PRP2=0.
        let host = FakeHostPort::new();
        let mut pool = pool(4);
        let sg = build(&host, &mut pool, 0x1000, PAGE_SIZE).unwrap();
        assert_eq!(sg.prp2, 0);
        assert_eq!(sg.list_page, prp::NONE);
    }

    #[test]
    fn two_page_transfer_sets_prp2_to_second_page() {
        // spec.md §8 boundary behavior: exactly-two-page transfer -> PRP2 =
        // physical of second page, no list.
        let host = FakeHostPort::new();
        let mut pool = pool(4);
        let sg = build(&host, &mut pool, 0x1000, 2 * PAGE_SIZE).unwrap();
        assert_eq!(sg.prp2, (0x1000 + PAGE_SIZE) as u64);
        assert_eq!(sg.list_page, prp::NONE);
    }

    #[test]
    fn mid_page_start_shrinks_first_chunk() {
        let host = FakeHostPort::new();
        let mut pool = pool(4);
        // first chunk is only half a page; still fits in PRP1/PRP2 since
        // total length <= first + PAGE_SIZE.
        let sg = build(&host, &mut pool, 0x1800, PAGE_SIZE).unwrap();
        assert_eq!(sg.prp1, 0x1800);
        assert_eq!(sg.prp2, 0x2000);
    }

    #[test]
    fn three_or_more_pages_uses_a_prp_list() {
        // spec.md §8 boundary behavior: K>=3 pages -> PRP1 + list with K-1
        // entries.
        let host = FakeHostPort::new();
        let mut pool = pool(4);
        let sg = build(&host, &mut pool, 0x1000, 3 * PAGE_SIZE).unwrap();
        assert_ne!(sg.list_page, prp::NONE);
        assert_eq!(sg.prp2, pool.phys_of(sg.list_page));
    }

    #[test]
    fn eighteen_page_span_fills_seventeen_list_entries() {
        // scenario 3, spec.md §8: 68 KiB read spanning 18 pages -> PRP1 +
        // one list page with 17 entries.
        let host = FakeHostPort::new();
        let mut pool = pool(4);
        let len = 18 * PAGE_SIZE - 1; // mid-page start plus 18 pages spanned
        let sg = build(&host, &mut pool, 1, len).unwrap();
        assert_ne!(sg.list_page, prp::NONE);
        let virt = pool.virt_of(sg.list_page);
        let words = unsafe { core::slice::from_raw_parts(virt as *const u64, 17) };
        assert_eq!(words[0], PAGE_SIZE as u64);
    }

    #[test]
    fn exhausted_pool_reports_resource_transient() {
        let host = FakeHostPort::new();
        let mut pool = pool(1);
        // consume the only page so the list allocation below must fail.
        let _ = pool.allocate();
        let err = build(&host, &mut pool, 0x1000, 3 * PAGE_SIZE).unwrap_err();
        assert_eq!(err, Error::ResourceTransient);
    }
}
