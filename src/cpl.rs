//! Completion dispatch (CPL): drains both completion rings, demultiplexes
//! each entry by its command identifier, and drives the controller's
//! init/shutdown state machine (spec §2 item 10, §4.9).
//!
//! Grounded on `examples/ethindp-kernel/libk/src/nvme/queues.rs`'s drain-then-acknowledge ring
//! handling and `examples/original_source/nvme2k_nvme.c`'s
//! `NvmeProcessCompletion`'s per-CID-class branching, reworked per §9's
//! redesign note: this module never holds a pointer back into a host
//! request, only the CID, the shadow `DeviceState` recorded at submission
//! time, and the [`HostPort`] trait through which it asks for buffers and
//! hands back an [`Outcome`].

use crossbeam_queue::SegQueue;
use log::{debug, trace, warn};

use crate::arena::PAGE_SIZE;
use crate::cid::{self, CidClass};
use crate::error::{Error, SenseData};
use crate::host::{HostPort, Outcome};
use crate::lifecycle::{self, UTILITY_PAGE_INDEX};
use crate::prp;
use crate::queues::{CompletionQueueEntry, QueueId};
use crate::state::{DeviceState, PendingLogResponse};
use crate::structs::{IdentifyControllerResponse, IdentifyNamespaceResponse};
use crate::xlt;

/// Drains one completion ring into a relay queue, mirrors each entry's
/// `SQHead` into the matching submission ring (§4.2 "copy sqhead = SQHead
/// into the mirror"), and rings the completion doorbell exactly once if
/// anything was consumed (§4.2, §5 "batched acknowledgement"). The ring's
/// own borrow ends when this returns, so the caller is free to dispatch
/// against `&mut DeviceState` afterward.
///
/// Grounded on `libk::nvme::queues::CompletionQueue::check_queue_for_new_entries`'s
/// drain-into-`SegQueue` relay.
fn collect(
    reg: &crate::reg::RegisterWindow,
    queue_id: QueueId,
    sq: &mut crate::queues::SubmissionQueue,
    cq: &mut crate::queues::CompletionQueue,
    relay: &SegQueue<CompletionQueueEntry>,
) {
    let progressed = cq.drain(|e| {
        sq.head = e.sq_head;
        relay.push(e);
    });
    if progressed {
        reg.ring_doorbell(queue_id as u16, false, cq.ring_index());
    }
}

/// Drains both completion rings and dispatches every entry found. Safe to
/// call from the ISR or the fallback timer alike (§4.9, §5).
pub fn drain(host: &dyn HostPort, state: &mut DeviceState) {
    let relay = SegQueue::new();
    collect(&state.reg, QueueId::Admin, &mut state.admin.sq, &mut state.admin.cq, &relay);
    collect(&state.reg, QueueId::Io, &mut state.io.sq, &mut state.io.cq, &relay);
    while let Some(cqe) = relay.pop() {
        dispatch(host, state, cqe);
    }
}

fn dispatch(host: &dyn HostPort, state: &mut DeviceState, cqe: CompletionQueueEntry) {
    match cid::decode(cqe.cid, state.is_init_complete()) {
        CidClass::Admin(value) if !state.is_init_complete() => {
            if let Err(e) = on_init_completion(host, state, value, &cqe) {
                warn!("lifecycle init step {:#06x} failed: {:?}", value, e);
            }
        }
        CidClass::Admin(value) => {
            trace!("admin completion {:#06x} seen by drain; submitter is polling for it", value);
        }
        CidClass::GetLogPage(prp_index) => on_log_page_completion(host, state, prp_index, &cqe),
        CidClass::OrderedFlushPrologue(tag) => {
            trace!("ordered-flush prologue for tag {} acknowledged silently", tag);
        }
        CidClass::Tagged(tag) => on_io_completion(host, state, tag, &cqe),
    }
}

fn device_protocol_error(cqe: &CompletionQueueEntry) -> Error {
    let nvme_status = ((cqe.status_code_type() as u16) << 8) | cqe.status_code() as u16;
    Error::DeviceProtocol {
        nvme_status,
        sense: SenseData::HARDWARE_ERROR,
    }
}

/// Submits the first command of the post-enable identify/queue-creation
/// chain: Create I/O Completion Queue. Every subsequent step is driven by
/// [`drain`]/[`dispatch`] as each admin completion arrives (§4.5).
pub fn start_identify_chain(host: &dyn HostPort, state: &mut DeviceState) -> crate::error::Result<()> {
    let sqe = lifecycle::build_create_io_cq(state.io.cq.phys, state.io.cq.size());
    state.submit_admin(host, &sqe)
}

/// Advances the init state machine by one step on each admin completion
/// (§4.5 "Identify and queue-creation chain"): Create I/O CQ -> Create I/O
/// SQ -> Identify Controller -> Identify Namespace -> done.
fn on_init_completion(
    host: &dyn HostPort,
    state: &mut DeviceState,
    cid_value: u16,
    cqe: &CompletionQueueEntry,
) -> crate::error::Result<()> {
    if cqe.is_error() {
        return Err(Error::Lifecycle(crate::error::LifecycleError::QueueCreateFailed));
    }

    if cid_value == cid::admin::CREATE_IO_CQ {
        let sqe = lifecycle::build_create_io_sq(state.io.sq.phys, state.io.sq.size());
        return state.submit_admin(host, &sqe);
    }

    if cid_value == cid::admin::CREATE_IO_SQ {
        let phys = state.prp.phys_of(UTILITY_PAGE_INDEX);
        let sqe = lifecycle::build_identify_controller(phys);
        return state.submit_admin(host, &sqe);
    }

    if cid_value == cid::admin::IDENTIFY_CONTROLLER {
        let virt = state.prp.virt_of(UTILITY_PAGE_INDEX);
        // SAFETY: the utility page holds a freshly-completed Identify
        // Controller response, exclusively owned by this init sequence
        // until init_complete is set (§3 "utility buffer").
        let resp = unsafe { &*(virt as *const IdentifyControllerResponse) };
        lifecycle::apply_identify_controller(state, resp);
        let phys = state.prp.phys_of(UTILITY_PAGE_INDEX);
        let sqe = lifecycle::build_identify_namespace(phys);
        return state.submit_admin(host, &sqe);
    }

    if cid_value == cid::admin::IDENTIFY_NAMESPACE {
        let virt = state.prp.virt_of(UTILITY_PAGE_INDEX);
        // SAFETY: same utility page, now holding the Identify Namespace
        // response.
        let resp = unsafe { &*(virt as *const IdentifyNamespaceResponse) };
        lifecycle::apply_identify_namespace(state, resp);
        state.mark_init_complete();
        debug!(
            "initialization complete: {} blocks x {} bytes",
            state.namespace_size_blocks, state.namespace_block_size
        );
        return Ok(());
    }

    warn!("unexpected admin CID {:#06x} during init", cid_value);
    Ok(())
}

/// Busy-polls the admin completion ring for a specific CID, used by the
/// shutdown sequence's "submit Delete I/O SQ/CQ, poll until completion"
/// step (§4.5). Returns `None` if `max_iters` stalls pass without seeing
/// it, matching shutdown's best-effort timeout policy (§7.5).
pub fn poll_for_admin_cid(
    reg: &crate::reg::RegisterWindow,
    admin_sq: &mut crate::queues::SubmissionQueue,
    admin_cq: &mut crate::queues::CompletionQueue,
    expected_cid: u16,
    max_iters: u32,
    stall: impl Fn(),
) -> Option<CompletionQueueEntry> {
    for _ in 0..max_iters {
        let mut found = None;
        let progressed = admin_cq.drain(|e| {
            admin_sq.head = e.sq_head;
            if e.cid == expected_cid && found.is_none() {
                found = Some(e);
            }
        });
        if progressed {
            reg.ring_doorbell(QueueId::Admin as u16, false, admin_cq.ring_index());
        }
        if found.is_some() {
            return found;
        }
        stall();
    }
    None
}

/// Outcome of a completed Get Log Page round trip, independent of which
/// conversion it fed (§4.9).
fn on_log_page_completion(host: &dyn HostPort, state: &mut DeviceState, prp_index: u8, cqe: &CompletionQueueEntry) {
    let _ = state.take_shadow(cqe.cid);

    if cqe.is_error() {
        state.prp.free(prp_index);
        state.stats.on_prp_list_page_returned();
        let _ = state.take_pending_log();
        state.non_tagged_in_flight.store(false, core::sync::atomic::Ordering::Relaxed);
        host.complete_non_tagged(Outcome::Failed(device_protocol_error(cqe)));
        host.notify_next_request();
        return;
    }

    let virt = state.prp.virt_of(prp_index);
    // SAFETY: this PRP page was exclusively owned by the just-completed Get
    // Log Page command; nothing else touches it until freed below.
    let smart = unsafe { &*(virt as *const xlt::NvmeSmartLog) };
    let (buf_virt, buf_len) = host.buffer_for_non_tagged();

    match state.take_pending_log() {
        Some(PendingLogResponse::InformationalExceptions) => {
            let page = xlt::informational_exceptions_log(smart);
            // SAFETY: buf_virt/buf_len describe the host's pinned buffer
            // for the outstanding non-tagged request.
            unsafe { copy_into_buffer(buf_virt, buf_len, &page) };
        }
        Some(PendingLogResponse::AtaSmartData) => {
            let ata = xlt::nvme_smart_to_ata_smart(smart);
            unsafe { copy_into_buffer(buf_virt, buf_len, &ata) };
        }
        None => {
            warn!("get-log-page completion with no pending conversion recorded");
        }
    }

    state.prp.free(prp_index);
    state.stats.on_prp_list_page_returned();
    state.non_tagged_in_flight.store(false, core::sync::atomic::Ordering::Relaxed);
    host.complete_non_tagged(Outcome::Success);
    host.notify_next_request();
}

/// Copies `src` into the host's buffer, truncating to whichever is shorter
/// (§4.9 "populate either the direct-SCSI 4 KiB payload or the IOCTL
/// envelope").
///
/// # Safety
/// `virt`/`len` must describe a pinned, exclusively-owned host buffer for
/// the duration of this call.
unsafe fn copy_into_buffer(virt: usize, len: usize, src: &[u8]) {
    let n = core::cmp::min(len, src.len());
    core::ptr::copy_nonoverlapping(src.as_ptr(), virt as *mut u8, n);
}

/// Normal tagged I/O completion: frees any PRP list page, restores the
/// TRIM-disguised write's first 16 bytes if the tail still matches the
/// pattern, maps the NVMe status to an [`Outcome`], and clears
/// back-pressure if the driver had set it (§4.7, §4.9, §8 scenario 6).
fn on_io_completion(host: &dyn HostPort, state: &mut DeviceState, tag: u8, cqe: &CompletionQueueEntry) {
    let shadow = match state.take_shadow(cqe.cid) {
        Some(s) => s,
        None => {
            warn!("completion for untracked CID {:#06x} (tag {}); dropping defensively", cqe.cid, tag);
            return;
        }
    };

    if shadow.prp_list_page != prp::NONE {
        state.prp.free(shadow.prp_list_page);
        state.stats.on_prp_list_page_returned();
    }

    if !cqe.is_error() {
        let (buf_virt, buf_len) = host.buffer_for_tag(tag);
        if buf_len >= PAGE_SIZE {
            // SAFETY: the tagged request's buffer is pinned DMA memory,
            // exclusively owned by this completion for the duration of the
            // check/restore below.
            let buf = unsafe { core::slice::from_raw_parts(buf_virt as *const u8, PAGE_SIZE) };
            if state.trim.tail_matches(buf) {
                let original = state.trim.pattern_bytes(0..16);
                // SAFETY: same buffer, at least 16 bytes since it spans a
                // full page.
                unsafe {
                    core::ptr::copy_nonoverlapping(original.as_ptr(), buf_virt as *mut u8, 16);
                }
            }
        }
    }

    let outcome = if cqe.is_error() {
        Outcome::Failed(device_protocol_error(cqe))
    } else {
        Outcome::Success
    };

    state.stats.on_complete();
    host.complete_tagged(tag, outcome);

    if state.take_busy() {
        host.notify_next_request();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arena::Arena;
    use crate::host::tests::{FakeDma, FakeHostPort};
    use crate::prp::PrpPagePool;
    use crate::queues::{QueueId as Qid, QueuePair};
    use crate::reg::RegisterWindow;
    use crate::state::{LockPolicy, RequestShadow};
    use alloc::vec;

    /// Builds a completion entry for dispatch tests without naming the
    /// ring's reserved dword.
    fn cqe(cid: u16, status: u16) -> CompletionQueueEntry {
        CompletionQueueEntry {
            cid,
            status,
            ..Default::default()
        }
    }

    fn device(queue_size: u16) -> (vec::Vec<u8>, FakeDma, DeviceState) {
        let mut bar = vec![0u8; 0x2000];
        bar[0..8].copy_from_slice(&0u64.to_le_bytes());
        let reg = unsafe { RegisterWindow::new(bar.as_mut_ptr() as usize) };
        let dma = FakeDma::new(64 * PAGE_SIZE);
        let mut arena = Arena::new(&dma, 4).unwrap();
        let admin_sq = arena.take_pages(1).unwrap();
        let admin_cq = arena.take_pages(1).unwrap();
        let io_sq = arena.take_pages(1).unwrap();
        let io_cq = arena.take_pages(1).unwrap();
        let prp = PrpPagePool::new(&mut arena, 4).unwrap();
        let admin = QueuePair::new(Qid::Admin, admin_sq, admin_cq, queue_size);
        let io = QueuePair::new(Qid::Io, io_sq, io_cq, queue_size);
        let mut state = DeviceState::new(reg, arena, admin, io, prp, LockPolicy::default());
        state.namespace_block_size = 512;
        (bar, dma, state)
    }

    #[test]
    fn untracked_cid_is_dropped_defensively_without_panicking() {
        let (_bar, _dma, mut state) = device(64);
        let host = FakeHostPort::new();
        host.set_buffer_for_tag(5, 0x1000, 4096);
        let entry = cqe(cid::build_tagged(5), 0);
        on_io_completion(&host, &mut state, 5, &entry);
        assert!(host.completions.lock().is_empty());
    }

    #[test]
    fn io_completion_frees_prp_list_page_and_completes_tag() {
        let (_bar, _dma, mut state) = device(64);
        let host = FakeHostPort::new();
        host.set_buffer_for_tag(2, 0x2000, 512);
        let page = state.prp.allocate();
        state.record_shadow(cid::build_tagged(2), RequestShadow { prp_list_page: page });
        state.stats.on_prp_list_page_taken();

        let entry = cqe(cid::build_tagged(2), 0);
        on_io_completion(&host, &mut state, 2, &entry);

        assert!(state.prp.is_empty());
        let completions = host.completions.lock();
        assert_eq!(completions.len(), 1);
        assert_eq!(
            completions[0],
            crate::host::tests::Completion::Tagged(2, Outcome::Success)
        );
    }

    #[test]
    fn io_completion_maps_error_status_to_device_protocol_outcome() {
        let (_bar, _dma, mut state) = device(64);
        let host = FakeHostPort::new();
        host.set_buffer_for_tag(1, 0x3000, 512);
        state.record_shadow(cid::build_tagged(1), RequestShadow::NONE);

        let mut status: u16 = 0;
        status |= (0x05u16) << 1; // status code 0x05
        status |= (0x01u16) << 9; // status code type 0x01
        let entry = cqe(cid::build_tagged(1), status);
        on_io_completion(&host, &mut state, 1, &entry);

        let completions = host.completions.lock();
        match completions[0] {
            crate::host::tests::Completion::Tagged(1, Outcome::Failed(Error::DeviceProtocol { nvme_status, .. })) => {
                assert_eq!(nvme_status, ((0x01u16) << 8) | 0x05);
            }
            other => panic!("unexpected completion: {:?}", other),
        }
    }

    #[test]
    fn io_completion_restores_trim_disguised_write_header() {
        let (_bar, dma_buf, mut state) = device(64);
        let region = dma_buf.allocate_uncached(PAGE_SIZE).unwrap();
        let mut pattern = [0xCDu8; PAGE_SIZE];
        pattern[0] = 0xAA;
        state.trim.enable(&pattern);

        // the buffer now looks like what rw::submit leaves behind: pattern
        // tail intact, first 16 bytes overwritten with a DSM descriptor.
        unsafe {
            core::ptr::copy_nonoverlapping(pattern.as_ptr(), region.virt as *mut u8, PAGE_SIZE);
            core::ptr::write_bytes(region.virt as *mut u8, 0, 16);
        }

        let host = FakeHostPort::new();
        host.set_buffer_for_tag(9, region.virt, PAGE_SIZE);
        state.record_shadow(cid::build_tagged(9), RequestShadow::NONE);

        let entry = cqe(cid::build_tagged(9), 0);
        on_io_completion(&host, &mut state, 9, &entry);

        let restored = unsafe { core::slice::from_raw_parts(region.virt as *const u8, 16) };
        assert_eq!(restored, &pattern[..16]);
    }

    #[test]
    fn busy_flag_clears_and_notifies_on_next_completion() {
        let (_bar, _dma, mut state) = device(64);
        let host = FakeHostPort::new();
        host.set_buffer_for_tag(0, 0x4000, 512);
        state.mark_busy();
        state.record_shadow(cid::build_tagged(0), RequestShadow::NONE);

        let entry = cqe(cid::build_tagged(0), 0);
        on_io_completion(&host, &mut state, 0, &entry);

        assert_eq!(*host.next_request_notifications.lock(), 1);
    }

    #[test]
    fn init_chain_drives_create_io_cq_then_create_io_sq() {
        let (_bar, _dma, mut state) = device(64);
        let host = FakeHostPort::new();
        start_identify_chain(&host, &mut state).unwrap();
        assert_eq!(state.admin.sq.tail, 1);

        let entry = cqe(cid::admin::CREATE_IO_CQ, 0);
        on_init_completion(&host, &mut state, cid::admin::CREATE_IO_CQ, &entry).unwrap();
        assert_eq!(state.admin.sq.tail, 2);
        assert!(!state.is_init_complete());
    }

    #[test]
    fn init_chain_completes_after_identify_namespace() {
        let (_bar, _dma, mut state) = device(64);
        let host = FakeHostPort::new();

        let ns_virt = state.prp.virt_of(UTILITY_PAGE_INDEX);
        unsafe {
            let ns = &mut *(ns_virt as *mut IdentifyNamespaceResponse);
            *ns = core::mem::zeroed();
            ns.nsze = 0x1000;
            ns.flbas = 0;
        }

        let entry = cqe(cid::admin::IDENTIFY_NAMESPACE, 0);
        on_init_completion(&host, &mut state, cid::admin::IDENTIFY_NAMESPACE, &entry).unwrap();

        assert!(state.is_init_complete());
        assert_eq!(state.namespace_size_blocks, 0x1000);
    }

    #[test]
    fn log_page_completion_routes_to_ata_smart_and_frees_the_page() {
        let (_bar, dma_buf, mut state) = device(64);
        let log_page = state.prp.allocate();
        let smart_virt = state.prp.virt_of(log_page);
        unsafe {
            let smart = &mut *(smart_virt as *mut xlt::NvmeSmartLog);
            *smart = core::mem::zeroed();
        }
        state.set_pending_log(PendingLogResponse::AtaSmartData);

        let region = dma_buf.allocate_uncached(PAGE_SIZE).unwrap();
        let host = FakeHostPort::new();
        host.set_non_tagged_buffer(region.virt, 512);
        let log_cid = cid::build_get_log_page(log_page);
        state.record_shadow(log_cid, RequestShadow::NONE);

        let entry = cqe(log_cid, 0);
        on_log_page_completion(&host, &mut state, log_page, &entry);

        assert!(state.prp.is_empty());
        let completions = host.completions.lock();
        assert_eq!(
            completions[0],
            crate::host::tests::Completion::NonTagged(Outcome::Success)
        );
        let written = unsafe { core::slice::from_raw_parts(region.virt as *const u8, 2) };
        assert_eq!(u16::from_le_bytes([written[0], written[1]]), 1); // ATA_SMART_DATA version
    }

    #[test]
    fn drain_ignores_empty_rings() {
        let (_bar, _dma, mut state) = device(64);
        let host = FakeHostPort::new();
        drain(&host, &mut state);
        assert_eq!(*host.next_request_notifications.lock(), 0);
    }

    /// Writes one raw completion entry into `cq`'s backing memory at its
    /// current ring index, with the given phase.
    fn write_raw_completion(cq: &crate::queues::CompletionQueue, addr: usize, sq_head: u16, cid: u16, phase: bool) {
        let idx = cq.ring_index() as usize;
        let slot = (addr + idx * 16) as *mut u32;
        unsafe {
            core::ptr::write(slot, 0); // dw0
            core::ptr::write(slot.add(1), 0); // reserved
            core::ptr::write(slot.add(2), sq_head as u32); // sq_head | sq_id(0)<<16
            core::ptr::write(slot.add(3), (cid as u32) | ((phase as u32) << 16));
        }
    }

    #[test]
    fn drain_mirrors_sq_head_so_the_ring_can_wrap() {
        // §4.2: "copy sqhead = SQHead into the mirror" -- without this the
        // submission ring would report full forever after its first wrap,
        // since nothing else ever advances `SubmissionQueue::head`.
        let (_bar, _dma, mut state) = device(4);
        // `phys` and the ring's internal `addr` are numerically identical
        // here since `FakeDma` hands out virt == phys regions.
        let io_cq_addr = state.io.cq.phys as usize;

        let host = FakeHostPort::new();
        host.set_buffer_for_tag(1, 0x9000, 512);
        state.record_shadow(cid::build_tagged(1), RequestShadow::NONE);

        write_raw_completion(&state.io.cq, io_cq_addr, 3, cid::build_tagged(1), true);
        drain(&host, &mut state);

        assert_eq!(state.io.sq.head, 3);
    }
}
