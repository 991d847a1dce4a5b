//! Controller lifecycle (LIFE): sanitize → enable → identify → create I/O
//! queues → enable interrupts → shutdown (spec §2 item 6, §3 "Lifecycles",
//! §4.5).
//!
//! Grounded on `examples/ethindp-kernel/libk/src/nvme/mod.rs`'s `NVMeController::init` (the
//! `'nvme_init` retry loop, AQA/ASQ/ACQ clamping, CC field assembly, the
//! CSTS.RDY poll) and `examples/original_source/nvme2k_nvme.c`'s
//! `NvmeWaitForReady` / `NvmeShutdownController`, reworked into the
//! decoupled "configure, then poll" shape this crate's tests rely on: the
//! register writes that start a state transition are separated from the
//! bounded poll that waits for the controller to reflect it, since spec §5
//! says every wait here is a plain busy poll with no suspension.

use bit_field::BitField;
use dia_semver::Semver;

use crate::arena::{Arena, PAGE_SIZE};
use crate::cid::admin as admin_cid;
use crate::error::{Error, LifecycleError, Result};
use crate::host::{DmaAllocator, HostPort};
use crate::opcodes::{cns, AdminOpcode};
use crate::prp::PrpPagePool;
use crate::queues::{QueueId, QueuePair, SubmissionQueueEntry};
use crate::reg::{Cc, Csts, RegisterWindow};
use crate::state::{DeviceState, LockPolicy};
use crate::structs::{IdentifyControllerResponse, IdentifyNamespaceResponse};

/// Abort enable after this many fatal (`CSTS.CFS`) resets, per the
/// supplemented retry policy grounded in the teacher's `'nvme_init` loop
/// (SPEC_FULL.md §C).
pub const MAX_ENABLE_RETRIES: u32 = 3;

/// PRP pool page reserved for Identify Controller/Namespace transfers while
/// the queue-creation/identify chain is still running. Nothing else
/// allocates from the pool before `DeviceState::is_init_complete`, so the
/// same page is simply handed to the general allocator afterward (§3
/// "utility buffer").
pub const UTILITY_PAGE_INDEX: u8 = 0;

const SANITIZE_RDY_CLEAR_RETRIES: u32 = 5;
const ENABLE_READY_TIMEOUT_ITERS: u32 = 5000; // 5s at 1ms/iter
const SHUTDOWN_COMPLETE_TIMEOUT_ITERS: u32 = 5000;
const QUEUE_DELETE_TIMEOUT_ITERS: u32 = 1000;

/// Masks interrupts, clears the admin queue registers, and disables the
/// controller, retrying the RDY=0 wait up to `SANITIZE_RDY_CLEAR_RETRIES`
/// times before forcing `CC = 0` on the last attempt (§4.5 "Sanitize").
pub fn sanitize(reg: &RegisterWindow, stall: impl Fn()) {
    reg.mask_all_interrupts();
    reg.clear_admin_queue_registers();
    reg.set_cc(0);
    for attempt in 0..SANITIZE_RDY_CLEAR_RETRIES {
        if !reg.csts().contains(Csts::RDY) {
            break;
        }
        if attempt + 1 == SANITIZE_RDY_CLEAR_RETRIES {
            reg.set_cc(0);
        }
        stall();
    }
    // some emulated controllers clear INTMS on reset; reassert it.
    reg.mask_all_interrupts();
}

/// Queue sizing derived from CAP.MQES, clamped to one page's worth of
/// 64-byte submission entries (§4.5 "Enable").
pub fn clamp_queue_size(mqes: u16) -> u16 {
    let page_entries = (PAGE_SIZE / 64) as u16;
    let mqes_entries = mqes.saturating_add(1);
    let size = core::cmp::min(page_entries, mqes_entries);
    // must be a power of two per §3 invariant
    let mut pow2 = 1u16;
    while pow2 * 2 <= size {
        pow2 *= 2;
    }
    pow2
}

/// Everything `enable` needs to hand back to the caller before the
/// identify/queue-creation chain can run: a constructed `DeviceState` whose
/// admin queue pair is ready to carry commands, and the queue size that was
/// actually used for both admin and (later) I/O queues.
pub struct Enabled {
    pub state: DeviceState,
    pub queue_size: u16,
}

/// Carves the arena, programs AQA/ASQ/ACQ, and writes `CC` with `EN=1`
/// (§4.5 "Enable"). Does not wait for `CSTS.RDY`; call [`await_ready`]
/// next. On arena exhaustion the caller should retry with a smaller PRP
/// pool size (§4.1).
pub fn configure_and_start(
    reg: RegisterWindow,
    dma: &dyn DmaAllocator,
    prp_pool_pages: usize,
    lock_policy: LockPolicy,
) -> Result<Enabled> {
    let mqes = reg.mqes();
    let queue_size = clamp_queue_size(mqes);

    let mut arena = Arena::new(dma, prp_pool_pages)?;
    let admin_sq = arena.take_pages(1)?;
    let io_sq = arena.take_pages(1)?;
    let prp = PrpPagePool::new(&mut arena, prp_pool_pages)?;
    let admin_cq = arena.take_pages(1)?;
    let io_cq = arena.take_pages(1)?;

    reg.set_aqa(queue_size - 1, queue_size - 1);
    reg.set_asq(admin_sq.phys);
    reg.set_acq(admin_cq.phys);

    let mut cc = (Cc::EN | Cc::CSS_NVM).bits();
    cc.set_bits(7..11, (PAGE_SIZE.trailing_zeros() - 12) as u32); // MPS
    cc.set_bits(11..14, 0); // AMS = round robin
    cc.set_bits(16..20, 6); // IOSQES = 64 bytes = 2^6
    cc.set_bits(20..24, 4); // IOCQES = 16 bytes = 2^4
    reg.set_cc(cc);

    let admin = QueuePair::new(QueueId::Admin, admin_sq, admin_cq, queue_size);
    let io = QueuePair::new(QueueId::Io, io_sq, io_cq, queue_size);

    let state = DeviceState::new(reg, arena, admin, io, prp, lock_policy);
    Ok(Enabled { state, queue_size })
}

/// Runs [`sanitize`], then [`configure_and_start`] + [`await_ready`], up to
/// [`MAX_ENABLE_RETRIES`] times (§4.1 "Allocations fail the enable path...the
/// driver then retries with a smaller PRP-pool count"; SPEC_FULL.md §C's
/// supplemented retry-on-`CSTS.CFS` policy grounded in the teacher's
/// `'nvme_init` loop). Arena exhaustion halves `prp_pool_pages` and retries
/// immediately; a fatal reset (`CSTS.CFS`) re-sanitizes the controller before
/// retrying with the same pool size. Any other failure aborts immediately.
pub fn enable(
    reg: RegisterWindow,
    dma: &dyn DmaAllocator,
    prp_pool_pages: usize,
    lock_policy: LockPolicy,
    ready_timeout_iters: u32,
    stall: impl Fn(),
) -> Result<Enabled> {
    sanitize(&reg, &stall);

    let mut pages = prp_pool_pages;
    let mut last_err = Error::Lifecycle(LifecycleError::ControllerNotReady);
    for _ in 0..MAX_ENABLE_RETRIES {
        match configure_and_start(reg, dma, pages, lock_policy) {
            Ok(enabled) => match await_ready(&enabled.state.reg, ready_timeout_iters, &stall) {
                Ok(()) => return Ok(enabled),
                Err(e) => {
                    last_err = e;
                    sanitize(&reg, &stall);
                }
            },
            Err(Error::Lifecycle(LifecycleError::ArenaAllocationFailed)) if pages > 1 => {
                last_err = Error::Lifecycle(LifecycleError::ArenaAllocationFailed);
                pages /= 2;
            }
            Err(e) => return Err(e),
        }
    }
    Err(last_err)
}

/// Polls `CSTS.RDY` until set or the 5-second budget (`max_iters` calls to
/// `stall`) expires (§4.5).
pub fn await_ready(reg: &RegisterWindow, max_iters: u32, stall: impl Fn()) -> Result<()> {
    for _ in 0..max_iters {
        let csts = reg.csts();
        if csts.contains(Csts::RDY) {
            return Ok(());
        }
        if csts.contains(Csts::CFS) {
            return Err(Error::Lifecycle(LifecycleError::ControllerNotReady));
        }
        stall();
    }
    Err(Error::Lifecycle(LifecycleError::ControllerNotReady))
}

/// Decodes the VS register into a semantic version, the way
/// `examples/ethindp-kernel/libk/src/nvme/mod.rs` does via `dia_semver::Semver`.
pub fn controller_version(reg: &RegisterWindow) -> Semver {
    let vs = reg.read32(crate::reg::offset::VS);
    Semver::new(
        vs.get_bits(16..32) as u64,
        vs.get_bits(8..16) as u64,
        vs.get_bits(0..8) as u64,
    )
}

/// Builds the Create I/O Completion Queue admin command (§4.5, CDW10/11
/// packing grounded on `nvme2k_nvme.c`'s `NvmeCreateIoCQ`).
pub fn build_create_io_cq(queue_phys: u64, queue_size: u16) -> SubmissionQueueEntry {
    let mut sqe = SubmissionQueueEntry::new(
        AdminOpcode::CreateIoCompletionQueue as u8,
        admin_cid::CREATE_IO_CQ,
        0,
    );
    sqe.prp1 = queue_phys;
    let mut cdw10 = 0u32;
    cdw10.set_bits(0..16, QueueId::Io as u32);
    cdw10.set_bits(16..32, (queue_size - 1) as u32);
    sqe.cdw10 = cdw10;
    sqe.cdw11 = 0b11; // PC=1 (physically contiguous), IEN=1 (interrupts enabled)
    sqe
}

/// Builds the Create I/O Submission Queue admin command (§4.5).
pub fn build_create_io_sq(queue_phys: u64, queue_size: u16) -> SubmissionQueueEntry {
    let mut sqe = SubmissionQueueEntry::new(AdminOpcode::CreateIoSubmissionQueue as u8, admin_cid::CREATE_IO_SQ, 0);
    sqe.prp1 = queue_phys;
    let mut cdw10 = 0u32;
    cdw10.set_bits(0..16, QueueId::Io as u32);
    cdw10.set_bits(16..32, (queue_size - 1) as u32);
    sqe.cdw10 = cdw10;
    let mut cdw11 = 0u32;
    cdw11.set_bit(0, true); // PC=1
    cdw11.set_bits(16..32, QueueId::Io as u32); // CQID
    sqe.cdw11 = cdw11;
    sqe
}

/// Builds the Identify Controller admin command (CNS=1) targeting the
/// utility buffer at `buffer_phys` (§4.5).
pub fn build_identify_controller(buffer_phys: u64) -> SubmissionQueueEntry {
    let mut sqe = SubmissionQueueEntry::new(AdminOpcode::Identify as u8, admin_cid::IDENTIFY_CONTROLLER, 0);
    sqe.prp1 = buffer_phys;
    sqe.cdw10 = cns::CONTROLLER;
    sqe
}

/// Builds the Identify Namespace admin command (CNS=0, NSID=1) (§4.5).
pub fn build_identify_namespace(buffer_phys: u64) -> SubmissionQueueEntry {
    let mut sqe = SubmissionQueueEntry::new(AdminOpcode::Identify as u8, admin_cid::IDENTIFY_NAMESPACE, 1);
    sqe.prp1 = buffer_phys;
    sqe.cdw10 = cns::NAMESPACE;
    sqe
}

/// Applies a successful Identify Controller response to `state` (§4.5
/// "extract and trim serial/model/firmware ASCII...").
pub fn apply_identify_controller(state: &mut DeviceState, resp: &IdentifyControllerResponse) {
    state.ident.serial = resp.sn;
    state.ident.model = resp.mn;
    state.ident.firmware = resp.fr;
    state.max_transfer_size_bytes = resp.max_transfer_size_bytes(PAGE_SIZE);
}

/// Applies a successful Identify Namespace response to `state` (§4.5).
pub fn apply_identify_namespace(state: &mut DeviceState, resp: &IdentifyNamespaceResponse) {
    state.namespace_size_blocks = resp.nsze;
    state.namespace_block_size = resp.block_size();
}

/// Clears the PCI interrupt-disable bit and unmasks vector 0 (§4.5 "Enable
/// interrupts").
pub fn enable_interrupts(reg: &RegisterWindow, host: &dyn HostPort) {
    const PCI_COMMAND_OFFSET: u8 = 0x04;
    const PCI_INTERRUPT_DISABLE: u32 = 0x0400;
    let cmd = host.pci_config_read32(PCI_COMMAND_OFFSET);
    host.pci_config_write32(PCI_COMMAND_OFFSET, cmd & !PCI_INTERRUPT_DISABLE);
    reg.unmask_vector0();
}

/// Result of [`shutdown`]'s best-effort queue-deletion phase.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ShutdownOutcome {
    Clean,
    /// One or both queue deletions, or the SHST poll, timed out; state was
    /// still reset regardless (§4.5, §7.5 "best-effort during shutdown").
    TimedOut,
}

/// Masks interrupts, deletes the I/O queues if the controller is ready,
/// requests a normal shutdown, disables the controller, and resets software
/// queue state so a subsequent enable again expects phase 1 (§4.5
/// "Shutdown").
///
/// This function only performs the register/ring bookkeeping; the caller is
/// responsible for submitting/polling the two delete-queue admin commands
/// (via [`build_delete_io_sq`]/[`build_delete_io_cq`]) before calling
/// [`finish_shutdown`].
pub fn begin_shutdown(reg: &RegisterWindow) -> bool {
    reg.mask_all_interrupts();
    reg.csts().contains(Csts::RDY)
}

pub fn build_delete_io_sq() -> SubmissionQueueEntry {
    let mut sqe = SubmissionQueueEntry::new(AdminOpcode::DeleteIoSubmissionQueue as u8, admin_cid::DELETE_IO_SQ, 0);
    sqe.cdw10 = QueueId::Io as u32;
    sqe
}

pub fn build_delete_io_cq() -> SubmissionQueueEntry {
    let mut sqe = SubmissionQueueEntry::new(AdminOpcode::DeleteIoCompletionQueue as u8, admin_cid::DELETE_IO_CQ, 0);
    sqe.cdw10 = QueueId::Io as u32;
    sqe
}

/// Requests shutdown, waits for `CSTS.SHST` to report complete, disables
/// the controller, clears AQA/ASQ/ACQ, and resets both queue pairs to their
/// first-enable state (§4.5).
pub fn finish_shutdown(
    reg: &RegisterWindow,
    admin: &mut QueuePair,
    io: &mut QueuePair,
    max_iters: u32,
    stall: impl Fn(),
) -> ShutdownOutcome {
    let mut cc = reg.cc() & !Cc::SHN_MASK.bits();
    cc |= Cc::SHN_NORMAL.bits();
    reg.set_cc(cc);

    let mut timed_out = false;
    let mut complete = false;
    for _ in 0..max_iters {
        if reg.csts().contains(Csts::SHST_COMPLETE) {
            complete = true;
            break;
        }
        stall();
    }
    if !complete {
        timed_out = true;
    }

    let cc = reg.cc() & !Cc::EN.bits();
    reg.set_cc(cc);

    let mut disabled = false;
    for _ in 0..max_iters {
        if !reg.csts().contains(Csts::RDY) {
            disabled = true;
            break;
        }
        stall();
    }
    if !disabled {
        timed_out = true;
    }

    reg.clear_admin_queue_registers();
    admin.reset();
    io.reset();

    if timed_out {
        ShutdownOutcome::TimedOut
    } else {
        ShutdownOutcome::Clean
    }
}

/// Runs the full shutdown sequence end to end: [`begin_shutdown`], then (if
/// the controller was ready) submits [`build_delete_io_sq`] and
/// [`build_delete_io_cq`], polling each completion via
/// [`crate::cpl::poll_for_admin_cid`], then [`finish_shutdown`] (§4.5
/// "Shutdown"). Queue deletion is best-effort: a submission failure or a
/// completion that never arrives still falls through to `finish_shutdown`,
/// which resets software state unconditionally.
pub fn shutdown(host: &dyn HostPort, state: &mut DeviceState, stall: impl Fn()) -> ShutdownOutcome {
    let was_ready = begin_shutdown(&state.reg);

    if was_ready {
        if state.submit_admin(host, &build_delete_io_sq()).is_ok() {
            crate::cpl::poll_for_admin_cid(
                &state.reg,
                &mut state.admin.sq,
                &mut state.admin.cq,
                admin_cid::DELETE_IO_SQ,
                QUEUE_DELETE_TIMEOUT_ITERS,
                &stall,
            );
        }
        if state.submit_admin(host, &build_delete_io_cq()).is_ok() {
            crate::cpl::poll_for_admin_cid(
                &state.reg,
                &mut state.admin.sq,
                &mut state.admin.cq,
                admin_cid::DELETE_IO_CQ,
                QUEUE_DELETE_TIMEOUT_ITERS,
                &stall,
            );
        }
    }

    finish_shutdown(
        &state.reg,
        &mut state.admin,
        &mut state.io,
        SHUTDOWN_COMPLETE_TIMEOUT_ITERS,
        &stall,
    )
}
