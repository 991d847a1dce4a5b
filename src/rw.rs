//! Read/write path (RW): CDB decode, TRIM-pattern shortcut, ordered-tag
//! prologue, and NVMe Read/Write/Dataset-Management command emission
//! (spec §2 item 8, §4.7).
//!
//! Grounded on `examples/original_source/nvme2k_scsi.c`'s
//! `ScsiHandleReadWrite` (CDB decode, transfer validation) and
//! `nvme2k_nvme.c`'s `NvmeBuildReadWriteCommand` (TRIM detection → DSM
//! conversion, ordered-tag Flush prologue, command emission).

use crate::arena::PAGE_SIZE;
use crate::cid;
use crate::error::{Error, Result};
use crate::host::HostPort;
use crate::opcodes::NvmOpcode;
use crate::prp;
use crate::queues::SubmissionQueueEntry;
use crate::sg;
use crate::state::{DeviceState, RequestShadow};

/// Transfer direction decoded from the CDB's group/opcode (§4.7).
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Direction {
    Read,
    Write,
}

/// Host tag-queuing discipline for this request (§4.7 "Ordered tag
/// prologue").
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum TagType {
    Simple,
    Ordered,
}

/// The result of decoding a 6- or 10-byte CDB (§4.7).
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct DecodedCdb {
    pub lba: u64,
    pub blocks: u32,
    pub direction: Direction,
}

/// Decodes a 6-byte READ(6)/WRITE(6) CDB. A zero block count means 256
/// blocks, per the SCSI standard (§4.7, §8 boundary behavior, §9 open
/// question "Read-6/Write-6 zero-count = 256").
pub fn decode_cdb6(cdb: &[u8; 6], direction: Direction) -> DecodedCdb {
    let lba = (((cdb[1] & 0x1F) as u32) << 16) | ((cdb[2] as u32) << 8) | (cdb[3] as u32);
    let blocks = if cdb[4] == 0 { 256 } else { cdb[4] as u32 };
    DecodedCdb {
        lba: lba as u64,
        blocks,
        direction,
    }
}

/// Decodes a 10-byte READ(10)/WRITE(10) CDB (§4.7).
pub fn decode_cdb10(cdb: &[u8; 10], direction: Direction) -> DecodedCdb {
    let lba = u32::from_be_bytes([cdb[2], cdb[3], cdb[4], cdb[5]]);
    let blocks = u16::from_be_bytes([cdb[7], cdb[8]]) as u32;
    DecodedCdb {
        lba: lba as u64,
        blocks,
        direction,
    }
}

/// A decoded read/write request ready to submit, bound to a tagged host
/// queue slot and its DMA buffer (§3 "RequestShadow", §4.7).
#[derive(Clone, Copy, Debug)]
pub struct ReadWriteRequest {
    pub queue_tag: u8,
    pub tag_type: TagType,
    pub lba: u64,
    pub blocks: u32,
    pub direction: Direction,
    pub buffer_virt: usize,
    pub buffer_len: usize,
}

impl ReadWriteRequest {
    pub fn cid(&self) -> u16 {
        cid::build_tagged(self.queue_tag)
    }
}

/// Validates transfer size against the buffer and `MaxTransferSizeBytes`
/// (§4.7 "Validate"), returning the transfer size in bytes on success.
fn validate(state: &DeviceState, req: &ReadWriteRequest) -> Result<u32> {
    let transfer_bytes = req
        .blocks
        .checked_mul(state.namespace_block_size)
        .ok_or(Error::InvalidRequest)?;
    if transfer_bytes as usize > req.buffer_len {
        return Err(Error::InvalidRequest);
    }
    if transfer_bytes as usize > state.max_transfer_size_bytes {
        return Err(Error::InvalidRequest);
    }
    Ok(transfer_bytes)
}

/// Builds the bare Flush submitted ahead of an ordered tagged request
/// (§4.7 "Ordered tag prologue"). Produces no host-visible completion;
/// CPL acknowledges it silently.
pub fn build_ordered_flush_prologue(queue_tag: u8) -> SubmissionQueueEntry {
    SubmissionQueueEntry::new(
        NvmOpcode::Flush as u8,
        cid::build_ordered_flush(queue_tag),
        1,
    )
}

/// Writes the 16-byte Dataset Management range descriptor `{context=0,
/// length=blocks, starting LBA}` into the first 16 bytes of the host
/// buffer at `buffer_virt` (§4.7 "TRIM shortcut").
///
/// # Safety
/// `buffer_virt` must point at a pinned DMA buffer at least 16 bytes long,
/// with no concurrent access.
unsafe fn write_dsm_range(buffer_virt: usize, lba: u64, blocks: u32) {
    let dst = buffer_virt as *mut u8;
    core::ptr::write_unaligned(dst as *mut u32, 0); // context attributes
    core::ptr::write_unaligned(dst.add(4) as *mut u32, blocks);
    core::ptr::write_unaligned(dst.add(8) as *mut u64, lba);
}

/// Builds the Dataset Management (deallocate) command a pattern-matching
/// TRIM write is converted into (§4.7). `range_phys` is the physical
/// address of the 16-byte range descriptor already written into the host
/// buffer by [`write_dsm_range`].
pub fn build_dataset_management(cid: u16, range_phys: u64) -> SubmissionQueueEntry {
    let mut sqe = SubmissionQueueEntry::new(NvmOpcode::DatasetManagement as u8, cid, 1);
    sqe.set_prp(range_phys, 0);
    sqe.cdw10 = 0; // NR - 1 = 0: one range descriptor
    sqe.cdw11 = 0b100; // AD (deallocate)
    sqe
}

/// Builds a standard Read or Write command with the supplied scatter/gather
/// result (§4.7 "Otherwise build a standard Read/Write command").
pub fn build_read_write(cid: u16, direction: Direction, lba: u64, blocks: u32, sg: sg::ScatterGather) -> SubmissionQueueEntry {
    let opcode = match direction {
        Direction::Read => NvmOpcode::Read,
        Direction::Write => NvmOpcode::Write,
    };
    let mut sqe = SubmissionQueueEntry::new(opcode as u8, cid, 1);
    sqe.set_prp(sg.prp1, sg.prp2);
    sqe.cdw10 = (lba & 0xFFFF_FFFF) as u32;
    sqe.cdw11 = (lba >> 32) as u32;
    sqe.cdw12 = blocks.saturating_sub(1) & 0xFFFF;
    sqe
}

/// Submits a decoded read/write request end to end: validates the
/// transfer, emits an ordered-flush prologue if required, recognises the
/// TRIM pattern-match shortcut, otherwise builds PRP1/PRP2(/list) and a
/// normal Read/Write command, and submits to the I/O queue (§4.7).
///
/// On submission failure any PRP list page allocated for this request is
/// freed and the shadow entry removed before the error is returned, so the
/// host port can safely re-present the request later.
pub fn submit(host: &dyn HostPort, state: &mut DeviceState, req: ReadWriteRequest) -> Result<()> {
    let transfer_bytes = match validate(state, &req) {
        Ok(bytes) => bytes,
        Err(e) => {
            state.stats.on_rejected();
            return Err(e);
        }
    };

    if req.tag_type == TagType::Ordered {
        let flush = build_ordered_flush_prologue(req.queue_tag);
        if let Err(e) = state.submit_io(host, &flush) {
            mark_busy_if_transient(state, &e);
            return Err(e);
        }
    }

    let cid = req.cid();

    if req.direction == Direction::Write && state.trim.is_enabled() && req.buffer_len >= PAGE_SIZE {
        // SAFETY: buffer_virt/buffer_len describe the host's pinned DMA
        // buffer for the duration of this call.
        let buf = unsafe { core::slice::from_raw_parts(req.buffer_virt as *const u8, PAGE_SIZE) };
        if state.trim.matches(buf) {
            let range_phys = host.virt_to_phys(req.buffer_virt);
            // SAFETY: same buffer, known to be >= 16 bytes since it is a
            // full page.
            unsafe { write_dsm_range(req.buffer_virt, req.lba, req.blocks) };
            let sqe = build_dataset_management(cid, range_phys);
            state.record_shadow(cid, RequestShadow::NONE);
            return match state.submit_io(host, &sqe) {
                Ok(()) => Ok(()),
                Err(e) => {
                    state.take_shadow(cid);
                    mark_busy_if_transient(state, &e);
                    Err(e)
                }
            };
        }
    }

    let scatter = match sg::build(host, &mut state.prp, req.buffer_virt, transfer_bytes as usize) {
        Ok(scatter) => scatter,
        Err(e) => {
            mark_busy_if_transient(state, &e);
            return Err(e);
        }
    };
    state.record_shadow(
        cid,
        RequestShadow {
            prp_list_page: scatter.list_page,
        },
    );
    if scatter.list_page != prp::NONE {
        state.stats.on_prp_list_page_taken();
    }

    let sqe = build_read_write(cid, req.direction, req.lba, req.blocks, scatter);
    match state.submit_io(host, &sqe) {
        Ok(()) => {
            match req.direction {
                Direction::Read => state.stats.on_read(transfer_bytes),
                Direction::Write => state.stats.on_write(transfer_bytes),
            }
            Ok(())
        }
        Err(e) => {
            state.take_shadow(cid);
            if scatter.list_page != prp::NONE {
                state.prp.free(scatter.list_page);
                state.stats.on_prp_list_page_returned();
            }
            mark_busy_if_transient(state, &e);
            Err(e)
        }
    }
}

/// Remembers that back-pressure happened, so the next I/O completion knows
/// to notify the host port once a slot frees up (§4.9, §8 scenario 6).
fn mark_busy_if_transient(state: &DeviceState, e: &Error) {
    if *e == Error::ResourceTransient {
        state.mark_busy();
    }
}
