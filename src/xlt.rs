//! SCSI↔NVMe translation layer (XLT): INQUIRY, READ CAPACITY(10), MODE
//! SENSE(6/10), LOG SENSE, SYNCHRONIZE CACHE, SAT ATA pass-through, the
//! Windows SMART IOCTL family, and the custom NVME2KDB TRIM IOCTLs (spec
//! §2 item 9, §4.8).
//!
//! Grounded on `examples/original_source/nvme2k_scsi.c` (INQUIRY, READ
//! CAPACITY, MODE SENSE 6/10, LOG SENSE, SAT pass-through, the five SMART
//! IOCTL handlers, and `HandleIO_SCSIDISK`) and `scsiext.h` (VPD/mode-page
//! field layouts, `SAT_PASSTHROUGH_16`/`_12`, `NVME_SMART_INFO`,
//! `ATA_SMART_DATA`, `ATA_IDENTIFY_DEVICE_STRUCT`). The byte-array field
//! style of `NVME_SMART_INFO`/`ATA_SMART_DATA` in `scsiext.h` — UCHAR
//! arrays instead of native integers, to sidestep alignment — is kept here
//! too: responses are assembled directly into byte buffers at the offsets
//! those structures document, rather than transmuted through packed
//! `repr(C)` types.

use alloc::vec::Vec;
use bit_field::BitField;
use static_assertions::assert_eq_size;

use crate::cid;
use crate::error::{Error, Result};
use crate::host::HostPort;
use crate::opcodes::AdminOpcode;
use crate::prp;
use crate::queues::SubmissionQueueEntry;
use crate::state::{DeviceState, Identification, PendingLogResponse, RequestShadow};
use core::sync::atomic::Ordering;

/// A 512-byte NVMe SMART/Health Information Log (Log Page 0x02), laid out
/// exactly as `scsiext.h`'s `NVME_SMART_INFO` (§4.8 "LOG SENSE").
#[derive(Clone, Copy)]
#[repr(C)]
pub struct NvmeSmartLog {
    pub critical_warning: u8,
    pub temperature: [u8; 2],
    pub available_spare: u8,
    pub available_spare_threshold: u8,
    pub percentage_used: u8,
    _reserved1: [u8; 26],
    pub data_units_read: [u8; 16],
    pub data_units_written: [u8; 16],
    pub host_read_commands: [u8; 16],
    pub host_write_commands: [u8; 16],
    pub controller_busy_time: [u8; 16],
    pub power_cycles: [u8; 16],
    pub power_on_hours: [u8; 16],
    pub unsafe_shutdowns: [u8; 16],
    pub media_errors: [u8; 16],
    pub num_error_log_entries: [u8; 16],
    pub warning_temp_time: [u8; 4],
    pub critical_temp_time: [u8; 4],
    pub temp_sensors: [u8; 16],
    _reserved2: [u8; 296],
}
assert_eq_size!(NvmeSmartLog, [u8; 512]);

impl NvmeSmartLog {
    pub fn temperature_kelvin(&self) -> u16 {
        u16::from_le_bytes(self.temperature)
    }

    /// Clamped to `u8` for the one byte SCSI/ATA fields below have room
    /// for; real composite temperatures comfortably fit.
    pub fn temperature_celsius(&self) -> u8 {
        self.temperature_kelvin().saturating_sub(273).min(255) as u8
    }

    pub fn power_on_hours(&self) -> u128 {
        le128(&self.power_on_hours)
    }

    pub fn media_errors(&self) -> u128 {
        le128(&self.media_errors)
    }

    pub fn data_units_written(&self) -> u128 {
        le128(&self.data_units_written)
    }

    pub fn data_units_read(&self) -> u128 {
        le128(&self.data_units_read)
    }
}

fn le128(field: &[u8; 16]) -> u128 {
    u128::from_le_bytes(*field)
}

/// Builds the admin Get Log Page command for the SMART/Health Information
/// log (log page 0x02), used by LOG SENSE, SAT SMART, and the SMART IOCTL
/// family alike (§4.8, §4.9).
pub fn build_get_log_page(cid: u16, buffer_phys: u64) -> SubmissionQueueEntry {
    let mut sqe = SubmissionQueueEntry::new(AdminOpcode::GetLogPage as u8, cid, 1);
    sqe.prp1 = buffer_phys;
    let mut cdw10 = 0u32;
    cdw10.set_bits(0..8, 0x02); // LID = SMART/Health Information
    cdw10.set_bits(16..32, 127); // NUMD: 512 bytes / 4 - 1
    sqe.cdw10 = cdw10;
    sqe
}

/// Builds the Flush command SYNCHRONIZE CACHE translates to (§4.8).
pub fn build_flush(cid: u16) -> SubmissionQueueEntry {
    SubmissionQueueEntry::new(crate::opcodes::NvmOpcode::Flush as u8, cid, 1)
}

/// Submits the Get Log Page command that backs LOG SENSE's Informational
/// Exceptions page, SAT SMART READ DATA/LOG, and the SMART IOCTL
/// read-attributes path alike (§4.8, §4.9): allocates a PRP page, records
/// which conversion the completion should apply once the log arrives, and
/// marks the non-tagged slot busy. At most one such request is outstanding
/// at a time (§3 invariant); a second one while the first is still pending
/// is rejected as transient rather than queued.
pub fn submit_log_page(host: &dyn HostPort, state: &mut DeviceState, response: PendingLogResponse) -> Result<()> {
    if state.non_tagged_in_flight.swap(true, Ordering::Relaxed) {
        return Err(Error::ResourceTransient);
    }

    let index = state.prp.allocate();
    if index == prp::NONE {
        state.non_tagged_in_flight.store(false, Ordering::Relaxed);
        return Err(Error::ResourceTransient);
    }

    let log_cid = cid::build_get_log_page(index);
    let sqe = build_get_log_page(log_cid, state.prp.phys_of(index));
    state.set_pending_log(response);
    state.record_shadow(log_cid, RequestShadow::NONE);

    match state.submit_admin(host, &sqe) {
        Ok(()) => Ok(()),
        Err(e) => {
            state.take_shadow(log_cid);
            let _ = state.take_pending_log();
            state.prp.free(index);
            state.non_tagged_in_flight.store(false, Ordering::Relaxed);
            Err(e)
        }
    }
}

/// Submits the Flush command SYNCHRONIZE CACHE translates to, as an
/// ordinary tagged I/O command (§4.8); its completion is dispatched the
/// same way any other tagged command's is, carrying no buffer of its own.
pub fn submit_synchronize_cache(host: &dyn HostPort, state: &mut DeviceState, queue_tag: u8) -> Result<()> {
    let tagged_cid = cid::build_tagged(queue_tag);
    let sqe = build_flush(tagged_cid);
    state.record_shadow(tagged_cid, RequestShadow::NONE);
    match state.submit_io(host, &sqe) {
        Ok(()) => Ok(()),
        Err(e) => {
            state.take_shadow(tagged_cid);
            Err(e)
        }
    }
}

fn trim_leading_spaces(field: &[u8]) -> &[u8] {
    let mut start = 0;
    while start < field.len() && field[start] == b' ' {
        start += 1;
    }
    &field[start..]
}

/// Copies `src` into `dst`, truncating or space-padding as needed (§4.8
/// "Vendor/product strings carved from the NVMe model string").
fn copy_padded(src: &[u8], dst: &mut [u8]) {
    let n = core::cmp::min(src.len(), dst.len());
    dst[..n].copy_from_slice(&src[..n]);
    for b in dst[n..].iter_mut() {
        *b = b' ';
    }
}

/// ATA identification strings are stored as words with the two ASCII
/// bytes of each word byte-swapped (§4.8 IDENTIFY DEVICE "ATA's
/// byte-swapped word layout").
fn copy_padded_ata_swapped(src: &[u8], dst: &mut [u8]) {
    debug_assert_eq!(dst.len() % 2, 0);
    let mut tmp = [0u8; 40];
    let n = core::cmp::min(dst.len(), tmp.len());
    copy_padded(src, &mut tmp[..n]);
    let mut i = 0;
    while i < n {
        dst[i] = tmp[i + 1];
        dst[i + 1] = tmp[i];
        i += 2;
    }
}

pub mod inquiry {
    use super::*;

    /// Standard INQUIRY response (EVPD=0): direct-access block device,
    /// SPC-3, response format 2, command-queuing supported (§4.8).
    pub fn standard(ident: &Identification) -> [u8; 36] {
        let mut buf = [0u8; 36];
        buf[2] = 0x05; // VERSION: SPC-3
        buf[3] = 0x02; // response data format
        buf[4] = 31; // additional length
        buf[7] = 0x02; // CmdQue

        let model = trim_leading_spaces(&ident.model);
        copy_padded(model, &mut buf[8..16]);
        let product = if model.len() > 8 { &model[8..] } else { &[] };
        copy_padded(product, &mut buf[16..32]);
        copy_padded(&ident.firmware[..4], &mut buf[32..36]);
        buf
    }

    /// VPD page 00h: supported VPD pages (§4.8).
    pub fn vpd_00() -> [u8; 8] {
        [0, 0x00, 0, 4, 0x00, 0x80, 0xB0, 0xB1]
    }

    /// VPD page 80h: unit serial number (§4.8).
    pub fn vpd_80(serial: &[u8; 20]) -> [u8; 24] {
        let mut buf = [0u8; 24];
        buf[1] = 0x80;
        buf[2..4].copy_from_slice(&20u16.to_be_bytes());
        buf[4..24].copy_from_slice(serial);
        buf
    }

    /// VPD page B0h: Block Limits. Reports `MaxTransferSizeBytes /
    /// block_size` and an unbounded UNMAP LBA count (§4.8).
    pub fn vpd_b0(max_transfer_blocks: u32) -> [u8; 64] {
        let mut buf = [0u8; 64];
        buf[1] = 0xB0;
        buf[2..4].copy_from_slice(&60u16.to_be_bytes());
        buf[8..12].copy_from_slice(&max_transfer_blocks.to_be_bytes());
        buf[20..24].copy_from_slice(&0xFFFF_FFFFu32.to_be_bytes());
        buf
    }

    /// VPD page B1h: Block Device Characteristics. Medium rotation rate 1
    /// signals non-rotating media (§4.8).
    pub fn vpd_b1() -> [u8; 64] {
        let mut buf = [0u8; 64];
        buf[1] = 0xB1;
        buf[2..4].copy_from_slice(&60u16.to_be_bytes());
        buf[4..6].copy_from_slice(&1u16.to_be_bytes());
        buf
    }
}

/// READ CAPACITY(10): last LBA and block size, both big-endian (§4.8).
pub fn read_capacity10(last_lba: u32, block_size: u32) -> [u8; 8] {
    let mut buf = [0u8; 8];
    buf[0..4].copy_from_slice(&last_lba.to_be_bytes());
    buf[4..8].copy_from_slice(&block_size.to_be_bytes());
    buf
}

pub mod mode_sense {
    use super::*;

    /// The 8-byte block descriptor MODE SENSE prefixes page data with when
    /// DBD=0 (§4.8): density 0, saturated 24-bit block count, block
    /// length.
    pub fn block_descriptor(blocks: u64, block_size: u32) -> [u8; 8] {
        let mut buf = [0u8; 8];
        let count = core::cmp::min(blocks, 0x00FF_FFFF) as u32;
        buf[1..4].copy_from_slice(&count.to_be_bytes()[1..4]);
        buf[5..8].copy_from_slice(&block_size.to_be_bytes()[1..4]);
        buf
    }

    /// Assembles one mode page's bytes (header + body). `changeable`
    /// selects the "changeable values" variant, which is all-zero body
    /// bytes since nothing in this device is changeable (§4.8).
    pub fn page(page_code: u8, changeable: bool, namespace_blocks: u64) -> Vec<u8> {
        let mut buf = match page_code {
            0x03 => format_device(),
            0x04 => rigid_disk_geometry(namespace_blocks),
            0x08 => caching(),
            0x0A => control(),
            0x1A => power_condition(),
            0x1C => informational_exceptions(),
            _ => Vec::new(),
        };
        if changeable && buf.len() > 2 {
            for b in buf[2..].iter_mut() {
                *b = 0;
            }
        }
        buf
    }

    fn format_device() -> Vec<u8> {
        let mut buf = alloc::vec![0u8; 24];
        buf[0] = 0x03;
        buf[1] = 22;
        buf[10..12].copy_from_slice(&63u16.to_be_bytes()); // sectors per track
        buf[20] |= 1 << 5; // soft-sectored
        buf
    }

    fn rigid_disk_geometry(namespace_blocks: u64) -> Vec<u8> {
        const HEADS: u64 = 64;
        const SECTORS_PER_TRACK: u64 = 63;
        let mut buf = alloc::vec![0u8; 24];
        buf[0] = 0x04;
        buf[1] = 22;
        let cylinders = namespace_blocks / (HEADS * SECTORS_PER_TRACK);
        buf[2..5].copy_from_slice(&cylinders.to_be_bytes()[5..8]);
        buf[5] = HEADS as u8;
        buf[20..22].copy_from_slice(&1u16.to_be_bytes()); // medium rotation rate
        buf
    }

    fn caching() -> Vec<u8> {
        let mut buf = alloc::vec![0u8; 20];
        buf[0] = 0x08;
        buf[1] = 18;
        buf[2] = 1 << 2; // WCE
        buf
    }

    fn control() -> Vec<u8> {
        let mut buf = alloc::vec![0u8; 12];
        buf[0] = 0x0A;
        buf[1] = 10;
        buf
    }

    fn power_condition() -> Vec<u8> {
        let mut buf = alloc::vec![0u8; 12];
        buf[0] = 0x1A;
        buf[1] = 10;
        buf
    }

    fn informational_exceptions() -> Vec<u8> {
        let mut buf = alloc::vec![0u8; 12];
        buf[0] = 0x1C;
        buf[1] = 10;
        buf[3] = 0x06; // MRIE = 6, report on request
        buf
    }

    /// All supported pages, in page-code order, for a return-all-pages
    /// request (§4.8 "Return-all page-code concatenates all supported
    /// pages").
    pub fn all_pages(changeable: bool, namespace_blocks: u64) -> Vec<u8> {
        let mut out = Vec::new();
        for code in [0x03u8, 0x04, 0x08, 0x0A, 0x1A, 0x1C] {
            out.extend_from_slice(&page(code, changeable, namespace_blocks));
        }
        out
    }
}

/// The SCSI Informational Exceptions General-Purpose log page (page code
/// 0x2F), the only log page served by LOG SENSE (§4.8).
pub fn informational_exceptions_log(smart: &NvmeSmartLog) -> [u8; 11] {
    let mut buf = [0u8; 11];
    buf[0] = 0x2F;
    buf[2..4].copy_from_slice(&7u16.to_be_bytes());
    buf[7] = 3; // parameter length
    if smart.critical_warning != 0 {
        buf[8] = 0x5D; // ASC: failure prediction threshold exceeded
    }
    buf[10] = smart.temperature_celsius();
    buf
}

/// A 12-byte ATA SMART attribute entry written at a fixed offset inside
/// an `ATA_SMART_DATA` buffer (§4.8, `scsiext.h`'s `ATA_SMART_ATTRIBUTE`).
fn write_attribute(buf: &mut [u8], offset: usize, id: u8, flags: u16, current: u8, worst: u8, raw48: u64) {
    buf[offset] = id;
    buf[offset + 1..offset + 3].copy_from_slice(&flags.to_le_bytes());
    buf[offset + 3] = current;
    buf[offset + 4] = worst;
    buf[offset + 5..offset + 11].copy_from_slice(&raw48.to_le_bytes()[..6]);
}

/// Converts a 512-byte NVMe SMART/Health log into a 512-byte `ATA_SMART_DATA`
/// buffer (§4.8 SAT pass-through, SMART IOCTL family; §8 "NVMe SMART -> ATA
/// SMART conversion is deterministic"). The attribute mapping is this
/// crate's own choice (DESIGN.md records it) since the filtered original
/// source only declares, but does not implement, the conversion.
pub fn nvme_smart_to_ata_smart(smart: &NvmeSmartLog) -> [u8; 512] {
    let mut buf = [0u8; 512];
    buf[0..2].copy_from_slice(&1u16.to_le_bytes()); // Version

    const ATTR_BASE: usize = 2;
    write_attribute(&mut buf, ATTR_BASE, 9, 0x0032, 100, 100, smart.power_on_hours() as u64 & 0xFFFF_FFFF_FFFF);
    write_attribute(&mut buf, ATTR_BASE + 12, 194, 0x0022, 100, 100, smart.temperature_celsius() as u64);
    write_attribute(&mut buf, ATTR_BASE + 24, 5, 0x0033, 100, 100, smart.media_errors() as u64 & 0xFFFF_FFFF_FFFF);
    write_attribute(&mut buf, ATTR_BASE + 36, 241, 0x0032, 100, 100, smart.data_units_written() as u64 & 0xFFFF_FFFF_FFFF);
    write_attribute(&mut buf, ATTR_BASE + 48, 242, 0x0032, 100, 100, smart.data_units_read() as u64 & 0xFFFF_FFFF_FFFF);

    const TRAILER: usize = ATTR_BASE + 360;
    buf[TRAILER + 4] = 1; // OfflineDataCollectionCapability
    buf[TRAILER + 5..TRAILER + 7].copy_from_slice(&3u16.to_le_bytes()); // SmartCapability
    buf[TRAILER + 7] = 1; // ErrorLoggingCapability
    buf[TRAILER + 9] = 2; // ShortSelfTestPollingTime
    buf[TRAILER + 10] = 10; // ExtendedSelfTestPollingTime
    buf[TRAILER + 11] = 5; // ConveyanceSelfTestPollingTime

    let sum: u32 = buf[..511].iter().map(|b| *b as u32).sum();
    buf[511] = (0x100u32.wrapping_sub(sum & 0xFF) & 0xFF) as u8;
    buf
}

/// Converts Identify Controller identification strings and namespace
/// geometry into a 512-byte ATA IDENTIFY DEVICE response (§4.8 SAT
/// pass-through `ECh`, SMART IOCTL family): byte-swapped ASCII strings,
/// LBA-28 and LBA-48 capacity, queue depth, and rotation rate 1 (SSD).
pub fn nvme_identify_to_ata_identify(ident: &Identification, total_blocks: u64, queue_depth: u16) -> [u8; 512] {
    let mut buf = [0u8; 512];
    buf[0..2].copy_from_slice(&0x0040u16.to_le_bytes()); // fixed, non-removable device

    copy_padded_ata_swapped(trim_leading_spaces(&ident.serial), &mut buf[20..40]);
    copy_padded_ata_swapped(trim_leading_spaces(&ident.firmware), &mut buf[46..54]);
    copy_padded_ata_swapped(trim_leading_spaces(&ident.model), &mut buf[54..94]);

    buf[98..100].copy_from_slice(&0x0300u16.to_le_bytes()); // Capabilities: LBA + DMA

    let lba28 = core::cmp::min(total_blocks, 0x0FFF_FFFF) as u32;
    buf[120..124].copy_from_slice(&lba28.to_le_bytes());

    buf[150..152].copy_from_slice(&queue_depth.to_le_bytes());

    buf[164..166].copy_from_slice(&0x0001u16.to_le_bytes()); // SMART supported
    buf[170..172].copy_from_slice(&0x0001u16.to_le_bytes()); // SMART enabled

    buf[200..208].copy_from_slice(&total_blocks.to_le_bytes()); // LBA-48

    buf[434..436].copy_from_slice(&1u16.to_le_bytes()); // non-rotating media
    buf
}

/// The (protocol, features, command) triple a SAT ATA PASS-THROUGH CDB
/// carries, parsed from either the 16- or 12-byte form (§4.8, `scsiext.h`'s
/// `SAT_PASSTHROUGH_16`/`_12`).
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct SatPassthrough {
    pub protocol: u8,
    pub features: u8,
    pub command: u8,
}

pub fn parse_sat16(cdb: &[u8; 16]) -> SatPassthrough {
    SatPassthrough {
        protocol: cdb[1] & 0x0F,
        features: cdb[4],
        command: cdb[14],
    }
}

pub fn parse_sat12(cdb: &[u8; 12]) -> SatPassthrough {
    SatPassthrough {
        protocol: cdb[1] & 0x0F,
        features: cdb[3],
        command: cdb[9],
    }
}

/// What a parsed SAT pass-through request asks this driver to emulate
/// (§4.8 "Supported: ...").
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum SatRequest {
    SmartReadData,
    SmartReadLog,
    IdentifyDevice,
    Unsupported,
}

pub fn classify_sat(req: SatPassthrough) -> SatRequest {
    match (req.command, req.features) {
        (0xB0, 0xD0) => SatRequest::SmartReadData,
        (0xB0, 0xD5) => SatRequest::SmartReadLog,
        (0xEC, _) => SatRequest::IdentifyDevice,
        _ => SatRequest::Unsupported,
    }
}

pub mod smart_ioctl {
    use super::*;

    /// Driver version (1.0) plus capability bits: bit0 = ATA IDENTIFY
    /// emulation supported, bit1 = SMART emulation supported (§4.8 "SMART
    /// version query").
    pub fn version() -> [u8; 4] {
        [1, 0, 0x03, 0]
    }

    /// "Passing" sentinel bytes the original mirrors into the ATA output
    /// registers for SMART RETURN STATUS (§4.8).
    pub fn return_status() -> [u8; 2] {
        [0x4F, 0xC2]
    }
}

/// Address selection for the single exposed device: path/target must be
/// zero, and so must LUN (§4.8 "Unsupported / selection", §7.4).
pub fn check_selection(path: u8, target: u8, lun: u8) -> Result<()> {
    if path != 0 || target != 0 {
        return Err(Error::SelectionTimeout);
    }
    if lun != 0 {
        return Err(Error::InvalidLun);
    }
    Ok(())
}

/// The custom "NVME2KDB"-signed TRIM-mode IOCTL surface (§6 "Custom IOCTL
/// surface").
pub mod trim_ioctl {
    use super::*;
    use crate::arena::PAGE_SIZE;
    use crate::state::DeviceState;

    pub const QUERY_INFO: u32 = 0x1000;
    pub const TRIM_MODE_ON: u32 = 0x1001;
    pub const TRIM_MODE_OFF: u32 = 0x1002;

    /// Dispatches one IOCTL. `TrimModeOn` requires an exactly 4096-byte
    /// payload, stored verbatim as the comparison pattern (§6).
    pub fn handle(state: &DeviceState, code: u32, payload: &[u8]) -> Result<()> {
        match code {
            QUERY_INFO => Ok(()),
            TRIM_MODE_ON => {
                if payload.len() != PAGE_SIZE {
                    return Err(Error::InvalidRequest);
                }
                let mut pattern = [0u8; PAGE_SIZE];
                pattern.copy_from_slice(payload);
                state.trim.enable(&pattern);
                Ok(())
            }
            TRIM_MODE_OFF => {
                state.trim.disable();
                Ok(())
            }
            _ => Err(Error::InvalidRequest),
        }
    }
}
