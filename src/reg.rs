//! Register window (REG): MMIO accessors over the controller's BAR0 region
//! (spec §2 item 1, §4.1, §6 "MMIO layout").
//!
//! Grounded on `examples/ethindp-kernel/libk/src/nvme/mod.rs`'s per-register `read_x`/`write_x`
//! methods, which wrap each offset in its own `VolAddress::new`; this module
//! collapses that into a single handle plus named offset constants, since
//! spec.md treats the register set as one window rather than one field per
//! register.

use bit_field::BitField;
use voladdress::VolAddress;

use crate::queues::{doorbell_offset, ring_doorbell};

pub mod offset {
    pub const CAP: usize = 0x00;
    pub const VS: usize = 0x08;
    pub const INTMS: usize = 0x0C;
    pub const INTMC: usize = 0x10;
    pub const CC: usize = 0x14;
    pub const CSTS: usize = 0x1C;
    pub const NSSR: usize = 0x20;
    pub const AQA: usize = 0x24;
    pub const ASQ: usize = 0x28;
    pub const ACQ: usize = 0x30;
}

bitflags::bitflags! {
    /// Controller Configuration register bits actually touched by this
    /// driver (§4.5).
    pub struct Cc: u32 {
        const EN = 1 << 0;
        const CSS_NVM = 0b000 << 4;
        const SHN_NORMAL = 0b01 << 14;
        const SHN_MASK = 0b11 << 14;
    }
}

bitflags::bitflags! {
    /// Controller Status register bits (§4.5, §4.9).
    pub struct Csts: u32 {
        const RDY = 1 << 0;
        const CFS = 1 << 1;
        const SHST_MASK = 0b11 << 2;
        const SHST_COMPLETE = 0b10 << 2;
    }
}

/// A handle to one controller's BAR0 MMIO window. Cheap to copy; the
/// physical base address is immutable after enable (§9 "Register-access
/// global state").
#[derive(Clone, Copy, Debug)]
pub struct RegisterWindow {
    base: usize,
}

impl RegisterWindow {
    /// # Safety
    /// `base` must be the mapped virtual address of a live NVMe controller's
    /// BAR0, valid for the lifetime of this handle.
    pub unsafe fn new(base: usize) -> Self {
        RegisterWindow { base }
    }

    pub fn read32(&self, off: usize) -> u32 {
        let addr: VolAddress<u32> = unsafe { VolAddress::new(self.base + off) };
        addr.read()
    }

    pub fn write32(&self, off: usize, value: u32) {
        let addr: VolAddress<u32> = unsafe { VolAddress::new(self.base + off) };
        addr.write(value)
    }

    pub fn read64(&self, off: usize) -> u64 {
        let lo = self.read32(off) as u64;
        let hi = self.read32(off + 4) as u64;
        (hi << 32) | lo
    }

    pub fn write64(&self, off: usize, value: u64) {
        self.write32(off, (value & 0xFFFF_FFFF) as u32);
        self.write32(off + 4, (value >> 32) as u32);
    }

    pub fn cap(&self) -> u64 {
        self.read64(offset::CAP)
    }

    /// Doorbell stride in bytes: `4 << ((CAP >> 32) & 0xF)` (§4.1).
    pub fn doorbell_stride(&self) -> usize {
        4usize << self.cap().get_bits(32..36)
    }

    /// Maximum queue entries supported, minus one (§3, GLOSSARY "MQES").
    pub fn mqes(&self) -> u16 {
        self.cap().get_bits(0..16) as u16
    }

    /// `true` if the controller advertises the NVM command set (CAP bit 37).
    pub fn supports_nvm_command_set(&self) -> bool {
        self.cap().get_bit(37)
    }

    pub fn cc(&self) -> u32 {
        self.read32(offset::CC)
    }

    pub fn set_cc(&self, value: u32) {
        self.write32(offset::CC, value)
    }

    pub fn csts(&self) -> Csts {
        Csts::from_bits_truncate(self.read32(offset::CSTS))
    }

    pub fn mask_all_interrupts(&self) {
        self.write32(offset::INTMS, 0xFFFF_FFFF);
    }

    pub fn unmask_vector0(&self) {
        self.write32(offset::INTMC, 1);
    }

    pub fn set_aqa(&self, submission_entries_minus_one: u16, completion_entries_minus_one: u16) {
        let mut aqa = 0u32;
        aqa.set_bits(0..12, submission_entries_minus_one as u32);
        aqa.set_bits(16..28, completion_entries_minus_one as u32);
        self.write32(offset::AQA, aqa);
    }

    pub fn clear_admin_queue_registers(&self) {
        self.write32(offset::AQA, 0);
        self.write64(offset::ASQ, 0);
        self.write64(offset::ACQ, 0);
    }

    pub fn set_asq(&self, phys: u64) {
        self.write64(offset::ASQ, phys);
    }

    pub fn set_acq(&self, phys: u64) {
        self.write64(offset::ACQ, phys);
    }

    pub fn ring_doorbell(&self, queue_id: u16, is_submission: bool, value: u16) {
        ring_doorbell(self.base, queue_id, is_submission, self.doorbell_stride(), value);
    }

    pub fn doorbell_offset(&self, queue_id: u16, is_submission: bool) -> usize {
        doorbell_offset(queue_id, is_submission, self.doorbell_stride())
    }
}
