//! The host-port contract (spec §6 "Host-port contract consumed", §9
//! "Cyclic pointers host↔driver").
//!
//! Everything the engine needs from its environment — buffer→physical
//! translation, uncached DMA allocation, PCI config-space access, the
//! fallback timer, and request completion — is expressed as traits here.
//! Per §9's redesign note, the driver never holds a back-pointer to a host
//! request: it looks requests up by tag/CID through these traits and hands
//! back an `Outcome`, instead of mutating a shared struct.
//!
//! Grounded on `examples/ethindp-kernel/libk/src/nvme/mod.rs`'s `Disk` trait shape (`libk`'s own
//! host-facing seam) and `examples/original_source/nvme2k.h`'s
//! `ScsiPortGetPhysicalAddress` / `ScsiPortGetSrb` / `ScsiPortNotification`
//! calls, which this crate turns into an explicit trait instead of
//! miniport-library globals.

use crate::arena::DmaRegion;
use crate::error::Error;

/// Outcome of a request the engine handed off to the controller, reported
/// back to the host port at completion time (§4.9, §7).
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Outcome {
    Success,
    Failed(Error),
}

/// Obtains the single contiguous uncached DMA block the arena bump-allocates
/// from (§4.1).
pub trait DmaAllocator {
    fn allocate_uncached(&self, len: usize) -> Option<DmaRegion>;
}

/// Everything the command engine needs from its host SCSI port.
pub trait HostPort {
    /// Physical address backing a virtual span already pinned for DMA.
    fn virt_to_phys(&self, virt: usize) -> u64;

    /// The (virtual address, length) of the data buffer belonging to the
    /// tagged in-flight request `tag`.
    fn buffer_for_tag(&self, tag: u8) -> (usize, usize);

    /// The (virtual address, length) of the data buffer belonging to
    /// whichever untagged request is currently in flight (§3 "at most one
    /// outstanding non-tagged host request at a time").
    fn buffer_for_non_tagged(&self) -> (usize, usize);

    /// Completes the tagged request `tag` with `outcome`.
    fn complete_tagged(&self, tag: u8, outcome: Outcome);

    /// Completes the single outstanding untagged request with `outcome`.
    fn complete_non_tagged(&self, outcome: Outcome);

    /// Arms a one-shot timer that will invoke the completion drain in
    /// roughly `micros` microseconds (§5 "Fallback timer").
    fn schedule_fallback_timer(&self, micros: u32);

    /// Cancels any pending fallback timer (the ISR does this on every
    /// interrupt, §5).
    fn cancel_fallback_timer(&self);

    /// Signals that back-pressure has cleared and the host port may present
    /// its next queued request (§4.9, §8 scenario 6).
    fn notify_next_request(&self);

    fn pci_config_read32(&self, offset: u8) -> u32;
    fn pci_config_write32(&self, offset: u8, value: u32);
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use alloc::vec::Vec;
    use spin::Mutex;

    /// Backs `DmaAllocator` with a plain heap buffer, pretending virtual ==
    /// physical (fine for host-toolchain unit tests, which never touch real
    /// hardware addresses).
    pub struct FakeDma {
        buf: Mutex<Vec<u8>>,
    }

    impl FakeDma {
        pub fn new(len: usize) -> Self {
            FakeDma {
                buf: Mutex::new(alloc::vec![0u8; len]),
            }
        }
    }

    impl DmaAllocator for FakeDma {
        fn allocate_uncached(&self, len: usize) -> Option<DmaRegion> {
            let buf = self.buf.lock();
            if len > buf.len() {
                return None;
            }
            let virt = buf.as_ptr() as usize;
            Some(DmaRegion {
                virt,
                phys: virt as u64,
                pages: len / crate::arena::PAGE_SIZE,
            })
        }
    }

    #[derive(Clone, Copy, Debug, Eq, PartialEq)]
    pub enum Completion {
        Tagged(u8, Outcome),
        NonTagged(Outcome),
    }

    /// Records completions and timer activity instead of acting on real
    /// hardware, so lifecycle/SG/RW/XLT/CPL tests can assert on what the
    /// engine told the host port to do.
    pub struct FakeHostPort {
        pub completions: Mutex<Vec<Completion>>,
        pub timers_scheduled: Mutex<u32>,
        pub timers_cancelled: Mutex<u32>,
        pub next_request_notifications: Mutex<u32>,
        pub pci_command_register: Mutex<u32>,
        buffers_by_tag: Mutex<alloc::collections::BTreeMap<u8, (usize, usize)>>,
        non_tagged_buffer: Mutex<Option<(usize, usize)>>,
    }

    impl FakeHostPort {
        pub fn new() -> Self {
            FakeHostPort {
                completions: Mutex::new(Vec::new()),
                timers_scheduled: Mutex::new(0),
                timers_cancelled: Mutex::new(0),
                next_request_notifications: Mutex::new(0),
                pci_command_register: Mutex::new(0x0400), // interrupt-disable set, like reset state
                buffers_by_tag: Mutex::new(alloc::collections::BTreeMap::new()),
                non_tagged_buffer: Mutex::new(None),
            }
        }

        pub fn set_buffer_for_tag(&self, tag: u8, virt: usize, len: usize) {
            self.buffers_by_tag.lock().insert(tag, (virt, len));
        }

        pub fn set_non_tagged_buffer(&self, virt: usize, len: usize) {
            *self.non_tagged_buffer.lock() = Some((virt, len));
        }
    }

    impl DmaAllocator for FakeHostPort {
        fn allocate_uncached(&self, len: usize) -> Option<DmaRegion> {
            None
        }
    }

    impl HostPort for FakeHostPort {
        fn virt_to_phys(&self, virt: usize) -> u64 {
            virt as u64
        }

        fn buffer_for_tag(&self, tag: u8) -> (usize, usize) {
            *self
                .buffers_by_tag
                .lock()
                .get(&tag)
                .expect("test set up buffer_for_tag before use")
        }

        fn buffer_for_non_tagged(&self) -> (usize, usize) {
            self.non_tagged_buffer
                .lock()
                .expect("test set up buffer_for_non_tagged before use")
        }

        fn complete_tagged(&self, tag: u8, outcome: Outcome) {
            self.completions.lock().push(Completion::Tagged(tag, outcome));
        }

        fn complete_non_tagged(&self, outcome: Outcome) {
            self.completions.lock().push(Completion::NonTagged(outcome));
        }

        fn schedule_fallback_timer(&self, _micros: u32) {
            *self.timers_scheduled.lock() += 1;
        }

        fn cancel_fallback_timer(&self) {
            *self.timers_cancelled.lock() += 1;
        }

        fn notify_next_request(&self) {
            *self.next_request_notifications.lock() += 1;
        }

        fn pci_config_read32(&self, offset: u8) -> u32 {
            if offset == 0x04 {
                *self.pci_command_register.lock()
            } else {
                0
            }
        }

        fn pci_config_write32(&self, offset: u8, value: u32) {
            if offset == 0x04 {
                *self.pci_command_register.lock() = value;
            }
        }
    }
}
