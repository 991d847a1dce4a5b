//! Optional process-wide controller registry, enabled by the
//! `global-registry` Cargo feature (spec SPEC_FULL.md §B "Global
//! registry").
//!
//! Most embedders own one [`DeviceState`] per adapter directly and drive it
//! through their own host port, never touching this module. It exists for a
//! host that, like the teacher kernel, wants a single process-wide place to
//! park every controller it has brought up and look one back up later (an
//! interrupt handler registered by index, say).
//!
//! Grounded on `libk::nvme::mod`'s
//! `CONTROLLERS: Mutex<MiniVec<NVMeController>>` static: same shape, with
//! `DeviceState` in place of the teacher's PCI-aware controller wrapper,
//! since ownership of the PCI device itself lives with the host port here
//! (§6).

use lazy_static::lazy_static;
use minivec::MiniVec;
use spin::Mutex;

use crate::state::DeviceState;

lazy_static! {
    static ref CONTROLLERS: Mutex<MiniVec<DeviceState>> = Mutex::new(MiniVec::new());
}

/// Stores `state` in the registry and returns the index it landed at.
/// Indices are stable for the life of the process: entries are never
/// removed, matching the teacher's registry (controllers are brought up
/// once at boot and live until shutdown).
pub fn register(state: DeviceState) -> usize {
    let mut controllers = CONTROLLERS.lock();
    controllers.push(state);
    controllers.len() - 1
}

/// Runs `f` against the controller at `index`, returning `None` if nothing
/// was ever registered there.
pub fn with_controller<R>(index: usize, f: impl FnOnce(&mut DeviceState) -> R) -> Option<R> {
    let mut controllers = CONTROLLERS.lock();
    controllers.get_mut(index).map(f)
}

/// Number of controllers registered so far.
pub fn count() -> usize {
    CONTROLLERS.lock().len()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arena::{Arena, PAGE_SIZE};
    use crate::host::tests::FakeDma;
    use crate::prp::PrpPagePool;
    use crate::queues::{QueueId, QueuePair};
    use crate::reg::RegisterWindow;
    use crate::state::LockPolicy;
    use alloc::vec;

    fn fresh_state() -> (vec::Vec<u8>, FakeDma, DeviceState) {
        let mut bar = vec![0u8; 0x2000];
        let reg = unsafe { RegisterWindow::new(bar.as_mut_ptr() as usize) };
        let dma = FakeDma::new(64 * PAGE_SIZE);
        let mut arena = Arena::new(&dma, 4).unwrap();
        let admin_sq = arena.take_pages(1).unwrap();
        let admin_cq = arena.take_pages(1).unwrap();
        let io_sq = arena.take_pages(1).unwrap();
        let io_cq = arena.take_pages(1).unwrap();
        let prp = PrpPagePool::new(&mut arena, 4).unwrap();
        let admin = QueuePair::new(QueueId::Admin, admin_sq, admin_cq, 64);
        let io = QueuePair::new(QueueId::Io, io_sq, io_cq, 64);
        let state = DeviceState::new(reg, arena, admin, io, prp, LockPolicy::default());
        (bar, dma, state)
    }

    #[test]
    fn register_returns_a_usable_index() {
        let (_bar, _dma, state) = fresh_state();
        let before = count();
        let index = register(state);
        assert_eq!(index, before);
        assert_eq!(count(), before + 1);

        let found = with_controller(index, |s| s.namespace_block_size);
        assert_eq!(found, Some(512));
    }

    #[test]
    fn with_controller_reports_none_for_an_unregistered_index() {
        assert_eq!(with_controller(usize::MAX, |_| ()), None);
    }
}
