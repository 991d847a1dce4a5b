//! `DeviceState`: the per-controller aggregate (spec §3 "DeviceState").
//!
//! Grounded on `examples/original_source/nvme2k.h`'s `HW_DEVICE_EXTENSION`
//! struct, reworked per §9's "Cyclic pointers host↔driver" note: the driver
//! owns only the PRP-page-index shadow per in-flight request, never a
//! pointer back to the host's request object.

use core::sync::atomic::{AtomicU32, AtomicU64, AtomicU8, Ordering};

use crate::arena::{Arena, PAGE_SIZE};
use crate::cid::UNTAGGED_QUEUE_TAG;
use crate::error::Result;
use crate::host::HostPort;
use crate::prp::{self, PrpPagePool};
use crate::queues::{QueueId, QueuePair, SubmissionQueueEntry};
use crate::reg::RegisterWindow;

/// Microseconds ahead the fallback timer is armed on every submission (§5
/// "Fallback timer").
pub const FALLBACK_TIMER_MICROS: u32 = 1000;

/// Submission/completion/interrupt locking strategy, replacing the
/// original's commented-out compile-time toggles (§9 "Compile-time feature
/// toggles"). Chosen once at `DeviceState::new` and carried as ordinary
/// configuration, never `cfg!`-switched.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum LockPolicy {
    /// Per-queue mutual exclusion only; the default, matching §5's "brief
    /// mutual-exclusion region" description.
    PerQueueMutex,
    /// A single shared lock guards submission, completion, and interrupt
    /// handling together. Coarser; useful on hosts where the per-queue
    /// regions can't be proven disjoint.
    SharedLock,
}

impl Default for LockPolicy {
    fn default() -> Self {
        LockPolicy::PerQueueMutex
    }
}

/// Advisory diagnostics counters (§3 "counters for diagnostics", supplemented
/// from `examples/original_source/nvme2k.h`). Relaxed ordering throughout:
/// §5 states counters are advisory and need no synchronisation stronger
/// than atomicity.
#[derive(Default)]
pub struct Stats {
    pub current_queue_depth: AtomicU32,
    pub max_queue_depth_reached: AtomicU32,
    pub current_prp_list_pages_used: AtomicU32,
    pub max_prp_list_pages_used: AtomicU32,
    pub total_bytes_read: AtomicU64,
    pub total_bytes_written: AtomicU64,
    pub total_requests: AtomicU64,
    pub total_reads: AtomicU64,
    pub total_writes: AtomicU64,
    pub max_read_size: AtomicU32,
    pub max_write_size: AtomicU32,
    pub rejected_requests: AtomicU64,
}

impl Stats {
    pub fn on_submit(&self) {
        let depth = self.current_queue_depth.fetch_add(1, Ordering::Relaxed) + 1;
        self.max_queue_depth_reached.fetch_max(depth, Ordering::Relaxed);
    }

    pub fn on_complete(&self) {
        self.current_queue_depth.fetch_sub(1, Ordering::Relaxed);
    }

    pub fn on_prp_list_page_taken(&self) {
        let used = self.current_prp_list_pages_used.fetch_add(1, Ordering::Relaxed) + 1;
        self.max_prp_list_pages_used.fetch_max(used, Ordering::Relaxed);
    }

    pub fn on_prp_list_page_returned(&self) {
        self.current_prp_list_pages_used.fetch_sub(1, Ordering::Relaxed);
    }

    pub fn on_read(&self, bytes: u32) {
        self.total_requests.fetch_add(1, Ordering::Relaxed);
        self.total_reads.fetch_add(1, Ordering::Relaxed);
        self.total_bytes_read.fetch_add(bytes as u64, Ordering::Relaxed);
        self.max_read_size.fetch_max(bytes, Ordering::Relaxed);
    }

    pub fn on_write(&self, bytes: u32) {
        self.total_requests.fetch_add(1, Ordering::Relaxed);
        self.total_writes.fetch_add(1, Ordering::Relaxed);
        self.total_bytes_written.fetch_add(bytes as u64, Ordering::Relaxed);
        self.max_write_size.fetch_max(bytes, Ordering::Relaxed);
    }

    pub fn on_rejected(&self) {
        self.rejected_requests.fetch_add(1, Ordering::Relaxed);
    }
}

/// The per-in-flight-request state the driver itself owns: just the PRP
/// page index, freed exactly once at completion or submission failure
/// (§3 "RequestShadow").
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct RequestShadow {
    pub prp_list_page: u8,
}

impl RequestShadow {
    pub const NONE: RequestShadow = RequestShadow {
        prp_list_page: prp::NONE,
    };
}

impl Default for RequestShadow {
    fn default() -> Self {
        RequestShadow::NONE
    }
}

/// `NVME2KDB`-signed TRIM-mode toggle state (§4.8 "Custom TRIM IOCTLs",
/// §4.7 "TRIM shortcut").
pub struct TrimState {
    enabled: core::sync::atomic::AtomicBool,
    pattern: spin::RwLock<[u8; PAGE_SIZE]>,
}

impl TrimState {
    pub fn new() -> Self {
        TrimState {
            enabled: core::sync::atomic::AtomicBool::new(false),
            pattern: spin::RwLock::new([0u8; PAGE_SIZE]),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Relaxed)
    }

    pub fn enable(&self, pattern: &[u8; PAGE_SIZE]) {
        *self.pattern.write() = *pattern;
        self.enabled.store(true, Ordering::Relaxed);
    }

    pub fn disable(&self) {
        self.enabled.store(false, Ordering::Relaxed);
    }

    pub fn matches(&self, buf: &[u8]) -> bool {
        if !self.is_enabled() || buf.len() < PAGE_SIZE {
            return false;
        }
        *self.pattern.read() == buf[..PAGE_SIZE]
    }

    pub fn pattern_bytes(&self, range: core::ops::Range<usize>) -> [u8; 16] {
        let guard = self.pattern.read();
        let mut out = [0u8; 16];
        out.copy_from_slice(&guard[range]);
        out
    }

    /// `true` if `buf[16..]` still matches the stored pattern's tail. The
    /// completion-side half of the TRIM shortcut: the first 16 bytes were
    /// overwritten with the DSM range descriptor before submission, so only
    /// the tail is diagnostic of "this was our disguised write" (§4.7, §9).
    pub fn tail_matches(&self, buf: &[u8]) -> bool {
        if !self.is_enabled() || buf.len() < PAGE_SIZE {
            return false;
        }
        let guard = self.pattern.read();
        buf[16..PAGE_SIZE] == guard[16..PAGE_SIZE]
    }
}

/// What the single outstanding non-tagged request is waiting for once its
/// Get Log Page command completes (§4.8, §4.9). Replaces a per-request
/// context pointer with one enum discriminant: at most one non-tagged
/// request is ever outstanding (§3 invariant), so one slot suffices and
/// the driver still never holds a reference back into host memory.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum PendingLogResponse {
    /// LOG SENSE: convert to the SCSI Informational Exceptions page.
    InformationalExceptions,
    /// SAT SMART READ DATA/LOG or a SMART IOCTL: convert to `ATA_SMART_DATA`.
    AtaSmartData,
}

/// Identification strings captured during Identify Controller, trimmed and
/// fixed-length per §3 ("20/40/8 bytes, space-padded").
#[derive(Clone, Copy)]
pub struct Identification {
    pub serial: [u8; 20],
    pub model: [u8; 40],
    pub firmware: [u8; 8],
}

impl Default for Identification {
    fn default() -> Self {
        Identification {
            serial: [b' '; 20],
            model: [b' '; 40],
            firmware: [b' '; 8],
        }
    }
}

/// One per controller (§3 "DeviceState").
pub struct DeviceState {
    pub reg: RegisterWindow,
    pub arena: Arena,
    pub admin: QueuePair,
    pub io: QueuePair,
    pub prp: PrpPagePool,
    pub ident: Identification,
    pub namespace_size_blocks: u64,
    pub namespace_block_size: u32,
    pub max_transfer_size_bytes: usize,
    pub stats: Stats,
    pub trim: TrimState,
    pub lock_policy: LockPolicy,
    pub init_complete: core::sync::atomic::AtomicBool,
    /// `true` while a non-tagged host request is outstanding; at most one at
    /// a time (§3 invariant).
    pub non_tagged_in_flight: core::sync::atomic::AtomicBool,
    pub next_non_tagged_seq: AtomicU32,
    /// Host-side notion of "no queue tag"; kept here only as the constant
    /// the driver compares incoming tags against.
    pub untagged_sentinel: u8,
    /// Fallback-timer probing state (§9 "Interrupt/timer interaction").
    pub fallback: FallbackTimerState,
    /// `true` once a submission has been refused with a resource-transient
    /// error; cleared and notified on the next completion (§4.9, §8
    /// scenario 6 "back-pressure").
    busy: core::sync::atomic::AtomicBool,
    shadows: spin::Mutex<heapless::FnvIndexMap<u16, RequestShadow, heapless::consts::U64>>,
    pending_log: spin::Mutex<Option<PendingLogResponse>>,
}

/// Replaces the original's timer-tick reference counter with explicit
/// states, per §9's redesign note.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum FallbackTimerMode {
    Disabled,
    Armed,
    Probing,
}

pub struct FallbackTimerState {
    mode: spin::Mutex<FallbackTimerMode>,
    interrupt_count: AtomicU32,
}

impl FallbackTimerState {
    pub fn new() -> Self {
        FallbackTimerState {
            mode: spin::Mutex::new(FallbackTimerMode::Armed),
            interrupt_count: AtomicU32::new(0),
        }
    }

    pub fn mode(&self) -> FallbackTimerMode {
        *self.mode.lock()
    }

    /// Called on every submission: re-arms unless disabled (§5).
    pub fn on_submit(&self) {
        let mut mode = self.mode.lock();
        if *mode != FallbackTimerMode::Disabled {
            *mode = FallbackTimerMode::Armed;
        }
    }

    /// Called on every real interrupt. After enough real interrupts the
    /// fallback probing concludes the line is wired correctly and disables
    /// itself (§5, §9).
    pub fn on_interrupt(&self, disable_after: u32) {
        let count = self.interrupt_count.fetch_add(1, Ordering::Relaxed) + 1;
        if count >= disable_after {
            *self.mode.lock() = FallbackTimerMode::Disabled;
        }
    }

    /// Called when the fallback timer itself fires with nothing to drain:
    /// moves Armed -> Probing so a subsequent bare fire without any
    /// interrupts in between is distinguishable.
    pub fn on_timer_fired_with_no_work(&self) {
        let mut mode = self.mode.lock();
        if *mode == FallbackTimerMode::Armed {
            *mode = FallbackTimerMode::Probing;
        }
    }
}

impl DeviceState {
    pub fn new(
        reg: RegisterWindow,
        arena: Arena,
        admin: QueuePair,
        io: QueuePair,
        prp: PrpPagePool,
        lock_policy: LockPolicy,
    ) -> Self {
        DeviceState {
            reg,
            arena,
            admin,
            io,
            prp,
            ident: Identification::default(),
            namespace_size_blocks: 0,
            namespace_block_size: 512,
            max_transfer_size_bytes: 512 * PAGE_SIZE,
            stats: Stats::default(),
            trim: TrimState::new(),
            lock_policy,
            init_complete: core::sync::atomic::AtomicBool::new(false),
            non_tagged_in_flight: core::sync::atomic::AtomicBool::new(false),
            next_non_tagged_seq: AtomicU32::new(0),
            untagged_sentinel: UNTAGGED_QUEUE_TAG,
            fallback: FallbackTimerState::new(),
            busy: core::sync::atomic::AtomicBool::new(false),
            shadows: spin::Mutex::new(heapless::FnvIndexMap::new()),
            pending_log: spin::Mutex::new(None),
        }
    }

    pub fn is_init_complete(&self) -> bool {
        self.init_complete.load(Ordering::Relaxed)
    }

    pub fn mark_init_complete(&self) {
        self.init_complete.store(true, Ordering::Relaxed);
    }

    /// Records that a submission was just refused for lack of resources
    /// (queue full or PRP pool exhausted), so the next completion knows to
    /// notify the host port once back-pressure clears.
    pub fn mark_busy(&self) {
        self.busy.store(true, Ordering::Relaxed);
    }

    /// Clears the busy flag and reports whether it had been set.
    pub fn take_busy(&self) -> bool {
        self.busy.swap(false, Ordering::Relaxed)
    }

    /// Next non-tagged sequence number, mod 2^14 (§4.4).
    pub fn next_non_tagged_sequence(&self) -> u16 {
        (self.next_non_tagged_seq.fetch_add(1, Ordering::Relaxed) & 0x3FFF) as u16
    }

    pub fn record_shadow(&self, cid: u16, shadow: RequestShadow) {
        let _ = self.shadows.lock().insert(cid, shadow);
    }

    /// Removes and returns the shadow recorded under `cid`, or
    /// `RequestShadow::NONE` if this CID never had one (a "null request
    /// shadow", §9 open question — treated here as non-fatal, logged by the
    /// caller and resolved to no PRP page to free).
    pub fn take_shadow(&self, cid: u16) -> Option<RequestShadow> {
        self.shadows.lock().remove(&cid)
    }

    /// Records what conversion the next Get Log Page completion on the
    /// non-tagged queue slot should apply.
    pub fn set_pending_log(&self, response: PendingLogResponse) {
        *self.pending_log.lock() = Some(response);
    }

    /// Takes and clears the pending Get Log Page conversion, if any.
    pub fn take_pending_log(&self) -> Option<PendingLogResponse> {
        self.pending_log.lock().take()
    }

    /// Pushes `sqe` onto the admin submission ring and rings its doorbell,
    /// arming the fallback timer the same way any submission does (§4.2,
    /// §5 "On every submission, schedule a one-shot timer"). Unlike
    /// `submit_io`, this does not touch the queue-depth counters: §4.2
    /// scopes those to "the I/O submitter" specifically.
    pub fn submit_admin(&mut self, host: &dyn HostPort, sqe: &SubmissionQueueEntry) -> Result<()> {
        submit(&self.reg, &mut self.admin, host, &self.fallback, sqe)
    }

    /// Pushes `sqe` onto the I/O submission ring and rings its doorbell,
    /// tracking the in-flight counter and its high-water mark (§4.2 "The
    /// I/O submitter additionally increments an in-flight counter and
    /// tracks a high-water mark").
    pub fn submit_io(&mut self, host: &dyn HostPort, sqe: &SubmissionQueueEntry) -> Result<()> {
        submit(&self.reg, &mut self.io, host, &self.fallback, sqe)?;
        self.stats.on_submit();
        Ok(())
    }
}

fn submit(
    reg: &RegisterWindow,
    qp: &mut QueuePair,
    host: &dyn HostPort,
    fallback: &FallbackTimerState,
    sqe: &SubmissionQueueEntry,
) -> Result<()> {
    let new_tail = qp.sq.push(sqe)?;
    reg.ring_doorbell(qp.id as u16, true, new_tail);
    fallback.on_submit();
    host.schedule_fallback_timer(FALLBACK_TIMER_MICROS);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::host::tests::{FakeDma, FakeHostPort};

    fn device(queue_size: u16) -> (alloc::vec::Vec<u8>, FakeDma, DeviceState) {
        let mut bar = alloc::vec![0u8; 0x2000];
        let reg = unsafe { RegisterWindow::new(bar.as_mut_ptr() as usize) };
        let dma = FakeDma::new(64 * PAGE_SIZE);
        let mut arena = Arena::new(&dma, 4).unwrap();
        let admin_sq = arena.take_pages(1).unwrap();
        let admin_cq = arena.take_pages(1).unwrap();
        let io_sq = arena.take_pages(1).unwrap();
        let io_cq = arena.take_pages(1).unwrap();
        let prp = PrpPagePool::new(&mut arena, 4).unwrap();
        let admin = QueuePair::new(QueueId::Admin, admin_sq, admin_cq, queue_size);
        let io = QueuePair::new(QueueId::Io, io_sq, io_cq, queue_size);
        let state = DeviceState::new(reg, arena, admin, io, prp, LockPolicy::default());
        (bar, dma, state)
    }

    #[test]
    fn submit_admin_leaves_queue_depth_untouched_but_submit_io_tracks_it() {
        // §4.2: queue-depth tracking is scoped to "the I/O submitter".
        let (_bar, _dma, mut state) = device(64);
        let host = FakeHostPort::new();
        let sqe = SubmissionQueueEntry::new(0, 0, 1);

        state.submit_admin(&host, &sqe).unwrap();
        state.submit_admin(&host, &sqe).unwrap();
        assert_eq!(state.stats.current_queue_depth.load(Ordering::Relaxed), 0);

        state.submit_io(&host, &sqe).unwrap();
        assert_eq!(state.stats.current_queue_depth.load(Ordering::Relaxed), 1);
        assert_eq!(state.stats.max_queue_depth_reached.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn stats_track_high_water_mark_independent_of_current_depth() {
        let stats = Stats::default();
        stats.on_submit();
        stats.on_submit();
        stats.on_complete();
        assert_eq!(stats.current_queue_depth.load(Ordering::Relaxed), 1);
        assert_eq!(stats.max_queue_depth_reached.load(Ordering::Relaxed), 2);
    }

    #[test]
    fn trim_state_matches_only_when_enabled() {
        let trim = TrimState::new();
        let mut pattern = [0u8; PAGE_SIZE];
        pattern[0] = 0xAB;
        assert!(!trim.matches(&pattern));
        trim.enable(&pattern);
        assert!(trim.matches(&pattern));
        trim.disable();
        assert!(!trim.matches(&pattern));
    }

    #[test]
    fn fallback_timer_disables_after_enough_interrupts() {
        let fb = FallbackTimerState::new();
        assert_eq!(fb.mode(), FallbackTimerMode::Armed);
        fb.on_interrupt(3);
        fb.on_interrupt(3);
        assert_eq!(fb.mode(), FallbackTimerMode::Armed);
        fb.on_interrupt(3);
        assert_eq!(fb.mode(), FallbackTimerMode::Disabled);
    }
}
