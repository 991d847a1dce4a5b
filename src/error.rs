//! Error taxonomy for the command-processing engine.
//!
//! Every fallible operation in this crate returns one of these variants; there
//! is no panicking path in non-test code. See spec.md §7 for the policy each
//! variant implements.

/// A SCSI sense key/ASC/ASCQ triple, used to build the 18-byte fixed-format
/// sense buffer synthesised for device-protocol errors.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct SenseData {
    pub key: u8,
    pub asc: u8,
    pub ascq: u8,
}

impl SenseData {
    /// Key=04h Hardware Error, ASC=44h Internal Target Failure: the sense
    /// synthesised for any non-zero NVMe completion status (§4.9, §7.1).
    pub const HARDWARE_ERROR: SenseData = SenseData {
        key: 0x04,
        asc: 0x44,
        ascq: 0x00,
    };

    /// Key=05h Illegal Request, ASC=25h Logical Unit Not Supported: used for
    /// a nonzero LUN addressed at our path/target (§4.8 "Unsupported /
    /// selection").
    pub const INVALID_LUN: SenseData = SenseData {
        key: 0x05,
        asc: 0x25,
        ascq: 0x00,
    };

    /// Serialises into the 18-byte fixed-format sense buffer SCSI expects.
    pub fn to_fixed_format(self) -> [u8; 18] {
        let mut buf = [0u8; 18];
        buf[0] = 0x70; // valid, current errors, fixed format
        buf[2] = self.key & 0x0F;
        buf[7] = 10; // additional sense length
        buf[12] = self.asc;
        buf[13] = self.ascq;
        buf
    }
}

/// Every way a request through this engine can fail to complete the way the
/// caller asked.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Error {
    /// Non-zero NVMe completion status; caller should surface CHECK
    /// CONDITION with `sense`. The driver never retries these (§7.1).
    DeviceProtocol { nvme_status: u16, sense: SenseData },
    /// Submission queue full or the PRP pool is exhausted. The caller backs
    /// off and the host port re-presents the request later (§7.2).
    ResourceTransient,
    /// Transfer exceeds `MaxTransferSizeBytes`, the CDB is unsupported, or an
    /// IOCTL payload is malformed. Not retried by the host port (§7.3).
    InvalidRequest,
    /// Wrong path/target addressed us. Maps to SCSI selection timeout
    /// (§4.8, §7.4).
    SelectionTimeout,
    /// Correct path/target, nonzero LUN. Maps to CHECK CONDITION + "invalid
    /// LUN" (§4.8, §7.4).
    InvalidLun,
    /// Controller never reported ready, shutdown timed out, a lifecycle
    /// admin command failed. Fatal during enable; best-effort during
    /// shutdown (§7.5).
    Lifecycle(LifecycleError),
    /// A completion that should be unreachable in a well-formed request
    /// stream (null request shadow, unexpected completion state). Logged and
    /// dropped with no host-visible effect (§7.6, §9 open question).
    Defensive,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum LifecycleError {
    ControllerNotReady,
    ArenaAllocationFailed,
    IdentifyFailed,
    QueueCreateFailed,
    ShutdownTimeout,
}

pub type Result<T> = core::result::Result<T, Error>;
