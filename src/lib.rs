//! `nvme2k`: an NVMe-to-SCSI miniport command-processing engine.
//!
//! This crate is the hardware-facing core of an NVMe miniport, with no
//! knowledge of *how* it is hosted: it knows the NVMe 1.0e wire protocol and
//! the SCSI/ATA translation rules a miniport needs, and asks for DMA memory
//! and pinned request buffers through the [`host`] module's traits rather
//! than owning a PCI device or an OS's storage-port callback table itself.
//!
//! A host port brings a controller up through [`lifecycle`], drives reads
//! and writes through [`rw`], and turns arbitrary CDBs/IOCTLs into NVMe
//! commands through [`xlt`]; [`cpl`] drains completions and feeds the
//! lifecycle state machine and the outstanding-request bookkeeping in
//! [`state`] back.
//!
//! Grounded on `libk`'s split from the teacher's monolithic kernel binary: a
//! `#![no_std]` library with `extern crate alloc`, unit-tested on the host
//! toolchain via `#[cfg_attr(not(test), no_std)]` so every module's
//! `#[cfg(test)]` block can exercise it against the fake host port in
//! [`host::tests`] without a real controller.
#![cfg_attr(not(test), no_std)]
#![deny(clippy::all)]

extern crate alloc;

pub mod arena;
pub mod cid;
pub mod cpl;
pub mod error;
pub mod host;
pub mod lifecycle;
pub mod opcodes;
pub mod prp;
pub mod queues;
pub mod reg;
#[cfg(feature = "global-registry")]
pub mod registry;
pub mod rw;
pub mod sg;
pub mod state;
pub mod structs;
pub mod xlt;
