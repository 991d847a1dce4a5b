//! Command Identifier (CID) encoding.
//!
//! A completion queue entry carries back only a 16-bit CID; every other bit
//! of context about the request has to be recoverable from that value alone.
//! This module is the single place that knows the bit layout (spec §4.4) and
//! the small set of fixed admin CIDs used during the lifecycle sequence.
//!
//! Grounded on `examples/original_source/nvme2k.h`'s `CID_NON_TAGGED_FLAG` /
//! `CID_ORDERED_FLUSH_FLAG` / `CID_VALUE_MASK` constants and
//! `nvme2k_nvme.c`'s `NvmeBuildCommandId` / `NvmeBuildFlushCommandId` /
//! `NvmeGetSrbFromCommandId`.

use bit_field::BitField;

const NON_TAGGED_FLAG: u16 = 0x8000;
const ORDERED_FLUSH_FLAG: u16 = 0x4000;
const VALUE_MASK: u16 = 0x3FFF;

/// Sentinel used by the host port for an untagged queue slot, matching the
/// original driver's `SP_UNTAGGED` (0xFF).
pub const UNTAGGED_QUEUE_TAG: u8 = 0xFF;

/// Fixed CIDs used during the init/shutdown state machine (§4.4).
pub mod admin {
    pub const CREATE_IO_CQ: u16 = 1;
    pub const CREATE_IO_SQ: u16 = 2;
    pub const IDENTIFY_CONTROLLER: u16 = 3;
    pub const IDENTIFY_NAMESPACE: u16 = 4;
    pub const INIT_COMPLETE: u16 = 5;
    pub const GET_LOG_PAGE_BASE: u16 = 6;
    pub const DELETE_IO_SQ: u16 = 0xFFFE;
    pub const DELETE_IO_CQ: u16 = 0xFFFD;
}

/// The decoded meaning of a CID, as CPL needs to dispatch on it.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum CidClass {
    /// A tagged host request; the queue tag identifies it to the host port.
    Tagged(u8),
    /// A Flush submitted ahead of a tagged ordered request; produces no
    /// host-visible completion.
    OrderedFlushPrologue(u8),
    /// One of the small fixed lifecycle CIDs.
    Admin(u16),
    /// A Get Log Page issued after init, `(base + prp_page_index)`.
    GetLogPage(u8),
}

/// Builds the CID for a tagged host request (§4.4 row 2).
pub fn build_tagged(queue_tag: u8) -> u16 {
    queue_tag as u16 & VALUE_MASK
}

/// Builds the CID for the ordered-flush prologue that precedes a tagged
/// ordered write/read (§4.7 "Ordered tag prologue").
pub fn build_ordered_flush(queue_tag: u8) -> u16 {
    (queue_tag as u16 & VALUE_MASK) | ORDERED_FLUSH_FLAG
}

/// Builds the CID for a post-init Get Log Page command, folding in which PRP
/// page holds the 512-byte log buffer so the completion can find it again.
pub fn build_get_log_page(prp_page_index: u8) -> u16 {
    ((admin::GET_LOG_PAGE_BASE + prp_page_index as u16) & VALUE_MASK) | NON_TAGGED_FLAG
}

/// Decodes a completion's CID into a dispatchable class. `init_complete`
/// selects whether a small-valued, non-flagged CID should be read as one of
/// the fixed lifecycle admin CIDs (during init) or as a tagged queue tag
/// (after init, where `0..=5` are ordinary valid tags).
///
/// Every non-tagged request this driver ever submits is a Get Log Page
/// (`build_get_log_page`, always `>= GET_LOG_PAGE_BASE`); a high-flag CID
/// below that base cannot come from a real submission, so it is folded into
/// the same defensive `Admin` bucket as any other unexpected value rather
/// than given its own class.
pub fn decode(cid: u16, init_complete: bool) -> CidClass {
    if cid == admin::DELETE_IO_SQ || cid == admin::DELETE_IO_CQ {
        return CidClass::Admin(cid);
    }
    if cid.get_bit(15) {
        let value = cid & VALUE_MASK;
        if value >= admin::GET_LOG_PAGE_BASE {
            return CidClass::GetLogPage((value - admin::GET_LOG_PAGE_BASE) as u8);
        }
        return CidClass::Admin(value);
    }
    if cid.get_bit(14) {
        return CidClass::OrderedFlushPrologue((cid & VALUE_MASK) as u8);
    }
    if !init_complete && cid >= 1 && cid <= 5 {
        return CidClass::Admin(cid);
    }
    CidClass::Tagged((cid & VALUE_MASK) as u8)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tagged_round_trips_through_decode() {
        let cid = build_tagged(0x20);
        assert_eq!(decode(cid, true), CidClass::Tagged(0x20));
    }

    #[test]
    fn ordered_flush_carries_the_queue_tag() {
        // scenario 5 from spec.md §8: tag=0x20 -> flush CID 0x4020, write CID 0x0020
        assert_eq!(build_ordered_flush(0x20), 0x4020);
        assert_eq!(build_tagged(0x20), 0x0020);
        assert_eq!(
            decode(0x4020, true),
            CidClass::OrderedFlushPrologue(0x20)
        );
    }

    #[test]
    fn get_log_page_folds_in_prp_index() {
        let cid = build_get_log_page(3);
        assert_eq!(decode(cid, true), CidClass::GetLogPage(3));
    }

    #[test]
    fn fixed_admin_cids_decode_during_init() {
        assert_eq!(decode(admin::CREATE_IO_CQ, false), CidClass::Admin(1));
        assert_eq!(decode(admin::IDENTIFY_NAMESPACE, false), CidClass::Admin(4));
    }

    #[test]
    fn shutdown_sentinels_decode_regardless_of_init_state() {
        assert_eq!(decode(admin::DELETE_IO_SQ, true), CidClass::Admin(0xFFFE));
        assert_eq!(decode(admin::DELETE_IO_CQ, true), CidClass::Admin(0xFFFD));
    }
}
