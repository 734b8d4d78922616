//! Error taxonomy for the replication core (spec §7).

use thiserror::Error;

/// Errors raised by the activity log, transfer log, bitmap, resync LRU, and
/// generation-counter components.
///
/// Each variant corresponds to one kind in the error taxonomy of spec §7;
/// the policy attached to each kind (mark out-of-sync, escalate, tear down a
/// connection, log only, ...) is applied by the caller, not by this type.
#[derive(Debug, Error)]
pub enum Error {
    /// The backing disk returned an error while servicing a read or write.
    #[error("local I/O error at sector {sector} (len {len}): {source}")]
    LocalIo {
        /// First affected sector.
        sector: u64,
        /// Length of the affected range in bytes.
        len: u64,
        /// Underlying device error.
        #[source]
        source: rdbd_block_device::DeviceError,
    },

    /// The transfer log ring filled up completely; barrier cadence failed to
    /// prevent it. Treated as a bug, not a recoverable condition.
    #[error("transfer log overflow: ring of capacity {capacity} is full")]
    TransferLogOverflow {
        /// Ring capacity that was exceeded.
        capacity: usize,
    },

    /// A `BarrierAck`'s reported epoch size or barrier number did not match
    /// what the transfer log observed. Diagnostic only; the peer's count is
    /// treated as authoritative and the transfer log still advances.
    #[error(
        "epoch mismatch: barrier {barrier_nr} expected set_size {expected}, peer reported {observed}"
    )]
    EpochMismatch {
        /// Barrier number the ack refers to.
        barrier_nr: u32,
        /// Entry count the transfer log actually observed for this epoch.
        expected: u32,
        /// Entry count the peer reported in `BarrierAck`.
        observed: u32,
    },

    /// An AL transaction record's CRC did not match, or its magic was wrong.
    #[error("activity log transaction {tr_number} failed crc/magic check")]
    ActivityLogCorrupt {
        /// Transaction number recovered from the record header, if legible.
        tr_number: u32,
    },

    /// A blocking acquire (AL slot, resync LRU extent) was interrupted by
    /// cancellation before it could complete.
    #[error("operation interrupted before completion")]
    Interrupted,

    /// The metadata I/O buffer could not be obtained because the disk
    /// transitioned to a state below `Negotiating`/`Attaching`.
    #[error("metadata I/O unavailable: disk state does not permit it")]
    MetadataIoUnavailable,
}

/// Convenience alias for core operations.
pub type Result<T> = core::result::Result<T, Error>;
