//! On-disk layout of one activity-log transaction record (spec §3, §4.3,
//! §4.4). Grounded on the fixed-size, CRC-guarded record style of
//! `fatrs::transaction::TransactionEntry`, adapted to the big-endian,
//! 4096-byte layout this spec calls for.
//!
//! ```text
//! offset  size  field
//!      0     4  magic              (AL_TR_MAGIC)
//!      4     4  tr_number
//!      8     4  crc32c             (computed with this field zeroed)
//!     12     2  transaction_type   (Update = 0, Initialized = 0xffff)
//!     14     2  n_updates
//!     16     2  context_size
//!     18     2  context_start_slot_nr
//!     20    16  reserved
//!     36   128  update_slot_nr[64]      (u16 each)
//!    164   256  update_extent_nr[64]    (u32 each)
//!    420  3676  context[919]            (u32 each)
//! ------
//!   4096  total
//! ```

use crate::error::{Error, Result};

/// Number of `(slot, extent)` updates carried per transaction.
pub const AL_UPDATES_PER_TRANSACTION: usize = 64;
/// Number of context slot numbers carried per transaction: the remainder of
/// the 4096-byte record after the header and update arrays.
pub const AL_CONTEXT_PER_TRANSACTION: usize = 919;
/// Fixed on-disk size of one transaction record.
pub const AL_TRANSACTION_SIZE: usize = 4096;
/// Magic identifying a valid activity-log transaction record ("DTR0").
pub const AL_TR_MAGIC: u32 = 0x5444_5230;

const HEADER_LEN: usize = 36;
const UPDATE_SLOT_NR_LEN: usize = AL_UPDATES_PER_TRANSACTION * 2;
const UPDATE_EXTENT_NR_LEN: usize = AL_UPDATES_PER_TRANSACTION * 4;
const CONTEXT_OFFSET: usize = HEADER_LEN + UPDATE_SLOT_NR_LEN + UPDATE_EXTENT_NR_LEN;

/// Sentinel slot/extent number meaning "no update in this position".
pub const LC_FREE: u32 = u32::MAX;

/// Distinguishes an incremental update transaction from the one written when
/// the activity log is first initialized (whose `context` is authoritative
/// rather than a delta).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionType {
    /// Ordinary incremental transaction.
    Update,
    /// Initial load: `context` lists every slot's extent number.
    Initialized,
}

impl TransactionType {
    fn to_u16(self) -> u16 {
        match self {
            TransactionType::Update => 0,
            TransactionType::Initialized => 0xffff,
        }
    }

    fn from_u16(v: u16) -> Self {
        if v == 0xffff {
            TransactionType::Initialized
        } else {
            TransactionType::Update
        }
    }
}

/// One on-disk activity-log transaction record.
#[derive(Debug, Clone)]
pub struct AlTransaction {
    pub tr_number: u32,
    pub transaction_type: TransactionType,
    /// `(slot_nr, extent_nr)` pairs actually updated by this transaction;
    /// length at most [`AL_UPDATES_PER_TRANSACTION`].
    pub updates: Vec<(u16, u32)>,
    /// Snapshot of the slot ring starting at `context_start_slot_nr`, used
    /// to recover the full extent-to-slot mapping without replaying every
    /// transaction ever written.
    pub context: Vec<u32>,
    pub context_start_slot_nr: u16,
}

impl AlTransaction {
    /// Encode into a fixed 4096-byte, big-endian record with a correct
    /// CRC32c trailer.
    pub fn to_bytes(&self) -> [u8; AL_TRANSACTION_SIZE] {
        let mut buf = [0u8; AL_TRANSACTION_SIZE];
        buf[0..4].copy_from_slice(&AL_TR_MAGIC.to_be_bytes());
        buf[4..8].copy_from_slice(&self.tr_number.to_be_bytes());
        // crc32c field (bytes 8..12) left zero for the checksum pass below.
        buf[12..14].copy_from_slice(&self.transaction_type.to_u16().to_be_bytes());
        buf[14..16].copy_from_slice(&(self.updates.len() as u16).to_be_bytes());
        buf[16..18].copy_from_slice(&(self.context.len() as u16).to_be_bytes());
        buf[18..20].copy_from_slice(&self.context_start_slot_nr.to_be_bytes());

        for (i, (slot_nr, _)) in self.updates.iter().enumerate() {
            let off = HEADER_LEN + i * 2;
            buf[off..off + 2].copy_from_slice(&slot_nr.to_be_bytes());
        }
        for i in self.updates.len()..AL_UPDATES_PER_TRANSACTION {
            let off = HEADER_LEN + i * 2;
            buf[off..off + 2].copy_from_slice(&(LC_FREE as u16).to_be_bytes());
        }
        let extent_base = HEADER_LEN + UPDATE_SLOT_NR_LEN;
        for (i, (_, extent_nr)) in self.updates.iter().enumerate() {
            let off = extent_base + i * 4;
            buf[off..off + 4].copy_from_slice(&extent_nr.to_be_bytes());
        }
        for i in self.updates.len()..AL_UPDATES_PER_TRANSACTION {
            let off = extent_base + i * 4;
            buf[off..off + 4].copy_from_slice(&LC_FREE.to_be_bytes());
        }
        for (i, ctx) in self.context.iter().enumerate().take(AL_CONTEXT_PER_TRANSACTION) {
            let off = CONTEXT_OFFSET + i * 4;
            buf[off..off + 4].copy_from_slice(&ctx.to_be_bytes());
        }

        let crc = crc32c::crc32c(&buf);
        buf[8..12].copy_from_slice(&crc.to_be_bytes());
        buf
    }

    /// Decode and validate a transaction record, checking magic and CRC32c.
    pub fn from_bytes(buf: &[u8; AL_TRANSACTION_SIZE]) -> Result<Self> {
        let magic = u32::from_be_bytes(buf[0..4].try_into().unwrap());
        let tr_number = u32::from_be_bytes(buf[4..8].try_into().unwrap());
        let stored_crc = u32::from_be_bytes(buf[8..12].try_into().unwrap());

        let mut check_buf = *buf;
        check_buf[8..12].copy_from_slice(&[0u8; 4]);
        let computed_crc = crc32c::crc32c(&check_buf);

        if magic != AL_TR_MAGIC || stored_crc != computed_crc {
            return Err(Error::ActivityLogCorrupt { tr_number });
        }

        let transaction_type =
            TransactionType::from_u16(u16::from_be_bytes(buf[12..14].try_into().unwrap()));
        let n_updates = u16::from_be_bytes(buf[14..16].try_into().unwrap()) as usize;
        let context_size = u16::from_be_bytes(buf[16..18].try_into().unwrap()) as usize;
        let context_start_slot_nr = u16::from_be_bytes(buf[18..20].try_into().unwrap());

        let mut updates = Vec::with_capacity(n_updates.min(AL_UPDATES_PER_TRANSACTION));
        let extent_base = HEADER_LEN + UPDATE_SLOT_NR_LEN;
        for i in 0..n_updates.min(AL_UPDATES_PER_TRANSACTION) {
            let slot_off = HEADER_LEN + i * 2;
            let extent_off = extent_base + i * 4;
            let slot_nr = u16::from_be_bytes(buf[slot_off..slot_off + 2].try_into().unwrap());
            let extent_nr =
                u32::from_be_bytes(buf[extent_off..extent_off + 4].try_into().unwrap());
            updates.push((slot_nr, extent_nr));
        }

        let mut context = Vec::with_capacity(context_size.min(AL_CONTEXT_PER_TRANSACTION));
        for i in 0..context_size.min(AL_CONTEXT_PER_TRANSACTION) {
            let off = CONTEXT_OFFSET + i * 4;
            context.push(u32::from_be_bytes(buf[off..off + 4].try_into().unwrap()));
        }

        Ok(Self {
            tr_number,
            transaction_type,
            updates,
            context,
            context_start_slot_nr,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trip_preserves_fields() {
        let tx = AlTransaction {
            tr_number: 7,
            transaction_type: TransactionType::Update,
            updates: vec![(3, 100), (4, 101)],
            context: vec![1, 2, 3, 4],
            context_start_slot_nr: 0,
        };
        let bytes = tx.to_bytes();
        let back = AlTransaction::from_bytes(&bytes).unwrap();
        assert_eq!(back.tr_number, 7);
        assert_eq!(back.updates, vec![(3, 100), (4, 101)]);
        assert_eq!(back.context, vec![1, 2, 3, 4]);
    }

    #[test]
    fn corrupt_crc_is_rejected() {
        let tx = AlTransaction {
            tr_number: 1,
            transaction_type: TransactionType::Update,
            updates: vec![(0, 5)],
            context: vec![],
            context_start_slot_nr: 0,
        };
        let mut bytes = tx.to_bytes();
        bytes[100] ^= 0xff;
        assert!(matches!(
            AlTransaction::from_bytes(&bytes),
            Err(Error::ActivityLogCorrupt { tr_number: 1 })
        ));
    }

    #[test]
    fn unfilled_updates_are_padded_with_lc_free() {
        let tx = AlTransaction {
            tr_number: 2,
            transaction_type: TransactionType::Update,
            updates: vec![(0, 9)],
            context: vec![],
            context_start_slot_nr: 0,
        };
        let bytes = tx.to_bytes();
        let second_slot = u16::from_be_bytes(bytes[38..40].try_into().unwrap());
        assert_eq!(second_slot, LC_FREE as u16);
    }
}
