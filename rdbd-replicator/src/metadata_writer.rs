//! Persists activity-log transaction records to a reserved region of the
//! backing device (spec §4.3/§4.4: the activity log's on-disk ring).
//!
//! Grounded on `fatrs::transaction::TransactionLog`'s fixed-size, rotating
//! on-disk log, adapted from FAT's sector-addressed metadata region to a
//! small ring of [`rdbd_core::al_transaction::AL_TRANSACTION_SIZE`]-byte
//! slots reserved at the front of the device.

use std::sync::Arc;

use tokio::sync::Mutex;

use rdbd_block_device::{BlockDevice, SECTOR_SIZE};
use rdbd_core::al_transaction::{AlTransaction, AL_TRANSACTION_SIZE};
use rdbd_core::{AlTransactionWriter, Error, Result};

const SECTORS_PER_TRANSACTION: u64 = (AL_TRANSACTION_SIZE / SECTOR_SIZE) as u64;

/// Writes activity-log transactions into a ring of `ring_slots` fixed-size
/// records starting at `base_sector`, serialized through the device's
/// shared write lock.
pub struct DeviceAlWriter<D> {
    device: Arc<Mutex<D>>,
    base_sector: u64,
    ring_slots: u32,
}

impl<D> DeviceAlWriter<D> {
    /// `base_sector` and the `ring_slots`-sized region that follows it are
    /// reserved exclusively for activity-log transactions; callers must
    /// keep application data out of that range.
    pub fn new(device: Arc<Mutex<D>>, base_sector: u64, ring_slots: u32) -> Self {
        Self { device, base_sector, ring_slots: ring_slots.max(1) }
    }
}

impl<D> AlTransactionWriter for DeviceAlWriter<D>
where
    D: BlockDevice + Send,
{
    async fn write_transaction(&mut self, tx: &AlTransaction) -> Result<()> {
        let slot = tx.tr_number % self.ring_slots;
        let sector = self.base_sector + u64::from(slot) * SECTORS_PER_TRANSACTION;
        let bytes = tx.to_bytes();
        let mut dev = self.device.lock().await;
        dev.write(sector, &bytes)
            .await
            .map_err(|source| Error::LocalIo { sector, len: bytes.len() as u64, source })?;
        dev.flush()
            .await
            .map_err(|source| Error::LocalIo { sector, len: bytes.len() as u64, source })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rdbd_core::al_transaction::TransactionType;
    use rdbd_block_device::MemoryBlockDevice;

    #[tokio::test]
    async fn writes_land_in_the_slot_for_their_transaction_number() {
        let device = Arc::new(Mutex::new(MemoryBlockDevice::new(64)));
        let mut writer = DeviceAlWriter::new(device.clone(), 0, 4);
        let tx = AlTransaction {
            tr_number: 5,
            transaction_type: TransactionType::Update,
            updates: vec![(0, 10)],
            context: vec![],
            context_start_slot_nr: 0,
        };
        writer.write_transaction(&tx).await.unwrap();

        let expected_sector = (5 % 4) * SECTORS_PER_TRANSACTION;
        let mut buf = vec![0u8; AL_TRANSACTION_SIZE];
        device.lock().await.read(expected_sector, &mut buf).await.unwrap();
        let round_tripped = AlTransaction::from_bytes(buf.as_slice().try_into().unwrap()).unwrap();
        assert_eq!(round_tripped.tr_number, 5);
        assert_eq!(round_tripped.updates, vec![(0, 10)]);
    }
}
