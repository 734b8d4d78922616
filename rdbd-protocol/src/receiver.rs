//! Receiver: the data-socket side that applies inbound `Data`/`Barrier`
//! packets to the local backing device (spec §4.6 "Receive path", "Busy
//! block", "Barrier handling").
//!
//! Acks are never written back on the data socket itself; the receiver
//! only ever produces them and hands them to the asender's outgoing queue,
//! the same separation of data and meta sockets the wire layout assumes.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use tokio::sync::{mpsc, Mutex, Notify};
use tokio_util::sync::CancellationToken;

use rdbd_block_device::BlockDevice;
use rdbd_core::{Bitmap, Protocol};

use crate::error::Result;
use crate::io::read_packet;
use crate::packet::Packet;

/// Sectors currently being written locally. An overlapping `Data` packet
/// for a sector already in this set waits rather than racing the earlier
/// write (spec §4.6 "busy block").
#[derive(Default)]
struct BusyBlocks {
    inner: Mutex<HashSet<u64>>,
    notify: Notify,
}

impl BusyBlocks {
    async fn acquire(&self, sector: u64) {
        loop {
            {
                let mut set = self.inner.lock().await;
                if !set.contains(&sector) {
                    set.insert(sector);
                    return;
                }
            }
            self.notify.notified().await;
        }
    }

    async fn release(&self, sector: u64) {
        self.inner.lock().await.remove(&sector);
        self.notify.notify_waiters();
    }
}

#[derive(Default)]
struct EpochState {
    current: u32,
    outstanding: HashMap<u32, u32>,
    completed: HashMap<u32, u32>,
}

/// Per-epoch outstanding-write counter gating `Barrier` -> `BarrierAck`
/// promotion: a barrier only acks once every write received before it has
/// completed locally (spec §4 "Transfer Log / epochs").
struct EpochTracker {
    state: Mutex<EpochState>,
    notify: Notify,
}

impl EpochTracker {
    fn new() -> Self {
        Self { state: Mutex::new(EpochState::default()), notify: Notify::new() }
    }

    async fn begin_write(&self) -> u32 {
        let mut s = self.state.lock().await;
        let epoch = s.current;
        *s.outstanding.entry(epoch).or_insert(0) += 1;
        epoch
    }

    async fn finish_write(&self, epoch: u32) {
        let mut s = self.state.lock().await;
        if let Some(c) = s.outstanding.get_mut(&epoch) {
            *c -= 1;
        }
        *s.completed.entry(epoch).or_insert(0) += 1;
        drop(s);
        self.notify.notify_waiters();
    }

    /// Wait for the current epoch to drain, then return its completed
    /// count and roll to a new epoch. Writes belonging to the next epoch
    /// may already be outstanding when this returns; they are unaffected.
    async fn close_epoch(&self) -> u32 {
        let epoch;
        loop {
            let s = self.state.lock().await;
            let candidate = s.current;
            let outstanding = s.outstanding.get(&candidate).copied().unwrap_or(0);
            if outstanding == 0 {
                epoch = candidate;
                break;
            }
            drop(s);
            self.notify.notified().await;
        }
        let mut s = self.state.lock().await;
        let set_size = s.completed.remove(&epoch).unwrap_or(0);
        s.outstanding.remove(&epoch);
        s.current = epoch + 1;
        set_size
    }
}

/// Drives the data socket on the side that is applying a peer's writes:
/// reads `Data`/`Barrier` (and resync) packets, submits writes to `D`
/// through a single shared lock, and emits `RecvAck`/`WriteAck`/
/// `BarrierAck` onto `ack_tx` for the asender to carry out over the meta
/// socket.
pub struct Receiver<D> {
    device: Arc<Mutex<D>>,
    bitmap: Arc<Bitmap>,
    protocol: Protocol,
    ack_tx: mpsc::Sender<Packet>,
    busy: Arc<BusyBlocks>,
    epochs: Arc<EpochTracker>,
    cancel: CancellationToken,
}

impl<D> Receiver<D>
where
    D: BlockDevice + Send + 'static,
{
    pub fn new(
        device: Arc<Mutex<D>>,
        bitmap: Arc<Bitmap>,
        protocol: Protocol,
        ack_tx: mpsc::Sender<Packet>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            device,
            bitmap,
            protocol,
            ack_tx,
            busy: Arc::new(BusyBlocks::default()),
            epochs: Arc::new(EpochTracker::new()),
            cancel,
        }
    }

    /// Run the receive loop over `reader` until cancelled or the socket
    /// closes. Packets are processed in wire order, which is what fixes
    /// each `Data` write's epoch membership relative to the `Barrier`s
    /// around it.
    pub async fn run<R>(&self, mut reader: R) -> Result<()>
    where
        R: tokio::io::AsyncRead + Unpin,
    {
        loop {
            let packet = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => return Ok(()),
                res = read_packet(&mut reader) => res?,
            };
            match packet {
                Packet::Data { sector, block_id, payload } => {
                    self.handle_data(sector, block_id, payload).await;
                }
                Packet::Barrier { barrier_nr } => {
                    let set_size = self.epochs.close_epoch().await;
                    let _ = self.ack_tx.send(Packet::BarrierAck { barrier_nr, set_size }).await;
                }
                Packet::WriteHint { sector } => {
                    let sectors_per_bit =
                        rdbd_core::bitmap::BM_BLOCK_SIZE / rdbd_block_device::SECTOR_SIZE as u64;
                    let bitnr = sector / sectors_per_bit;
                    let al_extent = bitnr / rdbd_core::bitmap::BITS_PER_AL_EXTENT;
                    self.bitmap.mark_page_dirty(rdbd_core::bitmap::al_extent_to_bm_page(al_extent as u32));
                }
                Packet::RsDataRequest { sector, size } => {
                    let mut buf = vec![0u8; size as usize];
                    let mut dev = self.device.lock().await;
                    if dev.read(sector, &mut buf).await.is_ok() {
                        drop(dev);
                        let _ = self
                            .ack_tx
                            .send(Packet::RsDataReply { sector, payload: bytes::Bytes::from(buf) })
                            .await;
                    }
                }
                other => {
                    log::warn!("receiver: unexpected packet on data socket: {:?}", other.command());
                }
            }
        }
    }

    async fn handle_data(&self, sector: u64, block_id: u64, payload: bytes::Bytes) {
        if self.protocol != Protocol::A {
            let _ = self.ack_tx.send(Packet::RecvAck { block_id }).await;
        }
        self.busy.acquire(sector).await;
        let epoch = self.epochs.begin_write().await;
        let mut dev = self.device.lock().await;
        let write_ok = dev.write(sector, &payload).await.is_ok();
        let flush_ok = write_ok && dev.flush().await.is_ok();
        drop(dev);
        if write_ok {
            self.bitmap.mark_in_sync(sector, payload.len() as u32);
        }
        self.epochs.finish_write(epoch).await;
        self.busy.release(sector).await;
        if self.protocol == Protocol::C && flush_ok {
            let _ = self.ack_tx.send(Packet::WriteAck { block_id }).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rdbd_block_device::MemoryBlockDevice;

    fn device(sectors: u64) -> Arc<Mutex<MemoryBlockDevice>> {
        Arc::new(Mutex::new(MemoryBlockDevice::new(sectors)))
    }

    #[tokio::test]
    async fn protocol_c_data_write_clears_out_of_sync_and_acks_write() {
        let (tx, mut rx) = mpsc::channel(8);
        let bitmap = Arc::new(Bitmap::new(1024));
        bitmap.mark_out_of_sync(0, 4096);
        let recv = Receiver::new(device(16), bitmap.clone(), Protocol::C, tx, CancellationToken::new());
        let payload = bytes::Bytes::from(vec![7u8; 4096]);
        recv.handle_data(0, 42, payload).await;
        assert_eq!(bitmap.weight(), 0);
        let acks: Vec<_> = std::iter::from_fn(|| rx.try_recv().ok()).collect();
        assert!(acks.iter().any(|p| matches!(p, Packet::RecvAck { block_id: 42 })));
        assert!(acks.iter().any(|p| matches!(p, Packet::WriteAck { block_id: 42 })));
    }

    #[tokio::test]
    async fn protocol_a_data_write_sends_no_acks() {
        let (tx, mut rx) = mpsc::channel(8);
        let bitmap = Arc::new(Bitmap::new(1024));
        let recv = Receiver::new(device(16), bitmap, Protocol::A, tx, CancellationToken::new());
        recv.handle_data(0, 1, bytes::Bytes::from(vec![0u8; 4096])).await;
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn barrier_closes_epoch_and_reports_completed_count() {
        let (tx, mut rx) = mpsc::channel(8);
        let bitmap = Arc::new(Bitmap::new(1024));
        let recv = Receiver::new(device(16), bitmap, Protocol::B, tx, CancellationToken::new());
        recv.handle_data(0, 1, bytes::Bytes::from(vec![0u8; 4096])).await;
        recv.handle_data(1, 2, bytes::Bytes::from(vec![0u8; 4096])).await;
        let set_size = recv.epochs.close_epoch().await;
        assert_eq!(set_size, 2);
        while let Ok(_) = rx.try_recv() {}
    }
}
