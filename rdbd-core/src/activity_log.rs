//! Activity log: a bounded, write-through cache of "hot" 4 MiB extents
//! (spec §3 "Activity Log", §4.3 component C3).
//!
//! Grounded on two sources: the slot/LRU/CRC'd-transaction shape of
//! `drbd_actlog.c`'s `lc_get`/`al_write_transaction`/`_al_get`, and the
//! fixed-record, single-writer-buffer serialization style of
//! `fatrs::transaction::TransactionLog`.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};

use tokio::sync::Notify;

use crate::al_transaction::{
    AlTransaction, TransactionType, AL_CONTEXT_PER_TRANSACTION, AL_UPDATES_PER_TRANSACTION,
};
use crate::error::Result;
use crate::metadata_io::MetadataIoBuffer;

/// Anything the activity log needs to know about resync state for an
/// extent, without depending on the resync LRU's concrete type.
///
/// Implemented by [`crate::resync_lru::ResyncLru`]; kept as a trait here so
/// the two modules couple through a narrow seam rather than each other's
/// internals (spec §4.3 scenario F / §4.2 `NO_WRITES`).
pub trait ResyncGate {
    /// True if the BME covering this AL extent currently has `NO_WRITES`
    /// set (a resync pass owns it).
    fn blocks_al_extent(&self, al_extent: u32) -> bool;
    /// Ask the resync side to step aside for this AL extent (raises
    /// `PRIORITY` on the covering BME).
    fn raise_priority(&self, al_extent: u32);
}

/// A gate that never blocks, for devices run without a resync LRU attached.
pub struct NoResyncGate;

impl ResyncGate for NoResyncGate {
    fn blocks_al_extent(&self, _al_extent: u32) -> bool {
        false
    }
    fn raise_priority(&self, _al_extent: u32) {}
}

#[derive(Debug, Clone, Copy)]
struct AleSlot {
    extent: Option<u32>,
    refcnt: u32,
}

struct AlInner {
    slots: Vec<AleSlot>,
    index: HashMap<u32, usize>,
    /// Recency order, most recently touched at the back. Only slots with
    /// `refcnt == 0` are eviction candidates, scanned from the front.
    lru: VecDeque<usize>,
    /// Slots changed since the last transaction write, in change order.
    pending: Vec<(u16, u32)>,
    al_tr_number: u32,
    /// Rotating cursor into the slot table for the `context` snapshot that
    /// rides along with each transaction, so the whole table gets covered
    /// on disk even when updates are sparse.
    context_cursor: u16,
}

impl AlInner {
    fn touch(&mut self, slot: usize) {
        if let Some(pos) = self.lru.iter().position(|&s| s == slot) {
            self.lru.remove(pos);
        }
        self.lru.push_back(slot);
    }

    fn find_evictable(&self) -> Option<usize> {
        self.lru.iter().copied().find(|&s| self.slots[s].refcnt == 0)
    }
}

/// Bounded cache of active extents with CRC-guarded transaction logging to
/// stable storage.
pub struct ActivityLog {
    inner: Mutex<AlInner>,
    /// Signalled whenever a slot's refcount drops to zero or a transaction
    /// commits, so waiters blocked in [`ActivityLog::begin_io`] can retry.
    wait: Arc<Notify>,
    io_buffer: Arc<MetadataIoBuffer>,
}

impl ActivityLog {
    /// Create an activity log with `nr_elements` resident slots.
    pub fn new(nr_elements: u32, io_buffer: Arc<MetadataIoBuffer>) -> Self {
        let nr_elements = nr_elements.max(1) as usize;
        Self {
            inner: Mutex::new(AlInner {
                slots: vec![AleSlot { extent: None, refcnt: 0 }; nr_elements],
                index: HashMap::new(),
                lru: VecDeque::new(),
                pending: Vec::new(),
                al_tr_number: 0,
                context_cursor: 0,
            }),
            wait: Arc::new(Notify::new()),
            io_buffer,
        }
    }

    /// Number of resident slots.
    pub fn nr_elements(&self) -> usize {
        self.inner.lock().unwrap().slots.len()
    }

    /// True if `al_extent` currently has a resident slot with an active
    /// reference (used by the resync LRU to decide whether a BME can take
    /// `NO_WRITES`, spec §4.2 scenario F).
    pub fn is_al_extent_active(&self, al_extent: u32) -> bool {
        let inner = self.inner.lock().unwrap();
        inner
            .index
            .get(&al_extent)
            .is_some_and(|&slot| inner.slots[slot].refcnt > 0)
    }

    /// Acquire a reference on `al_extent`, staging a slot reassignment if it
    /// is not already resident. Suspends (without blocking the executor)
    /// while the covering BME holds `NO_WRITES`, per spec §4.3's coupling to
    /// the resync side.
    pub async fn begin_io(&self, al_extent: u32, gate: &dyn ResyncGate) {
        loop {
            if gate.blocks_al_extent(al_extent) {
                gate.raise_priority(al_extent);
                self.wait.notified().await;
                continue;
            }
            {
                let mut inner = self.inner.lock().unwrap();
                if let Some(&slot) = inner.index.get(&al_extent) {
                    inner.slots[slot].refcnt += 1;
                    inner.touch(slot);
                    return;
                }
                if let Some(slot) = inner.find_evictable() {
                    if let Some(old) = inner.slots[slot].extent {
                        inner.index.remove(&old);
                    }
                    inner.slots[slot] = AleSlot { extent: Some(al_extent), refcnt: 1 };
                    inner.index.insert(al_extent, slot);
                    inner.touch(slot);
                    inner.pending.push((slot as u16, al_extent));
                    return;
                }
            }
            self.wait.notified().await;
        }
    }

    /// Release a reference taken by [`ActivityLog::begin_io`]. Wakes
    /// waiters once the last reference on a slot drops, so it becomes
    /// evictable.
    pub fn complete_io(&self, al_extent: u32) {
        let mut became_free = false;
        {
            let mut inner = self.inner.lock().unwrap();
            if let Some(&slot) = inner.index.get(&al_extent) {
                if inner.slots[slot].refcnt > 0 {
                    inner.slots[slot].refcnt -= 1;
                    became_free = inner.slots[slot].refcnt == 0;
                }
            }
        }
        if became_free {
            self.wait.notify_waiters();
        }
    }

    /// Drop every resident extent once all references have gone to zero.
    /// Callers are expected to hold the device quiesced; this only waits
    /// on in-flight references, not on new ones arriving.
    pub async fn shrink(&self) {
        loop {
            {
                let mut inner = self.inner.lock().unwrap();
                if inner.slots.iter().all(|s| s.refcnt == 0) {
                    for slot in &mut inner.slots {
                        slot.extent = None;
                    }
                    inner.index.clear();
                    inner.lru.clear();
                    return;
                }
            }
            self.wait.notified().await;
        }
    }

    /// Whether there are staged changes not yet durably logged.
    pub fn has_pending_changes(&self) -> bool {
        !self.inner.lock().unwrap().pending.is_empty()
    }

    /// Flush staged slot changes to stable storage as one or more
    /// CRC32c-guarded transaction records (spec §4.4), serialized through
    /// the shared metadata I/O buffer. Each record carries at most
    /// [`AL_UPDATES_PER_TRANSACTION`] updates and a rotating snapshot of the
    /// slot table so the full table is recoverable from the log alone.
    pub async fn write_transaction<W: AlTransactionWriter>(&self, writer: &mut W) -> Result<()> {
        let _permit = self.io_buffer.acquire().await?;

        loop {
            let (batch, context, context_start, tr_number, done) = {
                let mut inner = self.inner.lock().unwrap();
                if inner.pending.is_empty() {
                    return Ok(());
                }
                let take = inner.pending.len().min(AL_UPDATES_PER_TRANSACTION);
                let batch: Vec<(u16, u32)> = inner.pending.drain(..take).collect();

                let nr_slots = inner.slots.len();
                let window = AL_CONTEXT_PER_TRANSACTION.min(nr_slots);
                let start = inner.context_cursor as usize % nr_slots.max(1);
                let mut context = Vec::with_capacity(window);
                for i in 0..window {
                    let idx = (start + i) % nr_slots;
                    context.push(inner.slots[idx].extent.unwrap_or(crate::al_transaction::LC_FREE));
                }
                inner.context_cursor = ((start + window) % nr_slots.max(1)) as u16;

                inner.al_tr_number += 1;
                (batch, context, start as u16, inner.al_tr_number, inner.pending.is_empty())
            };

            let tx = AlTransaction {
                tr_number,
                transaction_type: TransactionType::Update,
                updates: batch,
                context,
                context_start_slot_nr: context_start,
            };
            writer.write_transaction(&tx).await?;

            if done {
                break;
            }
        }
        self.wait.notify_waiters();
        Ok(())
    }
}

/// Persists encoded transaction records; implemented over the backing
/// device's metadata region by the replicator crate.
#[trait_variant::make(SendAlTransactionWriter: Send)]
pub trait AlTransactionWriter {
    async fn write_transaction(&mut self, tx: &AlTransaction) -> Result<()>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex as StdMutex;

    struct RecordingWriter {
        records: StdMutex<Vec<AlTransaction>>,
    }

    impl AlTransactionWriter for RecordingWriter {
        async fn write_transaction(&mut self, tx: &AlTransaction) -> Result<()> {
            self.records.lock().unwrap().push(tx.clone());
            Ok(())
        }
    }

    fn al(nr: u32) -> ActivityLog {
        ActivityLog::new(nr, Arc::new(MetadataIoBuffer::new()))
    }

    #[tokio::test]
    async fn repeated_access_to_same_extent_reuses_slot() {
        let log = al(4);
        log.begin_io(10, &NoResyncGate).await;
        log.begin_io(10, &NoResyncGate).await;
        assert!(log.is_al_extent_active(10));
        log.complete_io(10);
        assert!(log.is_al_extent_active(10));
        log.complete_io(10);
        assert!(!log.is_al_extent_active(10));
    }

    #[tokio::test]
    async fn evicts_lru_slot_when_full() {
        let log = al(2);
        log.begin_io(1, &NoResyncGate).await;
        log.complete_io(1);
        log.begin_io(2, &NoResyncGate).await;
        log.complete_io(2);
        // Both slots now free; extent 1 is least recently touched.
        log.begin_io(3, &NoResyncGate).await;
        assert!(log.is_al_extent_active(3));
        {
            let inner = log.inner.lock().unwrap();
            assert!(!inner.index.contains_key(&1));
            assert!(inner.index.contains_key(&2));
        }
    }

    #[tokio::test]
    async fn write_transaction_drains_pending_and_is_idempotent_when_empty() {
        let log = al(4);
        log.begin_io(5, &NoResyncGate).await;
        assert!(log.has_pending_changes());
        let mut writer = RecordingWriter { records: StdMutex::new(Vec::new()) };
        log.write_transaction(&mut writer).await.unwrap();
        assert!(!log.has_pending_changes());
        assert_eq!(writer.records.lock().unwrap().len(), 1);
        // No-op when nothing pending.
        log.write_transaction(&mut writer).await.unwrap();
        assert_eq!(writer.records.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn resync_gate_suspends_begin_io_until_released() {
        struct Blocking(std::sync::atomic::AtomicBool);
        impl ResyncGate for Blocking {
            fn blocks_al_extent(&self, _e: u32) -> bool {
                self.0.load(std::sync::atomic::Ordering::SeqCst)
            }
            fn raise_priority(&self, _e: u32) {}
        }
        let log = Arc::new(al(4));
        let gate = Arc::new(Blocking(std::sync::atomic::AtomicBool::new(true)));
        let log2 = log.clone();
        let gate2 = gate.clone();
        let handle = tokio::spawn(async move {
            log2.begin_io(1, gate2.as_ref()).await;
        });
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        assert!(!handle.is_finished());
        gate.0.store(false, std::sync::atomic::Ordering::SeqCst);
        log.wait.notify_waiters();
        handle.await.unwrap();
        assert!(log.is_al_extent_active(1));
    }
}
