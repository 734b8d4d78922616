//! Transfer log: an in-memory ring of in-flight requests grouped into
//! barrier-delimited epochs (spec §3 "Transfer-Log Entry"/"Epoch", §4.4
//! component C4).
//!
//! A fixed-capacity ring with a reader/writer lock, matching the
//! begin/end-pointer ring described in spec §4.4. Entries are appended by
//! the sender just before a write goes out on the wire; barriers are
//! appended when `ISSUE_BARRIER` fires. [`TransferLog::release`] advances
//! the ring as `BarrierAck`s arrive; [`TransferLog::dependence`] and
//! [`TransferLog::check_sector`] answer the reverse-scan queries the
//! request lifecycle (C8) needs before it can locally complete a write.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::RwLock;

use crate::error::Error;

/// Result of [`TransferLog::clear`]: requests to force-complete upstream
/// (dirty) and sectors to mark out-of-sync, both drawn from entries that
/// had not yet reached `RQ_DRBD_WRITTEN`/local completion at disconnect.
#[derive(Debug, Default, Clone)]
pub struct TlClearResult {
    /// Request ids that must be completed upstream with the dirty bit set.
    pub to_complete: Vec<u64>,
    /// Sectors that must be marked out-of-sync in the bitmap.
    pub out_of_sync_sectors: Vec<u64>,
}

/// One slot in the transfer log ring.
#[derive(Debug, Clone)]
enum TlEntry {
    /// A write request in flight. `finished` marks it as locally complete;
    /// it is kept in the ring as a tombstone (rather than removed) until
    /// its epoch is released, so conflict scans still see it.
    Write {
        request_id: u64,
        sector: u64,
        finished: bool,
    },
    /// A barrier marker carrying a monotonically increasing epoch number.
    Barrier { bnr: u32 },
}

struct Inner {
    ring: VecDeque<TlEntry>,
    capacity: usize,
    /// Set once the ring crosses 75% full; cleared when a barrier is
    /// appended. The sender checks this before sending the next data block
    /// and, if set, prepends a `Barrier` packet (spec §4.4 `add`, §4.6
    /// "send-barrier policy").
    issue_barrier: bool,
}

/// In-memory ring of in-flight requests grouped into barrier-delimited
/// epochs.
pub struct TransferLog {
    inner: RwLock<Inner>,
    next_barrier_nr: AtomicU32,
}

impl TransferLog {
    /// Create a transfer log with room for `capacity` entries (writes and
    /// barriers combined).
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: RwLock::new(Inner {
                ring: VecDeque::with_capacity(capacity),
                capacity,
                issue_barrier: false,
            }),
            next_barrier_nr: AtomicU32::new(1),
        }
    }

    /// Number of entries currently held (writes and barriers).
    pub fn len(&self) -> usize {
        self.inner.read().unwrap().ring.len()
    }

    /// True if the ring holds no entries.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Append a write entry for `request_id` at `sector`. Must happen
    /// strictly before the corresponding `Data` packet leaves the wire
    /// (spec §5 ordering guarantee).
    pub fn append_write(&self, request_id: u64, sector: u64) -> Result<(), Error> {
        let mut inner = self.inner.write().unwrap();
        if inner.ring.len() >= inner.capacity {
            log::error!(
                "transfer log overflow: ring of capacity {} is full",
                inner.capacity
            );
            return Err(Error::TransferLogOverflow { capacity: inner.capacity });
        }
        inner.ring.push_back(TlEntry::Write { request_id, sector, finished: false });
        if inner.ring.len() * 4 >= inner.capacity * 3 {
            inner.issue_barrier = true;
        }
        Ok(())
    }

    /// True if the ring has crossed 75% full since the last barrier and a
    /// barrier should be prepended to the next outgoing data block.
    pub fn should_issue_barrier(&self) -> bool {
        self.inner.read().unwrap().issue_barrier
    }

    /// Append a barrier entry and return its fresh, monotonically
    /// increasing number. Callers must hold their own send-side mutex
    /// across this call and the wire `Barrier` packet send so barriers are
    /// never reordered with the data that preceded them (spec §4.6).
    pub fn add_barrier(&self) -> Result<u32, Error> {
        let mut inner = self.inner.write().unwrap();
        if inner.ring.len() >= inner.capacity {
            log::error!(
                "transfer log overflow: ring of capacity {} is full",
                inner.capacity
            );
            return Err(Error::TransferLogOverflow { capacity: inner.capacity });
        }
        let bnr = self.next_barrier_nr.fetch_add(1, Ordering::SeqCst);
        inner.ring.push_back(TlEntry::Barrier { bnr });
        inner.issue_barrier = false;
        Ok(bnr)
    }

    /// Mark a request completed locally without releasing its epoch. It
    /// remains in the ring as a tombstone for conflict scans until the
    /// enclosing epoch is released.
    pub fn mark_finished(&self, request_id: u64) {
        let mut inner = self.inner.write().unwrap();
        for entry in inner.ring.iter_mut() {
            if let TlEntry::Write { request_id: id, finished, .. } = entry {
                if *id == request_id {
                    *finished = true;
                    return;
                }
            }
        }
    }

    /// The peer finished an epoch: advance the ring past every entry up to
    /// and including the barrier numbered `bnr`. Verifies the observed
    /// entry count against `set_size`; a mismatch is logged as
    /// [`Error::EpochMismatch`] but never prevents the ring from advancing
    /// (spec §7: diagnostic only, the peer's count is authoritative).
    pub fn release(&self, bnr: u32, set_size: u32) {
        let mut inner = self.inner.write().unwrap();
        let mut observed: u32 = 0;
        let mut found = false;
        while let Some(entry) = inner.ring.pop_front() {
            match entry {
                TlEntry::Write { .. } => observed += 1,
                TlEntry::Barrier { bnr: entry_bnr } => {
                    found = true;
                    if entry_bnr != bnr || observed != set_size {
                        log::error!(
                            "{}",
                            Error::EpochMismatch { barrier_nr: bnr, expected: observed, observed: set_size }
                        );
                    }
                    break;
                }
            }
        }
        if !found {
            log::error!(
                "{}",
                Error::EpochMismatch { barrier_nr: bnr, expected: observed, observed: set_size }
            );
        }
    }

    /// Reverse-scan from the end of the ring back to the start or the
    /// nearest barrier, looking for `request_id`. If found, mark it
    /// finished and return `true` (the request is still within the current
    /// epoch; a local completion ack must not be issued yet). If a barrier
    /// or the start of the ring is reached first, return `false`.
    pub fn dependence(&self, request_id: u64) -> bool {
        let mut inner = self.inner.write().unwrap();
        for entry in inner.ring.iter_mut().rev() {
            match entry {
                TlEntry::Write { request_id: id, finished, .. } if *id == request_id => {
                    *finished = true;
                    return true;
                }
                TlEntry::Barrier { .. } => return false,
                TlEntry::Write { .. } => continue,
            }
        }
        false
    }

    /// Connection loss: walk every entry, collect the requests that must be
    /// force-completed (dirty) upstream and the sectors that must be marked
    /// out-of-sync, then reinitialize the ring (spec §4.4 `clear`,
    /// invariant 5, scenario C).
    ///
    /// A request is force-completed here if it is not yet marked finished
    /// (i.e. never reached `RQ_DRBD_WRITTEN`/`SENT` far enough to complete
    /// locally under protocol C, or "dirty" under any protocol). Every
    /// sector belonging to such a request is marked out-of-sync, since the
    /// peer cannot be trusted to hold a matching copy of it.
    pub fn clear(&self) -> TlClearResult {
        let mut inner = self.inner.write().unwrap();
        let mut to_complete = Vec::new();
        let mut out_of_sync_sectors = Vec::new();
        for entry in inner.ring.drain(..) {
            if let TlEntry::Write { request_id, sector, finished } = entry {
                if !finished {
                    to_complete.push(request_id);
                    out_of_sync_sectors.push(sector);
                }
            }
        }
        inner.issue_barrier = false;
        TlClearResult { to_complete, out_of_sync_sectors }
    }

    /// Reverse-scan the current epoch (end back to the start or the
    /// nearest barrier) for a not-yet-written request touching `sector`.
    pub fn check_sector(&self, sector: u64) -> bool {
        let inner = self.inner.read().unwrap();
        for entry in inner.ring.iter().rev() {
            match entry {
                TlEntry::Write { sector: s, finished, .. } if *s == sector && !*finished => {
                    return true;
                }
                TlEntry::Barrier { .. } => return false,
                TlEntry::Write { .. } => continue,
            }
        }
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn overflow_is_reported() {
        let tl = TransferLog::new(2);
        tl.append_write(1, 100).unwrap();
        tl.append_write(2, 200).unwrap();
        assert!(matches!(
            tl.append_write(3, 300),
            Err(Error::TransferLogOverflow { capacity: 2 })
        ));
    }

    #[test]
    fn dependence_stops_at_barrier() {
        let tl = TransferLog::new(8);
        tl.append_write(1, 10).unwrap();
        tl.add_barrier().unwrap();
        tl.append_write(2, 20).unwrap();
        assert!(tl.dependence(2));
        assert!(!tl.dependence(1), "request predates the barrier: not in current epoch");
    }

    #[test]
    fn check_sector_ignores_finished_writes() {
        let tl = TransferLog::new(8);
        tl.append_write(1, 500).unwrap();
        assert!(tl.check_sector(500));
        tl.mark_finished(1);
        assert!(!tl.check_sector(500));
    }

    #[test]
    fn release_advances_past_matching_barrier() {
        let tl = TransferLog::new(8);
        tl.append_write(1, 1).unwrap();
        tl.append_write(2, 2).unwrap();
        let bnr = tl.add_barrier().unwrap();
        tl.append_write(3, 3).unwrap();
        assert_eq!(tl.len(), 4);
        tl.release(bnr, 2);
        assert_eq!(tl.len(), 1, "only the trailing write after the barrier remains");
    }

    #[test]
    fn crossing_three_quarters_full_requests_a_barrier() {
        let tl = TransferLog::new(8);
        for i in 0..5 {
            tl.append_write(i, i).unwrap();
        }
        assert!(!tl.should_issue_barrier(), "5/8 has not crossed 75%");
        tl.append_write(5, 5).unwrap();
        assert!(tl.should_issue_barrier(), "6/8 = 75%: a barrier must be issued");
        tl.add_barrier().unwrap();
        assert!(!tl.should_issue_barrier(), "flag clears once the barrier is appended");
    }

    #[test]
    fn clear_force_completes_unfinished_writes_and_marks_sectors() {
        let tl = TransferLog::new(8);
        tl.append_write(1, 100).unwrap();
        tl.append_write(2, 200).unwrap();
        tl.mark_finished(1);
        tl.append_write(3, 300).unwrap();
        let result = tl.clear();
        assert_eq!(result.to_complete, vec![2, 3]);
        assert_eq!(result.out_of_sync_sectors, vec![200, 300]);
        assert!(tl.is_empty(), "ring is reinitialized after clear");
        assert!(!tl.should_issue_barrier());
    }

    #[test]
    fn release_with_wrong_set_size_still_advances() {
        let tl = TransferLog::new(8);
        tl.append_write(1, 1).unwrap();
        let bnr = tl.add_barrier().unwrap();
        tl.release(bnr, 99);
        assert!(tl.is_empty(), "mismatch is logged, not fatal: ring still advances");
    }
}
