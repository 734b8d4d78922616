//! Resync LRU: a bounded cache of bitmap extents (BME) currently under
//! active resync, coupled to the activity log so app writes and resync I/O
//! take turns rather than starving each other (spec §3 "Resync LRU", §4.2
//! component C2, scenario F).
//!
//! Grounded on `drbd_actlog.c`'s `_bme_get`/`bme_put`/`drbd_try_clear_on_disk_bm`
//! bookkeeping (`rs_left`, `rs_failed`, the `NO_WRITES`/`LOCKED`/`PRIORITY`
//! flag trio) and, for the slot/LRU cache shape itself, the same
//! slot-table style used in [`crate::activity_log`].

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;

use tokio::sync::Notify;

use crate::activity_log::ResyncGate;
use crate::bitmap::{Bitmap, BITS_PER_AL_EXTENT, BITS_PER_RS_EXTENT};

/// AL extents covered by one resync (BME) extent.
const AL_EXTENTS_PER_RS_EXTENT: u32 = (BITS_PER_RS_EXTENT / BITS_PER_AL_EXTENT) as u32;

/// Number of times an AL writer may be made to step aside for an in-flight
/// resync chunk on the same extent before the resync side is forced to
/// yield it back.
pub const STEP_ASIDE_THRESHOLD: u32 = 200;

#[derive(Debug, Clone)]
struct Bme {
    rs_extent: u32,
    refcnt: u32,
    /// Resync I/O is in flight for this extent; the activity log must not
    /// hand out a reference to any AL extent it covers.
    no_writes: bool,
    /// A resync request is outstanding (sent and not yet acknowledged).
    locked: bool,
    /// Number of times an AL writer has asked this extent to step aside
    /// while `no_writes` was set.
    priority: u32,
    /// Out-of-sync blocks remaining in this extent, cached from the bitmap
    /// and decremented as resync clears them.
    rs_left: u64,
    /// Blocks that failed to resync (read or write error) within this
    /// extent.
    rs_failed: u64,
}

struct Inner {
    slots: Vec<Option<Bme>>,
    index: HashMap<u32, usize>,
    lru: VecDeque<usize>,
}

impl Inner {
    fn touch(&mut self, slot: usize) {
        if let Some(pos) = self.lru.iter().position(|&s| s == slot) {
            self.lru.remove(pos);
        }
        self.lru.push_back(slot);
    }

    fn find_evictable(&self) -> Option<usize> {
        self.lru.iter().copied().find(|&s| {
            self.slots[s]
                .as_ref()
                .is_none_or(|bme| bme.refcnt == 0 && !bme.no_writes && !bme.locked)
        })
    }

    /// Count of slots currently under an in-flight resync I/O (`LOCKED`).
    fn locked_count(&self) -> usize {
        self.slots.iter().flatten().filter(|bme| bme.locked).count()
    }
}

/// Outcome of finishing a resync chunk, fed back into the cached
/// `rs_left`/`rs_failed` counters.
#[derive(Debug, Clone, Copy)]
pub struct ResyncOutcome {
    /// Blocks cleared (marked in-sync) by this chunk.
    pub cleared: u64,
    /// Blocks that failed and remain out-of-sync.
    pub failed: u64,
}

/// Bounded cache of bitmap extents under active resync.
pub struct ResyncLru {
    inner: Mutex<Inner>,
    wait: Notify,
}

impl ResyncLru {
    /// Create a resync LRU with room for `nr_elements` concurrently-cached
    /// extents.
    pub fn new(nr_elements: u32) -> Self {
        let nr_elements = nr_elements.max(1) as usize;
        Self {
            inner: Mutex::new(Inner {
                slots: vec![None; nr_elements],
                index: HashMap::new(),
                lru: VecDeque::new(),
            }),
            wait: Notify::new(),
        }
    }

    fn rs_extent_of_al_extent(al_extent: u32) -> u32 {
        al_extent / AL_EXTENTS_PER_RS_EXTENT
    }

    /// Acquire a reference on `rs_extent`, loading `rs_left` from the
    /// bitmap on a cache miss. Waits for a slot to free up if the cache is
    /// full of extents still under active resync, and refuses to admit a
    /// new extent at all while more than half the cache's slots are
    /// `LOCKED` (an in-flight resync I/O), mirroring `_bme_get`'s refusal
    /// to pile more concurrent resync work onto an already-saturated cache.
    pub async fn get_extent(&self, rs_extent: u32, bitmap: &Bitmap) -> u64 {
        loop {
            {
                let mut inner = self.inner.lock().unwrap();
                if let Some(&slot) = inner.index.get(&rs_extent) {
                    let rs_left = {
                        let bme = inner.slots[slot].as_mut().unwrap();
                        bme.refcnt += 1;
                        bme.rs_left
                    };
                    inner.touch(slot);
                    return rs_left;
                }
                if inner.locked_count() * 2 > inner.slots.len() {
                    // admitting a new extent would exceed half the cache
                    // under active resync; wait for one to finish instead.
                } else if let Some(slot) = inner.find_evictable() {
                    if let Some(old) = inner.slots[slot].take() {
                        inner.index.remove(&old.rs_extent);
                    }
                    let rs_left = bitmap.rs_weight(rs_extent);
                    inner.slots[slot] = Some(Bme {
                        rs_extent,
                        refcnt: 1,
                        no_writes: false,
                        locked: false,
                        priority: 0,
                        rs_left,
                        rs_failed: 0,
                    });
                    inner.index.insert(rs_extent, slot);
                    inner.touch(slot);
                    return rs_left;
                }
            }
            self.wait.notified().await;
        }
    }

    /// Release a reference taken by [`ResyncLru::get_extent`].
    pub fn put_extent(&self, rs_extent: u32) {
        let mut became_free = false;
        {
            let mut inner = self.inner.lock().unwrap();
            if let Some(&slot) = inner.index.get(&rs_extent) {
                if let Some(bme) = inner.slots[slot].as_mut() {
                    bme.refcnt = bme.refcnt.saturating_sub(1);
                    became_free = bme.refcnt == 0 && !bme.no_writes;
                }
            }
        }
        if became_free {
            self.wait.notify_waiters();
        }
    }

    /// Attempt to start a resync I/O on an already-referenced extent.
    /// Returns `false` ("step aside") if the application has raised
    /// PRIORITY on this extent and the step-aside budget
    /// ([`STEP_ASIDE_THRESHOLD`]) is not yet exhausted; the caller should
    /// pick a different extent and retry this one later. Once the budget
    /// is exhausted (or if PRIORITY was never raised), grabs the extent
    /// unconditionally.
    pub fn try_begin_resync_io(&self, rs_extent: u32) -> bool {
        let mut inner = self.inner.lock().unwrap();
        let Some(&slot) = inner.index.get(&rs_extent) else {
            return false;
        };
        let bme = inner.slots[slot].as_mut().unwrap();
        if bme.priority > 0 && bme.priority < STEP_ASIDE_THRESHOLD {
            return false;
        }
        bme.no_writes = true;
        bme.locked = true;
        true
    }

    /// Finish a resync I/O, updating cached counters and releasing the
    /// `NO_WRITES`/`LOCKED` flags so the activity log can proceed.
    pub fn end_resync_io(&self, rs_extent: u32, outcome: ResyncOutcome) {
        {
            let mut inner = self.inner.lock().unwrap();
            if let Some(&slot) = inner.index.get(&rs_extent) {
                let bme = inner.slots[slot].as_mut().unwrap();
                bme.rs_left = bme.rs_left.saturating_sub(outcome.cleared);
                bme.rs_failed += outcome.failed;
                bme.no_writes = false;
                bme.locked = false;
                bme.priority = 0;
            }
        }
        self.wait.notify_waiters();
    }

    /// Out-of-sync blocks remaining and failed blocks for a resident
    /// extent, if cached.
    pub fn counters(&self, rs_extent: u32) -> Option<(u64, u64)> {
        let inner = self.inner.lock().unwrap();
        let &slot = inner.index.get(&rs_extent)?;
        let bme = inner.slots[slot].as_ref()?;
        Some((bme.rs_left, bme.rs_failed))
    }
}

impl ResyncGate for ResyncLru {
    fn blocks_al_extent(&self, al_extent: u32) -> bool {
        let rs_extent = Self::rs_extent_of_al_extent(al_extent);
        let inner = self.inner.lock().unwrap();
        inner
            .index
            .get(&rs_extent)
            .and_then(|&slot| inner.slots[slot].as_ref())
            .is_some_and(|bme| bme.no_writes)
    }

    fn raise_priority(&self, al_extent: u32) {
        let rs_extent = Self::rs_extent_of_al_extent(al_extent);
        let mut inner = self.inner.lock().unwrap();
        if let Some(&slot) = inner.index.get(&rs_extent) {
            if let Some(bme) = inner.slots[slot].as_mut() {
                bme.priority += 1;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn get_extent_caches_rs_left_from_bitmap() {
        let bitmap = Bitmap::new(BITS_PER_RS_EXTENT * 2);
        bitmap.set_bits(0, 10);
        let lru = ResyncLru::new(4);
        let rs_left = lru.get_extent(0, &bitmap).await;
        assert_eq!(rs_left, 10);
        lru.put_extent(0);
    }

    #[tokio::test]
    async fn no_writes_blocks_al_extent_until_resync_ends() {
        let bitmap = Bitmap::new(BITS_PER_RS_EXTENT);
        let lru = ResyncLru::new(4);
        lru.get_extent(0, &bitmap).await;
        assert!(lru.try_begin_resync_io(0));
        assert!(lru.blocks_al_extent(0));
        assert!(lru.blocks_al_extent(AL_EXTENTS_PER_RS_EXTENT - 1));
        lru.end_resync_io(0, ResyncOutcome { cleared: 5, failed: 0 });
        assert!(!lru.blocks_al_extent(0));
        let (rs_left, rs_failed) = lru.counters(0).unwrap();
        assert_eq!(rs_failed, 0);
        assert!(rs_left <= u64::MAX);
    }

    #[tokio::test]
    async fn steps_aside_below_threshold_then_proceeds_once_exhausted() {
        let bitmap = Bitmap::new(BITS_PER_RS_EXTENT);
        let lru = ResyncLru::new(4);
        lru.get_extent(0, &bitmap).await;
        lru.raise_priority(0);
        assert!(
            !lru.try_begin_resync_io(0),
            "resync must step aside while PRIORITY is raised and the budget isn't exhausted"
        );
        for _ in 1..STEP_ASIDE_THRESHOLD {
            lru.raise_priority(0);
        }
        assert!(
            lru.try_begin_resync_io(0),
            "resync must grab the extent anyway once the step-aside budget is exhausted"
        );
        lru.end_resync_io(0, ResyncOutcome { cleared: 0, failed: 0 });
        // priority resets to 0 once a resync chunk completes, and with no
        // PRIORITY raised there is nothing to step aside for.
        assert!(lru.try_begin_resync_io(0));
    }

    #[tokio::test]
    async fn refuses_to_admit_a_new_extent_once_more_than_half_the_cache_is_locked() {
        let bitmap = Bitmap::new(BITS_PER_RS_EXTENT * 8);
        let lru = ResyncLru::new(4);
        for rs_extent in 0..2 {
            lru.get_extent(rs_extent, &bitmap).await;
            assert!(lru.try_begin_resync_io(rs_extent));
        }
        // 2/4 locked is not yet "more than half": a third extent may still
        // be admitted.
        lru.get_extent(2, &bitmap).await;
        assert!(lru.try_begin_resync_io(2));

        // 3/4 locked: a fourth extent must wait rather than be admitted,
        // even though one cache slot is still free.
        let admit = tokio::time::timeout(std::time::Duration::from_millis(50), lru.get_extent(3, &bitmap)).await;
        assert!(admit.is_err(), "admission must block while over half the cache is locked");

        lru.end_resync_io(0, ResyncOutcome { cleared: 0, failed: 0 });
        let admit = tokio::time::timeout(std::time::Duration::from_millis(50), lru.get_extent(3, &bitmap)).await;
        assert!(admit.is_ok(), "admission proceeds once a locked slot frees up");
    }
}
