//! Out-of-sync bitmap (spec §3 "Bitmap", §4.1 component C1).
//!
//! One bit per [`BM_BLOCK_SIZE`] of user data: `0` means both sides hold
//! identical data for that block (modulo in-flight writes tracked in the
//! transfer log), `1` means out-of-sync. Storage is word-granular behind a
//! single lock, matching the teacher's [`crate::generation`]-adjacent style
//! of small `Mutex`-guarded counters rather than per-bit atomics.

use std::collections::BTreeSet;
use std::sync::Mutex;

/// Bytes covered by one bitmap bit.
pub const BM_BLOCK_SIZE_B: u32 = 12;
/// `1 << BM_BLOCK_SIZE_B`.
pub const BM_BLOCK_SIZE: u64 = 1 << BM_BLOCK_SIZE_B;
/// Sector size in bytes (matches [`rdbd_block_device::SECTOR_SIZE`]).
const SECTOR_SIZE: u64 = rdbd_block_device::SECTOR_SIZE as u64;
/// Sectors covered by one bitmap bit.
const SECTORS_PER_BIT: u64 = BM_BLOCK_SIZE / SECTOR_SIZE;

/// Bytes covered by one activity-log extent (4 MiB).
pub const AL_EXTENT_SIZE_B: u32 = 22;
/// Bits per activity-log extent.
pub const BITS_PER_AL_EXTENT: u64 = (1u64 << AL_EXTENT_SIZE_B) / BM_BLOCK_SIZE;

/// Bytes covered by one resync (BME) extent (16 MiB = 4 AL extents).
pub const RS_EXTENT_SIZE_B: u32 = 24;
/// Bits per resync extent.
pub const BITS_PER_RS_EXTENT: u64 = (1u64 << RS_EXTENT_SIZE_B) / BM_BLOCK_SIZE;

/// Bits stored per in-memory bitmap page (a 4 KiB page of bitmap words).
const BITS_PER_BITMAP_PAGE: u64 = 4096 * 8;

/// Page index holding the bit for an activity-log extent.
pub fn al_extent_to_bm_page(al_enr: u32) -> u32 {
    ((al_enr as u64 * BITS_PER_AL_EXTENT) / BITS_PER_BITMAP_PAGE) as u32
}

/// Page index holding the bits for a resync extent.
pub fn rs_extent_to_bm_page(rs_enr: u32) -> u32 {
    ((rs_enr as u64 * BITS_PER_RS_EXTENT) / BITS_PER_BITMAP_PAGE) as u32
}

struct BitmapInner {
    words: Vec<u64>,
    nr_bits: u64,
    /// Single-slot cache for partial-clear accumulation: the bitmap bit
    /// currently being assembled from sub-block completions, and which
    /// sub-block positions within it have reported clean so far.
    sb_bitnr: Option<u64>,
    sb_mask: u32,
    /// Restartable scan cursor for [`Bitmap::get_blocknr`].
    cursor_bitnr: u64,
    cursor_sub: u32,
    cursor_done: bool,
    /// Bitmap pages hinted dirty by AL updates, pending an on-disk flush.
    dirty_pages: BTreeSet<u32>,
}

/// Word-granular, lock-guarded out-of-sync bitmap.
pub struct Bitmap {
    inner: Mutex<BitmapInner>,
}

impl Bitmap {
    /// Create a bitmap covering `nr_bits` blocks, all initially in sync.
    pub fn new(nr_bits: u64) -> Self {
        let words = vec![0u64; ((nr_bits + 63) / 64) as usize];
        Self {
            inner: Mutex::new(BitmapInner {
                words,
                nr_bits,
                sb_bitnr: None,
                sb_mask: 0,
                cursor_bitnr: 0,
                cursor_sub: 0,
                cursor_done: false,
                dirty_pages: BTreeSet::new(),
            }),
        }
    }

    /// Total number of bits this bitmap covers.
    pub fn nr_bits(&self) -> u64 {
        self.inner.lock().unwrap().nr_bits
    }

    fn get_bit_locked(inner: &BitmapInner, bitnr: u64) -> bool {
        let word = inner.words[(bitnr / 64) as usize];
        (word >> (bitnr % 64)) & 1 != 0
    }

    fn set_bit_locked(inner: &mut BitmapInner, bitnr: u64, value: bool) -> bool {
        let idx = (bitnr / 64) as usize;
        let mask = 1u64 << (bitnr % 64);
        let was_set = inner.words[idx] & mask != 0;
        if value {
            inner.words[idx] |= mask;
        } else {
            inner.words[idx] &= !mask;
        }
        was_set != value
    }

    /// Set or clear a single bit at sub-bitmap-block granularity.
    ///
    /// `blocknr` is expressed in units of `2^ln2_block_size` bytes. When
    /// `bit` is `false` and `ln2_block_size < BM_BLOCK_SIZE_B`, the clear is
    /// accumulated in a single-slot mask keyed by the enclosing bitmap bit;
    /// the bit is only cleared once every sub-block of that bitmap block has
    /// individually reported clean. Setting `bit = true` always takes effect
    /// immediately and discards any pending accumulation for that bit (a
    /// fresh write makes the block dirty again, regardless of in-flight
    /// sub-block completions).
    pub fn set(&self, blocknr: u64, ln2_block_size: u32, bit: bool) {
        assert!(ln2_block_size <= BM_BLOCK_SIZE_B, "block larger than a bitmap block");
        let shift = BM_BLOCK_SIZE_B - ln2_block_size;
        let bitmap_bit = blocknr >> shift;
        let mut inner = self.inner.lock().unwrap();
        if bitmap_bit >= inner.nr_bits {
            return;
        }
        if bit {
            Self::set_bit_locked(&mut inner, bitmap_bit, true);
            if inner.sb_bitnr == Some(bitmap_bit) {
                inner.sb_bitnr = None;
                inner.sb_mask = 0;
            }
            return;
        }
        let sub_count = 1u32 << shift;
        if sub_count == 1 {
            Self::set_bit_locked(&mut inner, bitmap_bit, false);
            return;
        }
        let sub_idx = (blocknr & ((1u64 << shift) - 1)) as u32;
        if inner.sb_bitnr != Some(bitmap_bit) {
            inner.sb_bitnr = Some(bitmap_bit);
            inner.sb_mask = 0;
        }
        inner.sb_mask |= 1 << sub_idx;
        let full_mask: u32 = if sub_count >= 32 {
            u32::MAX
        } else {
            (1u32 << sub_count) - 1
        };
        if inner.sb_mask & full_mask == full_mask {
            Self::set_bit_locked(&mut inner, bitmap_bit, false);
            inner.sb_bitnr = None;
            inner.sb_mask = 0;
        }
    }

    /// Return the next set bit as a block number at `ln2_block_size`
    /// granularity, advancing the internal scan cursor. Returns `None`
    /// ("MBDS_DONE") once the bitmap is exhausted; call [`Bitmap::reset`]
    /// to scan again.
    pub fn get_blocknr(&self, ln2_block_size: u32) -> Option<u64> {
        assert!(ln2_block_size <= BM_BLOCK_SIZE_B);
        let shift = BM_BLOCK_SIZE_B - ln2_block_size;
        let sub_count = 1u64 << shift;
        let mut inner = self.inner.lock().unwrap();
        if inner.cursor_done {
            return None;
        }
        loop {
            if inner.cursor_bitnr >= inner.nr_bits {
                inner.cursor_done = true;
                return None;
            }
            if !Self::get_bit_locked(&inner, inner.cursor_bitnr) {
                inner.cursor_bitnr += 1;
                inner.cursor_sub = 0;
                continue;
            }
            let result = (inner.cursor_bitnr << shift) + inner.cursor_sub as u64;
            inner.cursor_sub += 1;
            if u64::from(inner.cursor_sub) >= sub_count {
                inner.cursor_bitnr += 1;
                inner.cursor_sub = 0;
            }
            return Some(result);
        }
    }

    /// Restart the [`Bitmap::get_blocknr`] scan cursor from the beginning.
    pub fn reset(&self) {
        let mut inner = self.inner.lock().unwrap();
        inner.cursor_bitnr = 0;
        inner.cursor_sub = 0;
        inner.cursor_done = false;
    }

    /// Population count over the whole bitmap.
    pub fn weight(&self) -> u64 {
        let inner = self.inner.lock().unwrap();
        inner.words.iter().map(|w| w.count_ones() as u64).sum()
    }

    /// Count set bits in `[bit_start, bit_end)`.
    pub fn count_bits(&self, bit_start: u64, bit_end: u64) -> u64 {
        let inner = self.inner.lock().unwrap();
        (bit_start..bit_end.min(inner.nr_bits))
            .filter(|&b| Self::get_bit_locked(&inner, b))
            .count() as u64
    }

    /// Set bits in `[bit_start, bit_end)`, returning the number newly set.
    pub fn set_bits(&self, bit_start: u64, bit_end: u64) -> u64 {
        let mut inner = self.inner.lock().unwrap();
        let end = bit_end.min(inner.nr_bits);
        let mut count = 0u64;
        for b in bit_start..end {
            if Self::set_bit_locked(&mut inner, b, true) {
                count += 1;
            }
        }
        count
    }

    /// Clear bits in `[bit_start, bit_end)`, returning the number newly
    /// cleared.
    pub fn clear_bits(&self, bit_start: u64, bit_end: u64) -> u64 {
        let mut inner = self.inner.lock().unwrap();
        let end = bit_end.min(inner.nr_bits);
        let mut count = 0u64;
        for b in bit_start..end {
            if Self::set_bit_locked(&mut inner, b, false) {
                count += 1;
            }
        }
        count
    }

    /// Population count restricted to one activity-log extent.
    pub fn e_weight(&self, al_extent: u32) -> u64 {
        let start = al_extent as u64 * BITS_PER_AL_EXTENT;
        self.count_bits(start, start + BITS_PER_AL_EXTENT)
    }

    /// Population count restricted to one resync (BME) extent.
    pub fn rs_weight(&self, rs_extent: u32) -> u64 {
        let start = rs_extent as u64 * BITS_PER_RS_EXTENT;
        self.count_bits(start, start + BITS_PER_RS_EXTENT)
    }

    /// Mark the range `[sector, sector + size_bytes)` out-of-sync, rounding
    /// outward so any touched bitmap bit is included. Used for application
    /// writes and failure paths (§4.1, §7 `LocalIOError`/`EpochMismatch`
    /// policies).
    pub fn mark_out_of_sync(&self, sector: u64, size_bytes: u32) -> u64 {
        if size_bytes == 0 {
            return 0;
        }
        let size_sectors = (u64::from(size_bytes) + SECTOR_SIZE - 1) / SECTOR_SIZE;
        let last_sector = sector + size_sectors - 1;
        let sbnr = sector / SECTORS_PER_BIT;
        let ebnr = last_sector / SECTORS_PER_BIT;
        let count = self.set_bits(sbnr, ebnr + 1);
        if count > 0 {
            self.mark_page_dirty(al_extent_to_bm_page(
                (sbnr / BITS_PER_AL_EXTENT) as u32,
            ));
        }
        count
    }

    /// Mark the range `[sector, sector + size_bytes)` in-sync, rounding
    /// inward so only fully covered bitmap bits are cleared: a partial
    /// sub-block write never prematurely clears its enclosing bit.
    pub fn mark_in_sync(&self, sector: u64, size_bytes: u32) -> u64 {
        if size_bytes == 0 {
            return 0;
        }
        let size_sectors = (u64::from(size_bytes) + SECTOR_SIZE - 1) / SECTOR_SIZE;
        let last_sector = sector + size_sectors - 1;
        if last_sector + 1 < SECTORS_PER_BIT {
            return 0;
        }
        let sbnr = (sector + SECTORS_PER_BIT - 1) / SECTORS_PER_BIT;
        let ebnr_plus_one = (last_sector + 1 - (SECTORS_PER_BIT - 1)) / SECTORS_PER_BIT;
        if sbnr >= ebnr_plus_one {
            return 0;
        }
        self.clear_bits(sbnr, ebnr_plus_one)
    }

    /// Hint that an AL update touched the bitmap page for `page`; the
    /// metadata writer should flush it before the next AL transaction write
    /// (§4.3 step 5).
    pub fn mark_page_dirty(&self, page: u32) {
        self.inner.lock().unwrap().dirty_pages.insert(page);
    }

    /// Drain and return the set of bitmap pages hinted dirty since the last
    /// drain.
    pub fn take_dirty_pages(&self) -> Vec<u32> {
        let mut inner = self.inner.lock().unwrap();
        inner.dirty_pages.drain().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn weight_tracks_set_bits() {
        let bm = Bitmap::new(1024);
        assert_eq!(bm.weight(), 0);
        bm.set_bits(10, 20);
        assert_eq!(bm.weight(), 10);
        bm.clear_bits(15, 17);
        assert_eq!(bm.weight(), 8);
    }

    #[test]
    fn set_then_clear_aligned_range_is_a_no_op() {
        let bm = Bitmap::new(1024);
        let before = bm.weight();
        bm.mark_out_of_sync(0, BM_BLOCK_SIZE as u32);
        bm.mark_in_sync(0, BM_BLOCK_SIZE as u32);
        assert_eq!(bm.weight(), before);
    }

    #[test]
    fn sub_block_range_postpones_clear() {
        let bm = Bitmap::new(1024);
        bm.mark_out_of_sync(0, BM_BLOCK_SIZE as u32);
        assert_eq!(bm.weight(), 1);
        // Only covers half the bitmap block: rounding inward drops the
        // whole bit, so it is not cleared.
        bm.mark_in_sync(0, (BM_BLOCK_SIZE / 2) as u32);
        assert_eq!(bm.weight(), 1, "partial clear must not clear the full bit");
    }

    #[test]
    fn get_blocknr_is_restartable() {
        let bm = Bitmap::new(64);
        bm.set_bits(3, 4);
        bm.set_bits(40, 41);
        assert_eq!(bm.get_blocknr(BM_BLOCK_SIZE_B), Some(3));
        assert_eq!(bm.get_blocknr(BM_BLOCK_SIZE_B), Some(40));
        assert_eq!(bm.get_blocknr(BM_BLOCK_SIZE_B), None);
        bm.reset();
        assert_eq!(bm.get_blocknr(BM_BLOCK_SIZE_B), Some(3));
    }

    #[test]
    fn sub_block_primitive_accumulates_before_clearing() {
        let bm = Bitmap::new(8);
        bm.set(0, BM_BLOCK_SIZE_B, true);
        assert_eq!(bm.weight(), 1);
        // Sub-writes at quarter granularity: 4 sub-blocks per bitmap bit.
        let sub_b = BM_BLOCK_SIZE_B - 2;
        bm.set(0, sub_b, false);
        bm.set(1, sub_b, false);
        bm.set(2, sub_b, false);
        assert_eq!(bm.weight(), 1, "not all sub-blocks clean yet");
        bm.set(3, sub_b, false);
        assert_eq!(bm.weight(), 0, "all four sub-blocks clean: bit clears");
    }

    #[test]
    fn e_weight_is_scoped_to_one_al_extent() {
        let bm = Bitmap::new(BITS_PER_AL_EXTENT * 3);
        bm.set_bits(0, BITS_PER_AL_EXTENT);
        bm.set_bits(BITS_PER_AL_EXTENT, BITS_PER_AL_EXTENT + 5);
        assert_eq!(bm.e_weight(0), BITS_PER_AL_EXTENT);
        assert_eq!(bm.e_weight(1), 5);
        assert_eq!(bm.e_weight(2), 0);
    }
}
