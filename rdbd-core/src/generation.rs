//! Generation counters and the metadata block that persists them (spec §3
//! "Generation counters", §4.5 component C5).
//!
//! Four 32-bit counters — `human`, `connected`, `arbitrary`, and
//! `primary_ind` — identify how far this side's data has diverged from the
//! peer's since their last successful connection, and are compared after a
//! reconnect to decide whether a quick resync suffices or a full resync is
//! required. A parallel `bit_map_gen` snapshot records, for the side that
//! was primary at the time, which generation the peer's data was at when
//! the bitmap was last known consistent.

use std::cmp::Ordering;
use std::sync::RwLock;

/// Magic identifying a valid generation-counter record ("GDC0").
pub const GC_MAGIC: u32 = 0x4744_4330;
/// On-disk size of the primary generation-counter record.
pub const GC_RECORD_SIZE: usize = 24;
/// On-disk size of the `bit_map_gen` snapshot record.
pub const BITMAP_GEN_RECORD_SIZE: usize = 16;

/// Which event caused (or is about to cause) divergence; selects the
/// counter [`GenerationRecord::increment`] bumps.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GcKind {
    /// A human operator forced the issue (e.g. manual invalidate).
    Human,
    /// A reconnect occurred.
    Connected,
    /// Some other event that may have caused arbitrary divergence.
    Arbitrary,
}

/// Identifies which side was primary at a point under comparison.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Side {
    /// This device.
    Me,
    /// The connected peer.
    Peer,
}

/// The four generation counters as read from (or about to be written to)
/// the primary 24-byte record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct GenerationCounters {
    pub human: u32,
    pub connected: u32,
    pub arbitrary: u32,
    pub primary_ind: bool,
}

impl GenerationCounters {
    /// All-ones reset value used when the on-disk record is missing or
    /// corrupt, with `primary_ind` set from the device's current role.
    fn reset(currently_primary: bool) -> Self {
        Self {
            human: u32::MAX,
            connected: u32::MAX,
            arbitrary: u32::MAX,
            primary_ind: currently_primary,
        }
    }

    fn to_bytes(self) -> [u8; GC_RECORD_SIZE] {
        let mut buf = [0u8; GC_RECORD_SIZE];
        buf[0..4].copy_from_slice(&self.human.to_be_bytes());
        buf[4..8].copy_from_slice(&self.connected.to_be_bytes());
        buf[8..12].copy_from_slice(&self.arbitrary.to_be_bytes());
        buf[12..16].copy_from_slice(&(self.primary_ind as u32).to_be_bytes());
        buf[16..20].copy_from_slice(&GC_MAGIC.to_be_bytes());
        // buf[20..24] left zero: pad.
        buf
    }

    /// Decode a record, falling back to [`Self::reset`] on a bad magic.
    fn from_bytes(buf: &[u8; GC_RECORD_SIZE], currently_primary: bool) -> Self {
        let magic = u32::from_be_bytes(buf[16..20].try_into().unwrap());
        if magic != GC_MAGIC {
            return Self::reset(currently_primary);
        }
        Self {
            human: u32::from_be_bytes(buf[0..4].try_into().unwrap()),
            connected: u32::from_be_bytes(buf[4..8].try_into().unwrap()),
            arbitrary: u32::from_be_bytes(buf[8..12].try_into().unwrap()),
            primary_ind: u32::from_be_bytes(buf[12..16].try_into().unwrap()) != 0,
        }
    }

    /// Lexicographic comparison of `(human, connected, arbitrary)`, per
    /// `md_compare` (spec §4.5).
    fn compare_counters(&self, other: &Self) -> Ordering {
        (self.human, self.connected, self.arbitrary).cmp(&(
            other.human,
            other.connected,
            other.arbitrary,
        ))
    }
}

/// The `bit_map_gen` snapshot: a separate, smaller record parallel to
/// [`GenerationCounters`] but without its own `primary_ind`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct BitmapGenSnapshot {
    pub human: u32,
    pub connected: u32,
    pub arbitrary: u32,
}

impl BitmapGenSnapshot {
    fn to_bytes(self) -> [u8; BITMAP_GEN_RECORD_SIZE] {
        let mut buf = [0u8; BITMAP_GEN_RECORD_SIZE];
        buf[0..4].copy_from_slice(&self.human.to_be_bytes());
        buf[4..8].copy_from_slice(&self.connected.to_be_bytes());
        buf[8..12].copy_from_slice(&self.arbitrary.to_be_bytes());
        buf[12..16].copy_from_slice(&GC_MAGIC.to_be_bytes());
        buf
    }

    fn from_bytes(buf: &[u8; BITMAP_GEN_RECORD_SIZE]) -> Self {
        let magic = u32::from_be_bytes(buf[12..16].try_into().unwrap());
        if magic != GC_MAGIC {
            return Self::default();
        }
        Self {
            human: u32::from_be_bytes(buf[0..4].try_into().unwrap()),
            connected: u32::from_be_bytes(buf[4..8].try_into().unwrap()),
            arbitrary: u32::from_be_bytes(buf[8..12].try_into().unwrap()),
        }
    }

    fn matches_counters(&self, gc: &GenerationCounters) -> bool {
        self.human == gc.human && self.connected == gc.connected && self.arbitrary == gc.arbitrary
    }
}

/// This device's generation record: its own counters plus its own
/// `bit_map_gen` snapshot. The peer's values arrive over the wire
/// (`ReportParams`, spec §4.6) and are passed in as parameters rather than
/// owned here.
pub struct GenerationRecord {
    counters: RwLock<GenerationCounters>,
    bitmap_gen: RwLock<BitmapGenSnapshot>,
}

impl GenerationRecord {
    /// Load from an on-disk 24-byte record, resetting to all-ones (with
    /// `primary_ind` from `currently_primary`) on a bad magic.
    pub fn md_read(buf: &[u8; GC_RECORD_SIZE], currently_primary: bool) -> Self {
        Self {
            counters: RwLock::new(GenerationCounters::from_bytes(buf, currently_primary)),
            bitmap_gen: RwLock::new(BitmapGenSnapshot::default()),
        }
    }

    /// Encode the current counters for a write, first refreshing
    /// `primary_ind` from the device's live role.
    pub fn md_write(&self, currently_primary: bool) -> [u8; GC_RECORD_SIZE] {
        let mut counters = self.counters.write().unwrap();
        counters.primary_ind = currently_primary;
        counters.to_bytes()
    }

    /// Replace both records with freshly read on-disk bytes (spec §6
    /// control surface `attach`: load persisted generation metadata before
    /// the device participates in a handshake).
    pub fn reload(
        &self,
        gc_buf: &[u8; GC_RECORD_SIZE],
        bitmap_buf: &[u8; BITMAP_GEN_RECORD_SIZE],
        currently_primary: bool,
    ) {
        *self.counters.write().unwrap() = GenerationCounters::from_bytes(gc_buf, currently_primary);
        *self.bitmap_gen.write().unwrap() = BitmapGenSnapshot::from_bytes(bitmap_buf);
    }

    /// Increment exactly one counter. Callers must do this before
    /// performing the associated divergence-causing operation (spec §4.5
    /// `md_inc`).
    pub fn increment(&self, kind: GcKind) {
        let mut counters = self.counters.write().unwrap();
        match kind {
            GcKind::Human => counters.human = counters.human.wrapping_add(1),
            GcKind::Connected => counters.connected = counters.connected.wrapping_add(1),
            GcKind::Arbitrary => counters.arbitrary = counters.arbitrary.wrapping_add(1),
        }
    }

    /// A read-only snapshot of the current counters.
    pub fn counters(&self) -> GenerationCounters {
        *self.counters.read().unwrap()
    }

    /// Record this side's `bit_map_gen` snapshot (taken whenever the
    /// bitmap was last known fully consistent with the peer).
    pub fn record_bitmap_gen(&self, snapshot: BitmapGenSnapshot) {
        *self.bitmap_gen.write().unwrap() = snapshot;
    }

    /// Encode the `bit_map_gen` snapshot record.
    pub fn bitmap_gen_bytes(&self) -> [u8; BITMAP_GEN_RECORD_SIZE] {
        self.bitmap_gen.read().unwrap().to_bytes()
    }

    /// Load a `bit_map_gen` snapshot record (e.g. one received from the
    /// peer over the wire, or reloaded from disk).
    pub fn decode_bitmap_gen(buf: &[u8; BITMAP_GEN_RECORD_SIZE]) -> BitmapGenSnapshot {
        BitmapGenSnapshot::from_bytes(buf)
    }

    /// Lexicographic comparison against a peer's counters: `Less` if this
    /// side is behind, `Greater` if ahead, `Equal` if identical (spec §4.5
    /// `md_compare`).
    pub fn compare(&self, peer: &GenerationCounters) -> Ordering {
        self.counters().compare_counters(peer)
    }

    /// Whether a quick resync suffices rather than a full resync (spec
    /// §4.5 `md_syncq_ok`): both sides must have stayed consistent through
    /// any prior sync, neither side may currently be marked primary (a
    /// primary crash forces a full resync), and the side that was primary
    /// before the disconnect must have a live `gc` matching the other
    /// side's `bit_map_gen` snapshot.
    pub fn syncq_ok(
        consistent_me: bool,
        consistent_peer: bool,
        mine: &GenerationCounters,
        peer: &GenerationCounters,
        last_primary: Side,
        mine_bitmap_gen: &BitmapGenSnapshot,
        peer_bitmap_gen: &BitmapGenSnapshot,
    ) -> bool {
        if !consistent_me || !consistent_peer {
            return false;
        }
        if mine.primary_ind || peer.primary_ind {
            return false;
        }
        match last_primary {
            Side::Me => peer_bitmap_gen.matches_counters(mine),
            Side::Peer => mine_bitmap_gen.matches_counters(peer),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reload_replaces_both_records_from_fresh_bytes() {
        let rec = GenerationRecord::md_read(&[0u8; GC_RECORD_SIZE], false);

        let mut gc_buf = [0u8; GC_RECORD_SIZE];
        gc_buf[16..20].copy_from_slice(&GC_MAGIC.to_be_bytes());
        gc_buf[0..4].copy_from_slice(&5u32.to_be_bytes());
        let mut bm_buf = [0u8; BITMAP_GEN_RECORD_SIZE];
        bm_buf[12..16].copy_from_slice(&GC_MAGIC.to_be_bytes());
        bm_buf[0..4].copy_from_slice(&5u32.to_be_bytes());

        rec.reload(&gc_buf, &bm_buf, true);
        assert_eq!(rec.counters().human, 5);
        assert!(rec.counters().primary_ind);
        assert_eq!(rec.bitmap_gen_bytes(), BitmapGenSnapshot { human: 5, connected: 0, arbitrary: 0 }.to_bytes());
    }

    #[test]
    fn bad_magic_resets_to_all_ones_with_role_primary_ind() {
        let buf = [0xAAu8; GC_RECORD_SIZE];
        let rec = GenerationRecord::md_read(&buf, true);
        let c = rec.counters();
        assert_eq!(c.human, u32::MAX);
        assert!(c.primary_ind);
    }

    #[test]
    fn round_trips_through_encode_decode() {
        let mut buf = [0u8; GC_RECORD_SIZE];
        buf[16..20].copy_from_slice(&GC_MAGIC.to_be_bytes());
        buf[0..4].copy_from_slice(&7u32.to_be_bytes());
        let rec = GenerationRecord::md_read(&buf, false);
        assert_eq!(rec.counters().human, 7);
        rec.increment(GcKind::Human);
        assert_eq!(rec.counters().human, 8);
        let encoded = rec.md_write(true);
        let reloaded = GenerationRecord::md_read(&encoded, false);
        assert_eq!(reloaded.counters().human, 8);
        assert!(reloaded.counters().primary_ind);
    }

    #[test]
    fn syncq_ok_requires_consistency_and_matching_snapshot() {
        let mine = GenerationCounters { human: 3, connected: 1, arbitrary: 0, primary_ind: false };
        let peer = GenerationCounters { human: 2, connected: 1, arbitrary: 0, primary_ind: false };
        let peer_snapshot_of_me = BitmapGenSnapshot { human: 3, connected: 1, arbitrary: 0 };
        assert!(GenerationRecord::syncq_ok(
            true,
            true,
            &mine,
            &peer,
            Side::Me,
            &BitmapGenSnapshot::default(),
            &peer_snapshot_of_me,
        ));
        assert!(!GenerationRecord::syncq_ok(
            false,
            true,
            &mine,
            &peer,
            Side::Me,
            &BitmapGenSnapshot::default(),
            &peer_snapshot_of_me,
        ));
    }

    #[test]
    fn syncq_ok_rejects_dual_primary() {
        let mine = GenerationCounters { human: 1, connected: 1, arbitrary: 1, primary_ind: true };
        let peer = GenerationCounters { human: 1, connected: 1, arbitrary: 1, primary_ind: true };
        assert!(!GenerationRecord::syncq_ok(
            true,
            true,
            &mine,
            &peer,
            Side::Me,
            &BitmapGenSnapshot::default(),
            &BitmapGenSnapshot::default(),
        ));
    }

    #[test]
    fn syncq_ok_rejects_single_side_primary_crash() {
        let mine = GenerationCounters { human: 1, connected: 1, arbitrary: 1, primary_ind: false };
        let peer = GenerationCounters { human: 1, connected: 1, arbitrary: 1, primary_ind: true };
        assert!(!GenerationRecord::syncq_ok(
            true,
            true,
            &mine,
            &peer,
            Side::Me,
            &BitmapGenSnapshot::default(),
            &BitmapGenSnapshot::default(),
        ));
    }
}
