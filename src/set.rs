//! The ordered set: flat bitmaps on top, cuckoo-hashed trie below.
//!
//! One anonymous mapping holds everything: the three flat bitmap levels,
//! then the slot array (guards included) on a 128-byte boundary. The
//! mapping is sized once from `max_set_size` and never grows; with four
//! buckets per expected key the cuckoo table stays far from its load limit.
//!
//! Reads never lock and never allocate. The structure holds raw views into
//! its own mapping, so a set is neither `Send` nor `Sync`; share it across
//! threads behind your own synchronisation if you need to.

use std::io;

use memmap2::{MmapMut, MmapOptions};

use crate::bitmap::{FlatBitmap, FLAT_BYTES};
use crate::error::{CapacityError, Error};
use crate::key;
use crate::node::Slot;
use crate::table::{CuckooTable, LcpResult, LookupPromise, Reserve, Stats, GUARD_SLOTS};
use crate::tracing_helpers::{debug_log, trace_log};

/// Hard cap on the `max_set_size` a set can be built for.
///
/// The 32-bit hash family and slot indices limit the bucket range; past
/// 2^28 expected keys the table could no longer keep four buckets per key.
pub const MAX_SET_SIZE: usize = 1 << 28;

/// A pending [`lower_bound`](MlpSet::lower_bound) whose final memory access
/// may still be in flight.
///
/// [`MlpSet::lower_bound_deferred`] does all the computation except the
/// last dependent load and starts a prefetch for it. Issue a batch of
/// deferred queries, then [`get`](LowerBound::get) them in order; the
/// fetches overlap instead of serialising on cache misses.
pub struct LowerBound<'a>(LowerBoundInner<'a>);

enum LowerBoundInner<'a> {
    Done(Option<u64>),
    Pending(LookupPromise<'a>),
}

impl LowerBound<'_> {
    /// Re-issue the prefetch hint. Cheap and idempotent.
    pub fn prefetch(&self) {
        if let LowerBoundInner::Pending(p) = &self.0 {
            p.prefetch();
        }
    }

    /// Complete the query: the smallest stored key `>=` the queried key.
    #[must_use]
    pub fn get(self) -> Option<u64> {
        match self.0 {
            LowerBoundInner::Done(v) => v,
            LowerBoundInner::Pending(p) => Some(p.resolve()),
        }
    }
}

/// Debug view of one trie node, from [`MlpSet::probe_node`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeSummary {
    /// Bytes of the minimum key that address the node.
    pub index_len: u32,
    /// Index bytes plus path-compressed bytes.
    pub full_key_len: u32,
    /// Minimum key in the node's subtree.
    pub min_key: u64,
    /// Child bytes in ascending order; empty for a leaf.
    pub children: Vec<u8>,
}

/// An ordered set of `u64` keys tuned for memory-level parallelism.
///
/// ```
/// # fn main() -> Result<(), Box<dyn std::error::Error>> {
/// let mut set = mlpset::MlpSet::new(10_000)?;
/// set.insert(42)?;
/// set.insert(7)?;
/// assert!(set.contains(7));
/// assert_eq!(set.lower_bound(8), Some(42));
/// assert_eq!(set.lower_bound(43), None);
/// # Ok(())
/// # }
/// ```
pub struct MlpSet {
    map: MmapMut,
    flat: FlatBitmap,
    table: CuckooTable,
    len: usize,
}

impl MlpSet {
    /// Build an empty set able to hold up to `max_set_size` keys.
    ///
    /// # Errors
    ///
    /// [`Error::SizeLimit`] if `max_set_size` exceeds [`MAX_SET_SIZE`],
    /// [`Error::Map`] if the backing mapping cannot be created.
    pub fn new(max_set_size: usize) -> Result<Self, Error> {
        if max_set_size > MAX_SET_SIZE {
            return Err(Error::SizeLimit {
                requested: max_set_size,
            });
        }
        let buckets = max_set_size.max(4096).next_power_of_two() * 4;
        let slots_off = (FLAT_BYTES + 127) & !127;
        let raw_slots = buckets + 2 * GUARD_SLOTS as usize;
        let total = slots_off + raw_slots * std::mem::size_of::<Slot>();

        let mut map = Self::map_zeroed(total)?;
        debug_log!(buckets, bytes = total, "mapped set backing memory");

        let base = map.as_mut_ptr();
        // SAFETY: the mapping is zeroed, page-aligned (so the slot region
        // sits on a 128-byte boundary), covers both views without overlap,
        // and lives as long as the set that owns it.
        let (flat, table) = unsafe {
            (
                FlatBitmap::from_raw(base),
                CuckooTable::from_raw(base.add(slots_off).cast::<Slot>(), buckets),
            )
        };
        Ok(Self {
            map,
            flat,
            table,
            len: 0,
        })
    }

    /// Anonymous zeroed mapping, huge pages first on Linux.
    fn map_zeroed(len: usize) -> io::Result<MmapMut> {
        #[cfg(target_os = "linux")]
        {
            // 2 MiB pages cut TLB pressure on the slot array; fall through
            // when the system has none configured.
            if let Ok(m) = MmapOptions::new().len(len).huge(Some(21)).map_anon() {
                return Ok(m);
            }
        }
        MmapOptions::new().len(len).map_anon()
    }

    /// Number of keys in the set.
    #[must_use]
    pub fn len(&self) -> usize {
        self.len
    }

    /// Whether the set holds no keys.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Bytes of backing memory mapped for this set.
    #[must_use]
    pub fn allocated_bytes(&self) -> usize {
        self.map.len()
    }

    /// Internal operation counters.
    #[must_use]
    pub fn stats(&self) -> Stats {
        self.table.stats()
    }

    // ========================================================================
    // Insert
    // ========================================================================

    /// Insert a key. Returns `true` if it was not present before.
    ///
    /// # Errors
    ///
    /// [`CapacityError`] if the hash table cannot make room; the set is
    /// unchanged in that case.
    pub fn insert(&mut self, key: u64) -> Result<bool, CapacityError> {
        let r = self.table.query_lcp(key);
        if r.lcp == 8 {
            return Ok(false);
        }
        if r.lcp == 2 {
            // First key under this 3-byte prefix: a fresh top-level leaf.
            trace_log!(key, "insert: new top-level subtree");
            self.table.insert(3, 8, key, None)?;
            self.flat.mark(key);
            self.len += 1;
            return Ok(true);
        }

        let snap = *self.table.slot(r.pos);
        let ilen = snap.index_len();
        let full_len = snap.full_key_len();
        debug_assert!(r.lcp >= ilen && r.lcp <= full_len);

        if r.lcp == full_len {
            // Key diverges exactly at this node's branch point: one new
            // leaf, one new child edge.
            trace_log!(key, lcp = r.lcp, "insert: new child edge");
            self.table.insert(r.lcp + 1, 8, key, None)?;
            // The leaf insert may have displaced the branch node.
            let pos = self
                .table
                .lookup_must_exist(ilen, snap.min_key)
                .resolve_position();
            self.table.add_child(pos, key::byte(key, r.lcp));
        } else {
            self.split_compressed(key, r.lcp, &snap)?;
        }

        self.update_subtree_mins(key, r.lcp, &r.positions);
        self.flat.mark(key);
        self.len += 1;
        Ok(true)
    }

    /// Split a node whose compressed span diverges from `key` at byte
    /// `lcp`: push the node one level down, plant a branch in its old
    /// position, then hang the new key's leaf off the branch.
    ///
    /// Ordered so the only step that can fail after a write is the leaf
    /// insert, and that step either completes or leaves the table alone.
    /// The push-down and the one-child branch reshuffle existing data
    /// without changing what the set holds, so a failed insert still means
    /// an unchanged set.
    fn split_compressed(&mut self, key: u64, lcp: u32, snap: &Slot) -> Result<(), CapacityError> {
        trace_log!(key, lcp, "insert: splitting compressed span");
        let ilen = snap.index_len();

        // A slot for the pushed-down node, indexed one byte past the split.
        let dst = match self.table.reserve_index(lcp + 1, snap.min_key)? {
            Reserve::Free(p) => p,
            Reserve::Exists(p) => {
                debug_assert!(false, "split target index already present");
                p
            }
        };
        // Reserving may have displaced the node being split.
        let src = self
            .table
            .lookup_must_exist(ilen, snap.min_key)
            .resolve_position();
        self.table.move_node(src, dst);
        self.table.rekey(dst, lcp + 1);

        // The branch takes over the old index, covering the shared span.
        // One of its buckets is the slot just vacated, so this cannot
        // displace anything. The new key joins as child and minimum only
        // after its leaf exists.
        let out = self
            .table
            .insert(ilen, lcp, snap.min_key, Some(key::byte(snap.min_key, lcp)))?;
        debug_assert!(!out.existed);

        self.table.insert(lcp + 1, 8, key, None)?;

        // The leaf insert may have displaced the branch.
        let pos = self
            .table
            .lookup_must_exist(ilen, snap.min_key)
            .resolve_position();
        self.table.add_child(pos, key::byte(key, lcp));
        Ok(())
    }

    /// Walk the ancestors of a freshly inserted key and lower their subtree
    /// minima. Stops at the first ancestor already holding a smaller key.
    fn update_subtree_mins(&mut self, key: u64, lcp: u32, positions: &[u32; 9]) {
        for l in (3..=lcp).rev() {
            let Some(pos) = self.ancestor_at(key, l, positions[l as usize]) else {
                continue;
            };
            let min = self.table.slot(pos).min_key;
            if key > min {
                break;
            }
            if key < min {
                self.table.set_min_key(pos, key);
            }
        }
    }

    /// Validate a cached ancestor position, falling back to an exact
    /// lookup: insert-side displacement can leave entries stale.
    fn ancestor_at(&self, key: u64, l: u32, hint: u32) -> Option<u32> {
        if hint != 0 {
            let s = self.table.slot(hint);
            if s.is_node()
                && s.index_len() == l
                && key::prefix(s.min_key, l) == key::prefix(key, l)
            {
                return Some(hint);
            }
        }
        self.table.lookup(l, key)
    }

    // ========================================================================
    // Queries
    // ========================================================================

    /// Whether `key` is in the set.
    #[must_use]
    pub fn contains(&self, key: u64) -> bool {
        // The depth-3 bitmap rejects most misses without touching the
        // table.
        if !self.flat.lv2_bit((key >> 40) as u32) {
            return false;
        }
        self.table.query_lcp(key).lcp == 8
    }

    /// Smallest stored key `>= key`, or `None` if every key is smaller.
    #[must_use]
    pub fn lower_bound(&self, key: u64) -> Option<u64> {
        self.lower_bound_deferred(key).get()
    }

    /// [`lower_bound`](Self::lower_bound) split in two so callers can
    /// overlap the final fetches of a batch of queries.
    #[must_use]
    pub fn lower_bound_deferred(&self, key: u64) -> LowerBound<'_> {
        let r = self.table.query_lcp(key);
        if r.lcp == 8 {
            return LowerBound(LowerBoundInner::Done(Some(key)));
        }
        if r.lcp == 2 {
            // Nothing under this 3-byte prefix; the flat levels find the
            // next populated subtree.
            return self.flat_successor((key >> 40) as u32);
        }

        let snap = self.table.slot(r.pos);
        let full_len = snap.full_key_len();
        if r.lcp < full_len {
            // Divergence inside the compressed span: the whole subtree is
            // on one side of the key.
            if key::byte(key, r.lcp) < key::byte(snap.min_key, r.lcp) {
                return LowerBound(LowerBoundInner::Done(Some(snap.min_key)));
            }
            return self.ancestor_successor(key, &r, snap.index_len());
        }

        // Divergence at the branch point: the next child up holds the
        // successor's subtree.
        let b = key::byte(key, r.lcp);
        if let Some(c) = self.table.lower_bound_child(r.pos, b) {
            debug_assert_ne!(c, b);
            return self.descend(key, r.lcp, c);
        }
        self.ancestor_successor(key, &r, snap.index_len())
    }

    /// Promise the minimum of the child subtree `c` hanging off the node
    /// that covers `key` up to byte `branch`.
    fn descend(&self, key: u64, branch: u32, c: u8) -> LowerBound<'_> {
        let child_key = key::with_byte(key::prefix(key, branch), branch, c);
        let p = self.table.lookup_must_exist(branch + 1, child_key);
        p.prefetch();
        LowerBound(LowerBoundInner::Pending(p))
    }

    /// Search the ancestors of `key` (index lengths below `below`) for a
    /// branch with a child greater than the key's byte there.
    fn ancestor_successor(&self, key: u64, r: &LcpResult, below: u32) -> LowerBound<'_> {
        for l in (3..below).rev() {
            let Some(pos) = self.read_ancestor(key, l, r.positions[l as usize]) else {
                continue;
            };
            let branch = self.table.slot(pos).full_key_len();
            let b = key::byte(key, branch);
            if b == 255 {
                continue;
            }
            if let Some(c) = self.table.lower_bound_child(pos, b + 1) {
                return self.descend(key, branch, c);
            }
        }
        // Subtree of the key's 3-byte prefix exhausted; move to the next
        // populated prefix.
        let p3 = (key >> 40) as u32;
        if p3 == 0x00ff_ffff {
            return LowerBound(LowerBoundInner::Done(None));
        }
        self.flat_successor(p3 + 1)
    }

    /// Validate a query-cached ancestor position. Read paths need no
    /// lookup fallback: an entry for an existing prefix is always exact.
    fn read_ancestor(&self, key: u64, l: u32, hint: u32) -> Option<u32> {
        if hint == 0 {
            return None;
        }
        let s = self.table.slot(hint);
        (s.is_node() && s.index_len() == l && key::prefix(s.min_key, l) == key::prefix(key, l))
            .then_some(hint)
    }

    /// Minimum of the first populated 3-byte-prefix subtree `>= from`.
    fn flat_successor(&self, from: u32) -> LowerBound<'_> {
        match self.flat.successor_prefix(from) {
            Some(p3) => {
                let p = self.table.lookup_must_exist(3, u64::from(p3) << 40);
                p.prefetch();
                LowerBound(LowerBoundInner::Pending(p))
            }
            None => LowerBound(LowerBoundInner::Done(None)),
        }
    }

    // ========================================================================
    // Debug probes
    // ========================================================================

    /// Whether the depth-1 bitmap has the bit for this leading byte.
    #[must_use]
    pub fn root_bit(&self, p1: u8) -> bool {
        self.flat.root_bit(u32::from(p1))
    }

    /// Whether the depth-2 bitmap has the bit for this 2-byte prefix.
    #[must_use]
    pub fn depth1_bit(&self, p2: u16) -> bool {
        self.flat.lv1_bit(u32::from(p2))
    }

    /// Whether the depth-3 bitmap has the bit for this 3-byte prefix
    /// (low 24 bits of `p3`).
    #[must_use]
    pub fn depth2_bit(&self, p3: u32) -> bool {
        debug_assert!(p3 < 1 << 24);
        self.flat.lv2_bit(p3)
    }

    /// The trie node indexed by the `index_len`-byte prefix of `key`, if
    /// one exists. Test and diagnostics hook.
    #[must_use]
    pub fn probe_node(&self, index_len: u32, key: u64) -> Option<NodeSummary> {
        debug_assert!((3..=8).contains(&index_len));
        let pos = self.table.lookup(index_len, key)?;
        let s = self.table.slot(pos);
        Some(NodeSummary {
            index_len: s.index_len(),
            full_key_len: s.full_key_len(),
            min_key: s.min_key,
            children: if s.is_leaf() {
                Vec::new()
            } else {
                self.table.children(pos)
            },
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn set() -> MlpSet {
        MlpSet::new(4096).unwrap()
    }

    #[test]
    fn rejects_oversized_request() {
        assert!(matches!(
            MlpSet::new(MAX_SET_SIZE + 1),
            Err(Error::SizeLimit { .. })
        ));
    }

    #[test]
    fn insert_contains_roundtrip() {
        let mut s = set();
        assert!(s.is_empty());
        assert!(s.insert(0x1122_3344_5566_7788).unwrap());
        assert!(!s.insert(0x1122_3344_5566_7788).unwrap());
        assert!(s.contains(0x1122_3344_5566_7788));
        assert!(!s.contains(0x1122_3344_5566_7789));
        assert_eq!(s.len(), 1);
    }

    #[test]
    fn shared_prefix_splits_into_branch() {
        let mut s = set();
        let a = 0x0102_0304_0506_0708;
        let b = 0x0102_0304_0506_ff00;
        s.insert(a).unwrap();
        s.insert(b).unwrap();

        // Divergence at byte 6: branch covering the 6 shared bytes.
        let branch = s.probe_node(3, a).unwrap();
        assert_eq!(branch.full_key_len, 6);
        assert_eq!(branch.min_key, a);
        assert_eq!(branch.children, vec![0x07, 0xff]);

        // Both sides hang off index length 7.
        assert_eq!(s.probe_node(7, a).unwrap().min_key, a);
        assert_eq!(s.probe_node(7, b).unwrap().min_key, b);

        assert!(s.contains(a) && s.contains(b));
        assert_eq!(s.lower_bound(a + 1), Some(b));
    }

    #[test]
    fn flat_bitmap_levels_track_prefixes() {
        let mut s = set();
        s.insert(0xaabb_cc00_0000_0001).unwrap();
        assert!(s.root_bit(0xaa));
        assert!(s.depth1_bit(0xaabb));
        assert!(s.depth2_bit(0xaabbcc));
        assert!(!s.root_bit(0xab));
        assert!(!s.depth2_bit(0xaabbcd));
    }

    #[test]
    fn min_key_propagates_to_ancestors() {
        let mut s = set();
        let keys = [
            0x4040_4040_0000_0099,
            0x4040_4040_0000_0050,
            0x4040_4040_9900_0000,
            0x4040_4040_0000_0001,
        ];
        for k in keys {
            s.insert(k).unwrap();
        }
        let top = s.probe_node(3, keys[0]).unwrap();
        assert_eq!(top.min_key, 0x4040_4040_0000_0001);
        assert_eq!(s.lower_bound(0x4040_0000_0000_0000), Some(0x4040_4040_0000_0001));
    }

    #[test]
    fn lower_bound_walks_up_and_across() {
        let mut s = set();
        let a = 0x1111_1100_0000_0000;
        let b = 0x1111_11ff_0000_0000;
        let c = 0x2222_0000_0000_0000;
        for k in [a, b, c] {
            s.insert(k).unwrap();
        }
        assert_eq!(s.lower_bound(0), Some(a));
        assert_eq!(s.lower_bound(a), Some(a));
        assert_eq!(s.lower_bound(a + 1), Some(b));
        assert_eq!(s.lower_bound(b + 1), Some(c));
        assert_eq!(s.lower_bound(c + 1), None);
        assert_eq!(s.lower_bound(u64::MAX), None);
    }

    #[test]
    fn deferred_lower_bounds_batch() {
        let mut s = set();
        let keys: Vec<u64> = (0..64).map(|i| 0x0500_0000_0000_0000 + i * 1000).collect();
        for &k in &keys {
            s.insert(k).unwrap();
        }
        let queries: Vec<u64> = (0..64).map(|i| 0x0500_0000_0000_0000 + i * 1000 - 1).collect();
        let pending: Vec<LowerBound<'_>> =
            queries.iter().map(|&q| s.lower_bound_deferred(q)).collect();
        for (p, want) in pending.into_iter().zip(&keys) {
            assert_eq!(p.get(), Some(*want));
        }
    }

    #[test]
    fn doc_example_probe_surface() {
        let mut s = set();
        s.insert(7).unwrap();
        assert_eq!(s.probe_node(3, 7).unwrap().full_key_len, 8);
        assert!(s.probe_node(4, 7).is_none());
        assert!(s.allocated_bytes() > FLAT_BYTES);
        assert_eq!(s.stats().moved_nodes, 0);
    }
}
