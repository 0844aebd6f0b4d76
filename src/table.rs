//! Cuckoo hash table holding every trie node of depth 3 to 8.
//!
//! Each node is addressed by the hashes of its index prefix and may live in
//! one of two buckets. Six guard slots on either side of the bucket range
//! keep the `-3..=3` neighbor window of any bucket inside the allocation, so
//! adjacent child bitmaps never need a bounds branch.
//!
//! Displacement is iterative: a walk collects the eviction chain (each
//! victim's alternate bucket), the terminal slot is freed (either it is
//! already empty, or it holds a bitmap fragment whose owner relocates it),
//! and the chain unwinds deepest-first. A chain that exceeds the round
//! budget fails the insert with [`CapacityError`]; the table is untouched in
//! that case because the walk itself writes nothing.

use std::cell::Cell;

use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};
use smallvec::SmallVec;

use crate::bitmap::first_set_ge;
use crate::error::CapacityError;
use crate::hash::{self, PrefixHashes};
use crate::key;
use crate::node::{expected_head, ChildRep, Slot, SlotState, HEAD_EQ_MASK, TAG_MASK};
use crate::prefetch::prefetch_read;
use crate::tracing_helpers::{debug_log, trace_log, warn_log};

/// Guard slots before and after the bucket range.
pub(crate) const GUARD_SLOTS: u32 = 6;

/// Longest eviction chain tried before an insert gives up.
const DISPLACEMENT_LIMIT: usize = 1000;

/// Slot index plus relative neighbor offset. Guards keep the result in
/// bounds for any bucket.
#[inline]
fn offset_pos(pos: u32, off: i32) -> u32 {
    debug_assert!((-(GUARD_SLOTS as i32) / 2..=GUARD_SLOTS as i32 / 2).contains(&off));
    pos.wrapping_add_signed(off)
}

#[derive(Default)]
struct Counters {
    slow_path: Cell<u64>,
    moved_nodes: Cell<u64>,
    relocated_bitmaps: Cell<u64>,
}

/// Operation counters, exposed for diagnostics and tuning.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Stats {
    /// Prefix queries that fell back to exact probing after a tag collision.
    pub slow_path_queries: u64,
    /// Nodes moved between buckets by cuckoo displacement.
    pub moved_nodes: u64,
    /// Adjacent child bitmaps evicted to make room for a displaced node.
    pub relocated_bitmaps: u64,
}

/// Result of [`CuckooTable::reserve_for_insert`].
pub(crate) enum Reserve {
    /// A node with this index already sits at the position.
    Exists(u32),
    /// The position is empty and valid for the index; the caller writes it.
    Free(u32),
}

/// Outcome of a completed insert.
pub(crate) struct InsertOutcome {
    pub(crate) pos: u32,
    pub(crate) existed: bool,
}

/// Longest-common-prefix query result.
///
/// `lcp` is the byte length of the longest prefix of the queried key that
/// leads to a stored subtree, clamped below at the sentinel 2 when not even
/// the 3-byte prefix exists. When `lcp > 2`, `pos` is the deepest matching
/// node and `positions[len]` (for `len` in `3..=8`) is the slot of the node
/// indexed by that prefix length. A `positions` entry is exact whenever the
/// prefix exists; for an absent prefix it is 0 or, rarely, a stale slot, so
/// callers validate entries before trusting them.
pub(crate) struct LcpResult {
    pub(crate) lcp: u32,
    pub(crate) pos: u32,
    pub(crate) positions: [u32; 9],
}

/// A lookup for a key known to be present, split so the caller can overlap
/// the cache misses of several lookups before resolving any of them.
pub(crate) struct LookupPromise<'a> {
    table: &'a CuckooTable,
    p1: u32,
    p2: u32,
    expected_head: u32,
    shift: u32,
    shifted_key: u64,
}

impl LookupPromise<'_> {
    /// Start pulling both candidate slots toward the cache.
    #[inline]
    pub(crate) fn prefetch(&self) {
        prefetch_read(self.table.slot_ptr(self.p1));
        prefetch_read(self.table.slot_ptr(self.p2));
    }

    /// Finish the lookup, returning the node's subtree minimum.
    #[inline]
    pub(crate) fn resolve(self) -> u64 {
        let table = self.table;
        table.slot(self.resolve_position()).min_key
    }

    /// Finish the lookup, returning the node's slot.
    #[inline]
    pub(crate) fn resolve_position(self) -> u32 {
        let s1 = self.table.slot(self.p1);
        if s1.matches(self.expected_head, self.shift, self.shifted_key) {
            return self.p1;
        }
        debug_assert!(self
            .table
            .slot(self.p2)
            .matches(self.expected_head, self.shift, self.shifted_key));
        self.p2
    }
}

/// The table. Does not own the slot memory (the set's mapping does); owns
/// the external bitmap blocks and the displacement RNG.
pub(crate) struct CuckooTable {
    slots: *mut Slot,
    raw_len: usize,
    mask: u32,
    /// External 256-bit child bitmaps; `child_map` of an
    /// [`ChildRep::External`] node indexes into this.
    ext_bitmaps: Vec<Box<[u64; 4]>>,
    rng: SmallRng,
    counters: Counters,
}

impl CuckooTable {
    /// # Safety
    ///
    /// `slots` must point at `buckets + 2 * GUARD_SLOTS` zero-initialised
    /// slots on a 128-byte-aligned base, valid and unaliased for the
    /// lifetime of the table. `buckets` must be a power of two.
    pub(crate) unsafe fn from_raw(slots: *mut Slot, buckets: usize) -> Self {
        debug_assert!(buckets.is_power_of_two());
        debug_assert!(slots as usize % 128 == 0);
        Self {
            slots,
            raw_len: buckets + 2 * GUARD_SLOTS as usize,
            mask: (buckets - 1) as u32,
            ext_bitmaps: Vec::new(),
            // Victim choice only breaks ties between two buckets; a fixed
            // seed keeps runs reproducible.
            rng: SmallRng::seed_from_u64(0xd6e8_feb8_6659_fd93),
            counters: Counters::default(),
        }
    }

    #[inline]
    fn bucket(&self, h: u32) -> u32 {
        (h & self.mask) + GUARD_SLOTS
    }

    #[inline]
    fn slot_ptr(&self, pos: u32) -> *mut Slot {
        debug_assert!((pos as usize) < self.raw_len);
        // SAFETY: bounds asserted; the mapping covers raw_len slots.
        unsafe { self.slots.add(pos as usize) }
    }

    #[inline]
    pub(crate) fn slot(&self, pos: u32) -> &Slot {
        // SAFETY: slot_ptr checks bounds; shared access only.
        unsafe { &*self.slot_ptr(pos) }
    }

    #[inline]
    fn slot_mut(&mut self, pos: u32) -> &mut Slot {
        // SAFETY: slot_ptr checks bounds; &mut self gives exclusivity.
        unsafe { &mut *self.slot_ptr(pos) }
    }

    pub(crate) fn stats(&self) -> Stats {
        Stats {
            slow_path_queries: self.counters.slow_path.get(),
            moved_nodes: self.counters.moved_nodes.get(),
            relocated_bitmaps: self.counters.relocated_bitmaps.get(),
        }
    }

    // ========================================================================
    // Point lookup
    // ========================================================================

    /// Exact lookup of the node indexed by the `ilen`-byte prefix of `ikey`.
    pub(crate) fn lookup(&self, ilen: u32, ikey: u64) -> Option<u32> {
        let tag = hash::hash3(ikey, ilen) & TAG_MASK;
        let exp = expected_head(ilen, tag);
        let shift = 64 - 8 * ilen;
        let shifted = ikey >> shift;
        let p1 = self.bucket(hash::hash1(ikey, ilen));
        let p2 = self.bucket(hash::hash2(ikey, ilen));
        prefetch_read(self.slot_ptr(p1));
        prefetch_read(self.slot_ptr(p2));
        if self.slot(p1).matches(exp, shift, shifted) {
            return Some(p1);
        }
        if self.slot(p2).matches(exp, shift, shifted) {
            return Some(p2);
        }
        None
    }

    /// Deferred lookup of a node the caller knows is present.
    pub(crate) fn lookup_must_exist(&self, ilen: u32, ikey: u64) -> LookupPromise<'_> {
        let tag = hash::hash3(ikey, ilen) & TAG_MASK;
        let shift = 64 - 8 * ilen;
        LookupPromise {
            table: self,
            p1: self.bucket(hash::hash1(ikey, ilen)),
            p2: self.bucket(hash::hash2(ikey, ilen)),
            expected_head: expected_head(ilen, tag),
            shift,
            shifted_key: ikey >> shift,
        }
    }

    // ========================================================================
    // LCP query
    // ========================================================================

    /// Longest stored prefix of `key`, all twelve candidate slots probed
    /// with their fetches overlapped.
    pub(crate) fn query_lcp(&self, key_: u64) -> LcpResult {
        let h = PrefixHashes::compute(key_);
        let mut c1 = [0_u32; 6];
        let mut c2 = [0_u32; 6];
        for i in 0..6 {
            c1[i] = self.bucket(h.h1[i]);
            c2[i] = self.bucket(h.h2[i]);
            prefetch_read(self.slot_ptr(c1[i]));
            prefetch_read(self.slot_ptr(c2[i]));
        }

        let mut m1 = 0_u32;
        let mut m2 = 0_u32;
        for i in 0..6 {
            let exp = expected_head(i as u32 + 3, h.h3[i] & TAG_MASK);
            if self.slot(c1[i]).head & HEAD_EQ_MASK == exp {
                m1 |= 1 << i;
            }
            if self.slot(c2[i]).head & HEAD_EQ_MASK == exp {
                m2 |= 1 << i;
            }
        }
        // Both buckets matching some length means at least one is a tag
        // collision; sort it out with exact probes.
        if m1 & m2 != 0 {
            return self.query_lcp_slow(key_, &c1, &c2);
        }
        let msk = m1 | m2;
        if msk == 0 {
            return LcpResult {
                lcp: 2,
                pos: 0,
                positions: [0; 9],
            };
        }

        let top = 31 - msk.leading_zeros();
        let len = top + 3;
        let pos = if m1 >> top & 1 == 1 {
            c1[top as usize]
        } else {
            c2[top as usize]
        };
        if key::prefix(self.slot(pos).min_key, len) != key::prefix(key_, len) {
            return self.query_lcp_slow(key_, &c1, &c2);
        }

        let mut positions = [0_u32; 9];
        for i in 0..6 {
            if msk >> i & 1 == 1 {
                positions[i + 3] = if m1 >> i & 1 == 1 { c1[i] } else { c2[i] };
            }
        }
        LcpResult {
            lcp: key::common_prefix_len(key_, self.slot(pos).min_key),
            pos,
            positions,
        }
    }

    /// Tag collision fallback: exact probes, deepest length first. Entries
    /// in `positions` are exact here.
    #[cold]
    fn query_lcp_slow(&self, key_: u64, c1: &[u32; 6], c2: &[u32; 6]) -> LcpResult {
        self.counters.slow_path.set(self.counters.slow_path.get() + 1);
        trace_log!(key = key_, "lcp query hit slow path");
        let mut positions = [0_u32; 9];
        let mut pos = 0_u32;
        for i in (0..6).rev() {
            let len = i as u32 + 3;
            let cand = if self.slot(c1[i]).is_exact_prefix(key_, len) {
                c1[i]
            } else if self.slot(c2[i]).is_exact_prefix(key_, len) {
                c2[i]
            } else {
                continue;
            };
            positions[i + 3] = cand;
            if pos == 0 {
                pos = cand;
            }
        }
        if pos == 0 {
            return LcpResult {
                lcp: 2,
                pos: 0,
                positions,
            };
        }
        LcpResult {
            lcp: key::common_prefix_len(key_, self.slot(pos).min_key),
            pos,
            positions,
        }
    }

    // ========================================================================
    // Insert and displacement
    // ========================================================================

    /// Find or make a slot for the node indexed by the `ilen`-byte prefix
    /// of `dkey`, displacing residents if both buckets are taken.
    pub(crate) fn reserve_index(&mut self, ilen: u32, dkey: u64) -> Result<Reserve, CapacityError> {
        let tag = hash::hash3(dkey, ilen) & TAG_MASK;
        self.reserve_for_insert(ilen, dkey, tag)
    }

    fn reserve_for_insert(
        &mut self,
        ilen: u32,
        dkey: u64,
        tag: u32,
    ) -> Result<Reserve, CapacityError> {
        let exp = expected_head(ilen, tag);
        let shift = 64 - 8 * ilen;
        let shifted = dkey >> shift;
        let p1 = self.bucket(hash::hash1(dkey, ilen));
        let p2 = self.bucket(hash::hash2(dkey, ilen));
        if self.slot(p1).matches(exp, shift, shifted) {
            return Ok(Reserve::Exists(p1));
        }
        if self.slot(p2).matches(exp, shift, shifted) {
            return Ok(Reserve::Exists(p2));
        }
        if !self.slot(p1).is_occupied() {
            return Ok(Reserve::Free(p1));
        }
        if !self.slot(p2).is_occupied() {
            return Ok(Reserve::Free(p2));
        }
        let victim = if self.rng.gen::<bool>() { p1 } else { p2 };
        self.run_displacement(victim)?;
        debug_assert!(!self.slot(victim).is_occupied());
        Ok(Reserve::Free(victim))
    }

    /// Insert a node. A non-leaf carries its first known child; a leaf
    /// (`dlen == 8`) passes `None`.
    pub(crate) fn insert(
        &mut self,
        ilen: u32,
        dlen: u32,
        dkey: u64,
        first_child: Option<u8>,
    ) -> Result<InsertOutcome, CapacityError> {
        let tag = hash::hash3(dkey, ilen) & TAG_MASK;
        match self.reserve_for_insert(ilen, dkey, tag)? {
            Reserve::Exists(pos) => Ok(InsertOutcome { pos, existed: true }),
            Reserve::Free(pos) => {
                self.slot_mut(pos).init(ilen, dlen, dkey, tag, first_child);
                Ok(InsertOutcome {
                    pos,
                    existed: false,
                })
            }
        }
    }

    /// Re-index a node in place after a path-compression split. The slot
    /// must already be valid for the new index (the caller reserved it).
    pub(crate) fn rekey(&mut self, pos: u32, new_index_len: u32) {
        let min_key = self.slot(pos).min_key;
        let tag = hash::hash3(min_key, new_index_len) & TAG_MASK;
        let s = self.slot_mut(pos);
        s.set_index_len(new_index_len);
        s.set_tag(tag);
    }

    /// Lower a node's subtree minimum. The new minimum must share the
    /// node's index prefix.
    pub(crate) fn set_min_key(&mut self, pos: u32, min_key: u64) {
        debug_assert!(self.slot(pos).is_node());
        debug_assert_eq!(
            key::prefix(min_key, self.slot(pos).index_len()),
            self.slot(pos).index_key()
        );
        self.slot_mut(pos).min_key = min_key;
    }

    /// Free `victim` by walking its eviction chain and unwinding it.
    ///
    /// The walk writes nothing, so a failed insert leaves the table intact.
    fn run_displacement(&mut self, victim: u32) -> Result<(), CapacityError> {
        let mut chain: SmallVec<[u32; 32]> = SmallVec::new();
        let mut pos = victim;
        loop {
            if chain.len() >= DISPLACEMENT_LIMIT {
                warn_log!(victim, "eviction chain budget exhausted");
                return Err(CapacityError);
            }
            match self.slot(pos).state() {
                SlotState::Empty => break,
                SlotState::Fragment => {
                    // The fragment's owner moves its bitmap out of the way,
                    // freeing this slot.
                    if let Some(owner) = self.bitmap_owner(pos) {
                        self.relocate_bitmap(owner);
                    } else {
                        debug_assert!(false, "fragment without owner in window");
                    }
                    break;
                }
                SlotState::Node => {
                    let s = self.slot(pos);
                    let ilen = s.index_len();
                    let ikey = s.index_key();
                    let p1 = self.bucket(hash::hash1(ikey, ilen));
                    let p2 = self.bucket(hash::hash2(ikey, ilen));
                    chain.push(pos);
                    pos = if p1 == pos { p2 } else { p1 };
                }
            }
        }
        debug_log!(victim, chain = chain.len(), "eviction chain resolved");
        while let Some(src) = chain.pop() {
            debug_assert!(!self.slot(pos).is_occupied());
            self.move_node(src, pos);
            pos = src;
        }
        Ok(())
    }

    /// Move the node at `src` into the empty slot `dst`, dragging its
    /// adjacent bitmap along (or spilling it externally).
    pub(crate) fn move_node(&mut self, src: u32, dst: u32) {
        debug_assert!(self.slot(src).is_node() && !self.slot(dst).is_occupied());
        self.counters
            .moved_nodes
            .set(self.counters.moved_nodes.get() + 1);
        let node = *self.slot(src);
        *self.slot_mut(dst) = node;
        let rep = if node.is_leaf() {
            ChildRep::Inline
        } else {
            node.child_rep()
        };
        match rep {
            ChildRep::Inline | ChildRep::External => {
                self.slot_mut(src).clear();
            }
            ChildRep::Adjacent(off) => {
                let frag_src = offset_pos(src, off);
                match self.find_neighboring_empty_slot(dst) {
                    Some(new_off) => {
                        let frag = *self.slot(frag_src);
                        self.slot_mut(dst).set_child_rep(ChildRep::Adjacent(new_off));
                        *self.slot_mut(offset_pos(dst, new_off)) = frag;
                    }
                    None => {
                        let idx = self.copy_to_external(src);
                        let d = self.slot_mut(dst);
                        d.set_child_rep(ChildRep::External);
                        d.child_map = idx;
                    }
                }
                self.slot_mut(src).clear();
                self.slot_mut(frag_src).clear();
            }
        }
    }

    /// Nearest empty slot within the neighbor window, same cache line
    /// preferred.
    fn find_neighboring_empty_slot(&self, pos: u32) -> Option<i32> {
        // Slots are 24 bytes on a 128-byte-aligned base, so the low bits of
        // the byte offset say where in its cache line this slot sits.
        if (pos as usize * 24) & 63 < 32 {
            if !self.slot(offset_pos(pos, 1)).is_occupied() {
                return Some(1);
            }
            if !self.slot(offset_pos(pos, -1)).is_occupied() {
                return Some(-1);
            }
        }
        for i in 1..=3 {
            if !self.slot(offset_pos(pos, i)).is_occupied() {
                return Some(i);
            }
            if !self.slot(offset_pos(pos, -i)).is_occupied() {
                return Some(-i);
            }
        }
        None
    }

    /// Owner of the bitmap fragment at `frag_pos`, somewhere in its window.
    fn bitmap_owner(&self, frag_pos: u32) -> Option<u32> {
        for off in [-3_i32, -2, -1, 1, 2, 3] {
            let p = offset_pos(frag_pos, off);
            let s = self.slot(p);
            if s.is_node() && !s.is_leaf() {
                if let ChildRep::Adjacent(o) = s.child_rep() {
                    if o + off == 0 {
                        return Some(p);
                    }
                }
            }
        }
        None
    }

    // ========================================================================
    // Child storage
    // ========================================================================

    /// Add a child edge, growing inline list -> adjacent bitmap ->
    /// external bitmap as needed.
    pub(crate) fn add_child(&mut self, pos: u32, child: u8) {
        debug_assert!(!self.slot(pos).is_leaf());
        debug_assert!(!self.child_exists(pos, child));
        if let ChildRep::Inline = self.slot(pos).child_rep() {
            if self.slot(pos).inline_count() < 8 {
                self.slot_mut(pos).inline_insert(child);
                return;
            }
            self.extend_to_bitmap(pos);
        }
        self.bitmap_set(pos, child);
    }

    pub(crate) fn child_exists(&self, pos: u32, child: u8) -> bool {
        let s = self.slot(pos);
        debug_assert!(s.is_node() && !s.is_leaf());
        match s.child_rep() {
            ChildRep::Inline => s.inline_contains(child),
            _ => {
                let c = u32::from(child);
                self.gather_bitmap(pos)[(c / 64) as usize] & (1 << (c % 64)) != 0
            }
        }
    }

    /// Smallest child byte `>= child`, if any.
    pub(crate) fn lower_bound_child(&self, pos: u32, child: u8) -> Option<u8> {
        let s = self.slot(pos);
        debug_assert!(s.is_node() && !s.is_leaf());
        match s.child_rep() {
            ChildRep::Inline => s.inline_lower_bound(child),
            _ => {
                let bit = first_set_ge(&self.gather_bitmap(pos), u32::from(child));
                bit.map(|b| b as u8)
            }
        }
    }

    /// All child bytes in ascending order.
    pub(crate) fn children(&self, pos: u32) -> Vec<u8> {
        let s = self.slot(pos);
        debug_assert!(s.is_node() && !s.is_leaf());
        match s.child_rep() {
            ChildRep::Inline => (0..s.inline_count()).map(|i| s.inline_child(i)).collect(),
            _ => {
                let words = self.gather_bitmap(pos);
                let mut out = Vec::new();
                for (w, &word) in words.iter().enumerate() {
                    let mut bits = word;
                    while bits != 0 {
                        out.push((w as u32 * 64 + bits.trailing_zeros()) as u8);
                        bits &= bits - 1;
                    }
                }
                out
            }
        }
    }

    /// Set one bit in an already-bitmap child map.
    fn bitmap_set(&mut self, pos: u32, child: u8) {
        let c = u32::from(child);
        match self.slot(pos).child_rep() {
            ChildRep::External => {
                let idx = self.slot(pos).child_map;
                self.ext_block_mut(idx)[(c / 64) as usize] |= 1 << (c % 64);
            }
            ChildRep::Adjacent(off) => {
                if c < 64 {
                    self.slot_mut(pos).child_map |= 1 << c;
                } else if c == 94 || c == 95 {
                    // The fragment's occupancy bits sit where these two
                    // children would land; they live in the owner's header.
                    self.slot_mut(pos).set_head_child_bit(c);
                } else {
                    self.slot_mut(offset_pos(pos, off))
                        .fragment_word_or(c / 64 - 1, 1 << (c % 64));
                }
            }
            ChildRep::Inline => debug_assert!(false, "bitmap_set on inline node"),
        }
    }

    /// Switch a full inline list to bitmap form, adjacent if a neighbor
    /// slot is free, external otherwise.
    fn extend_to_bitmap(&mut self, pos: u32) {
        debug_assert!(self.slot(pos).inline_count() == 8);
        let children = self.slot(pos).child_map;
        match self.find_neighboring_empty_slot(pos) {
            Some(off) => {
                let s = self.slot_mut(pos);
                s.head &= 0xff03_ffff;
                s.set_child_rep(ChildRep::Adjacent(off));
                s.child_map = 0;
                self.slot_mut(offset_pos(pos, off)).init_fragment();
            }
            None => {
                let idx = self.alloc_ext_bitmap([0; 4]);
                let s = self.slot_mut(pos);
                s.head &= 0xff03_ffff;
                s.set_child_rep(ChildRep::External);
                s.child_map = idx;
            }
        }
        for i in 0..8 {
            self.bitmap_set(pos, (children >> (8 * i)) as u8);
        }
    }

    /// Move an adjacent bitmap to a different neighbor (or externally) so
    /// its current fragment slot can take a displaced node.
    fn relocate_bitmap(&mut self, pos: u32) {
        self.counters
            .relocated_bitmaps
            .set(self.counters.relocated_bitmaps.get() + 1);
        let ChildRep::Adjacent(old) = self.slot(pos).child_rep() else {
            debug_assert!(false, "relocate on non-adjacent node");
            return;
        };
        match self.find_neighboring_empty_slot(pos) {
            Some(new_off) => {
                debug_assert_ne!(new_off, old);
                let frag = *self.slot(offset_pos(pos, old));
                *self.slot_mut(offset_pos(pos, new_off)) = frag;
                self.slot_mut(offset_pos(pos, old)).clear();
                self.slot_mut(pos).set_child_rep(ChildRep::Adjacent(new_off));
            }
            None => {
                let idx = self.copy_to_external(pos);
                self.slot_mut(offset_pos(pos, old)).clear();
                let s = self.slot_mut(pos);
                s.set_child_rep(ChildRep::External);
                s.child_map = idx;
            }
        }
    }

    /// Materialise the full 256-bit bitmap of a non-inline node.
    fn gather_bitmap(&self, pos: u32) -> [u64; 4] {
        let node = self.slot(pos);
        match node.child_rep() {
            ChildRep::External => *self.ext_block(node.child_map),
            ChildRep::Adjacent(off) => {
                let frag = self.slot(offset_pos(pos, off));
                // Splice children 94/95 back in over the fragment's
                // occupancy bits.
                let mut w1 = frag.fragment_word(0) & 0xffff_ffff_3fff_ffff;
                if node.head_child_bit(94) {
                    w1 |= 1 << 30;
                }
                if node.head_child_bit(95) {
                    w1 |= 1 << 31;
                }
                [node.child_map, w1, frag.fragment_word(1), frag.fragment_word(2)]
            }
            ChildRep::Inline => {
                debug_assert!(false, "gather on inline node");
                [0; 4]
            }
        }
    }

    /// Copy an adjacent bitmap into a fresh external block and return its
    /// index.
    fn copy_to_external(&mut self, pos: u32) -> u64 {
        debug_assert!(matches!(self.slot(pos).child_rep(), ChildRep::Adjacent(_)));
        let block = self.gather_bitmap(pos);
        self.alloc_ext_bitmap(block)
    }

    fn alloc_ext_bitmap(&mut self, block: [u64; 4]) -> u64 {
        self.ext_bitmaps.push(Box::new(block));
        (self.ext_bitmaps.len() - 1) as u64
    }

    fn ext_block(&self, idx: u64) -> &[u64; 4] {
        &self.ext_bitmaps[idx as usize]
    }

    fn ext_block_mut(&mut self, idx: u64) -> &mut [u64; 4] {
        &mut self.ext_bitmaps[idx as usize]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::prelude::*;
    use std::collections::BTreeSet;

    struct Fixture {
        _mem: Vec<Slot>,
        t: CuckooTable,
    }

    fn fixture(buckets: usize) -> Fixture {
        let empty = Slot {
            head: 0,
            aux: 0,
            min_key: 0,
            child_map: 0,
        };
        let mut mem = vec![empty; buckets + 2 * GUARD_SLOTS as usize + 16];
        // Tests don't control heap alignment; skip forward whole slots
        // until a 128-byte boundary (24-byte slots hit one within 16).
        let base = mem.as_mut_ptr();
        let mut skip = 0;
        // SAFETY: the vec has 16 spare slots to absorb the skip.
        while unsafe { base.add(skip) } as usize % 128 != 0 {
            skip += 1;
        }
        // SAFETY: the vec is zeroed and outlives the fixture.
        let t = unsafe { CuckooTable::from_raw(base.add(skip), buckets) };
        Fixture { _mem: mem, t }
    }

    #[test]
    fn insert_then_lookup_roundtrip() {
        let mut f = fixture(1024);
        let k1 = 0x0102_0304_0506_0708;
        let k2 = 0x0102_03ff_0000_0000;
        let a = f.t.insert(3, 3, k2, Some(0x04)).unwrap();
        assert!(!a.existed);
        let b = f.t.insert(4, 8, k1, None).unwrap();
        assert!(!b.existed);

        assert_eq!(f.t.lookup(3, k1), Some(a.pos));
        assert_eq!(f.t.lookup(4, k1), Some(b.pos));
        assert_eq!(f.t.lookup(5, k1), None);
        assert_eq!(f.t.lookup(4, 0x0102_03fe_0000_0000), None);
        assert!(f.t.slot(b.pos).is_leaf());
    }

    #[test]
    fn duplicate_insert_reports_existing() {
        let mut f = fixture(1024);
        let k = 0xaabb_ccdd_0000_0000;
        let first = f.t.insert(4, 8, k, None).unwrap();
        let second = f.t.insert(4, 8, k, None).unwrap();
        assert!(second.existed);
        assert_eq!(first.pos, second.pos);
    }

    #[test]
    fn promise_resolves_to_min_key() {
        let mut f = fixture(1024);
        let k = 0x1020_3040_5060_7080;
        f.t.insert(5, 8, k, None).unwrap();
        let p = f.t.lookup_must_exist(5, k);
        p.prefetch();
        assert_eq!(p.resolve(), k);
    }

    #[test]
    fn child_reps_match_btreeset_oracle() {
        let mut rng = StdRng::seed_from_u64(7);
        for forced_external in [false, true] {
            let mut f = fixture(1024);
            let k = 0x5566_7700_0000_0000;
            let ins = f.t.insert(3, 3, k, Some(7)).unwrap();
            if forced_external {
                // Occupy the whole neighbor window so the bitmap cannot go
                // adjacent.
                for off in [-3_i32, -2, -1, 1, 2, 3] {
                    let p = offset_pos(ins.pos, off);
                    if !f.t.slot(p).is_occupied() {
                        f.t.slot_mut(p).init(8, 8, u64::from(p), 0, None);
                    }
                }
            }
            let mut oracle = BTreeSet::from([7_u8]);
            for _ in 0..120 {
                let c: u8 = rng.gen();
                if oracle.insert(c) {
                    assert!(!f.t.child_exists(ins.pos, c));
                    f.t.add_child(ins.pos, c);
                }
                assert!(f.t.child_exists(ins.pos, c));
            }
            if forced_external {
                assert_eq!(f.t.slot(ins.pos).child_rep(), ChildRep::External);
            } else {
                assert!(matches!(
                    f.t.slot(ins.pos).child_rep(),
                    ChildRep::Adjacent(_)
                ));
            }
            let got = f.t.children(ins.pos);
            let want: Vec<u8> = oracle.iter().copied().collect();
            assert_eq!(got, want);
            for c in 0..=255_u8 {
                assert_eq!(
                    f.t.lower_bound_child(ins.pos, c),
                    oracle.range(c..).next().copied(),
                    "lower bound child {c}"
                );
            }
        }
    }

    #[test]
    fn children_94_and_95_survive_bitmap_form() {
        let mut f = fixture(1024);
        let ins = f.t.insert(3, 3, 0x0101_0100_0000_0000, Some(94)).unwrap();
        for c in [95, 1, 2, 3, 4, 5, 6] {
            f.t.add_child(ins.pos, c);
        }
        assert_eq!(f.t.slot(ins.pos).child_rep(), ChildRep::Inline);
        f.t.add_child(ins.pos, 200);
        assert!(!matches!(f.t.slot(ins.pos).child_rep(), ChildRep::Inline));
        for c in [94, 95, 1, 200] {
            assert!(f.t.child_exists(ins.pos, c), "child {c}");
        }
        assert_eq!(f.t.lower_bound_child(ins.pos, 90), Some(94));
        assert_eq!(f.t.lower_bound_child(ins.pos, 95), Some(95));
        assert_eq!(f.t.lower_bound_child(ins.pos, 96), Some(200));
    }

    #[test]
    fn displacement_keeps_every_node_findable() {
        let mut f = fixture(1024);
        let mut rng = StdRng::seed_from_u64(42);
        let mut keys = BTreeSet::new();
        // ~40% load forces plenty of displacement without risking failure.
        while keys.len() < 400 {
            keys.insert(rng.gen::<u64>());
        }
        for &k in &keys {
            let out = f.t.insert(8, 8, k, None).unwrap();
            assert!(!out.existed);
        }
        for &k in &keys {
            let pos = f.t.lookup(8, k).unwrap();
            assert_eq!(f.t.slot(pos).min_key, k);
        }
        assert!(f.t.stats().moved_nodes > 0);
    }

    #[test]
    fn query_lcp_finds_deepest_prefix() {
        let mut f = fixture(1024);
        let k = 0x1122_3344_5566_7788;
        f.t.insert(3, 8, k, None).unwrap();

        let full = f.t.query_lcp(k);
        assert_eq!(full.lcp, 8);
        assert_eq!(f.t.slot(full.pos).min_key, k);

        let sibling = f.t.query_lcp(0x1122_33ff_0000_0000);
        assert_eq!(sibling.lcp, 3);
        assert_eq!(sibling.positions[3], sibling.pos);

        let missing = f.t.query_lcp(0x9988_0000_0000_0000);
        assert_eq!(missing.lcp, 2);
    }

    #[test]
    fn query_lcp_reports_positions_for_all_lengths() {
        let mut f = fixture(1024);
        let k = 0x0102_0304_0506_0708;
        f.t.insert(3, 3, k, Some(0x04)).unwrap();
        f.t.insert(4, 6, k, Some(0x07)).unwrap();
        f.t.insert(7, 8, k, None).unwrap();

        let r = f.t.query_lcp(k);
        assert_eq!(r.lcp, 8);
        for len in [3, 4, 7] {
            let p = r.positions[len];
            assert_ne!(p, 0, "missing position for length {len}");
            assert_eq!(f.t.slot(p).index_len() as usize, len);
            assert_eq!(f.t.slot(p).min_key, k);
        }
        assert_eq!(r.positions[5], 0);
        assert_eq!(r.positions[6], 0);
    }
}
