//! The 24-byte cuckoo slot.
//!
//! Every trie node below the flat-bitmap levels lives in one hash table slot:
//!
//! ```text
//! root ===[parent]--child--*-----path-compressed bytes-----[this]--child-- ... --[subtree minimum]
//!                      index_len                        full_key_len              8-byte min_key
//! ```
//!
//! The header word packs, from the top bit down:
//!
//! * 2 bits  occupancy: `00` empty, `10` node, `11` bitmap fragment
//! * 3 bits  `index_len - 1`: bytes of `min_key` that address this slot
//! * 3 bits  `full_key_len - 1`: index bytes plus path-compressed bytes
//! * 3 bits  child representation: `0` inline list, `4` external bitmap,
//!   otherwise `offset + 4` of the adjacent fragment slot (offset in
//!   `-3..=3`, never `0`)
//! * 3 bits  inline child count minus 1; for an adjacent bitmap, bits 18/19
//!   instead hold children 94/95 (see below)
//! * 18 bits tag from [`hash3`](crate::hash::hash3)
//!
//! A node with more than eight children spreads a 256-bit child bitmap over
//! its own `child_map` (children 0..64) and the 24 bytes of a neighboring
//! empty slot. The fragment's first word doubles as its own header, whose
//! occupancy bits `11` sit exactly where children 94 and 95 would land, so
//! those two children are stored in the owner's header bits 18/19 instead.
//! When no neighbor is free the bitmap moves to an external block and
//! `child_map` holds that block's index.
//!
//! A leaf is a node with `full_key_len == 8`; its `child_map` is all ones.

use crate::key;

/// Low 18 bits of the header: the tag.
pub(crate) const TAG_MASK: u32 = (1 << 18) - 1;

/// Header bits that identify a node during lookup: occupancy, `index_len`
/// and tag. `full_key_len` and the child bits are excluded.
pub(crate) const HEAD_EQ_MASK: u32 = 0xf803_ffff;

/// Occupancy bits of an empty-slot header claimed as a bitmap fragment.
pub(crate) const FRAGMENT_HEAD: u32 = 0xc000_0000;

/// Header an occupied node with this `index_len` and tag must carry in its
/// [`HEAD_EQ_MASK`] bits.
#[inline]
#[must_use]
pub(crate) const fn expected_head(index_len: u32, tag: u32) -> u32 {
    0x8000_0000 | ((index_len - 1) << 27) | tag
}

/// What a slot currently holds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum SlotState {
    /// Free.
    Empty,
    /// A trie node.
    Node,
    /// The spill-over words of a neighbor's child bitmap.
    Fragment,
}

/// How a node stores its children.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ChildRep {
    /// Up to eight child bytes packed sorted into `child_map`.
    Inline,
    /// 256-bit bitmap spilling into the slot at this relative offset.
    Adjacent(i32),
    /// 256-bit bitmap in an externally owned block; `child_map` is the
    /// block index.
    External,
}

/// One hash table slot. Layout is load-bearing: a fragment slot's first
/// eight bytes (`head` then `aux`) are addressed as a single bitmap word.
#[derive(Debug, Clone, Copy)]
#[repr(C)]
pub(crate) struct Slot {
    pub(crate) head: u32,
    /// High half of bitmap word 1 when this slot is a fragment (children
    /// 96..128). Unused for nodes.
    pub(crate) aux: u32,
    /// Minimum key of the subtree. Its `index_len`-byte prefix is this
    /// node's hash index; its `full_key_len`-byte prefix adds the
    /// path-compressed bytes.
    pub(crate) min_key: u64,
    /// Child storage, interpreted per [`ChildRep`]; all ones for a leaf.
    pub(crate) child_map: u64,
}

impl Slot {
    #[inline]
    pub(crate) fn state(&self) -> SlotState {
        debug_assert!(self.head >> 30 != 1);
        match self.head >> 30 {
            2 => SlotState::Node,
            3 => SlotState::Fragment,
            _ => SlotState::Empty,
        }
    }

    #[inline]
    pub(crate) fn is_occupied(&self) -> bool {
        self.state() != SlotState::Empty
    }

    #[inline]
    pub(crate) fn is_node(&self) -> bool {
        self.state() == SlotState::Node
    }

    /// A leaf holds a complete 8-byte key and has no children.
    #[inline]
    pub(crate) fn is_leaf(&self) -> bool {
        debug_assert!(self.is_node());
        self.full_key_len() == 8
    }

    #[inline]
    pub(crate) fn index_len(&self) -> u32 {
        debug_assert!(self.is_node());
        1 + ((self.head >> 27) & 7)
    }

    #[inline]
    pub(crate) fn full_key_len(&self) -> u32 {
        debug_assert!(self.is_node());
        1 + ((self.head >> 24) & 7)
    }

    /// The prefix of `min_key` this slot is hashed under.
    #[inline]
    pub(crate) fn index_key(&self) -> u64 {
        key::prefix(self.min_key, self.index_len())
    }

    #[inline]
    pub(crate) fn tag(&self) -> u32 {
        self.head & TAG_MASK
    }

    /// Rewrite `index_len` in place; the caller must also retag and make
    /// sure the slot sits at a position valid for the new index.
    #[inline]
    pub(crate) fn set_index_len(&mut self, index_len: u32) {
        debug_assert!(self.is_node() && (1..=8).contains(&index_len));
        self.head = (self.head & 0xc7ff_ffff) | ((index_len - 1) << 27);
    }

    #[inline]
    pub(crate) fn set_tag(&mut self, tag: u32) {
        debug_assert!(self.is_node() && tag <= TAG_MASK);
        self.head = (self.head & !TAG_MASK) | tag;
    }

    #[inline]
    pub(crate) fn child_rep(&self) -> ChildRep {
        debug_assert!(self.is_node());
        match (self.head >> 21) & 7 {
            0 => ChildRep::Inline,
            4 => ChildRep::External,
            r => ChildRep::Adjacent(r as i32 - 4),
        }
    }

    /// Overwrite the representation bits, preserving the 94/95 child bits.
    #[inline]
    pub(crate) fn set_child_rep(&mut self, rep: ChildRep) {
        let bits = match rep {
            ChildRep::Inline => 0,
            ChildRep::External => 4,
            ChildRep::Adjacent(off) => {
                debug_assert!((-3..=3).contains(&off) && off != 0);
                (off + 4) as u32
            }
        };
        self.head = (self.head & 0xff1f_ffff) | (bits << 21);
    }

    /// Header compare plus index-prefix compare, one branch each.
    #[inline]
    pub(crate) fn matches(&self, expected_head: u32, shift: u32, shifted_key: u64) -> bool {
        (self.head & HEAD_EQ_MASK) == expected_head && (self.min_key >> shift) == shifted_key
    }

    /// Tag-free exact probe: occupied node with this `index_len` whose
    /// index equals the `len`-byte prefix of `key`. Never a false positive.
    #[inline]
    pub(crate) fn is_exact_prefix(&self, key_: u64, len: u32) -> bool {
        (self.head & 0xf800_0000) == (0x8000_0000 | ((len - 1) << 27))
            && key::prefix(key_, len) == key::prefix(self.min_key, len)
    }

    /// Claim an empty slot as a node. A leaf passes `first_child: None`.
    pub(crate) fn init(
        &mut self,
        index_len: u32,
        full_key_len: u32,
        min_key: u64,
        tag: u32,
        first_child: Option<u8>,
    ) {
        debug_assert!(!self.is_occupied());
        debug_assert!((1..=8).contains(&index_len) && (1..=8).contains(&full_key_len));
        debug_assert!(tag <= TAG_MASK);
        self.head = 0x8000_0000 | ((index_len - 1) << 27) | ((full_key_len - 1) << 24) | tag;
        self.min_key = min_key;
        self.child_map = first_child.map_or(u64::MAX, u64::from);
    }

    #[inline]
    pub(crate) fn clear(&mut self) {
        self.head = 0;
        self.aux = 0;
        self.min_key = 0;
        self.child_map = 0;
    }

    // ========================================================================
    // Inline child list (sorted, up to 8 bytes in child_map)
    // ========================================================================

    #[inline]
    pub(crate) fn inline_count(&self) -> u32 {
        debug_assert!(matches!(self.child_rep(), ChildRep::Inline));
        1 + ((self.head >> 18) & 7)
    }

    #[inline]
    fn set_inline_count(&mut self, n: u32) {
        debug_assert!((1..=8).contains(&n));
        self.head = (self.head & 0xffe3_ffff) | ((n - 1) << 18);
    }

    #[inline]
    pub(crate) fn inline_child(&self, i: u32) -> u8 {
        debug_assert!(i < self.inline_count());
        (self.child_map >> (8 * i)) as u8
    }

    /// Insert `child` keeping the list sorted ascending. The caller has
    /// checked the child is absent and the list is not full.
    pub(crate) fn inline_insert(&mut self, child: u8) {
        let n = self.inline_count();
        debug_assert!(n < 8 && !self.inline_contains(child));
        let mut at = n;
        for i in 0..n {
            if self.inline_child(i) > child {
                at = i;
                break;
            }
        }
        let shift = 8 * at;
        let low_mask = (1_u64 << shift) - 1;
        let low = self.child_map & low_mask;
        let high = (self.child_map & !low_mask) << 8;
        self.child_map = low | high | (u64::from(child) << shift);
        self.set_inline_count(n + 1);
    }

    pub(crate) fn inline_contains(&self, child: u8) -> bool {
        (0..self.inline_count()).any(|i| self.inline_child(i) == child)
    }

    /// Smallest inline child `>= child`, if any.
    pub(crate) fn inline_lower_bound(&self, child: u8) -> Option<u8> {
        (0..self.inline_count())
            .map(|i| self.inline_child(i))
            .find(|&c| c >= child)
    }

    // ========================================================================
    // Adjacent-bitmap plumbing
    // ========================================================================

    /// Children 94 and 95 of an adjacent bitmap, stored in header bits
    /// 18/19 because the fragment's occupancy bits occupy their place.
    #[inline]
    pub(crate) fn head_child_bit(&self, child: u32) -> bool {
        debug_assert!(child == 94 || child == 95);
        self.head & (1 << (child - 76)) != 0
    }

    #[inline]
    pub(crate) fn set_head_child_bit(&mut self, child: u32) {
        debug_assert!(child == 94 || child == 95);
        self.head |= 1 << (child - 76);
    }

    /// Read this slot's 24 bytes as three bitmap words (fragment view).
    #[inline]
    pub(crate) fn fragment_word(&self, w: u32) -> u64 {
        match w {
            0 => (u64::from(self.aux) << 32) | u64::from(self.head),
            1 => self.min_key,
            _ => self.child_map,
        }
    }

    #[inline]
    pub(crate) fn fragment_word_or(&mut self, w: u32, bits: u64) {
        match w {
            0 => {
                self.head |= bits as u32;
                self.aux |= (bits >> 32) as u32;
            }
            1 => self.min_key |= bits,
            _ => self.child_map |= bits,
        }
    }

    /// Claim an empty slot as a bitmap fragment.
    #[inline]
    pub(crate) fn init_fragment(&mut self) {
        debug_assert!(!self.is_occupied());
        self.clear();
        self.head = FRAGMENT_HEAD;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::mem::{align_of, size_of};

    const EMPTY: Slot = Slot {
        head: 0,
        aux: 0,
        min_key: 0,
        child_map: 0,
    };

    #[test]
    fn slot_is_24_bytes() {
        assert_eq!(size_of::<Slot>(), 24);
        assert_eq!(align_of::<Slot>(), 8);
    }

    #[test]
    fn init_packs_header() {
        let mut s = EMPTY;
        s.init(3, 5, 0x0102_0304_0506_0708, 0x2_abcd, Some(0x42));
        assert_eq!(s.state(), SlotState::Node);
        assert_eq!(s.index_len(), 3);
        assert_eq!(s.full_key_len(), 5);
        assert_eq!(s.tag(), 0x2_abcd);
        assert_eq!(s.index_key(), 0x0102_0300_0000_0000);
        assert_eq!(s.child_rep(), ChildRep::Inline);
        assert_eq!(s.inline_count(), 1);
        assert_eq!(s.inline_child(0), 0x42);
        assert!(!s.is_leaf());
    }

    #[test]
    fn leaf_has_full_key() {
        let mut s = EMPTY;
        s.init(4, 8, 77, 0, None);
        assert!(s.is_leaf());
        assert_eq!(s.child_map, u64::MAX);
    }

    #[test]
    fn matches_compares_header_and_prefix() {
        let mut s = EMPTY;
        let k = 0x1122_3344_5566_7788;
        s.init(4, 6, k, 7, Some(1));
        let exp = expected_head(4, 7);
        assert!(s.matches(exp, 32, k >> 32));
        assert!(!s.matches(exp, 32, (k >> 32) + 1));
        assert!(!s.matches(expected_head(5, 7), 32, k >> 32));
        assert!(s.is_exact_prefix(k | 0xffff, 4));
        assert!(!s.is_exact_prefix(k ^ (1 << 40), 4));
    }

    #[test]
    fn inline_insert_keeps_sorted_order() {
        let mut s = EMPTY;
        s.init(3, 4, 0, 0, Some(50));
        for c in [10, 200, 50 + 1, 0, 255, 49, 128] {
            assert!(!s.inline_contains(c));
            s.inline_insert(c);
            assert!(s.inline_contains(c));
        }
        assert_eq!(s.inline_count(), 8);
        let all: Vec<u8> = (0..8).map(|i| s.inline_child(i)).collect();
        assert_eq!(all, vec![0, 10, 49, 50, 51, 128, 200, 255]);
    }

    #[test]
    fn inline_lower_bound_scans_sorted_list() {
        let mut s = EMPTY;
        s.init(3, 4, 0, 0, Some(20));
        s.inline_insert(5);
        s.inline_insert(100);
        assert_eq!(s.inline_lower_bound(0), Some(5));
        assert_eq!(s.inline_lower_bound(5), Some(5));
        assert_eq!(s.inline_lower_bound(6), Some(20));
        assert_eq!(s.inline_lower_bound(21), Some(100));
        assert_eq!(s.inline_lower_bound(101), None);
    }

    #[test]
    fn rekey_preserves_other_fields() {
        let mut s = EMPTY;
        s.init(5, 7, 0xaabb_ccdd_eeff_0011, 0x1_2345, Some(9));
        s.set_index_len(6);
        s.set_tag(0x3_ffff);
        assert_eq!(s.index_len(), 6);
        assert_eq!(s.full_key_len(), 7);
        assert_eq!(s.tag(), 0x3_ffff);
        assert_eq!(s.inline_count(), 1);
    }

    #[test]
    fn fragment_words_overlay_the_struct() {
        let mut s = EMPTY;
        s.init_fragment();
        assert_eq!(s.state(), SlotState::Fragment);
        assert_eq!(s.fragment_word(0), u64::from(FRAGMENT_HEAD));
        s.fragment_word_or(0, 1 << 40);
        assert_eq!(s.aux, 1 << 8);
        s.fragment_word_or(1, 0b1010);
        s.fragment_word_or(2, 1);
        assert_eq!(s.min_key, 0b1010);
        assert_eq!(s.child_map, 1);
        assert_eq!(s.state(), SlotState::Fragment);
    }
}
