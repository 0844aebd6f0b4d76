//! Flat bitmaps covering the top three byte-levels of the trie.
//!
//! Depth 1 is 256 bits, depth 2 is 256^2 bits, depth 3 is 256^3 bits; all
//! three live at the front of the set's single mapping. The first two fit
//! comfortably in L1/L2, so queries that fall out of the hash table resolve
//! near the top of the cache hierarchy. Bits are only ever set; the parent
//! bit of any set bit is set too.

/// Bytes of the depth-1 bitmap.
pub(crate) const ROOT_BYTES: usize = 32;
/// Bytes of the depth-2 bitmap.
pub(crate) const LV1_BYTES: usize = 8192;
/// Bytes of the depth-3 bitmap.
pub(crate) const LV2_BYTES: usize = 2 * 1024 * 1024;
/// Total footprint of the three levels.
pub(crate) const FLAT_BYTES: usize = ROOT_BYTES + LV1_BYTES + LV2_BYTES;

/// Smallest set bit `>= from` in a 256-bit row.
#[inline]
pub(crate) fn first_set_ge(words: &[u64; 4], from: u32) -> Option<u32> {
    if from > 255 {
        return None;
    }
    let mut w = (from / 64) as usize;
    let mut word = words[w] & (u64::MAX << (from % 64));
    loop {
        if word != 0 {
            return Some(w as u32 * 64 + word.trailing_zeros());
        }
        w += 1;
        if w == 4 {
            return None;
        }
        word = words[w];
    }
}

/// Views into the three flat levels. Does not own the memory; the set's
/// mapping outlives it.
pub(crate) struct FlatBitmap {
    root: *mut u64,
    lv1: *mut u64,
    lv2: *mut u64,
}

impl FlatBitmap {
    /// # Safety
    ///
    /// `base` must point at [`FLAT_BYTES`] of zero-initialised, 8-aligned
    /// memory that outlives the returned value and is not aliased mutably
    /// elsewhere.
    pub(crate) unsafe fn from_raw(base: *mut u8) -> Self {
        debug_assert!(base as usize % 8 == 0);
        Self {
            root: base.cast::<u64>(),
            lv1: base.add(ROOT_BYTES).cast::<u64>(),
            lv2: base.add(ROOT_BYTES + LV1_BYTES).cast::<u64>(),
        }
    }

    /// Set the three prefix bits of `key`.
    #[inline]
    pub(crate) fn mark(&mut self, key: u64) {
        let p1 = (key >> 56) as u32;
        let p2 = (key >> 48) as u32;
        let p3 = (key >> 40) as u32;
        // SAFETY: indices are bounded by the level sizes (8, 16 and 24 bit
        // prefixes) and the mapping covers FLAT_BYTES.
        unsafe {
            *self.root.add((p1 / 64) as usize) |= 1 << (p1 % 64);
            *self.lv1.add((p2 / 64) as usize) |= 1 << (p2 % 64);
            *self.lv2.add((p3 / 64) as usize) |= 1 << (p3 % 64);
        }
    }

    #[inline]
    pub(crate) fn root_bit(&self, p1: u32) -> bool {
        debug_assert!(p1 < 256);
        // SAFETY: p1 / 64 < 4.
        unsafe { *self.root.add((p1 / 64) as usize) & (1 << (p1 % 64)) != 0 }
    }

    #[inline]
    pub(crate) fn lv1_bit(&self, p2: u32) -> bool {
        debug_assert!(p2 < 1 << 16);
        // SAFETY: p2 / 64 < LV1_BYTES / 8.
        unsafe { *self.lv1.add((p2 / 64) as usize) & (1 << (p2 % 64)) != 0 }
    }

    #[inline]
    pub(crate) fn lv2_bit(&self, p3: u32) -> bool {
        debug_assert!(p3 < 1 << 24);
        // SAFETY: p3 / 64 < LV2_BYTES / 8.
        unsafe { *self.lv2.add((p3 / 64) as usize) & (1 << (p3 % 64)) != 0 }
    }

    #[inline]
    fn root_row(&self) -> [u64; 4] {
        // SAFETY: the root level is exactly one 256-bit row.
        unsafe { *self.root.cast::<[u64; 4]>() }
    }

    #[inline]
    fn lv1_row(&self, p1: u32) -> [u64; 4] {
        debug_assert!(p1 < 256);
        // SAFETY: 256 rows of 4 words each.
        unsafe { *self.lv1.add(p1 as usize * 4).cast::<[u64; 4]>() }
    }

    #[inline]
    fn lv2_row(&self, p2: u32) -> [u64; 4] {
        debug_assert!(p2 < 1 << 16);
        // SAFETY: 65536 rows of 4 words each.
        unsafe { *self.lv2.add(p2 as usize * 4).cast::<[u64; 4]>() }
    }

    /// Smallest marked 3-byte prefix `>= from`, cascading up through the
    /// levels when a row runs out.
    pub(crate) fn successor_prefix(&self, from: u32) -> Option<u32> {
        debug_assert!(from < 1 << 24);
        let row = from >> 8;
        if let Some(b) = first_set_ge(&self.lv2_row(row), from & 0xff) {
            return Some((row << 8) | b);
        }
        let p1 = from >> 16;
        let b1 = (from >> 8) & 0xff;
        if b1 < 255 {
            if let Some(c1) = first_set_ge(&self.lv1_row(p1), b1 + 1) {
                let row = (p1 << 8) | c1;
                let c2 = first_set_ge(&self.lv2_row(row), 0)?;
                return Some((row << 8) | c2);
            }
        }
        if p1 >= 255 {
            return None;
        }
        let c0 = first_set_ge(&self.root_row(), p1 + 1)?;
        let c1 = first_set_ge(&self.lv1_row(c0), 0)?;
        let row = (c0 << 8) | c1;
        let c2 = first_set_ge(&self.lv2_row(row), 0)?;
        Some((row << 8) | c2)
    }
}
