//! Byte-level helpers for treating a `u64` as an 8-byte big-endian string.
//!
//! The trie addresses nodes by key *prefixes*: the most significant `len`
//! bytes of the key, with everything below zeroed. Byte 0 is the most
//! significant byte.

/// Keep the most significant `len` bytes of `key`, zeroing the rest.
#[inline]
#[must_use]
pub(crate) const fn prefix(key: u64, len: u32) -> u64 {
    debug_assert!(1 <= len && len <= 8);
    let shift = 64 - 8 * len;
    (key >> shift) << shift
}

/// The `i`-th byte of `key` in big-endian order (`i` in `0..8`).
#[inline]
#[must_use]
pub(crate) const fn byte(key: u64, i: u32) -> u8 {
    debug_assert!(i < 8);
    (key >> (56 - 8 * i)) as u8
}

/// Replace the `i`-th big-endian byte of `key` with `b`.
#[inline]
#[must_use]
pub(crate) const fn with_byte(key: u64, i: u32, b: u8) -> u64 {
    debug_assert!(i < 8);
    let shift = 56 - 8 * i;
    (key & !(0xff_u64 << shift)) | ((b as u64) << shift)
}

/// Number of leading bytes shared by `a` and `b` (0..=8).
#[inline]
#[must_use]
pub(crate) const fn common_prefix_len(a: u64, b: u64) -> u32 {
    (a ^ b).leading_zeros() / 8
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn prefix_masks_low_bytes() {
        let k = 0x0123_4567_89ab_cdef;
        assert_eq!(prefix(k, 1), 0x0100_0000_0000_0000);
        assert_eq!(prefix(k, 3), 0x0123_4500_0000_0000);
        assert_eq!(prefix(k, 8), k);
    }

    #[test]
    fn byte_is_big_endian() {
        let k = 0x0123_4567_89ab_cdef;
        assert_eq!(byte(k, 0), 0x01);
        assert_eq!(byte(k, 4), 0x89);
        assert_eq!(byte(k, 7), 0xef);
    }

    #[test]
    fn with_byte_replaces_one_byte() {
        let k = 0x0123_4567_89ab_cdef;
        assert_eq!(with_byte(k, 0, 0xff), 0xff23_4567_89ab_cdef);
        assert_eq!(with_byte(k, 7, 0x00), 0x0123_4567_89ab_cd00);
        assert_eq!(with_byte(prefix(k, 3), 3, 0x42), 0x0123_4542_0000_0000);
    }

    #[test]
    fn common_prefix_counts_bytes() {
        assert_eq!(common_prefix_len(0, 0), 8);
        assert_eq!(common_prefix_len(0x0102_0304_0506_0708, 0x0102_0304_0506_0709), 7);
        assert_eq!(common_prefix_len(0x0102_0000_0000_0000, 0x0103_0000_0000_0000), 1);
        assert_eq!(common_prefix_len(0x8000_0000_0000_0000, 0), 0);
    }
}
