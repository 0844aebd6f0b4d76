//! XXH32-derived hash family over key prefixes.
//!
//! Every node in the trie is addressed by a prefix of 3 to 8 bytes, so a
//! single lookup needs up to three hashes (two bucket choices plus a tag)
//! for each of the six prefix lengths. The hashes are a trimmed-down XXH32:
//! mask the key to the prefix, mix the high word, mix the low word if the
//! prefix extends past 4 bytes, then avalanche. [`PrefixHashes::compute`]
//! produces all 18 values at once, vectorized on SSE4.1 hardware.

#[cfg(target_arch = "x86_64")]
pub(crate) mod simd;

pub(crate) const PRIME32_1: u32 = 2_654_435_761;
pub(crate) const PRIME32_2: u32 = 2_246_822_519;
pub(crate) const PRIME32_3: u32 = 3_266_489_917;
pub(crate) const PRIME32_4: u32 = 668_265_263;
pub(crate) const PRIME32_5: u32 = 374_761_393;

pub(crate) const SEED1: u32 = 1_192_827_283;
pub(crate) const SEED2: u32 = 534_897_851;

/// Final XXH32 bit-mixing step.
#[inline]
#[must_use]
pub(crate) const fn avalanche(mut h: u32) -> u32 {
    h ^= h >> 15;
    h = h.wrapping_mul(PRIME32_2);
    h ^= h >> 13;
    h = h.wrapping_mul(PRIME32_3);
    h ^= h >> 16;
    h
}

/// Hash the most significant `len` bytes of `key` (`len` in `1..=8`).
#[inline]
#[must_use]
const fn core_mix(key: u64, len: u32, seed: u32, multiplier: u32) -> u32 {
    let key = crate::key::prefix(key, len);
    let low = key as u32;
    let high = (key >> 32) as u32;
    let mut h = PRIME32_5.wrapping_add(seed).wrapping_add(len);
    h ^= high.wrapping_mul(multiplier);
    h = h.rotate_left(17).wrapping_mul(PRIME32_4);
    if len > 4 {
        h ^= low.wrapping_mul(multiplier);
        h = h.rotate_left(17).wrapping_mul(PRIME32_4);
    }
    avalanche(h)
}

/// First cuckoo bucket choice.
#[inline]
#[must_use]
pub(crate) const fn hash1(key: u64, len: u32) -> u32 {
    core_mix(key, len, SEED1, PRIME32_1)
}

/// Second cuckoo bucket choice.
#[inline]
#[must_use]
pub(crate) const fn hash2(key: u64, len: u32) -> u32 {
    core_mix(key, len, SEED2, PRIME32_3)
}

/// Tag hash; the low 18 bits are stored in the slot header.
#[inline]
#[must_use]
pub(crate) const fn hash3(key: u64, len: u32) -> u32 {
    core_mix(key, len, 0, PRIME32_3)
}

/// All 18 hashes a prefix lookup can need, indexed by `len - 3`.
#[derive(Debug, Clone, Copy)]
pub(crate) struct PrefixHashes {
    /// `hash1(key, len)` for `len` in `3..=8`.
    pub(crate) h1: [u32; 6],
    /// `hash2(key, len)` for `len` in `3..=8`.
    pub(crate) h2: [u32; 6],
    /// `hash3(key, len)` for `len` in `3..=8`.
    pub(crate) h3: [u32; 6],
}

impl PrefixHashes {
    /// Compute all 18 hashes, vectorized where the CPU supports it.
    #[must_use]
    pub(crate) fn compute(key: u64) -> Self {
        #[cfg(target_arch = "x86_64")]
        if is_x86_feature_detected!("sse4.1") {
            // SAFETY: sse4.1 support was just verified.
            return unsafe { simd::prefix_hashes(key) };
        }
        Self::compute_scalar(key)
    }

    /// Plain scalar evaluation; the reference for the vectorized path.
    #[must_use]
    pub(crate) fn compute_scalar(key: u64) -> Self {
        let mut out = Self {
            h1: [0; 6],
            h2: [0; 6],
            h3: [0; 6],
        };
        let mut len = 3;
        while len <= 8 {
            let i = (len - 3) as usize;
            out.h1[i] = hash1(key, len);
            out.h2[i] = hash2(key, len);
            out.h3[i] = hash3(key, len);
            len += 1;
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hash_ignores_masked_bytes() {
        // Keys differing only below the prefix hash identically.
        let a = 0x1122_3344_5566_7788;
        let b = 0x1122_3344_ffff_ffff;
        assert_eq!(hash1(a, 4), hash1(b, 4));
        assert_eq!(hash2(a, 4), hash2(b, 4));
        assert_eq!(hash3(a, 4), hash3(b, 4));
        assert_ne!(hash1(a, 8), hash1(b, 8));
    }

    #[test]
    fn hash_depends_on_length() {
        let k = 0x1122_3300_0000_0000;
        // Same masked bytes, different declared length.
        assert_ne!(hash1(k, 3), hash1(k, 4));
        assert_ne!(hash3(k, 3), hash3(k, 4));
    }

    #[test]
    fn family_members_disagree() {
        let k = 0xdead_beef_cafe_f00d;
        for len in 3..=8 {
            assert_ne!(hash1(k, len), hash2(k, len));
            assert_ne!(hash2(k, len), hash3(k, len));
        }
    }

    #[test]
    fn compute_matches_scalar() {
        // Mix of structured and pseudo-random keys.
        let mut keys = vec![0, u64::MAX, 1, 0x0102_0304_0506_0708, 1 << 63];
        let mut x = 0x9e37_79b9_7f4a_7c15_u64;
        for _ in 0..256 {
            x = x.wrapping_mul(0x2545_f491_4f6c_dd1d).wrapping_add(1);
            keys.push(x);
        }
        for k in keys {
            let v = PrefixHashes::compute(k);
            let s = PrefixHashes::compute_scalar(k);
            assert_eq!(v.h1, s.h1, "h1 mismatch for {k:#x}");
            assert_eq!(v.h2, s.h2, "h2 mismatch for {k:#x}");
            assert_eq!(v.h3, s.h3, "h3 mismatch for {k:#x}");
        }
    }

    #[test]
    fn scalar_agrees_with_standalone_fns() {
        let k = 0x0123_4567_89ab_cdef;
        let h = PrefixHashes::compute_scalar(k);
        for len in 3..=8_u32 {
            let i = (len - 3) as usize;
            assert_eq!(h.h1[i], hash1(k, len));
            assert_eq!(h.h2[i], hash2(k, len));
            assert_eq!(h.h3[i], hash3(k, len));
        }
    }
}
