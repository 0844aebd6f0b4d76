//! SSE4.1 evaluation of the full prefix-hash family.
//!
//! One call produces the same 18 values as [`PrefixHashes::compute_scalar`]
//! in four 128-bit lanes plus two scalar stragglers. The lane plan packs the
//! length-5..8 prefixes of each hash function into one vector each (the low
//! word participates for those lengths, masked per lane), and folds the
//! length-3/4 prefixes, which only mix the high word, into a fourth vector
//! shared between the two bucket hashes.

use std::arch::x86_64::{
    __m128i, _mm_and_si128, _mm_extract_epi32, _mm_mullo_epi32, _mm_or_si128, _mm_set1_epi32,
    _mm_set_epi32, _mm_slli_epi32, _mm_srli_epi32, _mm_xor_si128,
};

use super::{avalanche, PrefixHashes, PRIME32_1, PRIME32_2, PRIME32_3, PRIME32_4, PRIME32_5, SEED1, SEED2};

#[inline]
#[target_feature(enable = "sse4.1")]
unsafe fn rotl17_mult_p4(data: __m128i) -> __m128i {
    let hi = _mm_slli_epi32::<17>(data);
    let lo = _mm_srli_epi32::<15>(data);
    _mm_mullo_epi32(_mm_or_si128(hi, lo), _mm_set1_epi32(PRIME32_4 as i32))
}

#[inline]
#[target_feature(enable = "sse4.1")]
unsafe fn avalanche4(mut data: __m128i) -> __m128i {
    data = _mm_xor_si128(data, _mm_srli_epi32::<15>(data));
    data = _mm_mullo_epi32(data, _mm_set1_epi32(PRIME32_2 as i32));
    data = _mm_xor_si128(data, _mm_srli_epi32::<13>(data));
    data = _mm_mullo_epi32(data, _mm_set1_epi32(PRIME32_3 as i32));
    _mm_xor_si128(data, _mm_srli_epi32::<16>(data))
}

/// Scalar tail for a length-3 or length-4 prefix: only the high word mixes.
#[inline]
fn short_prefix(init: u32, mixed_high: u32) -> u32 {
    avalanche((init ^ mixed_high).rotate_left(17).wrapping_mul(PRIME32_4))
}

/// Compute all 18 prefix hashes of `key` in one pass.
///
/// Matches [`PrefixHashes::compute_scalar`] bit for bit; the equivalence is
/// property-tested.
#[target_feature(enable = "sse4.1")]
pub(crate) unsafe fn prefix_hashes(key: u64) -> PrefixHashes {
    let low = key as u32;
    let high = (key >> 32) as u32;

    let x1 = high.wrapping_mul(PRIME32_1);
    let x2 = high.wrapping_mul(PRIME32_3);

    let p5 = PRIME32_5;
    // Lane order low..high = prefix lengths 5..8.
    let init1 = _mm_set_epi32(
        p5.wrapping_add(SEED1).wrapping_add(8) as i32,
        p5.wrapping_add(SEED1).wrapping_add(7) as i32,
        p5.wrapping_add(SEED1).wrapping_add(6) as i32,
        p5.wrapping_add(SEED1).wrapping_add(5) as i32,
    );
    let init2 = _mm_set_epi32(
        p5.wrapping_add(SEED2).wrapping_add(8) as i32,
        p5.wrapping_add(SEED2).wrapping_add(7) as i32,
        p5.wrapping_add(SEED2).wrapping_add(6) as i32,
        p5.wrapping_add(SEED2).wrapping_add(5) as i32,
    );
    let init3 = _mm_set_epi32(
        p5.wrapping_add(8) as i32,
        p5.wrapping_add(7) as i32,
        p5.wrapping_add(6) as i32,
        p5.wrapping_add(5) as i32,
    );

    let mut out1 = rotl17_mult_p4(_mm_xor_si128(_mm_set1_epi32(x1 as i32), init1));
    let mut out2 = rotl17_mult_p4(_mm_xor_si128(_mm_set1_epi32(x2 as i32), init2));
    let mut out3 = rotl17_mult_p4(_mm_xor_si128(_mm_set1_epi32(x2 as i32), init3));

    // Low word masked to the bytes each prefix length actually covers.
    let low_mask = _mm_set_epi32(
        0xffff_ffff_u32 as i32,
        0xffff_ff00_u32 as i32,
        0xffff_0000_u32 as i32,
        0xff00_0000_u32 as i32,
    );
    let low4 = _mm_and_si128(_mm_set1_epi32(low as i32), low_mask);
    let low_p1 = _mm_mullo_epi32(low4, _mm_set1_epi32(PRIME32_1 as i32));
    let low_p3 = _mm_mullo_epi32(low4, _mm_set1_epi32(PRIME32_3 as i32));

    out1 = avalanche4(rotl17_mult_p4(_mm_xor_si128(out1, low_p1)));
    out2 = avalanche4(rotl17_mult_p4(_mm_xor_si128(out2, low_p3)));
    out3 = avalanche4(rotl17_mult_p4(_mm_xor_si128(out3, low_p3)));

    // Lengths 3 and 4: bucket hashes share one vector, lane order low..high
    // = h2(3), h2(4), h1(3), h1(4).
    let high3 = high & 0xffff_ff00;
    let h3p1 = high3.wrapping_mul(PRIME32_1);
    let h3p3 = high3.wrapping_mul(PRIME32_3);
    let init4 = _mm_set_epi32(
        p5.wrapping_add(SEED1).wrapping_add(4) as i32,
        p5.wrapping_add(SEED1).wrapping_add(3) as i32,
        p5.wrapping_add(SEED2).wrapping_add(4) as i32,
        p5.wrapping_add(SEED2).wrapping_add(3) as i32,
    );
    let mix4 = _mm_set_epi32(x1 as i32, h3p1 as i32, x2 as i32, h3p3 as i32);
    let out4 = avalanche4(rotl17_mult_p4(_mm_xor_si128(mix4, init4)));

    // Tag hash for lengths 3 and 4 stays scalar; two lanes are not worth a
    // fifth vector.
    let h33 = short_prefix(p5.wrapping_add(3), h3p3);
    let h34 = short_prefix(p5.wrapping_add(4), x2);

    PrefixHashes {
        h1: [
            _mm_extract_epi32::<2>(out4) as u32,
            _mm_extract_epi32::<3>(out4) as u32,
            _mm_extract_epi32::<0>(out1) as u32,
            _mm_extract_epi32::<1>(out1) as u32,
            _mm_extract_epi32::<2>(out1) as u32,
            _mm_extract_epi32::<3>(out1) as u32,
        ],
        h2: [
            _mm_extract_epi32::<0>(out4) as u32,
            _mm_extract_epi32::<1>(out4) as u32,
            _mm_extract_epi32::<0>(out2) as u32,
            _mm_extract_epi32::<1>(out2) as u32,
            _mm_extract_epi32::<2>(out2) as u32,
            _mm_extract_epi32::<3>(out2) as u32,
        ],
        h3: [
            h33,
            h34,
            _mm_extract_epi32::<0>(out3) as u32,
            _mm_extract_epi32::<1>(out3) as u32,
            _mm_extract_epi32::<2>(out3) as u32,
            _mm_extract_epi32::<3>(out3) as u32,
        ],
    }
}
