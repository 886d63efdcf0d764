//! Difficulty targets, retargeting, and cumulative chain work.
//!
//! The `difficulty_bits` header field is a Bitcoin-style compact encoding of
//! a 256-bit target: `bits = size << 24 | mantissa`, where the target is the
//! 3-byte mantissa shifted to `size` bytes. A block satisfies proof-of-work
//! when its hash, read as a big-endian 256-bit integer, is ≤ the target.
//!
//! Retargeting runs every `retarget_interval` blocks: the target is scaled by
//! `actual_time / expected_time`, with the ratio clamped to
//! `[1/max_adjustment, max_adjustment]` to blunt timestamp manipulation, and
//! the result clamped to the network's easiest allowed target.
//!
//! All arithmetic is integer on the full 256-bit target space (`num-bigint`).

use num_bigint::BigUint;
use num_traits::Zero;

use crate::codec::{Encodable, Reader, Writer};
use crate::error::CodecError;
use crate::types::Hash256;

/// Decode compact bits into a 256-bit target.
///
/// Returns `None` for the sign bit, a zero mantissa, or a target wider than
/// 256 bits — all of which are invalid in a header.
pub fn bits_to_target(bits: u32) -> Option<BigUint> {
    if bits & 0x0080_0000 != 0 {
        return None;
    }
    let exponent = (bits >> 24) as u32;
    let mantissa = bits & 0x007f_ffff;
    if mantissa == 0 {
        return None;
    }
    let target = if exponent <= 3 {
        BigUint::from(mantissa >> (8 * (3 - exponent)))
    } else {
        BigUint::from(mantissa) << (8 * (exponent - 3) as usize)
    };
    if target.is_zero() || target.bits() > 256 {
        return None;
    }
    Some(target)
}

/// Encode a target as compact bits. Inverse of [`bits_to_target`] up to
/// mantissa truncation.
pub fn target_to_bits(target: &BigUint) -> u32 {
    if target.is_zero() {
        return 0;
    }
    let bytes = target.to_bytes_be();
    let mut size = bytes.len() as u32;
    let mut mantissa: u32 = 0;
    for i in 0..3 {
        mantissa <<= 8;
        if i < bytes.len() {
            mantissa |= u32::from(bytes[i]);
        }
    }
    if mantissa & 0x0080_0000 != 0 {
        mantissa >>= 8;
        size += 1;
    }
    (size << 24) | mantissa
}

/// Check proof-of-work: the block hash as a big-endian integer must be ≤ the
/// target encoded by `bits`. Malformed bits never pass.
pub fn check_pow(hash: &Hash256, bits: u32) -> bool {
    match bits_to_target(bits) {
        Some(target) => BigUint::from_bytes_be(hash.as_bytes()) <= target,
        None => false,
    }
}

/// Compute the difficulty bits expected for the block at `height`.
///
/// Non-retarget heights inherit `parent_bits`. At every multiple of
/// `retarget_interval` (except genesis) the window
/// `[height - interval, height - 1]` is measured via `timestamp_at` and the
/// parent target rescaled by the clamped actual/expected ratio, bounded by
/// the network's easiest target `limit_bits`.
#[allow(clippy::too_many_arguments)]
pub fn expected_bits(
    height: u64,
    parent_bits: u32,
    retarget_interval: u64,
    target_block_time_s: u64,
    max_adjustment: u64,
    limit_bits: u32,
    timestamp_at: impl Fn(u64) -> Option<u64>,
) -> u32 {
    if height == 0 {
        return limit_bits;
    }
    if retarget_interval == 0 || height % retarget_interval != 0 || height < retarget_interval {
        return parent_bits;
    }

    let first_height = height - retarget_interval;
    let last_height = height - 1;
    let (Some(first_ts), Some(last_ts)) = (timestamp_at(first_height), timestamp_at(last_height))
    else {
        return parent_bits;
    };

    let Some(parent_target) = bits_to_target(parent_bits) else {
        return limit_bits;
    };
    let Some(limit) = bits_to_target(limit_bits) else {
        return parent_bits;
    };

    let expected = retarget_interval * target_block_time_s;
    if expected == 0 || max_adjustment == 0 {
        return parent_bits;
    }
    let actual = last_ts.saturating_sub(first_ts);
    let clamped = actual.clamp(expected / max_adjustment, expected.saturating_mul(max_adjustment));

    let mut new_target = parent_target * BigUint::from(clamped) / BigUint::from(expected);
    if new_target.is_zero() {
        new_target = BigUint::from(1u32);
    }
    if new_target > limit {
        new_target = limit;
    }
    target_to_bits(&new_target)
}

/// Cumulative proof-of-work, stored as a 256-bit big-endian integer.
///
/// A block contributes `2^256 / (target + 1)`; a branch's work is the sum
/// over its blocks. Fixed-width big-endian bytes make the derived `Ord`
/// numeric, which is what fork choice compares.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct ChainWork(pub [u8; 32]);

impl ChainWork {
    pub const ZERO: Self = Self([0u8; 32]);

    /// The work proven by one block at the given compact bits.
    pub fn from_bits(bits: u32) -> Option<Self> {
        let target = bits_to_target(bits)?;
        // 2^256 / (target + 1)
        let numerator = BigUint::from(1u8) << 256usize;
        let work = numerator / (target + BigUint::from(1u8));
        Some(Self::from_biguint(&work))
    }

    fn from_biguint(v: &BigUint) -> Self {
        let bytes = v.to_bytes_be();
        let mut out = [0u8; 32];
        if bytes.len() >= 32 {
            out.copy_from_slice(&bytes[bytes.len() - 32..]);
        } else {
            out[32 - bytes.len()..].copy_from_slice(&bytes);
        }
        Self(out)
    }

    fn to_biguint(self) -> BigUint {
        BigUint::from_bytes_be(&self.0)
    }

    /// Saturating accumulation of another block's or branch's work.
    pub fn add(&self, other: &ChainWork) -> ChainWork {
        let sum = self.to_biguint() + other.to_biguint();
        if sum.bits() > 256 {
            return ChainWork([0xFF; 32]);
        }
        Self::from_biguint(&sum)
    }
}

impl std::fmt::Display for ChainWork {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", hex::encode(self.0))
    }
}

impl Encodable for ChainWork {
    fn encode_into(&self, w: &mut Writer) {
        w.put_raw(&self.0);
    }
    fn decode_from(r: &mut Reader<'_>) -> Result<Self, CodecError> {
        Ok(Self(r.get_array::<32>()?))
    }
}
