//! Difficulty and compact target utilities.

use primitive_types::U256;
use spvd_consensus::{Hash256, NetworkParams};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompactError {
    Negative,
    Overflow,
}

impl std::fmt::Display for CompactError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CompactError::Negative => write!(f, "compact target has negative sign bit"),
            CompactError::Overflow => write!(f, "compact target overflows 256-bit range"),
        }
    }
}

impl std::error::Error for CompactError {}

pub fn compact_to_u256(bits: u32) -> Result<U256, CompactError> {
    let size = bits >> 24;
    let mut word = bits & 0x007f_ffff;
    let negative = (bits & 0x0080_0000) != 0;

    if negative {
        return Err(CompactError::Negative);
    }

    let value = if size <= 3 {
        let shift = 8 * (3 - size);
        word >>= shift;
        U256::from(word)
    } else {
        let shift = 8 * (size - 3);
        U256::from(word) << shift
    };

    if word != 0 {
        let overflow = size > 34 || (word > 0xff && size > 33) || (word > 0xffff && size > 32);
        if overflow {
            return Err(CompactError::Overflow);
        }
    }

    Ok(value)
}

pub fn u256_to_compact(value: U256) -> u32 {
    if value.is_zero() {
        return 0;
    }

    let mut size = value.bits().div_ceil(8) as u32;
    let mut compact: u32;

    if size <= 3 {
        compact = value.low_u32() << (8 * (3 - size));
    } else {
        let shift = 8 * (size - 3);
        compact = (value >> shift).low_u32();
    }

    if (compact & 0x0080_0000) != 0 {
        compact >>= 8;
        size += 1;
    }

    (size << 24) | (compact & 0x007f_ffff)
}

pub fn compact_to_target(bits: u32) -> Result<Hash256, CompactError> {
    let value = compact_to_u256(bits)?;
    Ok(value.to_little_endian())
}

pub fn target_to_compact(target: &Hash256) -> u32 {
    let value = U256::from_little_endian(target);
    u256_to_compact(value)
}

pub fn hash_meets_target(hash: &Hash256, target: &Hash256) -> bool {
    let hash_value = U256::from_little_endian(hash);
    let target_value = U256::from_little_endian(target);
    hash_value <= target_value
}

/// Work contributed by a block: `2^256 / (target + 1)`.
pub fn block_proof(bits: u32) -> Result<U256, CompactError> {
    let target = compact_to_u256(bits)?;
    if target.is_zero() {
        return Ok(U256::zero());
    }
    let one = U256::from(1u64);
    Ok((!target / (target + one)) + one)
}

/// Compute the compact bits required for the block after `prev`.
///
/// `first_block_time` is the timestamp of the first block of the ending
/// retarget period; `prev_time`/`prev_bits` belong to the last block of it.
/// The actual timespan is clamped to a quarter and four times the target
/// timespan before scaling the previous target.
pub fn next_work_required(
    prev_bits: u32,
    first_block_time: i64,
    prev_time: i64,
    params: &NetworkParams,
) -> Result<u32, CompactError> {
    if params.no_retargeting {
        return Ok(prev_bits);
    }

    let mut actual_timespan = prev_time - first_block_time;
    let min_timespan = params.target_timespan / 4;
    let max_timespan = params.target_timespan * 4;
    actual_timespan = actual_timespan.clamp(min_timespan, max_timespan);

    let prev_target = compact_to_u256(prev_bits)?;
    let pow_limit = U256::from_little_endian(&params.pow_limit);

    let next = match prev_target.checked_mul(U256::from(actual_timespan as u64)) {
        Some(scaled) => scaled / U256::from(params.target_timespan as u64),
        None => pow_limit,
    };
    let next = if next > pow_limit { pow_limit } else { next };

    Ok(u256_to_compact(next))
}
