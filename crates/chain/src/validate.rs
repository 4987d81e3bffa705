//! Stateless and contextual header checks.
//!
//! Validation never mutates anything; the working chain gathers the context
//! (median time, expected bits, checkpoint) and the functions here decide.

use primitive_types::U256;
use spvd_consensus::NetworkParams;
use spvd_pow::{block_proof, compact_to_u256, hash_meets_target, CompactError};
use spvd_primitives::{hash_to_hex, BlockHeader, Hash256};

use crate::entry::ChainEntry;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HeaderError {
    /// The parent header is unknown to the working chain.
    Orphan,
    /// The header hash does not meet its own claimed target.
    Pow,
    /// The claimed target is malformed, above the pow limit, or does not
    /// match the retarget schedule.
    BadBits { expected: u32, actual: u32 },
    /// The timestamp is not strictly greater than the median time past.
    TimeTooOld { time: u32, median: u32 },
    /// `prev_block` does not name the entry it was validated against.
    BadPrevHash,
    /// The header sits at a checkpoint height with the wrong hash.
    Checkpoint { height: u32 },
    Compact(CompactError),
}

impl std::fmt::Display for HeaderError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            HeaderError::Orphan => write!(f, "header has unknown previous block"),
            HeaderError::Pow => write!(f, "header hash exceeds target"),
            HeaderError::BadBits { expected, actual } => {
                write!(f, "bad bits {actual:#010x} (expected {expected:#010x})")
            }
            HeaderError::TimeTooOld { time, median } => {
                write!(f, "time {time} not above median time past {median}")
            }
            HeaderError::BadPrevHash => write!(f, "previous block hash mismatch"),
            HeaderError::Checkpoint { height } => {
                write!(f, "header conflicts with checkpoint at height {height}")
            }
            HeaderError::Compact(err) => write!(f, "{err}"),
        }
    }
}

impl std::error::Error for HeaderError {}

impl From<CompactError> for HeaderError {
    fn from(err: CompactError) -> Self {
        HeaderError::Compact(err)
    }
}

/// Context the working chain assembles for one candidate header.
#[derive(Clone, Copy, Debug)]
pub struct HeaderContext<'a> {
    pub params: &'a NetworkParams,
    /// Median of the previous (up to) 11 block times above the floor.
    pub median_time_past: u32,
    /// Bits required by the retarget schedule at this height.
    pub expected_bits: u32,
    /// Required hash at this height, when checkpoint enforcement is on.
    pub checkpoint: Option<Hash256>,
}

/// Context-free checks: the target decodes, stays under the pow limit, and
/// the header hash meets it.
pub fn check_proof_of_work(
    header: &BlockHeader,
    params: &NetworkParams,
) -> Result<(), HeaderError> {
    let target = compact_to_u256(header.bits)?;
    let pow_limit = U256::from_little_endian(&params.pow_limit);
    if target.is_zero() || target > pow_limit {
        return Err(HeaderError::BadBits {
            expected: params.pow_limit_bits,
            actual: header.bits,
        });
    }
    if !hash_meets_target(&header.hash(), &target.to_little_endian()) {
        return Err(HeaderError::Pow);
    }
    Ok(())
}

/// Full validation of `header` as a child of `prev`.
pub fn check_header(
    header: &BlockHeader,
    prev: &ChainEntry,
    ctx: &HeaderContext<'_>,
) -> Result<ChainEntry, HeaderError> {
    if header.prev_block != prev.hash() {
        return Err(HeaderError::BadPrevHash);
    }

    check_proof_of_work(header, ctx.params)?;

    if header.time <= ctx.median_time_past {
        return Err(HeaderError::TimeTooOld {
            time: header.time,
            median: ctx.median_time_past,
        });
    }

    if header.bits != ctx.expected_bits && !min_difficulty_applies(header, prev, ctx.params) {
        return Err(HeaderError::BadBits {
            expected: ctx.expected_bits,
            actual: header.bits,
        });
    }

    let height = prev.height + 1;
    if let Some(required) = ctx.checkpoint {
        if header.hash() != required {
            spvd_log::log_debug!(
                "rejecting header {} at checkpointed height {height}",
                hash_to_hex(&header.hash())
            );
            return Err(HeaderError::Checkpoint { height });
        }
    }

    Ok(ChainEntry {
        header: header.clone(),
        height,
        chainwork: prev.chainwork + block_proof(header.bits)?,
    })
}

/// Test-network escape hatch: after twice the target spacing without a
/// block, a pow-limit header is acceptable regardless of the schedule.
fn min_difficulty_applies(header: &BlockHeader, prev: &ChainEntry, params: &NetworkParams) -> bool {
    params.allow_min_difficulty
        && header.bits == params.pow_limit_bits
        && i64::from(header.time) > i64::from(prev.header.time) + params.target_spacing * 2
}
