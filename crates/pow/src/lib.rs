//! Proof-of-work arithmetic: compact targets, chainwork, retargeting.

pub mod difficulty;

pub use difficulty::{
    block_proof, compact_to_target, compact_to_u256, hash_meets_target, next_work_required,
    target_to_compact, u256_to_compact, CompactError,
};
