//! Block header primitives and consensus serialization.

pub mod encoding;
pub mod hash;
pub mod header;

/// A 256-bit hash in internal (little-endian) byte order.
pub type Hash256 = [u8; 32];

pub use hash::{hash_to_hex, sha256, sha256d};
pub use header::BlockHeader;
