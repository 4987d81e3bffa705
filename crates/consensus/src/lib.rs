//! Chain constants and per-network parameters.

pub mod constants;
pub mod params;

pub use params::{hash256_from_hex, network_params, Checkpoint, Network, NetworkParams};
pub use spvd_primitives::Hash256;
