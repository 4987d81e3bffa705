//! Protocol-wide constants.

/// Current network protocol version for P2P messages.
pub const PROTOCOL_VERSION: i32 = 70_016;

/// Oldest protocol version we will talk headers with.
pub const MIN_PEER_PROTO_VERSION: i32 = 31_800;

/// Maximum number of headers a single `headers` message may carry.
pub const MAX_HEADERS_RESULTS: usize = 2_000;

/// Maximum number of locator hashes accepted in `getheaders`.
pub const MAX_LOCATOR_HASHES: usize = 101;

/// Number of previous block times over which median-time-past is taken.
pub const MTP_WINDOW_SIZE: usize = 11;

/// Upper bound on a header's time relative to our adjusted clock, in seconds.
pub const MAX_FUTURE_BLOCK_TIME: i64 = 2 * 60 * 60;
