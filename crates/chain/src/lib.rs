//! Header chain state: validation, the in-memory working chain, and the
//! persistent height-keyed header index.

pub mod chain;
pub mod entry;
pub mod index;
pub mod validate;

pub use chain::{ChainListener, WorkingChain};
pub use entry::{ChainEntry, StoredBlock};
pub use index::{validate_start_height, HeaderIndex, IndexError, IndexOptions, StartTip};
pub use validate::HeaderError;
