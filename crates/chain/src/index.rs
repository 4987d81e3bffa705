//! The persistent header index.
//!
//! Owns the header store, mirrors accepted chain events into it, and
//! rebuilds the working chain from it at startup. Heights at or below the
//! historical point keep only the 80 header bytes; everything above keeps
//! the full entry so chainwork survives a restart.

use std::sync::{Arc, Mutex};

use spvd_consensus::NetworkParams;
use spvd_primitives::encoding::{Decoder, Encoder};
use spvd_primitives::{hash_to_hex, BlockHeader, Hash256};
use spvd_storage::{Column, KeyValueStore, StoreError, WriteBatch};

use crate::chain::{ChainListener, WorkingChain};
use crate::entry::{ChainEntry, StoredBlock};

/// Layout version of the header store.
pub const SCHEMA_VERSION: u32 = 1;

const META_VERSION_KEY: &[u8] = b"version";
const META_FLAGS_KEY: &[u8] = b"flags";
const META_TIP_KEY: &[u8] = b"tip";
const META_START_KEY: &[u8] = b"start";

const KEY_TAG_BLOCK: u8 = b'B';
const KEY_TAG_HASH: u8 = b'H';

const FLAG_CHECKPOINTS: u32 = 1 << 0;
const FLAG_CUSTOM_START: u32 = 1 << 1;

fn height_key(tag: u8, height: u32) -> [u8; 5] {
    let be = height.to_be_bytes();
    [tag, be[0], be[1], be[2], be[3]]
}

#[derive(Debug)]
pub enum IndexError {
    Store(StoreError),
    Corrupt(&'static str),
    Config(String),
    /// A rewind was requested below the custom start anchor.
    BelowStart { requested: u32, start: u32 },
}

impl std::fmt::Display for IndexError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            IndexError::Store(err) => write!(f, "{err}"),
            IndexError::Corrupt(message) => write!(f, "header store corrupt: {message}"),
            IndexError::Config(message) => write!(f, "{message}"),
            IndexError::BelowStart { requested, start } => write!(
                f,
                "cannot rewind to height {requested}: the store is anchored at start height {start}"
            ),
        }
    }
}

impl std::error::Error for IndexError {}

impl From<StoreError> for IndexError {
    fn from(err: StoreError) -> Self {
        IndexError::Store(err)
    }
}

/// Fast-sync anchor: the raw headers at `height - 1` and `height`.
#[derive(Clone, Debug)]
pub struct StartTip {
    pub prev: BlockHeader,
    pub start: BlockHeader,
    pub height: u32,
}

#[derive(Clone, Debug, Default)]
pub struct IndexOptions {
    pub checkpoints: bool,
    pub start: Option<StartTip>,
}

/// Check that a fast-sync start height is usable on this network.
///
/// The anchor must sit strictly under the last checkpoint and at or before
/// the last retarget boundary preceding it, because difficulty
/// recomputation needs an ancestor at that boundary and the node will never
/// possess older headers.
pub fn validate_start_height(params: &NetworkParams, height: u32) -> Result<(), IndexError> {
    if height == 0 {
        return Err(IndexError::Config(
            "start height 0 is the genesis; omit the start option to sync from scratch".to_string(),
        ));
    }
    let max_start = params.historical_point();
    if (params.last_checkpoint > 0 && height >= params.last_checkpoint) || height > max_start {
        return Err(IndexError::Config(format!(
            "start height {height} is past the last retarget boundary below the last checkpoint; \
             the maximum allowable start on {} is {max_start}",
            params.network.as_str()
        )));
    }
    Ok(())
}

pub struct HeaderIndex<S: ?Sized> {
    params: NetworkParams,
    batch: Mutex<WriteBatch>,
    tip: Mutex<(u32, Hash256)>,
    start_cell: Mutex<Option<u32>>,
    store: Arc<S>,
}

impl<S: ?Sized> std::fmt::Debug for HeaderIndex<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HeaderIndex").finish_non_exhaustive()
    }
}

impl<S: KeyValueStore + ?Sized> HeaderIndex<S> {
    /// Open the index over `store`, creating or checking the schema and
    /// reconciling any configured start anchor against the stored marker.
    pub fn open(
        store: Arc<S>,
        params: NetworkParams,
        options: IndexOptions,
    ) -> Result<Self, IndexError> {
        let index = Self {
            params,
            batch: Mutex::new(WriteBatch::new()),
            tip: Mutex::new((0, [0u8; 32])),
            start_cell: Mutex::new(None),
            store,
        };
        index.check_schema(&options)?;
        index.init_start(options)?;
        index.load_tip()?;
        Ok(index)
    }

    fn check_schema(&self, options: &IndexOptions) -> Result<(), IndexError> {
        match self.read_meta_u32(META_VERSION_KEY)? {
            Some(version) if version != SCHEMA_VERSION => Err(IndexError::Config(format!(
                "unsupported header store schema version {version} (expected {SCHEMA_VERSION})"
            ))),
            Some(_) => {
                let flags = self.read_meta_u32(META_FLAGS_KEY)?.unwrap_or(0);
                let stored_checkpoints = flags & FLAG_CHECKPOINTS != 0;
                if stored_checkpoints != options.checkpoints {
                    return Err(IndexError::Config(format!(
                        "checkpoint enforcement is {} in the store but {} in the configuration",
                        on_off(stored_checkpoints),
                        on_off(options.checkpoints)
                    )));
                }
                Ok(())
            }
            None => {
                let mut flags = 0u32;
                if options.checkpoints {
                    flags |= FLAG_CHECKPOINTS;
                }
                if options.start.is_some() {
                    flags |= FLAG_CUSTOM_START;
                }
                let mut batch = WriteBatch::new();
                batch.put(Column::Meta, META_VERSION_KEY, encode_u32(SCHEMA_VERSION));
                batch.put(Column::Meta, META_FLAGS_KEY, encode_u32(flags));
                self.store.write_batch(&batch)?;
                Ok(())
            }
        }
    }

    fn init_start(&self, options: IndexOptions) -> Result<(), IndexError> {
        let stored = self.read_meta_u32(META_START_KEY)?;
        match (stored, options.start) {
            (Some(marker), configured) => {
                if marker == 0 {
                    return Err(IndexError::Corrupt("invalid start marker"));
                }
                // The stored marker is authoritative.
                if let Some(tip) = configured {
                    if tip.height != marker {
                        return Err(IndexError::Config(format!(
                            "configured start height {} conflicts with the stored start marker {marker}",
                            tip.height
                        )));
                    }
                }
                if self.stored(marker - 1)?.is_none() || self.stored(marker)?.is_none() {
                    return Err(IndexError::Corrupt("start anchor records are missing"));
                }
                self.set_start(marker);
                Ok(())
            }
            (None, Some(tip)) => {
                validate_start_height(&self.params, tip.height)?;
                if tip.start.prev_block != tip.prev.hash() {
                    return Err(IndexError::Config(
                        "start tip headers do not link: the second header's prev_block must hash \
                         the first"
                            .to_string(),
                    ));
                }
                let tip_hash = tip.start.hash();
                let mut batch = WriteBatch::new();
                // Both anchor heights sit at or below the historical point,
                // so bare headers are all that is stored.
                batch.put(
                    Column::HeaderIndex,
                    height_key(KEY_TAG_BLOCK, tip.height - 1),
                    StoredBlock::Header(tip.prev.clone()).encode(),
                );
                batch.put(
                    Column::HashIndex,
                    height_key(KEY_TAG_HASH, tip.height - 1),
                    tip.prev.hash(),
                );
                batch.put(
                    Column::HeaderIndex,
                    height_key(KEY_TAG_BLOCK, tip.height),
                    StoredBlock::Header(tip.start.clone()).encode(),
                );
                batch.put(
                    Column::HashIndex,
                    height_key(KEY_TAG_HASH, tip.height),
                    tip_hash,
                );
                batch.put(Column::Meta, META_START_KEY, encode_u32(tip.height));
                batch.put(Column::Meta, META_TIP_KEY, encode_u32(tip.height));
                let flags = self.read_meta_u32(META_FLAGS_KEY)?.unwrap_or(0);
                batch.put(
                    Column::Meta,
                    META_FLAGS_KEY,
                    encode_u32(flags | FLAG_CUSTOM_START),
                );
                self.store.write_batch(&batch)?;
                spvd_log::log_info!(
                    "initialized custom start at height {} ({})",
                    tip.height,
                    hash_to_hex(&tip_hash)
                );
                self.set_start(tip.height);
                Ok(())
            }
            (None, None) => {
                if self.stored(0)?.is_none() {
                    let genesis = self.params.genesis.clone();
                    let mut batch = WriteBatch::new();
                    batch.put(
                        Column::HeaderIndex,
                        height_key(KEY_TAG_BLOCK, 0),
                        StoredBlock::Header(genesis).encode(),
                    );
                    batch.put(
                        Column::HashIndex,
                        height_key(KEY_TAG_HASH, 0),
                        self.params.genesis_hash,
                    );
                    batch.put(Column::Meta, META_TIP_KEY, encode_u32(0));
                    self.store.write_batch(&batch)?;
                }
                Ok(())
            }
        }
    }

    fn set_start(&self, height: u32) {
        let mut start = self.start_cell.lock().expect("header index start lock");
        *start = Some(height);
    }

    fn load_tip(&self) -> Result<(), IndexError> {
        let height = self
            .read_meta_u32(META_TIP_KEY)?
            .unwrap_or(self.start_height());
        let hash = self
            .hash(height)?
            .ok_or(IndexError::Corrupt("tip record is missing"))?;
        *self.tip.lock().expect("header index tip lock") = (height, hash);
        Ok(())
    }

    /// Rebuild the working chain from the store.
    ///
    /// Injects the anchor (custom start pair or genesis), reloads enough
    /// ancestors for contextual validation, and replays records up to the
    /// stored tip without re-emitting connect events.
    pub fn reconcile(&self, chain: &mut WorkingChain) -> Result<(), IndexError> {
        let floor = match self.start_height_opt() {
            Some(start) => {
                let prev = self
                    .stored(start - 1)?
                    .ok_or(IndexError::Corrupt("start anchor records are missing"))?
                    .into_entry(start - 1);
                let anchor = self
                    .stored(start)?
                    .ok_or(IndexError::Corrupt("start anchor records are missing"))?
                    .into_entry(start);
                chain.set_anchor(prev, anchor);
                start
            }
            None => {
                let genesis = ChainEntry::genesis(&self.params)
                    .map_err(|_| IndexError::Corrupt("genesis bits are not a valid target"))?;
                chain.resume(genesis);
                0
            }
        };

        let (tip_height, _) = self.tip();
        if tip_height <= floor {
            chain.announce_reset();
            return Ok(());
        }

        let historical_point = self.params.historical_point();
        let replay_from = if tip_height <= historical_point {
            floor + 1
        } else if self.params.last_checkpoint == 0 {
            1
        } else {
            (historical_point + 1).max(floor + 1)
        };

        // Contextual validation of future headers needs a window of
        // ancestors below the replay start.
        let window = self
            .params
            .retarget_interval
            .max(spvd_consensus::constants::MTP_WINDOW_SIZE as u32);
        let context_from = replay_from.saturating_sub(window).max(floor + 1);
        for height in context_from..replay_from {
            let entry = self
                .stored(height)?
                .ok_or(IndexError::Corrupt("missing header record during replay"))?
                .into_entry(height);
            chain.resume(entry);
        }

        let mut replayed = 0u32;
        for height in replay_from..=tip_height {
            let stored = self
                .stored(height)?
                .ok_or(IndexError::Corrupt("missing header record during replay"))?;
            let entry = match stored {
                StoredBlock::Entry(entry) if entry.height != height => {
                    return Err(IndexError::Corrupt("stored entry height mismatch"));
                }
                other => other.into_entry(height),
            };
            if let Some(tip) = chain.tip() {
                if tip.height + 1 == height && entry.header.prev_block != tip.hash() {
                    return Err(IndexError::Corrupt("header chain is not contiguous"));
                }
            }
            chain.resume(entry);
            replayed += 1;
        }

        spvd_log::log_info!(
            "header chain rebuilt to height {tip_height} ({replayed} records replayed)"
        );
        chain.announce_reset();
        Ok(())
    }

    /// Commit the buffered event writes. A crash before this point leaves
    /// the on-disk tip at the previous batch boundary.
    pub fn commit(&self) -> Result<(), IndexError> {
        let batch = {
            let mut guard = self.batch.lock().expect("header index batch lock");
            std::mem::take(&mut *guard)
        };
        if batch.is_empty() {
            return Ok(());
        }
        self.store.write_batch(&batch)?;
        Ok(())
    }

    pub fn pending_writes(&self) -> usize {
        self.batch.lock().expect("header index batch lock").len()
    }

    pub fn tip(&self) -> (u32, Hash256) {
        *self.tip.lock().expect("header index tip lock")
    }

    pub fn start_height(&self) -> u32 {
        self.start_height_opt().unwrap_or(0)
    }

    pub fn start_height_opt(&self) -> Option<u32> {
        *self.start_cell.lock().expect("header index start lock")
    }

    pub fn stored(&self, height: u32) -> Result<Option<StoredBlock>, IndexError> {
        let key = height_key(KEY_TAG_BLOCK, height);
        let Some(bytes) = self.store.get(Column::HeaderIndex, &key)? else {
            return Ok(None);
        };
        StoredBlock::decode(&bytes)
            .map(Some)
            .map_err(|_| IndexError::Corrupt("undecodable header record"))
    }

    pub fn header(&self, height: u32) -> Result<Option<BlockHeader>, IndexError> {
        Ok(self.stored(height)?.map(|stored| stored.header().clone()))
    }

    /// Entry lookup: full entries come back as stored; bare headers are
    /// reconstructed with zero chainwork, which nothing at or below the
    /// historical point consults.
    pub fn entry(&self, height: u32) -> Result<Option<ChainEntry>, IndexError> {
        Ok(self.stored(height)?.map(|stored| stored.into_entry(height)))
    }

    pub fn hash(&self, height: u32) -> Result<Option<Hash256>, IndexError> {
        let key = height_key(KEY_TAG_HASH, height);
        if let Some(bytes) = self.store.get(Column::HashIndex, &key)? {
            if bytes.len() != 32 {
                return Err(IndexError::Corrupt("hash record has invalid length"));
            }
            let mut hash = [0u8; 32];
            hash.copy_from_slice(&bytes);
            return Ok(Some(hash));
        }
        Ok(self.stored(height)?.map(|stored| stored.header().hash()))
    }

    /// Build a sparse locator from the tip down to the floor.
    ///
    /// The first ten hashes step back one height at a time, then the step
    /// doubles. The final hash is the floor (start anchor or genesis); a
    /// normal node would end at genesis, a fast-synced one never walks
    /// below its anchor.
    pub fn locator(&self) -> Result<Vec<Hash256>, IndexError> {
        let (tip_height, _) = self.tip();
        self.locator_from(tip_height)
    }

    pub fn locator_from(&self, from_height: u32) -> Result<Vec<Hash256>, IndexError> {
        let floor = self.start_height();
        let mut hashes = Vec::new();
        let mut height = from_height.max(floor);
        let mut step = 1u32;
        loop {
            let hash = self
                .hash(height)?
                .ok_or(IndexError::Corrupt("missing hash record for locator"))?;
            hashes.push(hash);
            if height <= floor {
                break;
            }
            if hashes.len() > 10 {
                step = step.saturating_mul(2);
            }
            height = height.saturating_sub(step).max(floor);
        }
        Ok(hashes)
    }

    /// Drop all records above `height` and move the tip there. Refuses to
    /// touch the custom start anchor.
    pub fn rewind(&self, height: u32) -> Result<(), IndexError> {
        let floor = self.start_height();
        if height < floor {
            return Err(IndexError::BelowStart {
                requested: height,
                start: floor,
            });
        }
        let (tip_height, _) = self.tip();
        if height >= tip_height {
            return Ok(());
        }
        let mut batch = WriteBatch::new();
        for h in (height + 1)..=tip_height {
            batch.delete(Column::HeaderIndex, height_key(KEY_TAG_BLOCK, h));
            batch.delete(Column::HashIndex, height_key(KEY_TAG_HASH, h));
        }
        batch.put(Column::Meta, META_TIP_KEY, encode_u32(height));
        self.store.write_batch(&batch)?;
        let hash = self
            .hash(height)?
            .ok_or(IndexError::Corrupt("tip record is missing"))?;
        *self.tip.lock().expect("header index tip lock") = (height, hash);
        Ok(())
    }

    fn read_meta_u32(&self, key: &[u8]) -> Result<Option<u32>, IndexError> {
        let Some(bytes) = self.store.get(Column::Meta, key)? else {
            return Ok(None);
        };
        let mut decoder = Decoder::new(&bytes);
        let value = decoder
            .read_u32_le()
            .map_err(|_| IndexError::Corrupt("undecodable meta record"))?;
        Ok(Some(value))
    }
}

impl<S: KeyValueStore + ?Sized> ChainListener for HeaderIndex<S> {
    fn chain_connect(&self, entry: &ChainEntry) {
        let stored = if entry.height <= self.params.historical_point() {
            StoredBlock::Header(entry.header.clone())
        } else {
            StoredBlock::Entry(entry.clone())
        };
        let hash = entry.hash();
        let mut batch = self.batch.lock().expect("header index batch lock");
        batch.put(
            Column::HeaderIndex,
            height_key(KEY_TAG_BLOCK, entry.height),
            stored.encode(),
        );
        batch.put(Column::HashIndex, height_key(KEY_TAG_HASH, entry.height), hash);
        batch.put(Column::Meta, META_TIP_KEY, encode_u32(entry.height));
        *self.tip.lock().expect("header index tip lock") = (entry.height, hash);
    }

    fn chain_disconnect(&self, entry: &ChainEntry) {
        let mut batch = self.batch.lock().expect("header index batch lock");
        batch.delete(Column::HeaderIndex, height_key(KEY_TAG_BLOCK, entry.height));
        batch.delete(Column::HashIndex, height_key(KEY_TAG_HASH, entry.height));
        let new_height = entry.height.saturating_sub(1);
        batch.put(Column::Meta, META_TIP_KEY, encode_u32(new_height));
        *self.tip.lock().expect("header index tip lock") =
            (new_height, entry.header.prev_block);
    }

    fn chain_reset(&self, _tip: &ChainEntry) {
        // The store already reflects accepted history.
    }
}

fn encode_u32(value: u32) -> Vec<u8> {
    let mut encoder = Encoder::with_capacity(4);
    encoder.write_u32_le(value);
    encoder.into_inner()
}

fn on_off(value: bool) -> &'static str {
    if value {
        "enabled"
    } else {
        "disabled"
    }
}
