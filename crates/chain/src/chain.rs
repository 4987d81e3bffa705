//! The in-memory working chain.
//!
//! Holds chain entries for the recent portion of the main chain plus any
//! side branches, resolves reorganisations by cumulative chainwork, and
//! notifies listeners synchronously in acceptance order.

use std::collections::HashMap;
use std::sync::Arc;

use spvd_consensus::constants::MTP_WINDOW_SIZE;
use spvd_consensus::NetworkParams;
use spvd_pow::next_work_required;
use spvd_primitives::{hash_to_hex, BlockHeader, Hash256};

use crate::entry::ChainEntry;
use crate::validate::{check_header, HeaderContext, HeaderError};

/// Observer of chain events. During a reorganisation every `disconnect`
/// is delivered before the first `connect`.
pub trait ChainListener: Send + Sync {
    fn chain_connect(&self, entry: &ChainEntry);
    fn chain_disconnect(&self, entry: &ChainEntry);
    fn chain_reset(&self, tip: &ChainEntry);
}

pub struct WorkingChain {
    params: NetworkParams,
    checkpoints_enabled: bool,
    entries: HashMap<Hash256, ChainEntry>,
    main: HashMap<u32, Hash256>,
    tip: Option<Hash256>,
    floor: u32,
    /// Fast-sync anchor acting as an extra checkpoint at the floor.
    anchor: Option<(u32, Hash256)>,
    listeners: Vec<Arc<dyn ChainListener>>,
}

impl WorkingChain {
    pub fn new(params: NetworkParams, checkpoints_enabled: bool) -> Self {
        Self {
            params,
            checkpoints_enabled,
            entries: HashMap::new(),
            main: HashMap::new(),
            tip: None,
            floor: 0,
            anchor: None,
            listeners: Vec::new(),
        }
    }

    pub fn add_listener(&mut self, listener: Arc<dyn ChainListener>) {
        self.listeners.push(listener);
    }

    pub fn unbind_listeners(&mut self) {
        self.listeners.clear();
    }

    pub fn params(&self) -> &NetworkParams {
        &self.params
    }

    /// Lowest usable height: the custom start height, or zero.
    pub fn floor(&self) -> u32 {
        self.floor
    }

    pub fn tip(&self) -> Option<&ChainEntry> {
        self.tip.as_ref().and_then(|hash| self.entries.get(hash))
    }

    pub fn entry(&self, hash: &Hash256) -> Option<&ChainEntry> {
        self.entries.get(hash)
    }

    pub fn entry_by_height(&self, height: u32) -> Option<&ChainEntry> {
        if height < self.floor {
            return None;
        }
        self.main
            .get(&height)
            .and_then(|hash| self.entries.get(hash))
    }

    pub fn is_main_chain(&self, entry: &ChainEntry) -> bool {
        self.main.get(&entry.height) == Some(&entry.hash())
    }

    pub fn has(&self, hash: &Hash256) -> bool {
        self.entries.contains_key(hash)
    }

    /// Install the fast-sync anchor pair: the floor moves to the start
    /// height and the start block becomes a fixed checkpoint, so no peer
    /// can fork the chain at or below it.
    pub fn set_anchor(&mut self, prev: ChainEntry, start: ChainEntry) {
        self.floor = start.height;
        self.anchor = Some((start.height, start.hash()));
        self.resume(prev);
        self.resume(start);
    }

    /// Re-attach a trusted entry from the header store during startup.
    ///
    /// No validation is performed and no events are emitted; the entry
    /// becomes the main-chain tip. The caller feeds entries in ascending
    /// height order.
    pub fn resume(&mut self, entry: ChainEntry) {
        let hash = entry.hash();
        self.main.insert(entry.height, hash);
        self.entries.insert(hash, entry);
        self.tip = Some(hash);
    }

    /// Tell listeners the chain was rebuilt. On-disk state is untouched.
    pub fn announce_reset(&self) {
        if let Some(tip) = self.tip() {
            for listener in &self.listeners {
                listener.chain_reset(tip);
            }
        }
    }

    /// Validate `header` against its parent and accept it into the chain,
    /// extending the tip, growing a side branch, or reorganising when a
    /// branch overtakes the main chain by cumulative work.
    pub fn add(&mut self, header: &BlockHeader) -> Result<ChainEntry, HeaderError> {
        let hash = header.hash();
        if let Some(existing) = self.entries.get(&hash) {
            return Ok(existing.clone());
        }

        let prev = match self.entries.get(&header.prev_block) {
            Some(prev) => prev.clone(),
            None => return Err(HeaderError::Orphan),
        };

        let height = prev.height + 1;
        let ctx = HeaderContext {
            params: &self.params,
            median_time_past: self.median_time_past(&prev),
            expected_bits: self.expected_bits(&prev)?,
            checkpoint: self.checkpoint_at(height),
        };
        let entry = check_header(header, &prev, &ctx)?;
        self.entries.insert(hash, entry.clone());

        let tip = match self.tip() {
            Some(tip) => tip.clone(),
            None => {
                // First entry of an empty chain becomes the root.
                self.main.insert(entry.height, hash);
                self.tip = Some(hash);
                self.emit_connect(&entry);
                return Ok(entry);
            }
        };

        if prev.hash() == tip.hash() {
            self.main.insert(entry.height, hash);
            self.tip = Some(hash);
            self.emit_connect(&entry);
        } else if entry.chainwork > tip.chainwork {
            self.reorganize(&entry);
        } else {
            spvd_log::log_debug!(
                "tracking side branch {} at height {}",
                hash_to_hex(&hash),
                entry.height
            );
        }

        Ok(entry)
    }

    fn reorganize(&mut self, new_tip: &ChainEntry) {
        // Walk the new branch back to the fork point on the main chain.
        let mut branch = Vec::new();
        let mut cursor = new_tip.clone();
        loop {
            if self.main.get(&cursor.height) == Some(&cursor.hash()) {
                break;
            }
            branch.push(cursor.clone());
            match self.entries.get(&cursor.header.prev_block) {
                Some(prev) => cursor = prev.clone(),
                None => {
                    // Branch root fell below the floor; the fork is the floor.
                    break;
                }
            }
        }
        let fork_height = cursor.height;

        let old_tip_height = self.tip().map(|tip| tip.height).unwrap_or(fork_height);
        spvd_log::log_info!(
            "reorganizing to {} at height {} (fork at {}, {} blocks disconnected)",
            hash_to_hex(&new_tip.hash()),
            new_tip.height,
            fork_height,
            old_tip_height.saturating_sub(fork_height),
        );

        // All disconnects complete before the first connect.
        let mut height = old_tip_height;
        while height > fork_height {
            if let Some(hash) = self.main.remove(&height) {
                if let Some(entry) = self.entries.get(&hash).cloned() {
                    self.emit_disconnect(&entry);
                }
            }
            height -= 1;
        }

        for entry in branch.iter().rev() {
            self.main.insert(entry.height, entry.hash());
            self.emit_connect(entry);
        }
        self.tip = Some(new_tip.hash());
    }

    fn emit_connect(&self, entry: &ChainEntry) {
        for listener in &self.listeners {
            listener.chain_connect(entry);
        }
    }

    fn emit_disconnect(&self, entry: &ChainEntry) {
        for listener in &self.listeners {
            listener.chain_disconnect(entry);
        }
    }

    /// Median of the previous (up to) 11 block times, bounded by the floor.
    fn median_time_past(&self, from: &ChainEntry) -> u32 {
        let mut times = Vec::with_capacity(MTP_WINDOW_SIZE);
        let mut cursor = Some(from);
        while let Some(entry) = cursor {
            times.push(entry.header.time);
            if times.len() == MTP_WINDOW_SIZE {
                break;
            }
            cursor = self.entries.get(&entry.header.prev_block);
        }
        times.sort_unstable();
        times[times.len() / 2]
    }

    /// Bits the retarget schedule requires for the child of `prev`.
    fn expected_bits(&self, prev: &ChainEntry) -> Result<u32, HeaderError> {
        let height = prev.height + 1;
        if self.params.is_retarget_height(height) {
            let first = self.period_first_entry(prev);
            return Ok(next_work_required(
                prev.header.bits,
                i64::from(first.header.time),
                i64::from(prev.header.time),
                &self.params,
            )?);
        }
        if self.params.allow_min_difficulty && !self.params.no_retargeting {
            // On test networks the schedule continues from the last block
            // that was not mined at minimum difficulty.
            let mut cursor = prev.clone();
            while cursor.height % self.params.retarget_interval != 0
                && cursor.header.bits == self.params.pow_limit_bits
            {
                match self.entries.get(&cursor.header.prev_block) {
                    Some(entry) => cursor = entry.clone(),
                    None => break,
                }
            }
            return Ok(cursor.header.bits);
        }
        Ok(prev.header.bits)
    }

    /// First entry of the retarget period ending at `prev`, or the oldest
    /// ancestor available above the floor.
    fn period_first_entry(&self, prev: &ChainEntry) -> ChainEntry {
        let mut cursor = prev.clone();
        let mut back = self.params.retarget_interval.saturating_sub(1);
        while back > 0 {
            match self.entries.get(&cursor.header.prev_block) {
                Some(entry) => cursor = entry.clone(),
                None => break,
            }
            back -= 1;
        }
        cursor
    }

    fn checkpoint_at(&self, height: u32) -> Option<Hash256> {
        if !self.checkpoints_enabled {
            return None;
        }
        if let Some((anchor_height, anchor_hash)) = &self.anchor {
            if height == *anchor_height {
                return Some(*anchor_hash);
            }
        }
        self.params.checkpoint(height).copied()
    }
}
