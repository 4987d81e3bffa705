//! Full header sync against an in-memory store: storage split between
//! historical and recent heights, and store contiguity after the event
//! stream.

use std::sync::Arc;

use spvd_chain::validate::check_proof_of_work;
use spvd_chain::{ChainEntry, HeaderIndex, IndexOptions, StoredBlock, WorkingChain};
use spvd_consensus::{network_params, Network, NetworkParams};
use spvd_primitives::BlockHeader;
use spvd_storage::memory::MemoryStore;

fn test_params() -> NetworkParams {
    let mut params = network_params(Network::Regtest);
    params.retarget_interval = 25;
    params.target_timespan = 24 * 600;
    params.no_retargeting = false;
    params.allow_min_difficulty = false;
    params.last_checkpoint = 62;
    params
}

fn mine(prev: &ChainEntry, params: &NetworkParams) -> BlockHeader {
    let mut header = BlockHeader {
        version: 1,
        prev_block: prev.hash(),
        merkle_root: [0u8; 32],
        time: prev.header.time + 600,
        bits: params.pow_limit_bits,
        nonce: 0,
    };
    while check_proof_of_work(&header, params).is_err() {
        header.nonce += 1;
    }
    header
}

#[test]
fn sync_splits_historical_and_recent_records() {
    let params = test_params();
    assert_eq!(params.historical_point(), 50);

    let store = Arc::new(MemoryStore::new());
    let index = Arc::new(
        HeaderIndex::open(store, params.clone(), IndexOptions::default()).expect("open index"),
    );
    let mut chain = WorkingChain::new(params.clone(), false);
    index.reconcile(&mut chain).expect("reconcile");
    chain.add_listener(index.clone());

    let mut prev = chain.tip().expect("genesis tip").clone();
    for _ in 1..=75u32 {
        let header = mine(&prev, &params);
        prev = chain.add(&header).expect("accept header");
    }
    index.commit().expect("commit");

    assert_eq!(index.tip().0, 75);
    assert_eq!(chain.tip().expect("tip").height, 75);

    // Heights fixed by checkpoint ancestry keep only the 80 header bytes.
    for height in 0..=50u32 {
        let stored = index.stored(height).expect("read").expect("present");
        assert!(
            matches!(stored, StoredBlock::Header(_)),
            "height {height} should be a bare header"
        );
    }
    // Recent heights keep the full entry with real chainwork.
    for height in 51..=75u32 {
        let stored = index.stored(height).expect("read").expect("present");
        match stored {
            StoredBlock::Entry(entry) => {
                assert_eq!(entry.height, height);
                assert!(!entry.chainwork.is_zero());
            }
            StoredBlock::Header(_) => panic!("height {height} should be a full entry"),
        }
    }
}

#[test]
fn synced_store_matches_local_hashes_and_is_contiguous() {
    let params = test_params();
    let store = Arc::new(MemoryStore::new());
    let index = Arc::new(
        HeaderIndex::open(store, params.clone(), IndexOptions::default()).expect("open index"),
    );
    let mut chain = WorkingChain::new(params.clone(), false);
    index.reconcile(&mut chain).expect("reconcile");
    chain.add_listener(index.clone());

    let mut hashes = vec![params.genesis_hash];
    let mut prev = chain.tip().expect("genesis tip").clone();
    for _ in 1..=75u32 {
        let header = mine(&prev, &params);
        hashes.push(header.hash());
        prev = chain.add(&header).expect("accept header");
    }
    index.commit().expect("commit");

    for height in 0..=75u32 {
        let header = index
            .header(height)
            .expect("read")
            .unwrap_or_else(|| panic!("missing header at {height}"));
        assert_eq!(header.hash(), hashes[height as usize]);
        assert_eq!(index.hash(height).expect("hash"), Some(hashes[height as usize]));
        if height > 0 {
            assert_eq!(header.prev_block, hashes[height as usize - 1]);
        }
    }
    assert!(index.header(76).expect("read").is_none());
}

#[test]
fn retarget_boundary_headers_are_validated() {
    let params = test_params();
    let mut chain = WorkingChain::new(params.clone(), false);
    chain.resume(ChainEntry::genesis(&params).expect("genesis"));

    // Crossing heights 25 and 50 exercises the retarget computation.
    let mut prev = chain.tip().expect("tip").clone();
    for height in 1..=55u32 {
        let header = mine(&prev, &params);
        prev = chain.add(&header).expect("accept header");
        assert_eq!(prev.height, height);
    }

    // A boundary header with bits off the schedule is rejected.
    let mut bogus = mine(&prev, &params);
    bogus.bits = 0x207ffffe;
    assert!(chain.add(&bogus).is_err());
}
