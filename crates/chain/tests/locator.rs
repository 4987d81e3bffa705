//! Locator shape over plain and custom-start chains.

use std::collections::HashMap;
use std::sync::Arc;

use spvd_chain::validate::check_proof_of_work;
use spvd_chain::{ChainEntry, HeaderIndex, IndexOptions, StartTip, WorkingChain};
use spvd_consensus::{network_params, Network, NetworkParams};
use spvd_primitives::{BlockHeader, Hash256};
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

fn mine_prefix(params: &NetworkParams, to_height: u32) -> Vec<BlockHeader> {
    let mut headers = vec![params.genesis.clone()];
    let mut prev = ChainEntry::genesis(params).expect("genesis");
    for height in 1..=to_height {
        let header = mine(&prev, params);
        prev = ChainEntry {
            header: header.clone(),
            height,
            chainwork: prev.chainwork,
        };
        headers.push(header);
    }
    headers
}

fn assert_locator_shape(
    locator: &[Hash256],
    heights: &HashMap<Hash256, u32>,
    tip: u32,
    floor: u32,
) {
    assert!(!locator.is_empty());
    assert_eq!(heights[&locator[0]], tip, "locator starts at the tip");
    let mut previous = None;
    for hash in locator {
        let height = heights[hash];
        if let Some(previous) = previous {
            assert!(height < previous, "locator heights strictly decrease");
        }
        assert!(height >= floor, "locator never walks below the floor");
        previous = Some(height);
    }
    assert_eq!(
        heights[locator.last().expect("non-empty")],
        floor,
        "locator ends at the floor"
    );
}

#[test]
fn locator_over_a_genesis_chain_ends_at_genesis() {
    let params = test_params();
    let store = Arc::new(MemoryStore::new());
    let index = Arc::new(
        HeaderIndex::open(store, params.clone(), IndexOptions::default()).expect("open index"),
    );
    let mut chain = WorkingChain::new(params.clone(), false);
    index.reconcile(&mut chain).expect("reconcile");
    chain.add_listener(index.clone());

    let mut heights = HashMap::new();
    heights.insert(params.genesis_hash, 0u32);
    let mut prev = chain.tip().expect("tip").clone();
    for height in 1..=30u32 {
        let header = mine(&prev, &params);
        heights.insert(header.hash(), height);
        prev = chain.add(&header).expect("accept header");
    }
    index.commit().expect("commit");

    let locator = index.locator().expect("locator");
    assert_locator_shape(&locator, &heights, 30, 0);
    assert_eq!(*locator.last().expect("non-empty"), params.genesis_hash);
}

#[test]
fn locator_over_a_custom_start_chain_ends_at_the_anchor() {
    let params = test_params();
    let headers = mine_prefix(&params, 50);

    let store = Arc::new(MemoryStore::new());
    let options = IndexOptions {
        checkpoints: false,
        start: Some(StartTip {
            prev: headers[49].clone(),
            start: headers[50].clone(),
            height: 50,
        }),
    };
    let index = Arc::new(
        HeaderIndex::open(store, params.clone(), options).expect("open with start tip"),
    );
    let mut chain = WorkingChain::new(params.clone(), false);
    index.reconcile(&mut chain).expect("reconcile");
    chain.add_listener(index.clone());

    let mut heights = HashMap::new();
    for (height, header) in headers.iter().enumerate() {
        heights.insert(header.hash(), height as u32);
    }
    let mut prev = chain.tip().expect("tip").clone();
    for height in 51..=100u32 {
        let header = mine(&prev, &params);
        heights.insert(header.hash(), height);
        prev = chain.add(&header).expect("accept header");
    }
    index.commit().expect("commit");
    assert_eq!(index.tip().0, 100);

    let locator = index.locator().expect("locator");
    assert_locator_shape(&locator, &heights, 100, 50);
    assert_eq!(*locator.last().expect("non-empty"), headers[50].hash());

    // The dense prefix walks back one block at a time before the step
    // starts doubling.
    for (offset, hash) in locator.iter().take(11).enumerate() {
        assert_eq!(heights[hash], 100 - offset as u32);
    }
    assert!(locator.len() < 20);
}
