//! Reorganisation: event ordering, store rewrites, and delivery-order
//! independence.

use std::sync::{Arc, Mutex};

use spvd_chain::validate::check_proof_of_work;
use spvd_chain::{ChainEntry, ChainListener, HeaderIndex, IndexOptions, WorkingChain};
use spvd_consensus::{network_params, Network, NetworkParams};
use spvd_primitives::{BlockHeader, Hash256};
use spvd_storage::memory::MemoryStore;

fn mine_tagged(
    prev: &ChainEntry,
    params: &NetworkParams,
    merkle_tag: u8,
) -> BlockHeader {
    let mut header = BlockHeader {
        version: 1,
        prev_block: prev.hash(),
        merkle_root: [merkle_tag; 32],
        time: prev.header.time + 600,
        bits: params.pow_limit_bits,
        nonce: 0,
    };
    while check_proof_of_work(&header, params).is_err() {
        header.nonce += 1;
    }
    header
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Event {
    Connect(u32),
    Disconnect(u32),
}

#[derive(Default)]
struct RecordingListener {
    events: Mutex<Vec<(Event, Hash256)>>,
}

impl RecordingListener {
    fn take(&self) -> Vec<(Event, Hash256)> {
        std::mem::take(&mut *self.events.lock().expect("events lock"))
    }
}

impl ChainListener for RecordingListener {
    fn chain_connect(&self, entry: &ChainEntry) {
        self.events
            .lock()
            .expect("events lock")
            .push((Event::Connect(entry.height), entry.hash()));
    }

    fn chain_disconnect(&self, entry: &ChainEntry) {
        self.events
            .lock()
            .expect("events lock")
            .push((Event::Disconnect(entry.height), entry.hash()));
    }

    fn chain_reset(&self, _tip: &ChainEntry) {}
}

/// Build a main chain to height 10 and an alternative branch forking at
/// height 7 and ending at height 12.
fn build_chains(params: &NetworkParams) -> (Vec<BlockHeader>, Vec<BlockHeader>) {
    let genesis = ChainEntry::genesis(params).expect("genesis");

    let mut main = Vec::new();
    let mut entries = vec![genesis.clone()];
    let mut prev = genesis.clone();
    for height in 1..=10u32 {
        let header = mine_tagged(&prev, params, 0xaa);
        prev = ChainEntry {
            header: header.clone(),
            height,
            chainwork: prev.chainwork + spvd_pow::block_proof(header.bits).expect("proof"),
        };
        entries.push(prev.clone());
        main.push(header);
    }

    let mut branch = Vec::new();
    let mut prev = entries[7].clone();
    for height in 8..=12u32 {
        let header = mine_tagged(&prev, params, 0xbb);
        prev = ChainEntry {
            header: header.clone(),
            height,
            chainwork: prev.chainwork + spvd_pow::block_proof(header.bits).expect("proof"),
        };
        branch.push(header);
    }

    (main, branch)
}

#[test]
fn reorg_disconnects_then_connects_and_rewrites_the_store() {
    let params = network_params(Network::Regtest);
    let store = Arc::new(MemoryStore::new());
    let index = Arc::new(
        HeaderIndex::open(store, params.clone(), IndexOptions::default()).expect("open index"),
    );
    let recorder = Arc::new(RecordingListener::default());

    let mut chain = WorkingChain::new(params.clone(), false);
    index.reconcile(&mut chain).expect("reconcile");
    chain.add_listener(index.clone());
    chain.add_listener(recorder.clone());

    let (main, branch) = build_chains(&params);
    for header in &main {
        chain.add(header).expect("main header");
    }
    index.commit().expect("commit main");
    assert_eq!(index.tip().0, 10);
    recorder.take();

    for header in &branch {
        chain.add(header).expect("branch header");
    }
    index.commit().expect("commit branch");

    let events = recorder.take();
    let kinds: Vec<Event> = events.iter().map(|(event, _)| *event).collect();
    assert_eq!(
        kinds,
        vec![
            Event::Disconnect(10),
            Event::Disconnect(9),
            Event::Disconnect(8),
            Event::Connect(8),
            Event::Connect(9),
            Event::Connect(10),
            Event::Connect(11),
            Event::Connect(12),
        ]
    );

    // The store now carries the new branch at heights 8..12 and nothing
    // from the old one.
    assert_eq!(index.tip().0, 12);
    for (offset, header) in branch.iter().enumerate() {
        let height = 8 + offset as u32;
        assert_eq!(
            index.hash(height).expect("hash"),
            Some(header.hash()),
            "height {height} should hold the branch header"
        );
    }
    let old_hashes: Vec<Hash256> = main[7..].iter().map(|header| header.hash()).collect();
    for height in 8..=10u32 {
        let stored = index.hash(height).expect("hash").expect("present");
        assert!(!old_hashes.contains(&stored));
    }
}

#[test]
fn reorg_outcome_is_independent_of_delivery_batching() {
    let params = network_params(Network::Regtest);
    let (main, branch) = build_chains(&params);

    let run = |batches: &[&[BlockHeader]]| -> Hash256 {
        let mut chain = WorkingChain::new(params.clone(), false);
        chain.resume(ChainEntry::genesis(&params).expect("genesis"));
        for header in &main {
            chain.add(header).expect("main header");
        }
        for batch in batches {
            for header in *batch {
                chain.add(header).expect("branch header");
            }
        }
        chain.tip().expect("tip").hash()
    };

    let all_at_once = run(&[&branch]);
    let split = run(&[&branch[..2], &branch[2..]]);
    let trickled = run(&[
        &branch[..1],
        &branch[1..2],
        &branch[2..3],
        &branch[3..4],
        &branch[4..],
    ]);

    assert_eq!(all_at_once, branch[4].hash());
    assert_eq!(all_at_once, split);
    assert_eq!(all_at_once, trickled);
}
