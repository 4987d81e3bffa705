//! Header sync driver.
//!
//! Feeds locator-based `getheaders` rounds into the working chain, commits
//! the index batch after every processed message, and keeps a bounded
//! orphan pool so announcements ahead of the tip can be resolved without
//! looping forever.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};

use spvd_chain::validate::check_proof_of_work;
use spvd_chain::{HeaderError, HeaderIndex, WorkingChain};
use spvd_consensus::constants::{MAX_FUTURE_BLOCK_TIME, MIN_PEER_PROTO_VERSION};
use spvd_consensus::NetworkParams;
use spvd_primitives::{hash_to_hex, BlockHeader, Hash256};
use spvd_storage::KeyValueStore;
use tokio::time::{sleep, timeout, Duration};

use crate::p2p::{parse_headers, parse_inv, Peer, MSG_BLOCK};
use crate::peer_book::PeerBook;

const IDLE_SLEEP_SECS: u64 = 5;
const HEADERS_TIMEOUT_SECS: u64 = 60;
const BAD_CHAIN_BAN_SECS: u64 = 60 * 60;
const EMPTY_ROUNDS_BEFORE_RECONNECT: u32 = 20;
/// Resolution rounds before an orphan is ejected.
const ORPHAN_MAX_ROUNDS: u32 = 4;
const ORPHAN_POOL_MAX: usize = 256;

struct Orphan {
    header: BlockHeader,
    rounds: u32,
}

#[derive(Default)]
struct OrphanPool {
    by_prev: HashMap<Hash256, Orphan>,
}

impl OrphanPool {
    fn insert(&mut self, header: BlockHeader) {
        if self.by_prev.len() >= ORPHAN_POOL_MAX {
            return;
        }
        self.by_prev
            .entry(header.prev_block)
            .or_insert(Orphan { header, rounds: 0 });
    }

    fn take_child_of(&mut self, hash: &Hash256) -> Option<BlockHeader> {
        self.by_prev.remove(hash).map(|orphan| orphan.header)
    }

    /// The hash of some pending orphan, used as the getheaders stop so the
    /// peer fills the gap up to it.
    fn stop_hash(&self) -> Option<Hash256> {
        self.by_prev.values().next().map(|o| o.header.hash())
    }

    /// Count a resolution attempt against every pending orphan and eject
    /// the ones that have been around too long.
    fn note_round(&mut self) {
        self.by_prev.retain(|_, orphan| {
            orphan.rounds += 1;
            if orphan.rounds > ORPHAN_MAX_ROUNDS {
                spvd_log::log_debug!(
                    "ejecting unresolvable orphan {}",
                    hash_to_hex(&orphan.header.hash())
                );
                false
            } else {
                true
            }
        });
    }

    fn is_empty(&self) -> bool {
        self.by_prev.is_empty()
    }
}

pub struct SyncDriver<S: ?Sized> {
    params: NetworkParams,
    chain: Arc<Mutex<WorkingChain>>,
    index: Arc<HeaderIndex<S>>,
    peer_book: Arc<PeerBook>,
    orphans: Mutex<OrphanPool>,
}

impl<S: KeyValueStore + ?Sized> SyncDriver<S> {
    pub fn new(
        params: NetworkParams,
        chain: Arc<Mutex<WorkingChain>>,
        index: Arc<HeaderIndex<S>>,
        peer_book: Arc<PeerBook>,
    ) -> Self {
        Self {
            params,
            chain,
            index,
            peer_book,
            orphans: Mutex::new(OrphanPool::default()),
        }
    }

    /// Rotate through peer candidates forever, syncing headers from one
    /// peer at a time.
    pub async fn run(self: Arc<Self>, addrs: Vec<SocketAddr>) {
        if addrs.is_empty() {
            spvd_log::log_warn!("no peer addresses available; header sync is idle");
            return;
        }
        let idle = Duration::from_secs(IDLE_SLEEP_SECS);
        let mut cursor = 0usize;
        loop {
            let addr = match self.peer_book.preferred(1).first() {
                Some(addr) => *addr,
                None => {
                    let addr = addrs[cursor % addrs.len()];
                    cursor += 1;
                    addr
                }
            };
            if self.peer_book.is_banned(addr) {
                sleep(idle).await;
                continue;
            }
            if let Err(err) = self.sync_once(addr).await {
                spvd_log::log_debug!("header peer {addr}: {err}");
                self.peer_book.record_failure(addr);
            }
            sleep(idle).await;
        }
    }

    async fn sync_once(&self, addr: SocketAddr) -> Result<(), String> {
        let (tip_height, _) = self.index.tip();
        let mut peer = Peer::connect(addr, self.params.message_start).await?;
        peer.handshake(tip_height as i32).await?;
        if peer.remote_version() < MIN_PEER_PROTO_VERSION {
            return Err(format!(
                "peer speaks protocol {} (need at least {MIN_PEER_PROTO_VERSION})",
                peer.remote_version()
            ));
        }
        spvd_log::log_info!(
            "header peer {} connected (version {}, agent {}, height {})",
            addr,
            peer.remote_version(),
            peer.remote_user_agent(),
            peer.remote_height()
        );
        self.sync_with_peer(&mut peer).await
    }

    async fn sync_with_peer(&self, peer: &mut Peer) -> Result<(), String> {
        let idle = Duration::from_secs(IDLE_SLEEP_SECS);
        let mut empty_rounds = 0u32;
        loop {
            let (tip_height, _) = self.index.tip();
            let locator = self.index.locator().map_err(|err| err.to_string())?;
            let stop = {
                let orphans = self.orphans.lock().expect("orphan pool lock");
                orphans.stop_hash().unwrap_or([0u8; 32])
            };
            peer.send_getheaders(&locator, &stop).await?;

            let headers = self.wait_headers(peer).await?;
            if headers.is_empty() {
                self.orphans.lock().expect("orphan pool lock").note_round();
                if peer.remote_height() > tip_height as i32 {
                    return Err("peer claims a higher tip but sent no headers".to_string());
                }
                empty_rounds += 1;
                if empty_rounds >= EMPTY_ROUNDS_BEFORE_RECONNECT {
                    return Ok(());
                }
                sleep(idle).await;
                continue;
            }
            empty_rounds = 0;

            let accepted = self.process_batch(&headers, peer.addr())?;
            let (new_tip, _) = self.index.tip();
            peer.bump_remote_height(new_tip as i32);
            spvd_log::log_debug!(
                "accepted {accepted}/{} headers, tip at {new_tip}",
                headers.len()
            );
        }
    }

    /// Read until a `headers` message arrives, answering pings and treating
    /// a block announcement as a cue to re-request with a fresh locator.
    async fn wait_headers(&self, peer: &mut Peer) -> Result<Vec<BlockHeader>, String> {
        loop {
            let (command, payload) = timeout(
                Duration::from_secs(HEADERS_TIMEOUT_SECS),
                peer.read_message(),
            )
            .await
            .map_err(|_| "headers request timed out".to_string())??;
            match command.as_str() {
                "headers" => return parse_headers(&payload),
                "ping" => peer.send_message("pong", &payload).await?,
                "inv" => {
                    let inv = parse_inv(&payload)?;
                    let announced = {
                        let chain = self.chain.lock().expect("working chain lock");
                        inv.iter()
                            .any(|item| item.inv_type == MSG_BLOCK && !chain.has(&item.hash))
                    };
                    if announced {
                        return Ok(Vec::new());
                    }
                }
                _ => {}
            }
        }
    }

    /// Feed one `headers` batch through the working chain in order. The
    /// first invalid header aborts the batch and bans the sender; accepted
    /// writes are committed either way.
    fn process_batch(&self, headers: &[BlockHeader], addr: SocketAddr) -> Result<usize, String> {
        if !headers_are_contiguous(headers) {
            self.peer_book.record_bad_chain(addr, BAD_CHAIN_BAN_SECS);
            return Err("non-contiguous headers sequence".to_string());
        }
        let now = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map(|elapsed| elapsed.as_secs() as i64)
            .unwrap_or(0);
        if headers
            .iter()
            .any(|header| i64::from(header.time) > now + MAX_FUTURE_BLOCK_TIME)
        {
            self.peer_book.record_bad_chain(addr, BAD_CHAIN_BAN_SECS);
            return Err("header timestamp too far in the future".to_string());
        }

        let mut accepted = 0usize;
        let mut failure: Option<String> = None;
        {
            let mut chain = self.chain.lock().expect("working chain lock");
            for header in headers {
                match chain.add(header) {
                    Ok(_) => accepted += 1,
                    Err(HeaderError::Orphan) => {
                        if check_proof_of_work(header, &self.params).is_err() {
                            self.peer_book.record_bad_chain(addr, BAD_CHAIN_BAN_SECS);
                            failure = Some("orphan header with invalid pow".to_string());
                        } else {
                            spvd_log::log_debug!(
                                "orphan header {} pooled",
                                hash_to_hex(&header.hash())
                            );
                            let mut orphans = self.orphans.lock().expect("orphan pool lock");
                            orphans.insert(header.clone());
                        }
                        // The rest of a contiguous batch cannot connect either.
                        break;
                    }
                    Err(err) => {
                        self.peer_book.record_bad_chain(addr, BAD_CHAIN_BAN_SECS);
                        failure = Some(format!("invalid header from peer: {err}"));
                        break;
                    }
                }
            }

            // Attach any pooled orphans that now connect to the tip.
            let mut orphans = self.orphans.lock().expect("orphan pool lock");
            while let Some(tip_hash) = chain.tip().map(|tip| tip.hash()) {
                let Some(orphan) = orphans.take_child_of(&tip_hash) else {
                    break;
                };
                match chain.add(&orphan) {
                    Ok(_) => accepted += 1,
                    Err(_) => break,
                }
            }
            if !orphans.is_empty() {
                orphans.note_round();
            }
        }

        self.index.commit().map_err(|err| err.to_string())?;

        match failure {
            Some(message) => Err(message),
            None => {
                self.peer_book.record_success(addr);
                Ok(accepted)
            }
        }
    }
}

fn headers_are_contiguous(headers: &[BlockHeader]) -> bool {
    headers
        .windows(2)
        .all(|pair| pair[1].prev_block == pair[0].hash())
}

#[cfg(test)]
mod tests {
    use super::*;
    use spvd_chain::{ChainEntry, IndexOptions};
    use spvd_consensus::{network_params, Network};
    use spvd_storage::memory::MemoryStore;

    fn mine(prev_hash: Hash256, params: &NetworkParams, time: u32) -> BlockHeader {
        let mut header = BlockHeader {
            version: 1,
            prev_block: prev_hash,
            merkle_root: [0u8; 32],
            time,
            bits: params.pow_limit_bits,
            nonce: 0,
        };
        while check_proof_of_work(&header, params).is_err() {
            header.nonce += 1;
        }
        header
    }

    fn driver_with_genesis(
        params: &NetworkParams,
    ) -> (Arc<SyncDriver<MemoryStore>>, Arc<Mutex<WorkingChain>>) {
        let store = Arc::new(MemoryStore::new());
        let index = Arc::new(
            HeaderIndex::open(store, params.clone(), IndexOptions::default()).expect("open index"),
        );
        let mut chain = WorkingChain::new(params.clone(), false);
        index.reconcile(&mut chain).expect("reconcile");
        let chain = Arc::new(Mutex::new(chain));
        {
            let mut guard = chain.lock().expect("chain lock");
            guard.add_listener(index.clone());
        }
        let driver = Arc::new(SyncDriver::new(
            params.clone(),
            chain.clone(),
            index,
            Arc::new(PeerBook::default()),
        ));
        (driver, chain)
    }

    fn test_addr() -> SocketAddr {
        "127.0.0.1:18444".parse().expect("addr")
    }

    #[test]
    fn contiguity_check() {
        let params = network_params(Network::Regtest);
        let genesis = ChainEntry::genesis(&params).expect("genesis");
        let h1 = mine(genesis.hash(), &params, genesis.header.time + 600);
        let h2 = mine(h1.hash(), &params, h1.time + 600);
        assert!(headers_are_contiguous(&[h1.clone(), h2.clone()]));
        assert!(!headers_are_contiguous(&[h2, h1]));
    }

    #[test]
    fn batch_extends_chain_and_commits() {
        let params = network_params(Network::Regtest);
        let (driver, _chain) = driver_with_genesis(&params);

        let genesis = ChainEntry::genesis(&params).expect("genesis");
        let h1 = mine(genesis.hash(), &params, genesis.header.time + 600);
        let h2 = mine(h1.hash(), &params, h1.time + 600);
        let accepted = driver
            .process_batch(&[h1, h2], test_addr())
            .expect("process batch");
        assert_eq!(accepted, 2);
        assert_eq!(driver.index.tip().0, 2);
        assert!(driver.index.header(2).expect("read").is_some());
    }

    #[test]
    fn orphan_is_pooled_then_attached() {
        let params = network_params(Network::Regtest);
        let (driver, _chain) = driver_with_genesis(&params);

        let genesis = ChainEntry::genesis(&params).expect("genesis");
        let h1 = mine(genesis.hash(), &params, genesis.header.time + 600);
        let h2 = mine(h1.hash(), &params, h1.time + 600);

        // The child arrives first and must wait in the pool.
        let accepted = driver
            .process_batch(std::slice::from_ref(&h2), test_addr())
            .expect("orphan batch");
        assert_eq!(accepted, 0);
        assert_eq!(driver.index.tip().0, 0);

        // Its parent arrives; both connect.
        let accepted = driver
            .process_batch(std::slice::from_ref(&h1), test_addr())
            .expect("parent batch");
        assert_eq!(accepted, 2);
        assert_eq!(driver.index.tip().0, 2);
    }

    #[test]
    fn orphans_are_ejected_after_bounded_rounds() {
        let params = network_params(Network::Regtest);
        let (driver, _chain) = driver_with_genesis(&params);

        let orphan = mine([0x77; 32], &params, 1_400_000_000);
        driver.process_batch(std::slice::from_ref(&orphan), test_addr()).expect("pool orphan");
        for _ in 0..=ORPHAN_MAX_ROUNDS {
            driver.orphans.lock().expect("orphan pool lock").note_round();
        }
        assert!(driver.orphans.lock().expect("orphan pool lock").is_empty());
    }

    #[test]
    fn invalid_header_aborts_batch_and_bans_peer() {
        let params = network_params(Network::Regtest);
        let (driver, _chain) = driver_with_genesis(&params);

        let genesis = ChainEntry::genesis(&params).expect("genesis");
        // A header whose time is not above the genesis median.
        let stale = mine(genesis.hash(), &params, genesis.header.time);
        let err = driver
            .process_batch(std::slice::from_ref(&stale), test_addr())
            .expect_err("must reject");
        assert!(err.contains("invalid header"));
        assert!(driver.peer_book.is_banned(test_addr()));
        assert_eq!(driver.index.tip().0, 0);
    }
}
