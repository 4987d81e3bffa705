//! The node façade: owns the store, working chain, header index, and sync
//! driver, and exposes the header queries.

use std::net::{SocketAddr, ToSocketAddrs};
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use spvd_chain::{
    ChainEntry, HeaderIndex, IndexError, IndexOptions, StartTip, WorkingChain,
};
use spvd_consensus::{network_params, Network, NetworkParams};
use spvd_primitives::{hash_to_hex, BlockHeader, Hash256};
use spvd_storage::memory::MemoryStore;
use spvd_storage::{KeyValueStore, StoreError};
use tokio::task::JoinHandle;

use crate::explorer;
use crate::peer_book::PeerBook;
use crate::sync::SyncDriver;

#[derive(Debug)]
pub enum NodeError {
    Config(String),
    Index(IndexError),
    Store(StoreError),
    Io(std::io::Error),
}

impl std::fmt::Display for NodeError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            NodeError::Config(message) => write!(f, "{message}"),
            NodeError::Index(err) => write!(f, "{err}"),
            NodeError::Store(err) => write!(f, "{err}"),
            NodeError::Io(err) => write!(f, "{err}"),
        }
    }
}

impl std::error::Error for NodeError {}

impl From<IndexError> for NodeError {
    fn from(err: IndexError) -> Self {
        // Start-height misconfiguration surfaces as a configuration error.
        match err {
            IndexError::Config(message) => NodeError::Config(message),
            other => NodeError::Index(other),
        }
    }
}

impl From<StoreError> for NodeError {
    fn from(err: StoreError) -> Self {
        NodeError::Store(err)
    }
}

impl From<std::io::Error> for NodeError {
    fn from(err: std::io::Error) -> Self {
        NodeError::Io(err)
    }
}

#[derive(Clone, Debug)]
pub struct NodeOptions {
    pub network: Network,
    /// Store directory; ignored with `memory`.
    pub prefix: PathBuf,
    pub memory: bool,
    pub checkpoints: bool,
    pub start_height: Option<u32>,
    /// Raw fast-sync anchor headers at `start_height - 1` and `start_height`.
    pub start_tip: Option<(BlockHeader, BlockHeader)>,
    /// Peer addresses; DNS seeds are used when empty.
    pub connect: Vec<String>,
}

impl NodeOptions {
    pub fn new(network: Network) -> Self {
        Self {
            network,
            prefix: PathBuf::from(".spvd"),
            memory: false,
            checkpoints: true,
            start_height: None,
            start_tip: None,
            connect: Vec::new(),
        }
    }
}

pub struct Node {
    params: NetworkParams,
    chain: Arc<Mutex<WorkingChain>>,
    index: Arc<HeaderIndex<dyn KeyValueStore>>,
    peer_book: Arc<PeerBook>,
    connect: Vec<String>,
    sync_task: Option<JoinHandle<()>>,
}

impl std::fmt::Debug for Node {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Node").finish_non_exhaustive()
    }
}

impl Node {
    /// Open everything in dependency order: store, empty working chain,
    /// header index (running startup reconciliation, possibly injecting the
    /// start anchor), then wire the index as a chain observer.
    pub fn open(options: NodeOptions) -> Result<Self, NodeError> {
        let params = network_params(options.network);
        let start = resolve_start(&options, &params)?;

        let store = open_store(&options, &params)?;
        let index = Arc::new(HeaderIndex::open(
            store,
            params.clone(),
            IndexOptions {
                checkpoints: options.checkpoints,
                start,
            },
        )?);

        let mut chain = WorkingChain::new(params.clone(), options.checkpoints);
        index.reconcile(&mut chain)?;
        chain.add_listener(index.clone());

        let (tip_height, tip_hash) = index.tip();
        spvd_log::log_info!(
            "header index open at height {tip_height} ({})",
            hash_to_hex(&tip_hash)
        );

        Ok(Self {
            params,
            chain: Arc::new(Mutex::new(chain)),
            index,
            peer_book: Arc::new(PeerBook::default()),
            connect: options.connect,
            sync_task: None,
        })
    }

    /// Start header sync against the configured peers, or the network's DNS
    /// seeds when none are configured.
    pub fn start_sync(&mut self) -> Result<(), NodeError> {
        if self.sync_task.is_some() {
            return Ok(());
        }
        let addrs = self.resolve_peer_addrs()?;
        let driver = Arc::new(SyncDriver::new(
            self.params.clone(),
            self.chain.clone(),
            self.index.clone(),
            self.peer_book.clone(),
        ));
        self.sync_task = Some(tokio::spawn(driver.run(addrs)));
        Ok(())
    }

    /// Stop syncing, flush any buffered index writes, and unbind listeners.
    pub fn close(mut self) -> Result<(), NodeError> {
        if let Some(task) = self.sync_task.take() {
            task.abort();
        }
        self.index.commit()?;
        self.chain
            .lock()
            .expect("working chain lock")
            .unbind_listeners();
        Ok(())
    }

    pub fn params(&self) -> &NetworkParams {
        &self.params
    }

    pub fn header(&self, height: u32) -> Result<Option<BlockHeader>, NodeError> {
        Ok(self.index.header(height)?)
    }

    pub fn entry(&self, height: u32) -> Result<Option<ChainEntry>, NodeError> {
        Ok(self.index.entry(height)?)
    }

    /// Entry lookup by hash, served from the working chain.
    pub fn entry_by_hash(&self, hash: &Hash256) -> Option<ChainEntry> {
        self.chain
            .lock()
            .expect("working chain lock")
            .entry(hash)
            .cloned()
    }

    pub fn tip(&self) -> Result<BlockHeader, NodeError> {
        let (height, _) = self.index.tip();
        self.header(height)?
            .ok_or(NodeError::Index(IndexError::Corrupt(
                "tip record is missing",
            )))
    }

    pub fn tip_height(&self) -> u32 {
        self.index.tip().0
    }

    pub fn start_height(&self) -> u32 {
        self.index.start_height()
    }

    /// Depth of a block: the tip counts as one confirmation.
    pub fn confirmations(&self, height: u32) -> Option<u32> {
        let (tip_height, _) = self.index.tip();
        if height > tip_height {
            return None;
        }
        Some(tip_height - height + 1)
    }

    fn resolve_peer_addrs(&self) -> Result<Vec<SocketAddr>, NodeError> {
        let default_port = self.params.default_port;
        let mut addrs = Vec::new();
        for spec in &self.connect {
            let resolved = if spec.contains(':') {
                spec.to_socket_addrs()
            } else {
                (spec.as_str(), default_port).to_socket_addrs()
            };
            match resolved {
                Ok(iter) => addrs.extend(iter),
                Err(err) => {
                    return Err(NodeError::Config(format!(
                        "cannot resolve peer address {spec}: {err}"
                    )))
                }
            }
        }
        if addrs.is_empty() {
            for seed in self.params.dns_seeds {
                match (*seed, default_port).to_socket_addrs() {
                    Ok(iter) => addrs.extend(iter.take(4)),
                    Err(err) => spvd_log::log_debug!("dns seed {seed} failed: {err}"),
                }
            }
        }
        Ok(addrs)
    }
}

fn resolve_start(
    options: &NodeOptions,
    params: &NetworkParams,
) -> Result<Option<StartTip>, NodeError> {
    match (&options.start_tip, options.start_height) {
        (Some((prev, start)), Some(height)) => Ok(Some(StartTip {
            prev: prev.clone(),
            start: start.clone(),
            height,
        })),
        (Some(_), None) => Err(NodeError::Config(
            "start-tip requires start-height to anchor the raw headers".to_string(),
        )),
        (None, Some(height)) => {
            // Fail on an unusable height before going to the network.
            spvd_chain::validate_start_height(params, height)?;
            let tip = explorer::fetch_start_tip(params.network, height)
                .map_err(|err| NodeError::Config(err.to_string()))?;
            Ok(Some(tip))
        }
        (None, None) => Ok(None),
    }
}

fn open_store(
    options: &NodeOptions,
    params: &NetworkParams,
) -> Result<Arc<dyn KeyValueStore>, NodeError> {
    if options.memory {
        return Ok(Arc::new(MemoryStore::new()));
    }
    let dir = options.prefix.join(params.network.as_str());
    std::fs::create_dir_all(&dir)?;
    let store = spvd_storage::fjall::FjallStore::open(dir.join("headers"))?;
    Ok(Arc::new(store))
}
