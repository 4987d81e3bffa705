//! Network parameter definitions.
//!
//! Parameters are plain values owned by whoever constructs them; nothing in
//! this crate is process-wide. Tests build their own `NetworkParams` with
//! whatever checkpoint schedule they need.

use spvd_primitives::{BlockHeader, Hash256};

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Network {
    Mainnet,
    Testnet,
    Regtest,
    Simnet,
}

impl Network {
    pub fn as_str(self) -> &'static str {
        match self {
            Network::Mainnet => "main",
            Network::Testnet => "test",
            Network::Regtest => "regtest",
            Network::Simnet => "simnet",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "main" | "mainnet" => Some(Network::Mainnet),
            "test" | "testnet" => Some(Network::Testnet),
            "regtest" => Some(Network::Regtest),
            "simnet" => Some(Network::Simnet),
            _ => None,
        }
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct Checkpoint {
    pub height: u32,
    pub hash: Hash256,
}

#[derive(Clone, Debug)]
pub struct NetworkParams {
    pub network: Network,
    pub genesis: BlockHeader,
    pub genesis_hash: Hash256,
    pub pow_limit: Hash256,
    pub pow_limit_bits: u32,
    /// Blocks between difficulty recomputations (2016 on mainnet).
    pub retarget_interval: u32,
    /// Expected seconds per retarget interval.
    pub target_timespan: i64,
    /// Expected seconds per block.
    pub target_spacing: i64,
    /// Accept pow-limit bits after twice the target spacing without a block.
    pub allow_min_difficulty: bool,
    /// Difficulty never moves off the previous bits.
    pub no_retargeting: bool,
    pub checkpoints: Vec<Checkpoint>,
    pub last_checkpoint: u32,
    pub message_start: [u8; 4],
    pub default_port: u16,
    pub dns_seeds: &'static [&'static str],
}

impl NetworkParams {
    /// Largest retarget-interval multiple at or below the last checkpoint.
    ///
    /// Heights at or below this point are fixed by checkpoint ancestry and
    /// are stored as bare headers; a fast-sync start anchor must not sit
    /// beyond it, because difficulty recomputation needs an ancestor at the
    /// preceding retarget boundary.
    pub fn historical_point(&self) -> u32 {
        if self.last_checkpoint == 0 {
            return 0;
        }
        self.last_checkpoint - self.last_checkpoint % self.retarget_interval
    }

    pub fn checkpoint(&self, height: u32) -> Option<&Hash256> {
        self.checkpoints
            .iter()
            .find(|checkpoint| checkpoint.height == height)
            .map(|checkpoint| &checkpoint.hash)
    }

    pub fn is_retarget_height(&self, height: u32) -> bool {
        !self.no_retargeting && height > 0 && height % self.retarget_interval == 0
    }
}

#[derive(Debug)]
pub enum HexError {
    InvalidLength,
    InvalidHex,
}

impl std::fmt::Display for HexError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            HexError::InvalidLength => write!(f, "hex string has invalid length"),
            HexError::InvalidHex => write!(f, "invalid hex digit"),
        }
    }
}

impl std::error::Error for HexError {}

/// Parse a displayed (big-endian) hash into internal byte order.
pub fn hash256_from_hex(input: &str) -> Result<Hash256, HexError> {
    let hex = input.trim();
    if hex.len() != 64 {
        return Err(HexError::InvalidLength);
    }

    let mut bytes = [0u8; 32];
    for (i, byte_out) in bytes.iter_mut().enumerate() {
        let start = i * 2;
        let byte =
            u8::from_str_radix(&hex[start..start + 2], 16).map_err(|_| HexError::InvalidHex)?;
        *byte_out = byte;
    }
    bytes.reverse();

    Ok(bytes)
}

pub fn network_params(network: Network) -> NetworkParams {
    match network {
        Network::Mainnet => mainnet_params(),
        Network::Testnet => testnet_params(),
        Network::Regtest => regtest_params(),
        Network::Simnet => simnet_params(),
    }
}

const GENESIS_MERKLE_ROOT: &str =
    "4a5e1e4baab89f3a32518a88c31bc87f618f76673e2cc77ab2127b7afdeda33b";

const POW_LIMIT_MAIN: &str = "00000000ffffffffffffffffffffffffffffffffffffffffffffffffffffffff";
const POW_LIMIT_REGTEST: &str = "7fffffffffffffffffffffffffffffffffffffffffffffffffffffffffffffff";

const RETARGET_INTERVAL: u32 = 2_016;
const TARGET_TIMESPAN: i64 = 14 * 24 * 60 * 60;
const TARGET_SPACING: i64 = 10 * 60;

const MAINNET_DNS_SEEDS: [&str; 5] = [
    "seed.bitcoin.sipa.be",
    "dnsseed.bluematt.me",
    "dnsseed.bitcoin.dashjr.org",
    "seed.bitcoinstats.com",
    "seed.bitcoin.jonasschnelli.ch",
];

const TESTNET_DNS_SEEDS: [&str; 3] = [
    "testnet-seed.bitcoin.jonasschnelli.ch",
    "seed.tbtc.petertodd.org",
    "testnet-seed.bluematt.me",
];

const NO_DNS_SEEDS: [&str; 0] = [];

fn genesis_header(time: u32, bits: u32, nonce: u32) -> BlockHeader {
    BlockHeader {
        version: 1,
        prev_block: [0u8; 32],
        merkle_root: hash256_from_hex(GENESIS_MERKLE_ROOT).expect("genesis merkle root"),
        time,
        bits,
        nonce,
    }
}

fn mainnet_params() -> NetworkParams {
    let genesis = genesis_header(1_231_006_505, 0x1d00_ffff, 2_083_236_893);
    let genesis_hash = genesis.hash();
    let checkpoints = mainnet_checkpoints();
    let last_checkpoint = checkpoints.last().map(|c| c.height).unwrap_or(0);
    NetworkParams {
        network: Network::Mainnet,
        genesis,
        genesis_hash,
        pow_limit: hash256_from_hex(POW_LIMIT_MAIN).expect("mainnet pow limit"),
        pow_limit_bits: 0x1d00_ffff,
        retarget_interval: RETARGET_INTERVAL,
        target_timespan: TARGET_TIMESPAN,
        target_spacing: TARGET_SPACING,
        allow_min_difficulty: false,
        no_retargeting: false,
        checkpoints,
        last_checkpoint,
        message_start: [0xf9, 0xbe, 0xb4, 0xd9],
        default_port: 8_333,
        dns_seeds: &MAINNET_DNS_SEEDS,
    }
}

fn testnet_params() -> NetworkParams {
    let genesis = genesis_header(1_296_688_602, 0x1d00_ffff, 414_098_458);
    let genesis_hash = genesis.hash();
    let checkpoints = testnet_checkpoints();
    let last_checkpoint = checkpoints.last().map(|c| c.height).unwrap_or(0);
    NetworkParams {
        network: Network::Testnet,
        genesis,
        genesis_hash,
        pow_limit: hash256_from_hex(POW_LIMIT_MAIN).expect("testnet pow limit"),
        pow_limit_bits: 0x1d00_ffff,
        retarget_interval: RETARGET_INTERVAL,
        target_timespan: TARGET_TIMESPAN,
        target_spacing: TARGET_SPACING,
        allow_min_difficulty: true,
        no_retargeting: false,
        checkpoints,
        last_checkpoint,
        message_start: [0x0b, 0x11, 0x09, 0x07],
        default_port: 18_333,
        dns_seeds: &TESTNET_DNS_SEEDS,
    }
}

fn regtest_params() -> NetworkParams {
    let genesis = genesis_header(1_296_688_602, 0x207f_ffff, 2);
    let genesis_hash = genesis.hash();
    NetworkParams {
        network: Network::Regtest,
        genesis,
        genesis_hash,
        pow_limit: hash256_from_hex(POW_LIMIT_REGTEST).expect("regtest pow limit"),
        pow_limit_bits: 0x207f_ffff,
        retarget_interval: RETARGET_INTERVAL,
        target_timespan: TARGET_TIMESPAN,
        target_spacing: TARGET_SPACING,
        allow_min_difficulty: true,
        no_retargeting: true,
        checkpoints: Vec::new(),
        last_checkpoint: 0,
        message_start: [0xfa, 0xbf, 0xb5, 0xda],
        default_port: 18_444,
        dns_seeds: &NO_DNS_SEEDS,
    }
}

fn simnet_params() -> NetworkParams {
    let genesis = genesis_header(1_401_292_357, 0x207f_ffff, 2);
    let genesis_hash = genesis.hash();
    NetworkParams {
        network: Network::Simnet,
        genesis,
        genesis_hash,
        pow_limit: hash256_from_hex(POW_LIMIT_REGTEST).expect("simnet pow limit"),
        pow_limit_bits: 0x207f_ffff,
        retarget_interval: RETARGET_INTERVAL,
        target_timespan: TARGET_TIMESPAN,
        target_spacing: TARGET_SPACING,
        allow_min_difficulty: true,
        no_retargeting: true,
        checkpoints: Vec::new(),
        last_checkpoint: 0,
        message_start: [0x16, 0x1c, 0x14, 0x12],
        default_port: 18_555,
        dns_seeds: &NO_DNS_SEEDS,
    }
}

fn parse_checkpoints(entries: &[(u32, &str)]) -> Vec<Checkpoint> {
    entries
        .iter()
        .map(|(height, hash)| Checkpoint {
            height: *height,
            hash: hash256_from_hex(hash).expect("checkpoint hash"),
        })
        .collect()
}

fn mainnet_checkpoints() -> Vec<Checkpoint> {
    parse_checkpoints(&[
        (
            11_111,
            "0000000069e244f73d78e8fd29ba2fd2ed618bd6fa2ee92559f542fdb26e7c1d",
        ),
        (
            33_333,
            "000000002dd5588a74784eaa7ab0507a18ad16a236e7b1ce69f00d7ddfb5d0a6",
        ),
        (
            74_000,
            "0000000000573993a3c9e41ce34471c079dcf5f52a0e824a81e7f953b8661a20",
        ),
        (
            105_000,
            "00000000000291ce28027faea320c8d2b054b2e0fe44a773f3eefb151d6bdc97",
        ),
        (
            134_444,
            "00000000000005b12ffd4cd315cd34ffd4a594f430ac814c91184a0d42d2b0fe",
        ),
        (
            168_000,
            "000000000000099e61ea72015e79632f216fe6cb33d7899acb35b75c8303b763",
        ),
        (
            193_000,
            "000000000000059f452a5f7340de6682a977387c17010ff6e6c3bd83ca8b1317",
        ),
        (
            210_000,
            "000000000000048b95347e83192f69cf0366076336c639f9b7228e9ba171342e",
        ),
        (
            216_116,
            "00000000000001b4f4b433e81ee46494af945cf96014816a4e2370f11b23df4e",
        ),
        (
            225_430,
            "00000000000001c108384350f74090433e7fcf79a606b8e797f065b130575932",
        ),
        (
            250_000,
            "000000000000003887df1f29024b06fc2200b55f8af8f35453d7be294df2d214",
        ),
        (
            279_000,
            "0000000000000001ae8c72a0b0c301f67e3afca10e819efa9041e458e9bd7e40",
        ),
        (
            295_000,
            "00000000000000004d9b4ef50f0f9d686fd69db2e03af35a100370c64632a983",
        ),
    ])
}

fn testnet_checkpoints() -> Vec<Checkpoint> {
    parse_checkpoints(&[(
        546,
        "000000002a936ca763904c3c35fce2f3556c559c0214345d31b1bcebf76acb70",
    )])
}
