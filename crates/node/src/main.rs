mod explorer;
mod node;
mod p2p;
mod peer_book;
mod sync;

use std::path::PathBuf;

use spvd_consensus::Network;
use spvd_log as logging;
use spvd_log::{log_debug, log_error, log_info, log_warn};
use spvd_primitives::{hash_to_hex, BlockHeader};

use crate::node::{Node, NodeOptions};

struct Config {
    network: Network,
    prefix: PathBuf,
    memory: bool,
    checkpoints: bool,
    start_height: Option<u32>,
    start_tip: Option<(BlockHeader, BlockHeader)>,
    connect: Vec<String>,
    log_level: logging::Level,
    log_format: logging::Format,
    log_timestamps: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            network: Network::Mainnet,
            prefix: PathBuf::from(".spvd"),
            memory: false,
            checkpoints: true,
            start_height: None,
            start_tip: None,
            connect: Vec::new(),
            log_level: logging::Level::Info,
            log_format: logging::Format::Text,
            log_timestamps: true,
        }
    }
}

enum CliAction {
    Run(Box<Config>),
    PrintHelp,
    PrintVersion,
}

fn usage() -> &'static str {
    "spvd - a headers-only Bitcoin peer\n\
     \n\
     USAGE:\n\
     \x20 spvd [OPTIONS]\n\
     \n\
     OPTIONS:\n\
     \x20 --network <main|test|regtest|simnet>  chain to follow (default: main)\n\
     \x20 --prefix <dir>                        store directory (default: .spvd)\n\
     \x20 --memory                              keep the store in memory\n\
     \x20 --no-checkpoints                      disable checkpoint enforcement\n\
     \x20 --start-height <height>               fast-sync anchor height\n\
     \x20 --start-tip <hex80> <hex80>           raw anchor headers at height-1 and height\n\
     \x20 --connect <addr>                      peer address (repeatable; DNS seeds otherwise)\n\
     \x20 --log-level <error|warn|info|debug|trace>\n\
     \x20 --log-format <text|json>\n\
     \x20 --no-log-timestamps\n\
     \x20 --help, --version"
}

fn parse_args_from<I>(raw_args: I) -> Result<CliAction, String>
where
    I: IntoIterator<Item = String>,
{
    let mut config = Config::default();
    let mut args = raw_args.into_iter();
    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--help" | "-h" => return Ok(CliAction::PrintHelp),
            "--version" | "-V" => return Ok(CliAction::PrintVersion),
            "--network" => {
                let value = expect_value(&mut args, "--network")?;
                config.network = Network::parse(&value)
                    .ok_or_else(|| format!("unknown network {value:?}"))?;
            }
            "--prefix" => {
                config.prefix = PathBuf::from(expect_value(&mut args, "--prefix")?);
            }
            "--memory" => config.memory = true,
            "--no-checkpoints" => config.checkpoints = false,
            "--start-height" => {
                let value = expect_value(&mut args, "--start-height")?;
                let height = value
                    .parse::<u32>()
                    .map_err(|_| format!("invalid start height {value:?}"))?;
                config.start_height = Some(height);
            }
            "--start-tip" => {
                let prev = parse_header_hex(&expect_value(&mut args, "--start-tip")?)?;
                let start = parse_header_hex(&expect_value(&mut args, "--start-tip")?)?;
                config.start_tip = Some((prev, start));
            }
            "--connect" => {
                config.connect.push(expect_value(&mut args, "--connect")?);
            }
            "--log-level" => {
                let value = expect_value(&mut args, "--log-level")?;
                config.log_level = logging::Level::parse(&value)
                    .ok_or_else(|| format!("unknown log level {value:?}"))?;
            }
            "--log-format" => {
                let value = expect_value(&mut args, "--log-format")?;
                config.log_format = logging::Format::parse(&value)
                    .ok_or_else(|| format!("unknown log format {value:?}"))?;
            }
            "--no-log-timestamps" => config.log_timestamps = false,
            other => return Err(format!("unknown option {other:?} (try --help)")),
        }
    }
    Ok(CliAction::Run(Box::new(config)))
}

fn expect_value(args: &mut impl Iterator<Item = String>, option: &str) -> Result<String, String> {
    args.next()
        .ok_or_else(|| format!("{option} requires a value"))
}

fn parse_header_hex(hex: &str) -> Result<BlockHeader, String> {
    let bytes = explorer::hex_to_bytes(hex.trim())
        .ok_or_else(|| "start-tip headers must be hex".to_string())?;
    BlockHeader::consensus_decode(&bytes).map_err(|err| format!("invalid start-tip header: {err}"))
}

async fn run_entry() -> Result<(), String> {
    let action = parse_args_from(std::env::args().skip(1))?;
    let config = match action {
        CliAction::PrintHelp => {
            println!("{}", usage());
            return Ok(());
        }
        CliAction::PrintVersion => {
            println!("spvd {}", env!("CARGO_PKG_VERSION"));
            return Ok(());
        }
        CliAction::Run(config) => config,
    };

    logging::init(logging::LogConfig {
        level: config.log_level,
        format: config.log_format,
        timestamps: config.log_timestamps,
    });

    log_info!(
        "starting spvd on {} (prefix {}, checkpoints {})",
        config.network.as_str(),
        config.prefix.display(),
        config.checkpoints,
    );

    let mut options = NodeOptions::new(config.network);
    options.prefix = config.prefix.clone();
    options.memory = config.memory;
    options.checkpoints = config.checkpoints;
    options.start_height = config.start_height;
    options.start_tip = config.start_tip.clone();
    options.connect = config.connect.clone();

    let mut node = Node::open(options).map_err(|err| err.to_string())?;
    node.start_sync().map_err(|err| err.to_string())?;

    let mut status = tokio::time::interval(std::time::Duration::from_secs(STATUS_INTERVAL_SECS));
    status.tick().await;
    loop {
        tokio::select! {
            result = tokio::signal::ctrl_c() => {
                result.map_err(|err| err.to_string())?;
                break;
            }
            _ = status.tick() => log_status(&node),
        }
    }
    log_info!("shutting down at height {}", node.tip_height());
    node.close().map_err(|err| err.to_string())
}

const STATUS_INTERVAL_SECS: u64 = 60;

fn log_status(node: &Node) {
    let height = node.tip_height();
    match node.tip() {
        Ok(tip) => log_info!(
            "{}: tip {} at height {height} (start height {})",
            node.params().network.as_str(),
            hash_to_hex(&tip.hash()),
            node.start_height()
        ),
        Err(err) => log_warn!("tip query failed: {err}"),
    }
    if let Ok(Some(entry)) = node.entry(height) {
        log_debug!("cumulative chainwork {}", entry.chainwork);
    }
}

#[tokio::main]
async fn main() {
    if let Err(err) = run_entry().await {
        log_error!("{err}");
        eprintln!("spvd: {err}");
        std::process::exit(1);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(list: &[&str]) -> Vec<String> {
        list.iter().map(|arg| arg.to_string()).collect()
    }

    #[test]
    fn parses_a_full_command_line() {
        let action = parse_args_from(args(&[
            "--network",
            "regtest",
            "--prefix",
            "/tmp/spvd",
            "--memory",
            "--no-checkpoints",
            "--start-height",
            "294336",
            "--connect",
            "127.0.0.1:18444",
            "--connect",
            "10.0.0.1",
            "--log-level",
            "debug",
        ]))
        .expect("parse");
        let CliAction::Run(config) = action else {
            panic!("expected run action");
        };
        assert_eq!(config.network, Network::Regtest);
        assert_eq!(config.prefix, PathBuf::from("/tmp/spvd"));
        assert!(config.memory);
        assert!(!config.checkpoints);
        assert_eq!(config.start_height, Some(294_336));
        assert_eq!(config.connect.len(), 2);
        assert_eq!(config.log_level, logging::Level::Debug);
    }

    #[test]
    fn rejects_unknown_options_and_missing_values() {
        assert!(parse_args_from(args(&["--bogus"])).is_err());
        assert!(parse_args_from(args(&["--network"])).is_err());
        assert!(parse_args_from(args(&["--start-height", "nope"])).is_err());
    }

    #[test]
    fn help_and_version_short_circuit() {
        assert!(matches!(
            parse_args_from(args(&["--help"])),
            Ok(CliAction::PrintHelp)
        ));
        assert!(matches!(
            parse_args_from(args(&["--version", "--bogus"])),
            Ok(CliAction::PrintVersion)
        ));
    }

    #[test]
    fn start_tip_parses_two_headers() {
        let genesis_hex = "010000000000000000000000000000000000000000000000000000000000000000000000\
3ba3edfd7a7b12b27ac72c3e67768f617fc81bc3888a51323a9fb8aa4b1e5e4a29ab5f49ffff001d1dac2b7c";
        let action = parse_args_from(args(&[
            "--start-tip",
            genesis_hex,
            genesis_hex,
            "--start-height",
            "10",
        ]))
        .expect("parse");
        let CliAction::Run(config) = action else {
            panic!("expected run action");
        };
        let (prev, start) = config.start_tip.expect("start tip");
        assert_eq!(prev, start);
        assert_eq!(prev.time, 1_231_006_505);
    }
}
