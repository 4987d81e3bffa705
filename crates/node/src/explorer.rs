//! Start-tip bootstrap over a block-explorer HTTP API.
//!
//! When a start height is configured without raw headers, the node fetches
//! the two anchor headers from an explorer. Only the public networks are
//! reachable this way; regtest and simnet must supply raw start tips.

use spvd_chain::StartTip;
use spvd_consensus::Network;
use spvd_primitives::BlockHeader;

const MAINNET_API_BASE: &str = "https://blockstream.info/api";
const TESTNET_API_BASE: &str = "https://blockstream.info/testnet/api";
const LOOKUP_TIMEOUT_SECS: u64 = 30;

#[derive(Debug)]
pub enum ExplorerError {
    UnsupportedNetwork(Network),
    Http(String),
    InvalidResponse(String),
}

impl std::fmt::Display for ExplorerError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ExplorerError::UnsupportedNetwork(network) => write!(
                f,
                "no explorer lookup on {}; supply raw start-tip headers instead",
                network.as_str()
            ),
            ExplorerError::Http(message) => write!(f, "{message}"),
            ExplorerError::InvalidResponse(message) => write!(f, "{message}"),
        }
    }
}

impl std::error::Error for ExplorerError {}

/// Resolve the headers at `height - 1` and `height`.
pub fn fetch_start_tip(network: Network, height: u32) -> Result<StartTip, ExplorerError> {
    let base = match network {
        Network::Mainnet => MAINNET_API_BASE,
        Network::Testnet => TESTNET_API_BASE,
        other => return Err(ExplorerError::UnsupportedNetwork(other)),
    };
    spvd_log::log_info!("resolving start tip at height {height} via explorer");
    let prev = fetch_header(base, height - 1)?;
    let start = fetch_header(base, height)?;
    Ok(StartTip {
        prev,
        start,
        height,
    })
}

fn fetch_header(base: &str, height: u32) -> Result<BlockHeader, ExplorerError> {
    let hash = get_text(&format!("{base}/block-height/{height}"))?;
    let hash = hash.trim();
    if hash.len() != 64 {
        return Err(ExplorerError::InvalidResponse(format!(
            "explorer returned an invalid hash for height {height}"
        )));
    }
    let header_hex = get_text(&format!("{base}/block/{hash}/header"))?;
    let bytes = hex_to_bytes(header_hex.trim()).ok_or_else(|| {
        ExplorerError::InvalidResponse(format!(
            "explorer returned invalid header hex for height {height}"
        ))
    })?;
    BlockHeader::consensus_decode(&bytes).map_err(|err| {
        ExplorerError::InvalidResponse(format!("undecodable header at height {height}: {err}"))
    })
}

fn get_text(url: &str) -> Result<String, ExplorerError> {
    let response = minreq::get(url)
        .with_timeout(LOOKUP_TIMEOUT_SECS)
        .send()
        .map_err(|err| ExplorerError::Http(format!("explorer request failed: {url} ({err})")))?;
    if response.status_code != 200 {
        return Err(ExplorerError::Http(format!(
            "explorer request failed: {url} (HTTP {})",
            response.status_code
        )));
    }
    response
        .as_str()
        .map(|text| text.to_string())
        .map_err(|err| ExplorerError::InvalidResponse(format!("non-text explorer response: {err}")))
}

pub fn hex_to_bytes(hex: &str) -> Option<Vec<u8>> {
    if hex.len() % 2 != 0 {
        return None;
    }
    let mut out = Vec::with_capacity(hex.len() / 2);
    let bytes = hex.as_bytes();
    for chunk in bytes.chunks(2) {
        let hi = char::from(chunk[0]).to_digit(16)?;
        let lo = char::from(chunk[1]).to_digit(16)?;
        out.push(((hi << 4) | lo) as u8);
    }
    Some(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn regtest_lookup_is_refused() {
        let err = fetch_start_tip(Network::Regtest, 50).expect_err("must refuse");
        assert!(matches!(err, ExplorerError::UnsupportedNetwork(_)));
        assert!(err.to_string().contains("start-tip"));
    }

    #[test]
    fn hex_decoding() {
        assert_eq!(hex_to_bytes("00ff10"), Some(vec![0x00, 0xff, 0x10]));
        assert_eq!(hex_to_bytes("0"), None);
        assert_eq!(hex_to_bytes("zz"), None);
    }
}
