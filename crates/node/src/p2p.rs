//! Bitcoin wire protocol, limited to what header sync needs.

use std::net::SocketAddr;
use std::time::{SystemTime, UNIX_EPOCH};

use spvd_consensus::constants::{MAX_HEADERS_RESULTS, MAX_LOCATOR_HASHES, PROTOCOL_VERSION};
use spvd_primitives::encoding::{Decoder, Encoder};
use spvd_primitives::hash::sha256d;
use spvd_primitives::{BlockHeader, Hash256};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::{timeout, Duration};

const MAX_PAYLOAD_SIZE: usize = 4 * 1024 * 1024;
const MAX_INV_RESULTS: usize = 50_000;
const NODE_NONE: u64 = 0;
pub const MSG_BLOCK: u32 = 2;
const SEND_TIMEOUT_SECS: u64 = 10;
const HANDSHAKE_READ_TIMEOUT_SECS: u64 = 30;
const USER_AGENT: &str = concat!("/spvd:", env!("CARGO_PKG_VERSION"), "/");

pub struct Peer {
    stream: TcpStream,
    magic: [u8; 4],
    remote_height: i32,
    remote_version: i32,
    remote_user_agent: String,
    addr: SocketAddr,
}

impl Peer {
    pub async fn connect(addr: SocketAddr, magic: [u8; 4]) -> Result<Self, String> {
        let stream = TcpStream::connect(addr)
            .await
            .map_err(|err| err.to_string())?;
        Ok(Self {
            stream,
            magic,
            remote_height: -1,
            remote_version: 0,
            remote_user_agent: String::new(),
            addr,
        })
    }

    pub async fn send_message(&mut self, command: &str, payload: &[u8]) -> Result<(), String> {
        let mut message = Vec::with_capacity(24 + payload.len());
        message.extend_from_slice(&self.magic);
        let mut command_bytes = [0u8; 12];
        let cmd = command.as_bytes();
        if cmd.len() > 12 {
            return Err("command too long".to_string());
        }
        command_bytes[..cmd.len()].copy_from_slice(cmd);
        message.extend_from_slice(&command_bytes);
        message.extend_from_slice(&(payload.len() as u32).to_le_bytes());
        let checksum = sha256d(payload);
        message.extend_from_slice(&checksum[..4]);
        message.extend_from_slice(payload);
        timeout(
            Duration::from_secs(SEND_TIMEOUT_SECS),
            self.stream.write_all(&message),
        )
        .await
        .map_err(|_| "peer write timed out".to_string())?
        .map_err(|err| err.to_string())?;
        Ok(())
    }

    pub async fn read_message(&mut self) -> Result<(String, Vec<u8>), String> {
        let mut header = [0u8; 24];
        self.stream
            .read_exact(&mut header)
            .await
            .map_err(|err| err.to_string())?;
        if header[..4] != self.magic {
            return Err("invalid magic".to_string());
        }
        let command = header[4..16]
            .iter()
            .take_while(|byte| **byte != 0)
            .map(|byte| *byte as char)
            .collect::<String>();
        let length = u32::from_le_bytes([header[16], header[17], header[18], header[19]]) as usize;
        if length > MAX_PAYLOAD_SIZE {
            return Err("payload too large".to_string());
        }
        let checksum = &header[20..24];
        let mut payload = vec![0u8; length];
        self.stream
            .read_exact(&mut payload)
            .await
            .map_err(|err| err.to_string())?;
        let calc = sha256d(&payload);
        if checksum != &calc[..4] {
            return Err("invalid payload checksum".to_string());
        }
        Ok((command, payload))
    }

    pub async fn handshake(&mut self, start_height: i32) -> Result<(), String> {
        let payload = build_version_payload(start_height);
        self.send_message("version", &payload).await?;

        let mut got_verack = false;
        let mut got_version = false;
        while !(got_verack && got_version) {
            let (command, payload) = timeout(
                Duration::from_secs(HANDSHAKE_READ_TIMEOUT_SECS),
                self.read_message(),
            )
            .await
            .map_err(|_| "peer handshake timed out".to_string())??;
            match command.as_str() {
                "version" => {
                    got_version = true;
                    self.send_message("verack", &[]).await?;
                    if let Ok(info) = parse_version(&payload) {
                        self.remote_height = info.start_height;
                        self.remote_version = info.version;
                        self.remote_user_agent = info.user_agent;
                    }
                }
                "verack" => {
                    got_verack = true;
                }
                "ping" => {
                    self.send_message("pong", &payload).await?;
                }
                _ => {}
            }
        }
        Ok(())
    }

    pub fn remote_height(&self) -> i32 {
        self.remote_height
    }

    pub fn bump_remote_height(&mut self, height: i32) {
        self.remote_height = self.remote_height.max(height);
    }

    pub fn remote_version(&self) -> i32 {
        self.remote_version
    }

    pub fn remote_user_agent(&self) -> &str {
        &self.remote_user_agent
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub async fn send_getheaders(
        &mut self,
        locator: &[Hash256],
        stop: &Hash256,
    ) -> Result<(), String> {
        let payload = build_getheaders_payload(locator, stop);
        self.send_message("getheaders", &payload).await
    }
}

pub fn parse_headers(payload: &[u8]) -> Result<Vec<BlockHeader>, String> {
    let mut decoder = Decoder::new(payload);
    let count = decoder.read_varint().map_err(|err| err.to_string())?;
    let count = usize::try_from(count).map_err(|_| "header count too large".to_string())?;
    if count > MAX_HEADERS_RESULTS {
        return Err("header count too large".to_string());
    }
    let mut headers = Vec::with_capacity(count);
    for _ in 0..count {
        let header = BlockHeader::decode_from(&mut decoder).map_err(|err| err.to_string())?;
        let _tx_count = decoder.read_varint().map_err(|err| err.to_string())?;
        headers.push(header);
    }
    if !decoder.is_empty() {
        return Err("trailing bytes in headers payload".to_string());
    }
    Ok(headers)
}

#[derive(Clone, Copy, Debug)]
pub struct InventoryVector {
    pub inv_type: u32,
    pub hash: Hash256,
}

pub fn parse_inv(payload: &[u8]) -> Result<Vec<InventoryVector>, String> {
    let mut decoder = Decoder::new(payload);
    let count = decoder.read_varint().map_err(|err| err.to_string())?;
    let count = usize::try_from(count).map_err(|_| "inv count too large".to_string())?;
    if count > MAX_INV_RESULTS {
        return Err("inv count too large".to_string());
    }
    let mut out = Vec::with_capacity(count);
    for _ in 0..count {
        let inv_type = decoder.read_u32_le().map_err(|err| err.to_string())?;
        let hash = decoder.read_hash_le().map_err(|err| err.to_string())?;
        out.push(InventoryVector { inv_type, hash });
    }
    if !decoder.is_empty() {
        return Err("trailing bytes in inv payload".to_string());
    }
    Ok(out)
}

pub fn build_getheaders_payload(locator: &[Hash256], stop: &Hash256) -> Vec<u8> {
    let mut encoder = Encoder::new();
    encoder.write_i32_le(PROTOCOL_VERSION);
    let count = locator.len().min(MAX_LOCATOR_HASHES);
    encoder.write_varint(count as u64);
    for hash in &locator[..count] {
        encoder.write_hash_le(hash);
    }
    encoder.write_hash_le(stop);
    encoder.into_inner()
}

fn build_version_payload(start_height: i32) -> Vec<u8> {
    let mut encoder = Encoder::new();
    encoder.write_i32_le(PROTOCOL_VERSION);
    encoder.write_u64_le(NODE_NONE);
    let timestamp = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|duration| duration.as_secs() as i64)
        .unwrap_or(0);
    encoder.write_i64_le(timestamp);
    write_net_addr(&mut encoder, NODE_NONE, [0u8; 16], 0);
    write_net_addr(&mut encoder, NODE_NONE, [0u8; 16], 0);
    encoder.write_u64_le(rand::random());
    encoder.write_var_str(USER_AGENT);
    encoder.write_i32_le(start_height);
    // No tx relay; this node only wants headers and block announcements.
    encoder.write_u8(0);
    encoder.into_inner()
}

fn write_net_addr(encoder: &mut Encoder, services: u64, ip: [u8; 16], port: u16) {
    encoder.write_u64_le(services);
    encoder.write_bytes(&ip);
    encoder.write_bytes(&port.to_be_bytes());
}

struct VersionInfo {
    version: i32,
    user_agent: String,
    start_height: i32,
}

fn parse_version(payload: &[u8]) -> Result<VersionInfo, String> {
    let mut decoder = Decoder::new(payload);
    let version = decoder.read_i32_le().map_err(|err| err.to_string())?;
    let _services = decoder.read_u64_le().map_err(|err| err.to_string())?;
    let _timestamp = decoder.read_i64_le().map_err(|err| err.to_string())?;
    read_net_addr(&mut decoder)?;
    read_net_addr(&mut decoder)?;
    let _nonce = decoder.read_u64_le().map_err(|err| err.to_string())?;
    let user_agent = decoder.read_var_str().map_err(|err| err.to_string())?;
    let start_height = decoder.read_i32_le().map_err(|err| err.to_string())?;
    Ok(VersionInfo {
        version,
        user_agent,
        start_height,
    })
}

fn read_net_addr(decoder: &mut Decoder) -> Result<(), String> {
    let _services = decoder.read_u64_le().map_err(|err| err.to_string())?;
    let _ip = decoder.read_fixed::<16>().map_err(|err| err.to_string())?;
    let _port = decoder.read_bytes(2).map_err(|err| err.to_string())?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_header(nonce: u32) -> BlockHeader {
        BlockHeader {
            version: 1,
            prev_block: [0x11; 32],
            merkle_root: [0x22; 32],
            time: 1_300_000_000,
            bits: 0x207fffff,
            nonce,
        }
    }

    #[test]
    fn headers_payload_roundtrip() {
        let headers = vec![sample_header(1), sample_header(2)];
        let mut encoder = Encoder::new();
        encoder.write_varint(headers.len() as u64);
        for header in &headers {
            header.encode_into(&mut encoder);
            encoder.write_varint(0);
        }
        let parsed = parse_headers(&encoder.into_inner()).expect("parse headers");
        assert_eq!(parsed, headers);
    }

    #[test]
    fn headers_payload_rejects_oversized_count() {
        let mut encoder = Encoder::new();
        encoder.write_varint((MAX_HEADERS_RESULTS + 1) as u64);
        assert!(parse_headers(&encoder.into_inner()).is_err());
    }

    #[test]
    fn getheaders_payload_layout() {
        let locator = vec![[0xaau8; 32], [0xbbu8; 32]];
        let stop = [0xccu8; 32];
        let payload = build_getheaders_payload(&locator, &stop);
        // version + varint + 2 hashes + stop
        assert_eq!(payload.len(), 4 + 1 + 64 + 32);
        assert_eq!(&payload[5..37], &[0xaau8; 32]);
        assert_eq!(&payload[69..101], &[0xccu8; 32]);
    }

    #[test]
    fn inv_payload_roundtrip() {
        let mut encoder = Encoder::new();
        encoder.write_varint(1);
        encoder.write_u32_le(MSG_BLOCK);
        encoder.write_hash_le(&[0x42; 32]);
        let parsed = parse_inv(&encoder.into_inner()).expect("parse inv");
        assert_eq!(parsed.len(), 1);
        assert_eq!(parsed[0].inv_type, MSG_BLOCK);
        assert_eq!(parsed[0].hash, [0x42; 32]);
    }

    async fn read_frame(stream: &mut TcpStream, magic: [u8; 4]) -> (String, Vec<u8>) {
        let mut header = [0u8; 24];
        stream.read_exact(&mut header).await.expect("frame header");
        assert_eq!(header[..4], magic);
        let command = header[4..16]
            .iter()
            .take_while(|byte| **byte != 0)
            .map(|byte| *byte as char)
            .collect::<String>();
        let length = u32::from_le_bytes([header[16], header[17], header[18], header[19]]) as usize;
        let mut payload = vec![0u8; length];
        stream.read_exact(&mut payload).await.expect("frame payload");
        (command, payload)
    }

    async fn write_frame(stream: &mut TcpStream, magic: [u8; 4], command: &str, payload: &[u8]) {
        let mut message = Vec::with_capacity(24 + payload.len());
        message.extend_from_slice(&magic);
        let mut command_bytes = [0u8; 12];
        command_bytes[..command.len()].copy_from_slice(command.as_bytes());
        message.extend_from_slice(&command_bytes);
        message.extend_from_slice(&(payload.len() as u32).to_le_bytes());
        let checksum = sha256d(payload);
        message.extend_from_slice(&checksum[..4]);
        message.extend_from_slice(payload);
        stream.write_all(&message).await.expect("frame write");
    }

    fn scripted_version_payload() -> Vec<u8> {
        let mut encoder = Encoder::new();
        encoder.write_i32_le(PROTOCOL_VERSION);
        encoder.write_u64_le(1);
        encoder.write_i64_le(0);
        write_net_addr(&mut encoder, 1, [0u8; 16], 0);
        write_net_addr(&mut encoder, 1, [0u8; 16], 0);
        encoder.write_u64_le(7);
        encoder.write_var_str("/scripted:1.0/");
        encoder.write_i32_le(123);
        encoder.write_u8(0);
        encoder.into_inner()
    }

    #[tokio::test]
    async fn handshake_and_headers_exchange_over_loopback() {
        let magic = [0xfa, 0xbf, 0xb5, 0xda];
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .expect("bind");
        let addr = listener.local_addr().expect("listener addr");

        let served = sample_header(7);
        let served_for_server = served.clone();
        let server = tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.expect("accept");
            let (command, _) = read_frame(&mut stream, magic).await;
            assert_eq!(command, "version");
            write_frame(&mut stream, magic, "version", &scripted_version_payload()).await;
            write_frame(&mut stream, magic, "verack", &[]).await;
            let (command, _) = read_frame(&mut stream, magic).await;
            assert_eq!(command, "verack");

            let (command, payload) = read_frame(&mut stream, magic).await;
            assert_eq!(command, "getheaders");
            // version + one-hash locator + stop
            assert_eq!(payload.len(), 4 + 1 + 32 + 32);

            let mut encoder = Encoder::new();
            encoder.write_varint(1);
            served_for_server.encode_into(&mut encoder);
            encoder.write_varint(0);
            write_frame(&mut stream, magic, "headers", &encoder.into_inner()).await;
        });

        let mut peer = Peer::connect(addr, magic).await.expect("connect");
        peer.handshake(0).await.expect("handshake");
        assert_eq!(peer.remote_height(), 123);
        assert_eq!(peer.remote_user_agent(), "/scripted:1.0/");

        peer.send_getheaders(&[[0x11; 32]], &[0u8; 32])
            .await
            .expect("getheaders");
        let (command, payload) = peer.read_message().await.expect("headers frame");
        assert_eq!(command, "headers");
        let parsed = parse_headers(&payload).expect("parse headers");
        assert_eq!(parsed, vec![served]);

        server.await.expect("server task");
    }
}
