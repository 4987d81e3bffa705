//! Chain entries and their persistent representation.

use primitive_types::U256;
use spvd_consensus::NetworkParams;
use spvd_pow::{block_proof, CompactError};
use spvd_primitives::encoding::{DecodeError, Decoder, Encoder};
use spvd_primitives::header::HEADER_SIZE;
use spvd_primitives::{BlockHeader, Hash256};

/// A header with its absolute height and cumulative chainwork.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ChainEntry {
    pub header: BlockHeader,
    pub height: u32,
    pub chainwork: U256,
}

impl ChainEntry {
    pub fn hash(&self) -> Hash256 {
        self.header.hash()
    }

    pub fn genesis(params: &NetworkParams) -> Result<Self, CompactError> {
        Ok(Self {
            header: params.genesis.clone(),
            height: 0,
            chainwork: block_proof(params.genesis.bits)?,
        })
    }
}

const TAG_HEADER: u8 = 0x00;
const TAG_ENTRY: u8 = 0x01;

/// Serialized length of a bare-header record.
pub const STORED_HEADER_LEN: usize = 1 + HEADER_SIZE;
/// Serialized length of a full-entry record.
pub const STORED_ENTRY_LEN: usize = 1 + HEADER_SIZE + 4 + 32;

/// A height-keyed record: blocks fixed by checkpoint ancestry keep only the
/// 80 header bytes, recent blocks keep the full entry so the working chain
/// can be rebuilt without losing chainwork.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum StoredBlock {
    Header(BlockHeader),
    Entry(ChainEntry),
}

impl StoredBlock {
    pub fn header(&self) -> &BlockHeader {
        match self {
            StoredBlock::Header(header) => header,
            StoredBlock::Entry(entry) => &entry.header,
        }
    }

    pub fn is_entry(&self) -> bool {
        matches!(self, StoredBlock::Entry(_))
    }

    /// Reconstruct a chain entry at `height`. Bare headers carry zero
    /// chainwork; nothing at or below the historical point consults it.
    pub fn into_entry(self, height: u32) -> ChainEntry {
        match self {
            StoredBlock::Header(header) => ChainEntry {
                header,
                height,
                chainwork: U256::zero(),
            },
            StoredBlock::Entry(entry) => entry,
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        match self {
            StoredBlock::Header(header) => {
                let mut encoder = Encoder::with_capacity(STORED_HEADER_LEN);
                encoder.write_u8(TAG_HEADER);
                header.encode_into(&mut encoder);
                encoder.into_inner()
            }
            StoredBlock::Entry(entry) => {
                let mut encoder = Encoder::with_capacity(STORED_ENTRY_LEN);
                encoder.write_u8(TAG_ENTRY);
                entry.header.encode_into(&mut encoder);
                encoder.write_u32_le(entry.height);
                encoder.write_bytes(&entry.chainwork.to_big_endian());
                encoder.into_inner()
            }
        }
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, DecodeError> {
        let mut decoder = Decoder::new(bytes);
        let tag = decoder.read_u8()?;
        let header = BlockHeader::decode_from(&mut decoder)?;
        let stored = match tag {
            TAG_HEADER => StoredBlock::Header(header),
            TAG_ENTRY => {
                let height = decoder.read_u32_le()?;
                let chainwork = decoder.read_fixed::<32>()?;
                StoredBlock::Entry(ChainEntry {
                    header,
                    height,
                    chainwork: U256::from_big_endian(&chainwork),
                })
            }
            _ => return Err(DecodeError::InvalidData("unknown stored block tag")),
        };
        if !decoder.is_empty() {
            return Err(DecodeError::TrailingBytes);
        }
        Ok(stored)
    }
}
