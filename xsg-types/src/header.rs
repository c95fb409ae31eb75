use borsh::{BorshDeserialize, BorshSerialize};
use serde::{Deserialize, Serialize};

use crate::hash::{double_sha256, H256};
use crate::network::{Target, Work, EQUIHASH_FORK_HEIGHT};
use crate::utils::{self, InvalidBits};

/// Serialized length of a header before the Equihash fork: the fixed fields
/// plus the three-byte solution-size tag, with an empty solution.
pub const HDR_LEN: usize = 143;

/// Serialized length of a header from the Equihash fork onwards, carrying
/// the full 1344-byte solution.
pub const HDR_LEN_FORK: usize = 1487;

/// Byte length of the Equihash solution in post-fork headers.
pub const SOLUTION_LEN_FORK: usize = HDR_LEN_FORK - HDR_LEN;

#[must_use]
pub fn is_post_equihash_fork(height: i64) -> bool {
    height >= EQUIHASH_FORK_HEIGHT
}

/// The single source of truth for the on-disk size of a header record.
#[must_use]
pub fn header_size(height: i64) -> usize {
    if is_post_equihash_fork(height) {
        HDR_LEN_FORK
    } else {
        HDR_LEN
    }
}

/// A decoded header record fails to parse.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DecodeHeaderError {
    InvalidLength { expected: usize, actual: usize },
    InvalidSolutionSize,
}

impl std::fmt::Display for DecodeHeaderError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DecodeHeaderError::InvalidLength { expected, actual } => {
                write!(f, "invalid header length: {actual} (expected {expected})")
            }
            DecodeHeaderError::InvalidSolutionSize => write!(f, "invalid solution size tag"),
        }
    }
}

impl std::error::Error for DecodeHeaderError {}

/// A block header with its height attached at deserialization time.
///
/// `prev_block_hash` is the all-zero hash on genesis. The solution-size tag
/// that precedes the solution on the wire is not stored: it is a function of
/// the solution length, validated on decode and regenerated on encode.
#[derive(BorshDeserialize, BorshSerialize, Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct Header {
    /// Block version, repurposed for soft fork signalling.
    pub version: i32,
    /// Reference to the previous block in the chain.
    pub prev_block_hash: H256,
    /// The root hash of the merkle tree of transactions in the block.
    pub merkle_root: H256,
    /// The root hash of the block commitments tree.
    pub reserved_hash: H256,
    /// The timestamp of the block, as claimed by the miner.
    pub time: u32,
    /// The target value below which the blockhash must lie.
    pub bits: u32,
    /// The block's nonce (32 bytes, Equihash style).
    pub nonce: H256,
    /// The Equihash solution; empty before the format fork.
    #[serde(with = "hex::serde")]
    pub solution: Vec<u8>,
    /// Derived: the height this header was decoded at.
    pub block_height: i64,
}

impl Header {
    pub fn serialize(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(HDR_LEN + self.solution.len());
        out.extend_from_slice(&self.version.to_le_bytes());
        out.extend_from_slice(&self.prev_block_hash.0);
        out.extend_from_slice(&self.merkle_root.0);
        out.extend_from_slice(&self.reserved_hash.0);
        out.extend_from_slice(&self.time.to_le_bytes());
        out.extend_from_slice(&self.bits.to_le_bytes());
        out.extend_from_slice(&self.nonce.0);
        out.extend_from_slice(&solution_size_tag(self.solution.len()));
        out.extend_from_slice(&self.solution);
        out
    }

    /// Decodes a header record of exactly `header_size(height)` bytes and
    /// attaches the height.
    ///
    /// # Errors
    ///
    /// `DecodeHeaderError` on a length mismatch or when the solution-size
    /// tag disagrees with the solution length the format demands at this
    /// height.
    pub fn deserialize(data: &[u8], height: i64) -> Result<Self, DecodeHeaderError> {
        let expected = header_size(height);
        if data.len() != expected {
            return Err(DecodeHeaderError::InvalidLength {
                expected,
                actual: data.len(),
            });
        }

        let hash_at = |offset: usize| {
            let mut bytes = [0u8; 32];
            bytes.copy_from_slice(&data[offset..offset + 32]);
            H256(bytes)
        };

        let solution_len = expected - HDR_LEN;
        let mut tag = [0u8; 3];
        tag.copy_from_slice(&data[140..143]);
        if decode_solution_size_tag(&tag) != Some(solution_len) {
            return Err(DecodeHeaderError::InvalidSolutionSize);
        }

        Ok(Header {
            version: i32::from_le_bytes(data[0..4].try_into().unwrap()),
            prev_block_hash: hash_at(4),
            merkle_root: hash_at(36),
            reserved_hash: hash_at(68),
            time: u32::from_le_bytes(data[100..104].try_into().unwrap()),
            bits: u32::from_le_bytes(data[104..108].try_into().unwrap()),
            nonce: hash_at(108),
            solution: data[143..].to_vec(),
            block_height: height,
        })
    }

    #[must_use]
    pub fn block_hash(&self) -> H256 {
        double_sha256(&self.serialize())
    }

    /// The target this header claims via its compact `bits` field.
    ///
    /// # Errors
    ///
    /// `InvalidBits` when the compact encoding is out of range.
    pub fn target(&self) -> Result<Target, InvalidBits> {
        utils::target_from_bits(self.bits)
    }

    /// The work done to mine a block with this header's target.
    ///
    /// # Errors
    ///
    /// `InvalidBits` when the compact encoding is out of range.
    pub fn work(&self) -> Result<Work, InvalidBits> {
        Ok(self.target()?.inverse())
    }
}

/// Encodes a solution length as the fixed three-byte tag stored at bytes
/// 140..143: a Bitcoin compact-size prefix, zero-padded to the field width.
#[must_use]
pub fn solution_size_tag(len: usize) -> [u8; 3] {
    if len < 0xfd {
        [len as u8, 0, 0]
    } else {
        let le = (len as u16).to_le_bytes();
        [0xfd, le[0], le[1]]
    }
}

fn decode_solution_size_tag(tag: &[u8; 3]) -> Option<usize> {
    if tag[0] == 0xfd {
        Some(usize::from(u16::from_le_bytes([tag[1], tag[2]])))
    } else if tag[1] == 0 && tag[2] == 0 {
        Some(usize::from(tag[0]))
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn post_fork_header() -> Header {
        let mut solution: Vec<u8> = (0..=255u8).collect::<Vec<u8>>().repeat(5);
        solution.extend_from_slice(&[0u8; 64]);
        assert_eq!(solution.len(), SOLUTION_LEN_FORK);
        Header {
            version: 4,
            prev_block_hash: H256([0xaa; 32]),
            merkle_root: H256([0xbb; 32]),
            reserved_hash: H256([0xcc; 32]),
            time: 0x5cf0_0000,
            bits: 0x1f07_ffff,
            nonce: H256([0xdd; 32]),
            solution,
            block_height: EQUIHASH_FORK_HEIGHT,
        }
    }

    fn pre_fork_header() -> Header {
        Header {
            version: 4,
            prev_block_hash: H256([0xaa; 32]),
            merkle_root: H256([0xbb; 32]),
            reserved_hash: H256([0xcc; 32]),
            time: 1000,
            bits: 0x1f07_ffff,
            nonce: H256([0xdd; 32]),
            solution: Vec::new(),
            block_height: 100,
        }
    }

    #[test]
    fn sizes_switch_at_the_fork() {
        assert_eq!(header_size(0), HDR_LEN);
        assert_eq!(header_size(EQUIHASH_FORK_HEIGHT - 1), HDR_LEN);
        assert_eq!(header_size(EQUIHASH_FORK_HEIGHT), HDR_LEN_FORK);
        assert_eq!(header_size(-1), HDR_LEN);
    }

    #[test]
    fn round_trips_post_fork() {
        let header = post_fork_header();
        let raw = header.serialize();
        assert_eq!(raw.len(), HDR_LEN_FORK);
        assert_eq!(&raw[140..143], &[0xfd, 0x40, 0x05]);
        let decoded = Header::deserialize(&raw, header.block_height).unwrap();
        assert_eq!(decoded, header);
    }

    #[test]
    fn round_trips_pre_fork() {
        let header = pre_fork_header();
        let raw = header.serialize();
        assert_eq!(raw.len(), HDR_LEN);
        assert_eq!(&raw[140..143], &[0, 0, 0]);
        let decoded = Header::deserialize(&raw, header.block_height).unwrap();
        assert_eq!(decoded, header);
    }

    #[test]
    fn known_block_hashes() {
        assert_eq!(
            post_fork_header().block_hash().to_string(),
            "4005d551827a293ab633f244339523e7789ade93c277ceb5793b2ba1451e43a4"
        );
        assert_eq!(
            pre_fork_header().block_hash().to_string(),
            "68c2ea896ba44b9d85ef2b0daf4d79a23dd2bc7201c409cca943a473d3538e1a"
        );
    }

    #[test]
    fn rejects_wrong_length() {
        let raw = post_fork_header().serialize();
        assert_eq!(
            Header::deserialize(&raw, 100),
            Err(DecodeHeaderError::InvalidLength {
                expected: HDR_LEN,
                actual: HDR_LEN_FORK,
            })
        );
        assert!(matches!(
            Header::deserialize(&raw[..HDR_LEN_FORK - 1], EQUIHASH_FORK_HEIGHT),
            Err(DecodeHeaderError::InvalidLength { .. })
        ));
    }

    #[test]
    fn rejects_bad_solution_size_tag() {
        let mut raw = post_fork_header().serialize();
        raw[140] = 0x00;
        assert_eq!(
            Header::deserialize(&raw, EQUIHASH_FORK_HEIGHT),
            Err(DecodeHeaderError::InvalidSolutionSize)
        );
    }

    #[test]
    fn deserializes_from_json_fixture() {
        let header: Header = serde_json::from_value(json!({
            "version": 4,
            "prev_block_hash": "aaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaa",
            "merkle_root": "bbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbb",
            "reserved_hash": "cccccccccccccccccccccccccccccccccccccccccccccccccccccccccccccccc",
            "time": 1000,
            "bits": 0x1f07ffffu32,
            "nonce": "dddddddddddddddddddddddddddddddddddddddddddddddddddddddddddddddd",
            "solution": "",
            "block_height": 100,
        }))
        .unwrap();
        assert_eq!(header, pre_fork_header());
    }
}
