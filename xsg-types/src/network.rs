use borsh::{BorshDeserialize, BorshSerialize};
use serde::{Deserialize, Serialize};

use crate::hash::H256;
use crate::u256::U256;

pub type Target = U256;
pub type Work = U256;

/// Headers are exchanged and checkpointed in fixed chunks of this many
/// blocks.
pub const CHUNK_LEN: i64 = 200;

/// Height at which the serialized header grows to carry the full Equihash
/// solution. `header_size` is driven solely by this constant.
pub const EQUIHASH_FORK_HEIGHT: i64 = 266_000;

/// Last block of the first Equihash parameter epoch. The retarget function
/// pins the target to `MIN_TARGET` for the final averaging window of the
/// epoch.
pub const EH_EPOCH_1_END: i64 = 266_000;

/// First block governed by the LWMA-3 retarget instead of Digishield.
pub const LWMA_FORK_BLOCK: i64 = 765_000;

pub const POW_AVERAGING_WINDOW: i64 = 17;
pub const POW_MEDIAN_BLOCK_SPAN: i64 = 11;
pub const POW_MAX_ADJUST_DOWN: i64 = 32;
pub const POW_MAX_ADJUST_UP: i64 = 16;
pub const POW_DAMPING_FACTOR: i64 = 4;
pub const POW_TARGET_SPACING: i64 = 60;
pub const ZAWY_LWMA3_AVERAGING_WINDOW: i64 = 60;

pub const TARGET_CALC_BLOCKS: i64 = POW_AVERAGING_WINDOW + POW_MEDIAN_BLOCK_SPAN;

pub const AVERAGING_WINDOW_TIMESPAN: i64 = POW_AVERAGING_WINDOW * POW_TARGET_SPACING;

pub const MIN_ACTUAL_TIMESPAN: i64 = AVERAGING_WINDOW_TIMESPAN * (100 - POW_MAX_ADJUST_UP) / 100;

pub const MAX_ACTUAL_TIMESPAN: i64 = AVERAGING_WINDOW_TIMESPAN * (100 + POW_MAX_ADJUST_DOWN) / 100;

/// The proof-of-work limit: no block target may exceed this value
/// (compact form 0x1f07ffff).
pub const MAX_TARGET: Target = U256::new(
    0x0007_ffff_ffff_ffff_ffff_ffff_ffff_ffff,
    0xffff_ffff_ffff_ffff_ffff_ffff_ffff_ffff,
);

/// The floor applied over the Equihash epoch transition.
pub const MIN_TARGET: Target = U256::new(0x0007_ffff_0000_0000_0000_0000_0000_0000, 0);

const GENESIS_MAINNET: H256 = H256([
    0x02, 0x06, 0x26, 0x01, 0x43, 0x83, 0x8b, 0x5f, 0xf5, 0x2d, 0xc2, 0xeb, 0x7b, 0x4b, 0x80,
    0x99, 0xd4, 0xe4, 0xc9, 0x9d, 0xc3, 0xef, 0x19, 0x79, 0x42, 0x89, 0xa2, 0xcd, 0x4c, 0x10,
    0x07, 0x00,
]);

#[derive(Clone, Debug, Default, BorshDeserialize, BorshSerialize, Serialize, Deserialize)]
pub enum Network {
    #[default]
    Mainnet,
    #[cfg(feature = "testnet")]
    Testnet,
}

/// A `(hash, target)` pair compiled into the client: the hash of the last
/// block of a chunk and the target in force just after it. Headers at or
/// below `max_checkpoint()` are trusted without re-verification.
#[derive(Clone, Debug, PartialEq, Eq, BorshDeserialize, BorshSerialize, Serialize, Deserialize)]
pub struct Checkpoint {
    pub hash: H256,
    pub target: Target,
}

#[derive(Clone, Debug, BorshDeserialize, BorshSerialize, Serialize, Deserialize)]
pub struct NetworkParams {
    pub genesis: H256,
    pub testnet: bool,
    pub checkpoints: Vec<Checkpoint>,
}

impl NetworkParams {
    #[must_use]
    pub fn new(network: &Network) -> Self {
        match network {
            Network::Mainnet => NetworkParams {
                genesis: GENESIS_MAINNET,
                testnet: false,
                checkpoints: Vec::new(),
            },
            #[cfg(feature = "testnet")]
            Network::Testnet => NetworkParams {
                genesis: H256::ZERO,
                testnet: true,
                checkpoints: Vec::new(),
            },
        }
    }

    /// Installs a vetted checkpoint list (one entry per full chunk).
    #[must_use]
    pub fn with_checkpoints(mut self, checkpoints: Vec<Checkpoint>) -> Self {
        self.checkpoints = checkpoints;
        self
    }

    /// The highest checkpointed block height, 0 when no checkpoints are
    /// compiled in.
    #[must_use]
    pub fn max_checkpoint(&self) -> i64 {
        (self.checkpoints.len() as i64 * CHUNK_LEN - 1).max(0)
    }
}
