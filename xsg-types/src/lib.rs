pub mod hash;
pub mod header;
pub mod network;
pub mod u256;
pub mod utils;

pub use hash::{double_sha256, H256};
pub use header::{header_size, is_post_equihash_fork, Header, HDR_LEN, HDR_LEN_FORK};
pub use network::{Checkpoint, Network, NetworkParams, Target, Work};
pub use u256::U256;
