//! File-backed header store and verifier for the SnowGem light client.
//!
//! Headers arrive from untrusted peers one at a time or in 200-header
//! chunks, are checked against linkage, retarget rules and proof of work,
//! and are persisted per branch. A registry of competing branches keeps
//! track of which one carries the highest tip, swapping files with the
//! trunk when a fork overtakes it.

pub mod chain;
pub mod config;
pub mod error;
pub mod manager;
pub mod retarget;

pub use chain::Blockchain;
pub use config::ClientConfig;
pub use error::{ChainError, Result};
pub use manager::{read_blockchains, ChainManager};
pub use retarget::ChunkHeaders;

pub(crate) const LOG_TARGET: &str = "blockchain";
