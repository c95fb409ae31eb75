use std::path::PathBuf;

use xsg_types::header::DecodeHeaderError;
use xsg_types::utils::InvalidBits;

pub type Result<T> = std::result::Result<T, ChainError>;

#[derive(Debug, thiserror::Error)]
pub enum ChainError {
    /// A header failed validation: bad length, bad linkage, wrong bits,
    /// insufficient proof of work. Aborts the enclosing chunk.
    #[error("invalid header: {0}")]
    InvalidHeader(String),

    /// A header the retarget window needs is in neither the in-flight
    /// context nor the store. Recoverable: `can_connect` turns it into a
    /// plain "no".
    #[error("missing header at height {0}")]
    MissingHeader(i64),

    /// The headers directory disappeared while the client was running.
    #[error("headers directory does not exist, was it deleted while running? expected at {0:?}")]
    HeadersDirNotFound(PathBuf),

    /// The headers directory is there but the chain's file is not.
    #[error("cannot find headers file but headers directory is there, should be at {0:?}")]
    HeadersFileNotFound(PathBuf),

    /// A chain swapped with its parent more times than there are chains.
    #[error("swapping fork with parent too many times: {0}")]
    SwapCycle(usize),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl From<DecodeHeaderError> for ChainError {
    fn from(err: DecodeHeaderError) -> Self {
        ChainError::InvalidHeader(err.to_string())
    }
}

impl From<InvalidBits> for ChainError {
    fn from(err: InvalidBits) -> Self {
        ChainError::InvalidHeader(err.to_string())
    }
}
