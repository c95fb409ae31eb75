use std::fmt;
use std::str::FromStr;

use borsh::{BorshDeserialize, BorshSerialize};
use serde::de::{self, Visitor};
use serde::{Deserialize, Serialize};

/// A 32-byte hash in natural (wire) byte order.
///
/// Block hashes are conventionally displayed reversed, the way block
/// explorers print them; `Display` and `FromStr` speak that reversed hex
/// form, while the inner bytes stay in the order they are hashed and
/// serialized in.
#[derive(BorshDeserialize, BorshSerialize, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Default)]
pub struct H256(pub [u8; 32]);

impl H256 {
    /// The all-zero hash: previous-block hash of the genesis block, and the
    /// hash of the virtual block at height -1.
    pub const ZERO: H256 = H256([0u8; 32]);
}

impl From<[u8; 32]> for H256 {
    fn from(bytes: [u8; 32]) -> Self {
        H256(bytes)
    }
}

impl TryFrom<Vec<u8>> for H256 {
    type Error = &'static str;

    fn try_from(value: Vec<u8>) -> Result<Self, Self::Error> {
        Ok(H256(value.try_into().map_err(|_| "Invalid hash length")?))
    }
}

impl fmt::Display for H256 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let reversed: Vec<u8> = self.0.iter().rev().copied().collect();
        f.write_str(&hex::encode(reversed))
    }
}

impl fmt::Debug for H256 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "H256({self})")
    }
}

impl FromStr for H256 {
    type Err = &'static str;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut bytes: Vec<u8> = hex::decode(s).map_err(|_| "Invalid hex string")?;
        bytes.reverse();
        H256::try_from(bytes)
    }
}

impl<'de> Deserialize<'de> for H256 {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        struct HexVisitor;

        impl<'de> Visitor<'de> for HexVisitor {
            type Value = H256;

            fn expecting(&self, formatter: &mut fmt::Formatter) -> fmt::Result {
                formatter.write_str("a reversed hex string")
            }

            fn visit_str<E>(self, v: &str) -> Result<Self::Value, E>
            where
                E: de::Error,
            {
                v.parse().map_err(de::Error::custom)
            }
        }

        deserializer.deserialize_str(HexVisitor)
    }
}

impl Serialize for H256 {
    fn serialize<S>(
        &self,
        serializer: S,
    ) -> Result<<S as serde::Serializer>::Ok, <S as serde::Serializer>::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(&self.to_string())
    }
}

pub fn double_sha256(input: &[u8]) -> H256 {
    use sha2::{Digest, Sha256};
    H256(Sha256::digest(Sha256::digest(input)).into())
}
