/*
    ContentRef - address of an immutable blob

    A reference is the blake3 digest of the bytes it names, so identical bytes
    always produce the same reference and a fetched blob can be checked against
    the reference it was requested by. On the wire it is the lowercase hex
    digest.
*/

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use super::ContentError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ContentRef([u8; 32]);

impl ContentRef {
    /// Reference for `data`
    pub fn for_bytes(data: &[u8]) -> Self {
        ContentRef(*blake3::hash(data).as_bytes())
    }

    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        ContentRef(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// True when `data` hashes to this reference
    pub fn matches(&self, data: &[u8]) -> bool {
        ContentRef::for_bytes(data) == *self
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// First 8 bytes, for log lines
    pub fn short(&self) -> String {
        hex::encode(&self.0[..8])
    }
}

impl fmt::Display for ContentRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl FromStr for ContentRef {
    type Err = ContentError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let raw = hex::decode(s).map_err(|e| ContentError::InvalidRef(format!("{}: {}", s, e)))?;
        let bytes: [u8; 32] = raw
            .try_into()
            .map_err(|v: Vec<u8>| ContentError::InvalidRef(format!("expected 32 bytes, got {}", v.len())))?;
        Ok(ContentRef(bytes))
    }
}

impl TryFrom<String> for ContentRef {
    type Error = ContentError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<ContentRef> for String {
    fn from(value: ContentRef) -> Self {
        value.to_hex()
    }
}
