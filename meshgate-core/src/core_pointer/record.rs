/*
    PointerRecord - signed (key -> content reference, sequence) binding

    The key is an ed25519 public key; a record is valid only when its signature
    over (key, content_ref, sequence) verifies under that key. Readers compare
    records by sequence alone: higher wins.
*/

use ed25519_dalek::{Signature, Verifier, VerifyingKey};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use super::PointerError;
use crate::core_content::ContentRef;
use crate::core_identity::RegistryCredential;

const SIGNING_DOMAIN: &[u8] = b"meshgate-pointer-v1";

/// Identity of a named pointer: the writer's public key
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct PointerKey([u8; 32]);

impl PointerKey {
    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        PointerKey(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    pub fn verifying_key(&self) -> Result<VerifyingKey, PointerError> {
        VerifyingKey::from_bytes(&self.0)
            .map_err(|e| PointerError::InvalidRecord(format!("pointer key is not a valid public key: {}", e)))
    }
}

impl From<VerifyingKey> for PointerKey {
    fn from(key: VerifyingKey) -> Self {
        PointerKey(key.to_bytes())
    }
}

impl fmt::Display for PointerKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&bs58::encode(self.0).into_string())
    }
}

impl fmt::Debug for PointerKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PointerKey({})", self)
    }
}

impl FromStr for PointerKey {
    type Err = PointerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let raw = bs58::decode(s)
            .into_vec()
            .map_err(|e| PointerError::InvalidRecord(format!("pointer key {}: {}", s, e)))?;
        let bytes: [u8; 32] = raw.try_into().map_err(|v: Vec<u8>| {
            PointerError::InvalidRecord(format!("pointer key must be 32 bytes, got {}", v.len()))
        })?;
        Ok(PointerKey(bytes))
    }
}

impl TryFrom<String> for PointerKey {
    type Error = PointerError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<PointerKey> for String {
    fn from(value: PointerKey) -> Self {
        value.to_string()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PointerRecord {
    pub key: PointerKey,
    pub content_ref: ContentRef,
    pub sequence: u64,
    #[serde(with = "signature_hex")]
    pub signature: Vec<u8>,
}

impl PointerRecord {
    /// Sign a new record. Fails if `credential` does not own `key`.
    pub fn sign(
        key: PointerKey,
        content_ref: ContentRef,
        sequence: u64,
        credential: &RegistryCredential,
    ) -> Result<Self, PointerError> {
        if credential.pointer_key() != key {
            return Err(PointerError::Unauthorized(key));
        }
        let signature = credential.sign(&signing_bytes(&key, &content_ref, sequence));
        Ok(Self {
            key,
            content_ref,
            sequence,
            signature: signature.to_bytes().to_vec(),
        })
    }

    pub fn verify(&self) -> Result<(), PointerError> {
        let key = self.key.verifying_key()?;
        let signature = Signature::from_slice(&self.signature)
            .map_err(|e| PointerError::InvalidRecord(format!("bad signature encoding: {}", e)))?;
        key.verify(&signing_bytes(&self.key, &self.content_ref, self.sequence), &signature)
            .map_err(|_| PointerError::InvalidRecord(format!("signature mismatch at sequence {}", self.sequence)))
    }
}

fn signing_bytes(key: &PointerKey, content_ref: &ContentRef, sequence: u64) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(SIGNING_DOMAIN.len() + 32 + 32 + 8);
    bytes.extend_from_slice(SIGNING_DOMAIN);
    bytes.extend_from_slice(key.as_bytes());
    bytes.extend_from_slice(content_ref.as_bytes());
    bytes.extend_from_slice(&sequence.to_be_bytes());
    bytes
}

mod signature_hex {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&hex::encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let s = String::deserialize(deserializer)?;
        hex::decode(s).map_err(serde::de::Error::custom)
    }
}
