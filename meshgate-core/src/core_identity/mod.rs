//! Identity provider
//!
//! Supplies the two things the protocols need from the host: a stable
//! per-peer identity string, and the shared registry write credential.

use ed25519_dalek::SigningKey;
use rand::Rng;
use std::fmt;
use thiserror::Error;

mod credential;

pub use credential::{
    generate_registry_secret, provider_from_config, CredentialProvider,
    InMemoryCredentialProvider, RegistryCredential, SeedCredentialProvider, SEED_LEN,
};

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum CredentialError {
    #[error("Registry credential missing: {0}")]
    Missing(String),

    #[error("Registry credential malformed: {0}")]
    Malformed(String),
}

/// Who this peer is on the mesh
#[derive(Clone, PartialEq, Eq)]
pub struct NodeIdentity {
    identity: String,
    display_name: String,
}

impl NodeIdentity {
    pub fn new(identity: impl Into<String>, display_name: impl Into<String>) -> Self {
        Self {
            identity: identity.into(),
            display_name: display_name.into(),
        }
    }

    /// Fresh identity: base58 of a newly generated ed25519 public key
    pub fn generate(display_name: impl Into<String>) -> Self {
        let mut seed = [0u8; 32];
        rand::rng().fill(&mut seed);
        let public = SigningKey::from_bytes(&seed).verifying_key();
        Self::new(bs58::encode(public.as_bytes()).into_string(), display_name)
    }

    pub fn identity(&self) -> &str {
        &self.identity
    }

    pub fn display_name(&self) -> &str {
        &self.display_name
    }

    /// Last six characters of the identity, for log lines
    pub fn short(&self) -> &str {
        let start = self.identity.len().saturating_sub(6);
        self.identity.get(start..).unwrap_or(&self.identity)
    }
}

impl fmt::Debug for NodeIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}({})", self.display_name, self.short())
    }
}
