//! Shared registry write credential
//!
//! Every peer allowed to publish the registry holds the same ed25519 seed.
//! The public half of that key *is* the registry's pointer identity, so
//! holding the seed is what makes a peer a legitimate writer.

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use ed25519_dalek::{Signature, Signer, SigningKey};
use rand::Rng;
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use zeroize::Zeroizing;

use super::CredentialError;
use crate::config::CredentialSource;
use crate::core_pointer::PointerKey;

/// Length of an ed25519 seed
pub const SEED_LEN: usize = 32;

/// Signing half of the registry pointer
#[derive(Clone)]
pub struct RegistryCredential {
    signing_key: SigningKey,
}

impl RegistryCredential {
    pub fn generate() -> Self {
        let mut seed = Zeroizing::new([0u8; SEED_LEN]);
        rand::rng().fill(&mut seed[..]);
        Self::from_seed(&seed)
    }

    pub fn from_seed(seed: &[u8; SEED_LEN]) -> Self {
        Self {
            signing_key: SigningKey::from_bytes(seed),
        }
    }

    /// Decode a base64 seed as printed by `generate_registry_secret`
    pub fn from_base64(encoded: &str) -> Result<Self, CredentialError> {
        let raw = Zeroizing::new(
            STANDARD
                .decode(encoded.trim())
                .map_err(|e| CredentialError::Malformed(format!("not base64: {}", e)))?,
        );
        if raw.len() != SEED_LEN {
            return Err(CredentialError::Malformed(format!(
                "seed must be {} bytes, got {}",
                SEED_LEN,
                raw.len()
            )));
        }
        let mut seed = Zeroizing::new([0u8; SEED_LEN]);
        seed.copy_from_slice(&raw);
        Ok(Self::from_seed(&seed))
    }

    pub fn to_base64(&self) -> Zeroizing<String> {
        Zeroizing::new(STANDARD.encode(self.signing_key.to_bytes()))
    }

    /// Identity of the registry pointer this credential may write
    pub fn pointer_key(&self) -> PointerKey {
        PointerKey::from(self.signing_key.verifying_key())
    }

    pub fn sign(&self, message: &[u8]) -> Signature {
        self.signing_key.sign(message)
    }
}

impl fmt::Debug for RegistryCredential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RegistryCredential")
            .field("pointer_key", &self.pointer_key())
            .finish_non_exhaustive()
    }
}

/// New shared secret for a registry, base64 encoded
pub fn generate_registry_secret() -> Zeroizing<String> {
    RegistryCredential::generate().to_base64()
}

/// Source of the registry credential, chosen once at construction
pub trait CredentialProvider: Send + Sync {
    fn registry_credential(&self) -> Result<RegistryCredential, CredentialError>;

    /// Short label for logs
    fn describe(&self) -> &'static str;
}

/// Reads an operator-supplied seed, inline or from a file
pub struct SeedCredentialProvider {
    source: SeedSource,
}

enum SeedSource {
    Inline(Zeroizing<String>),
    File(PathBuf),
}

impl SeedCredentialProvider {
    pub fn inline(secret: impl Into<String>) -> Self {
        Self {
            source: SeedSource::Inline(Zeroizing::new(secret.into())),
        }
    }

    pub fn file(path: impl Into<PathBuf>) -> Self {
        Self {
            source: SeedSource::File(path.into()),
        }
    }
}

impl CredentialProvider for SeedCredentialProvider {
    fn registry_credential(&self) -> Result<RegistryCredential, CredentialError> {
        match &self.source {
            SeedSource::Inline(secret) => {
                if secret.trim().is_empty() {
                    return Err(CredentialError::Missing("registry secret is empty".to_string()));
                }
                RegistryCredential::from_base64(secret)
            }
            SeedSource::File(path) => {
                let contents = Zeroizing::new(std::fs::read_to_string(path).map_err(|e| {
                    CredentialError::Missing(format!("{}: {}", path.display(), e))
                })?);
                RegistryCredential::from_base64(&contents)
            }
        }
    }

    fn describe(&self) -> &'static str {
        match self.source {
            SeedSource::Inline(_) => "seed",
            SeedSource::File(_) => "seed-file",
        }
    }
}

/// Holds a credential in memory; used for tests and single-process meshes
#[derive(Debug, Clone)]
pub struct InMemoryCredentialProvider {
    credential: RegistryCredential,
}

impl InMemoryCredentialProvider {
    pub fn new(credential: RegistryCredential) -> Self {
        Self { credential }
    }

    pub fn generate() -> Self {
        Self::new(RegistryCredential::generate())
    }
}

impl CredentialProvider for InMemoryCredentialProvider {
    fn registry_credential(&self) -> Result<RegistryCredential, CredentialError> {
        Ok(self.credential.clone())
    }

    fn describe(&self) -> &'static str {
        "in-memory"
    }
}

/// Provider selected by the configured source
pub fn provider_from_config(source: &CredentialSource) -> Arc<dyn CredentialProvider> {
    match source {
        CredentialSource::Seed { secret } => Arc::new(SeedCredentialProvider::inline(secret.clone())),
        CredentialSource::File { path } => Arc::new(SeedCredentialProvider::file(path.clone())),
        CredentialSource::InMemory => Arc::new(InMemoryCredentialProvider::generate()),
    }
}
