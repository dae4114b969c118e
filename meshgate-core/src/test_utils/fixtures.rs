//! Test fixtures

use std::sync::Arc;

use crate::config::Config;
use crate::core_identity::{CredentialProvider, InMemoryCredentialProvider};
use crate::core_node::LocalMesh;
use crate::core_presence::PeerRecord;
use crate::core_registry::RegistryEntry;

/// Default configuration with `display_name` filled in
pub fn test_config(display_name: &str) -> Config {
    let mut config = Config::default();
    config.identity.display_name = display_name.to_string();
    config
}

/// Same as `test_config`, with the access handshake turned on
pub fn negotiating_config(display_name: &str) -> Config {
    let mut config = test_config(display_name);
    config.negotiation.enabled = true;
    config
}

/// One credential shared by every peer of the returned mesh
pub fn test_mesh() -> LocalMesh {
    let credentials: Arc<dyn CredentialProvider> = Arc::new(InMemoryCredentialProvider::generate());
    LocalMesh::new(credentials)
}

pub fn member_names(entries: &[RegistryEntry]) -> Vec<String> {
    entries.iter().map(|e| e.display_name.clone()).collect()
}

pub fn peer_names(peers: &[PeerRecord]) -> Vec<String> {
    peers.iter().map(|p| p.display_name.clone()).collect()
}
