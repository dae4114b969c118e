//! In-process mesh: every peer shares one broadcast hub, one pointer store
//! and one content store, the way peers on a real network share the overlay.

use std::sync::Arc;

use super::{Node, NodeError, NodeServices, Relay};
use crate::clock::{Clock, SystemClock};
use crate::config::{Config, NegotiationConfig};
use crate::core_content::MemoryContentStore;
use crate::core_identity::{CredentialProvider, NodeIdentity};
use crate::core_pointer::MemoryPointerStore;
use crate::core_presence::NoDialer;
use crate::core_pubsub::BroadcastHub;
use crate::shutdown::ShutdownCoordinator;

#[derive(Clone)]
pub struct LocalMesh {
    hub: BroadcastHub,
    pointers: MemoryPointerStore,
    content: MemoryContentStore,
    credentials: Arc<dyn CredentialProvider>,
    clock: Arc<dyn Clock>,
}

impl LocalMesh {
    /// All peers write the registry with the credential from `credentials`
    pub fn new(credentials: Arc<dyn CredentialProvider>) -> Self {
        Self {
            hub: BroadcastHub::new(),
            pointers: MemoryPointerStore::new(),
            content: MemoryContentStore::new(),
            credentials,
            clock: Arc::new(SystemClock::new()),
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn hub(&self) -> &BroadcastHub {
        &self.hub
    }

    pub fn pointers(&self) -> &MemoryPointerStore {
        &self.pointers
    }

    pub fn content(&self) -> &MemoryContentStore {
        &self.content
    }

    pub fn services(&self, identity: &str) -> NodeServices {
        NodeServices {
            channel: Arc::new(self.hub.endpoint(identity)),
            pointers: Arc::new(self.pointers.clone()),
            content: Arc::new(self.content.clone()),
            dialer: Arc::new(NoDialer),
            clock: self.clock.clone(),
            credentials: self.credentials.clone(),
        }
    }

    pub fn node(&self, identity: NodeIdentity, config: Config) -> Result<Node, NodeError> {
        let services = self.services(identity.identity());
        Node::new(identity, config, services)
    }

    pub async fn relay(
        &self,
        identity: &str,
        config: &NegotiationConfig,
        shutdown: &ShutdownCoordinator,
    ) -> Result<Relay, NodeError> {
        Relay::start(config, Arc::new(self.hub.endpoint(identity)), &self.content, shutdown).await
    }
}
