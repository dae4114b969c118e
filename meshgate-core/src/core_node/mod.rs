/*
    Node - one peer's runtime

    Startup order:
      1. validate configuration and load the registry credential; either
         failing is fatal and nothing else starts
      2. if negotiation is enabled, run the initiator to completion
      3. spawn presence and registry loops, which run until shutdown

    Negotiation and registry failures stay in their own loops; neither can
    stop the other. Relays run the responder side instead (see `Relay`).
*/

use std::sync::Arc;
use thiserror::Error;
use tokio::task::JoinHandle;
use tracing::{error, info};

mod mesh;

pub use mesh::LocalMesh;

use crate::clock::Clock;
use crate::config::{Config, ConfigError, NegotiationConfig};
use crate::core_content::{ContentError, ContentStore};
use crate::core_identity::{CredentialError, CredentialProvider, NodeIdentity};
use crate::core_negotiation::{
    Authorization, DataLibrary, Initiator, NegotiationError, Responder, ResponderEvent, ResponderService,
};
use crate::core_pointer::{NamedPointerStore, PointerKey};
use crate::core_presence::{PeerDialer, PresenceError, PresenceHandle, PresenceService};
use crate::core_pubsub::BroadcastChannel;
use crate::core_registry::{RegistryHandle, RegistryService, RegistrySynchronizer};
use crate::shutdown::ShutdownCoordinator;

#[derive(Debug, Error)]
pub enum NodeError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Credential(#[from] CredentialError),

    #[error("Negotiation failed: {0}")]
    Negotiation(#[from] NegotiationError),

    #[error("Presence failed: {0}")]
    Presence(#[from] PresenceError),

    #[error("Content store error: {0}")]
    Content(#[from] ContentError),

    #[error("Task failed: {0}")]
    Task(String),
}

/// External collaborators a node runs against
#[derive(Clone)]
pub struct NodeServices {
    pub channel: Arc<dyn BroadcastChannel>,
    pub pointers: Arc<dyn NamedPointerStore>,
    pub content: Arc<dyn ContentStore>,
    pub dialer: Arc<dyn PeerDialer>,
    pub clock: Arc<dyn Clock>,
    pub credentials: Arc<dyn CredentialProvider>,
}

pub struct Node {
    identity: NodeIdentity,
    config: Config,
    services: NodeServices,
}

impl Node {
    pub fn new(identity: NodeIdentity, config: Config, services: NodeServices) -> Result<Self, NodeError> {
        config.validate()?;
        Ok(Self {
            identity,
            config,
            services,
        })
    }

    pub fn identity(&self) -> &NodeIdentity {
        &self.identity
    }

    /// Bring the node online. Returns once negotiation (if any) is done and
    /// the long-running loops are spawned.
    pub async fn start(self, shutdown: &ShutdownCoordinator) -> Result<RunningNode, NodeError> {
        let credential = self.services.credentials.registry_credential().map_err(|e| {
            error!(
                provider = self.services.credentials.describe(),
                error = %e,
                "Registry credential unavailable"
            );
            e
        })?;
        info!(
            peer = ?self.identity,
            registry = %credential.pointer_key(),
            provider = self.services.credentials.describe(),
            "Starting node"
        );

        let authorization = if self.config.negotiation.enabled {
            let initiator = Initiator::new(
                self.services.channel.clone(),
                self.services.content.clone(),
                self.config.negotiation.clone(),
            );
            let mut listener = shutdown.subscribe();
            Some(initiator.run(&mut listener).await?)
        } else {
            None
        };

        let (presence, presence_handle) = PresenceService::new(
            self.identity.clone(),
            &self.config.presence,
            self.services.channel.clone(),
            self.services.dialer.clone(),
            self.services.clock.clone(),
        );
        let presence_task = tokio::spawn(presence.run(shutdown.subscribe()));

        let sync = RegistrySynchronizer::new(
            self.identity.display_name(),
            self.config.registry.clone(),
            credential,
            self.services.pointers.clone(),
            self.services.content.clone(),
            self.services.clock.clone(),
        );
        let registry_key = sync.pointer_key();
        let (registry, registry_handle) = RegistryService::new(sync, self.config.registry.sync_interval);
        let registry_task = tokio::spawn(registry.run(shutdown.subscribe()));

        Ok(RunningNode {
            identity: self.identity,
            authorization,
            registry_key,
            presence: presence_handle,
            registry: registry_handle,
            presence_task,
            registry_task,
        })
    }
}

/// Handles onto a started node
pub struct RunningNode {
    identity: NodeIdentity,
    authorization: Option<Authorization>,
    registry_key: PointerKey,
    presence: PresenceHandle,
    registry: RegistryHandle,
    presence_task: JoinHandle<Result<(), PresenceError>>,
    registry_task: JoinHandle<()>,
}

impl RunningNode {
    pub fn identity(&self) -> &NodeIdentity {
        &self.identity
    }

    /// How access was earned, when negotiation ran
    pub fn authorization(&self) -> Option<&Authorization> {
        self.authorization.as_ref()
    }

    pub fn registry_key(&self) -> PointerKey {
        self.registry_key
    }

    pub fn presence(&self) -> &PresenceHandle {
        &self.presence
    }

    pub fn registry(&self) -> &RegistryHandle {
        &self.registry
    }

    /// Wait for both loops to stop after shutdown
    pub async fn join(self) -> Result<(), NodeError> {
        let presence = self
            .presence_task
            .await
            .map_err(|e| NodeError::Task(e.to_string()))?;
        self.registry_task
            .await
            .map_err(|e| NodeError::Task(e.to_string()))?;
        presence?;
        info!(peer = ?self.identity, "Node stopped");
        Ok(())
    }
}

/// Gatekeeper peer: serves the responder side of the handshake
pub struct Relay {
    events: tokio::sync::broadcast::Receiver<ResponderEvent>,
    task: JoinHandle<Result<Responder, NegotiationError>>,
}

impl Relay {
    /// Generate the data library into `content` and start serving
    pub async fn start(
        config: &NegotiationConfig,
        channel: Arc<dyn BroadcastChannel>,
        content: &dyn ContentStore,
        shutdown: &ShutdownCoordinator,
    ) -> Result<Self, NodeError> {
        let library = DataLibrary::generate(config.library_size, content).await?;
        let responder = Responder::new(library, config.assignment_batch);
        let service = ResponderService::new(responder, channel, config);
        let events = service.events();
        let task = tokio::spawn(service.run(shutdown.subscribe()));
        Ok(Self { events, task })
    }

    pub fn events(&mut self) -> &mut tokio::sync::broadcast::Receiver<ResponderEvent> {
        &mut self.events
    }

    /// Wait for the responder to stop; returns its final session table
    pub async fn join(self) -> Result<Responder, NodeError> {
        let responder = self.task.await.map_err(|e| NodeError::Task(e.to_string()))??;
        Ok(responder)
    }
}
