//! meshgate: presence, a shared registry and gated admission for
//! intermittently-connected peers

pub mod clock;
pub mod config;
pub mod core_content;
pub mod core_identity;
pub mod core_negotiation;
pub mod core_node;
pub mod core_pointer;
pub mod core_presence;
pub mod core_pubsub;
pub mod core_registry;
pub mod logging;
pub mod metrics;
pub mod shutdown;
pub mod test_utils;

pub use config::Config;
pub use core_identity::NodeIdentity;
pub use core_node::{LocalMesh, Node, NodeError, NodeServices, Relay, RunningNode};
pub use logging::{init_logging, LogLevel};
pub use shutdown::{ShutdownCoordinator, ShutdownSignal};
