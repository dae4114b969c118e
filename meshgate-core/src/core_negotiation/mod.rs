//! Access negotiation handshake
//!
//! A new peer (the initiator) must retrieve data named by a gatekeeper (the
//! responder) and hand it back before it is let into the mesh. Both sides
//! talk over their own broadcast topic so presence traffic never interferes.

use thiserror::Error;

mod initiator;
mod message;
mod responder;

pub use initiator::{Authorization, Initiator, InitiatorAction, InitiatorMachine, InitiatorState};
pub use message::NegotiationMessage;
pub use responder::{
    Asset, DataLibrary, Handled, NegotiationSession, Responder, ResponderEvent, ResponderService,
    SessionState,
};

use crate::core_content::ContentError;
use crate::core_pubsub::BroadcastError;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum NegotiationError {
    #[error("Malformed negotiation message: {0}")]
    Malformed(String),

    #[error("Failed to encode negotiation message: {0}")]
    Encode(String),

    #[error("Gave up after {attempts} work requests without access")]
    RetryBudgetExhausted { attempts: u32 },

    #[error("Negotiation cancelled by shutdown")]
    Cancelled,

    #[error("Negotiation subscription closed")]
    SubscriptionClosed,

    #[error(transparent)]
    Broadcast(#[from] BroadcastError),

    #[error(transparent)]
    Content(#[from] ContentError),
}
