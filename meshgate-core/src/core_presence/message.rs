//! Presence topic payloads

use serde::{Deserialize, Serialize};

use super::PresenceError;

/// Everything that travels on the presence topic
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum PresenceMessage {
    Heartbeat(Heartbeat),
    Chat(ChatMessage),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Heartbeat {
    pub identity: String,
    pub display_name: String,
    /// Sender's wall clock, Unix milliseconds
    pub timestamp: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reach_address: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub name: String,
    pub text: String,
}

impl PresenceMessage {
    pub fn encode(&self) -> Result<Vec<u8>, PresenceError> {
        serde_json::to_vec(self).map_err(|e| PresenceError::Encode(e.to_string()))
    }

    pub fn decode(data: &[u8]) -> Result<Self, PresenceError> {
        serde_json::from_slice(data).map_err(|e| PresenceError::Malformed(e.to_string()))
    }
}
