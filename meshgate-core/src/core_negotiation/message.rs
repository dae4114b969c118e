//! Negotiation topic payloads
//!
//! JSON objects tagged by `type`. Replies from the responder carry the
//! `target` identity they are meant for; everybody else ignores them.
//! Blob contents travel base64 encoded.

use serde::{Deserialize, Serialize};

use super::NegotiationError;
use crate::core_content::ContentRef;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum NegotiationMessage {
    RequestWork,
    Assignment {
        target: String,
        refs: Vec<ContentRef>,
    },
    FetchData {
        #[serde(rename = "ref")]
        content_ref: ContentRef,
    },
    DataDelivery {
        target: String,
        #[serde(rename = "ref")]
        content_ref: ContentRef,
        #[serde(with = "base64_bytes")]
        content: Vec<u8>,
    },
    SubmitProof {
        #[serde(rename = "ref")]
        content_ref: ContentRef,
        #[serde(with = "base64_bytes")]
        content: Vec<u8>,
    },
    AccessGranted {
        target: String,
    },
}

impl NegotiationMessage {
    /// Wire name, used as a metrics label
    pub fn kind(&self) -> &'static str {
        match self {
            NegotiationMessage::RequestWork => "REQUEST_WORK",
            NegotiationMessage::Assignment { .. } => "ASSIGNMENT",
            NegotiationMessage::FetchData { .. } => "FETCH_DATA",
            NegotiationMessage::DataDelivery { .. } => "DATA_DELIVERY",
            NegotiationMessage::SubmitProof { .. } => "SUBMIT_PROOF",
            NegotiationMessage::AccessGranted { .. } => "ACCESS_GRANTED",
        }
    }

    /// Addressee of a responder reply
    pub fn target(&self) -> Option<&str> {
        match self {
            NegotiationMessage::Assignment { target, .. }
            | NegotiationMessage::DataDelivery { target, .. }
            | NegotiationMessage::AccessGranted { target } => Some(target),
            _ => None,
        }
    }

    pub fn encode(&self) -> Result<Vec<u8>, NegotiationError> {
        serde_json::to_vec(self).map_err(|e| NegotiationError::Encode(e.to_string()))
    }

    pub fn decode(data: &[u8]) -> Result<Self, NegotiationError> {
        serde_json::from_slice(data).map_err(|e| NegotiationError::Malformed(e.to_string()))
    }
}

mod base64_bytes {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let s = String::deserialize(deserializer)?;
        STANDARD.decode(s).map_err(serde::de::Error::custom)
    }
}
