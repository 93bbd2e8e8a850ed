use chrono::{DateTime, Utc};
use serde::{de::DeserializeOwned, Serialize};
use uuid::Uuid;

pub const JSON_CONTENT_TYPE: &str = "application/json";

/// A message ready to be handed to the broker.
#[derive(Clone, Debug)]
pub struct OutboundMessage {
    pub body: Vec<u8>,
    pub content_type: String,
    pub message_id: String,
    pub timestamp: DateTime<Utc>,
    /// Delivery mode 2: survive a broker restart when routed to a durable queue.
    pub persistent: bool,
}

impl OutboundMessage {
    /// Serializes `message` as JSON and stamps it with a fresh id and the current time.
    pub fn json<T: Serialize + ?Sized>(message: &T) -> Result<Self, serde_json::Error> {
        Ok(Self::raw(serde_json::to_vec(message)?, JSON_CONTENT_TYPE))
    }

    pub fn raw(body: Vec<u8>, content_type: &str) -> Self {
        OutboundMessage {
            body,
            content_type: content_type.to_string(),
            message_id: Uuid::new_v4().to_string(),
            timestamp: Utc::now(),
            persistent: true,
        }
    }
}

/// The payload and routing metadata of one delivery, as seen by handlers.
#[derive(Clone, Debug)]
pub struct InboundMessage {
    pub body: Vec<u8>,
    pub exchange: String,
    pub routing_key: String,
    pub delivery_tag: u64,
    pub redelivered: bool,
    pub content_type: Option<String>,
    pub message_id: Option<String>,
}

impl InboundMessage {
    pub fn json<T: DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        serde_json::from_slice(&self.body)
    }

    pub fn is_json(&self) -> bool {
        self.content_type.as_deref() == Some(JSON_CONTENT_TYPE)
    }
}
