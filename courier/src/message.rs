use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// String attributes carried next to a payload.
pub type Attributes = BTreeMap<String, String>;

/// A payload plus its attributes. Two messages are equal
/// when both the bytes and the attributes match.
#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq, Eq)]
pub struct Message {
    pub data: Vec<u8>,
    #[serde(default)]
    pub attributes: Attributes,
}

impl Message {
    pub fn new(data: impl Into<Vec<u8>>) -> Self {
        Self {
            data: data.into(),
            attributes: Attributes::new(),
        }
    }

    pub fn with_attribute(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.attributes.insert(key.into(), value.into());
        self
    }
}

/// Returned once the broker has accepted a publish.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublishReceipt {
    pub message_id: String,
}

/// A single delivery handed out by `pull`. The same message
/// may be delivered again under a new `ack_id`.
#[derive(Debug, Clone)]
pub struct ReceivedMessage {
    pub ack_id: String,
    pub message_id: String,
    pub message: Message,
    pub delivery_attempt: u32,
    /// Milliseconds since the unix epoch.
    pub publish_time: u128,
}

/// Wire form of a published message on a NATS subject.
#[derive(Serialize, Deserialize, Debug)]
pub(crate) struct Envelope {
    pub id: String,
    pub data: Vec<u8>,
    #[serde(default)]
    pub attributes: Attributes,
    pub published_at: u128,
}

impl Envelope {
    pub fn into_bytes(&self) -> serde_json::Result<Vec<u8>> {
        serde_json::to_vec(self)
    }

    pub fn from_bytes(bytes: &[u8]) -> serde_json::Result<Self> {
        serde_json::from_slice(bytes)
    }
}
