use chrono::Utc;
use serde::{de::DeserializeOwned, Serialize};
use uuid::Uuid;

use crate::errors::Result;

pub const JSON_CONTENT_TYPE: &str = "application/json";

/// Transport metadata carried alongside a message body.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct MessageProperties {
    pub content_type: Option<String>,
    pub correlation_id: Option<String>,
    pub reply_to: Option<String>,
    pub message_id: Option<String>,
    pub timestamp: Option<u64>,
}

impl MessageProperties {
    /// Properties stamped on every outgoing message: JSON content type, fresh id, current time.
    pub fn json() -> Self {
        MessageProperties {
            content_type: Some(JSON_CONTENT_TYPE.to_string()),
            message_id: Some(Uuid::new_v4().to_string()),
            timestamp: Some(Utc::now().timestamp() as u64),
            ..MessageProperties::default()
        }
    }

    pub fn with_correlation_id(mut self, correlation_id: impl Into<String>) -> Self {
        self.correlation_id = Some(correlation_id.into());
        self
    }

    pub fn with_reply_to(mut self, reply_to: impl Into<String>) -> Self {
        self.reply_to = Some(reply_to.into());
        self
    }

    /// Overlays the fields set in `other` on top of `self`.
    pub fn merge(mut self, other: MessageProperties) -> Self {
        if other.content_type.is_some() {
            self.content_type = other.content_type;
        }
        if other.correlation_id.is_some() {
            self.correlation_id = other.correlation_id;
        }
        if other.reply_to.is_some() {
            self.reply_to = other.reply_to;
        }
        if other.message_id.is_some() {
            self.message_id = other.message_id;
        }
        if other.timestamp.is_some() {
            self.timestamp = other.timestamp;
        }
        self
    }
}

/// A message handed to a consumer by the broker.
#[derive(Clone, Debug)]
pub struct Delivery {
    pub delivery_tag: u64,
    pub exchange: String,
    pub routing_key: String,
    pub redelivered: bool,
    pub properties: MessageProperties,
    pub data: Vec<u8>,
}

impl Delivery {
    pub fn correlation_id(&self) -> Option<&str> {
        self.properties.correlation_id.as_deref()
    }

    pub fn reply_to(&self) -> Option<&str> {
        self.properties.reply_to.as_deref()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Parses the JSON body. An empty body decodes as JSON `null`.
    pub fn json<T: DeserializeOwned>(&self) -> Result<T> {
        decode(&self.data)
    }
}

pub fn encode<T: Serialize + ?Sized>(message: &T) -> Result<Vec<u8>> {
    Ok(serde_json::to_vec(message)?)
}

pub fn decode<T: DeserializeOwned>(data: &[u8]) -> Result<T> {
    if data.is_empty() {
        return Ok(serde_json::from_value(serde_json::Value::Null)?);
    }
    Ok(serde_json::from_slice(data)?)
}
