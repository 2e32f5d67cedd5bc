// src/rpc/caller.rs
use std::time::Duration;

use futures::StreamExt;
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use uuid::Uuid;

use crate::broker::{ChannelHandle, ConsumeOptions, ExchangeKind};
use crate::bus::Bus;
use crate::consumer::close_quietly;
use crate::errors::{BusError, Result};
use crate::message::{decode, MessageProperties};
use crate::publisher::ExchangePublish;
use crate::topology::{self, DURABLE_EXCHANGE, REPLY_EXCHANGE, REPLY_QUEUE};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallOptions {
    message_type: String,
    rpc_timeout: Option<Duration>,
}

impl CallOptions {
    pub fn new(message_type: impl Into<String>) -> Result<Self> {
        let message_type = message_type.into();
        if message_type.is_empty() {
            return Err(BusError::MissingField("options.messageType"));
        }
        Ok(CallOptions {
            message_type,
            rpc_timeout: None,
        })
    }

    /// Overrides the bus-wide RPC timeout for this call.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.rpc_timeout = Some(timeout);
        self
    }

    pub fn message_type(&self) -> &str {
        &self.message_type
    }
}

#[derive(Deserialize)]
struct ErrorReply {
    error: String,
}

/// Decodes a reply as `R`. When that fails and the body is an error
/// envelope, the responder's cause is returned instead.
fn decode_reply<R: DeserializeOwned>(message_type: &str, body: &[u8]) -> Result<R> {
    match decode(body) {
        Ok(reply) => Ok(reply),
        Err(e) => match serde_json::from_slice::<ErrorReply>(body) {
            Ok(ErrorReply { error }) => Err(BusError::HandlerError {
                message_type: message_type.to_string(),
                message: error,
            }),
            Err(_) => Err(e),
        },
    }
}

/// Reply infrastructure and correlation data for one call.
struct PendingCall<'a> {
    bus: &'a Bus,
    channel: &'a ChannelHandle,
    message_type: &'a str,
    reply_name: String,
    correlation_id: String,
}

impl PendingCall<'_> {
    /// Sets up the reply queue, sends the request and returns the body of the matching reply.
    async fn exchange<T: Serialize + ?Sized>(&self, message: &T) -> Result<Vec<u8>> {
        let events = self.bus.emitter();
        let channel = self.channel;

        channel
            .assert_exchange(&self.reply_name, ExchangeKind::Fanout, REPLY_EXCHANGE)
            .await?;
        events.debug(format!("asserted reply exchange {}", self.reply_name));

        channel.assert_queue(&self.reply_name, REPLY_QUEUE).await?;
        events.debug(format!("asserted reply queue {}", self.reply_name));

        channel.bind_queue(&self.reply_name, &self.reply_name, "").await?;
        events.debug(format!("bound reply queue {}", self.reply_name));

        // The reply queue is ours alone, no acks needed.
        let mut consumer = channel
            .consume(&self.reply_name, ConsumeOptions { no_ack: true })
            .await?;
        events.debug(format!("started consumer {}", self.reply_name));

        let request = ExchangePublish::new(self.message_type, ExchangeKind::Fanout, DURABLE_EXCHANGE)
            .with_properties(
                MessageProperties::default()
                    .with_correlation_id(self.correlation_id.as_str())
                    .with_reply_to(self.reply_name.as_str()),
            );
        self.bus.publish_to(message, &request).await?;

        while let Some(reply) = consumer.deliveries.next().await {
            let reply = reply?;
            events.debug("consuming reply message");
            if reply.correlation_id() == Some(self.correlation_id.as_str()) {
                return Ok(reply.data);
            }
            events.debug(format!(
                "ignoring reply with correlation id {:?}",
                reply.correlation_id()
            ));
        }
        Err(BusError::ReplyChannelClosed(self.message_type.to_string()))
    }
}

impl Bus {
    /// Sends `message` to whoever is bound to the message type and waits
    /// for the reply. An empty reply decodes as JSON `null`.
    ///
    /// A responder failure arrives as `{"error": "<cause>"}`. If `R` cannot
    /// hold that envelope the call fails with [`BusError::HandlerError`];
    /// `R = serde_json::Value` sees the envelope itself.
    ///
    /// The dedicated reply channel is closed whatever the outcome.
    pub async fn call<T, R>(&self, message: &T, options: &CallOptions) -> Result<R>
    where
        T: Serialize + ?Sized,
        R: DeserializeOwned,
    {
        let timeout = options.rpc_timeout.unwrap_or_else(|| self.config().rpc_timeout());
        let channel = self.get_consumer_channel().await?;
        let pending = PendingCall {
            bus: self,
            channel: &channel,
            message_type: &options.message_type,
            reply_name: topology::reply_name(self.client_prefix(), &options.message_type),
            correlation_id: Uuid::new_v4().to_string(),
        };

        let outcome = tokio::time::timeout(timeout, pending.exchange(message)).await;

        let events = self.emitter();
        events.debug("closing consumer channel");
        close_quietly(&channel, events, &pending.reply_name).await;

        match outcome {
            Ok(reply) => decode_reply(&options.message_type, &reply?),
            Err(_) => Err(BusError::Timeout {
                message_type: options.message_type.clone(),
                timeout_ms: timeout.as_millis() as u64,
            }),
        }
    }
}
