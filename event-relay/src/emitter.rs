//! Publishing side: declares the topic exchange and publishes envelopes to it.

use serde::Serialize;
use tracing::{info, warn};

use crate::broker::{Channel, Connection};
use crate::envelope::{Envelope, APPLICATION_JSON, TEXT_PLAIN};
use crate::error::{BrokerError, DeclareError, PublishError, SetupError};
use crate::topology::{validate_routing_key, ExchangeSpec};

/// How an [`Emitter`] sets up its channel and stamps outgoing envelopes.
#[derive(Debug, Clone)]
pub struct EmitterSettings {
    pub exchange: ExchangeSpec,
    /// Content type used by [`Emitter::publish`].
    pub content_type: String,
    /// Wait for a broker ack on every publish.
    pub publisher_confirms: bool,
}

impl EmitterSettings {
    pub fn new(exchange: ExchangeSpec) -> Self {
        Self {
            exchange,
            content_type: TEXT_PLAIN.to_string(),
            publisher_confirms: true,
        }
    }
}

/// Publishes envelopes to one exchange over a channel it owns.
///
/// Publishing is not retried; a [`PublishError`] goes back to the caller,
/// who decides whether to retry or drop the message.
pub struct Emitter<C: Channel> {
    channel: C,
    settings: EmitterSettings,
}

impl<C: Channel> Emitter<C> {
    /// Open a publishing channel on `connection` and declare the exchange.
    pub async fn open<K>(connection: &K, settings: EmitterSettings) -> Result<Self, SetupError>
    where
        K: Connection<Channel = C>,
    {
        let channel = connection
            .open_channel()
            .await
            .map_err(SetupError::Channel)?;

        if let Err(e) = Self::prepare(&channel, &settings).await {
            let _ = channel.close().await;
            return Err(e);
        }

        info!(
            exchange = %settings.exchange.name,
            kind = %settings.exchange.kind,
            durable = settings.exchange.durable,
            publisher_confirms = settings.publisher_confirms,
            "emitter_ready"
        );

        Ok(Self { channel, settings })
    }

    async fn prepare(channel: &C, settings: &EmitterSettings) -> Result<(), SetupError> {
        if settings.publisher_confirms {
            channel
                .confirm_select()
                .await
                .map_err(SetupError::Configure)?;
        }

        let exchange = &settings.exchange;
        channel
            .declare_exchange(exchange)
            .await
            .map_err(|e| SetupError::Declare {
                entity: "exchange",
                name: exchange.name.clone(),
                source: DeclareError::from_broker(&exchange.name, e),
            })
    }

    pub fn exchange(&self) -> &ExchangeSpec {
        &self.settings.exchange
    }

    /// Publish `body` with the configured content type.
    pub async fn publish(
        &self,
        body: impl Into<Vec<u8>>,
        routing_key: &str,
    ) -> Result<(), PublishError> {
        let envelope =
            Envelope::new(body, routing_key).with_content_type(self.settings.content_type.as_str());
        self.publish_envelope(&envelope).await
    }

    /// Publish `value` serialized as JSON.
    pub async fn publish_json<T: Serialize>(
        &self,
        value: &T,
        routing_key: &str,
    ) -> Result<(), PublishError> {
        let body = serde_json::to_vec(value)?;
        let envelope = Envelope::new(body, routing_key).with_content_type(APPLICATION_JSON);
        self.publish_envelope(&envelope).await
    }

    /// Publish a caller-built envelope as is.
    pub async fn publish_envelope(&self, envelope: &Envelope) -> Result<(), PublishError> {
        validate_routing_key(envelope.routing_key())?;

        let exchange = &self.settings.exchange.name;
        if let Err(e) = self.channel.publish(exchange, envelope).await {
            warn!(
                exchange = %exchange,
                routing_key = %envelope.routing_key(),
                error = %e,
                "event_publish_failed"
            );
            return Err(match e {
                BrokerError::Nacked => PublishError::Nacked {
                    exchange: exchange.clone(),
                    routing_key: envelope.routing_key().to_string(),
                },
                other => PublishError::Broker(other),
            });
        }

        info!(
            exchange = %exchange,
            routing_key = %envelope.routing_key(),
            content_type = %envelope.content_type(),
            body_length = envelope.body().len(),
            "event_published"
        );
        Ok(())
    }

    /// Release the publishing channel.
    pub async fn close(self) -> Result<(), BrokerError> {
        self.channel.close().await?;
        info!(exchange = %self.settings.exchange.name, "emitter_closed");
        Ok(())
    }
}
