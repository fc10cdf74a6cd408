//! Message handlers invoked by the consumer loop.

use std::future::Future;

use async_trait::async_trait;
use tracing::{info, warn};

use crate::envelope::{Envelope, APPLICATION_JSON};

/// Processes one envelope at a time.
///
/// Returning `Ok` acknowledges the delivery. Returning `Err` stops the
/// consumer and hands the envelope back to the broker, so it may be seen
/// again: handlers must tolerate duplicates.
#[async_trait]
pub trait Handler: Send + Sync {
    async fn handle(&self, envelope: Envelope) -> anyhow::Result<()>;
}

#[async_trait]
impl<F, Fut> Handler for F
where
    F: Fn(Envelope) -> Fut + Send + Sync,
    Fut: Future<Output = anyhow::Result<()>> + Send,
{
    async fn handle(&self, envelope: Envelope) -> anyhow::Result<()> {
        (self)(envelope).await
    }
}

/// Logs every received message and accepts it.
#[derive(Debug, Clone, Copy, Default)]
pub struct LogHandler;

#[async_trait]
impl Handler for LogHandler {
    async fn handle(&self, envelope: Envelope) -> anyhow::Result<()> {
        if envelope.content_type() == APPLICATION_JSON {
            match serde_json::from_slice::<serde_json::Value>(envelope.body()) {
                Ok(value) => {
                    info!(
                        routing_key = %envelope.routing_key(),
                        content_type = %envelope.content_type(),
                        body = %value,
                        "event_received"
                    );
                    return Ok(());
                }
                Err(e) => warn!(
                    routing_key = %envelope.routing_key(),
                    error = %e,
                    "event_body_not_json"
                ),
            }
        }

        info!(
            routing_key = %envelope.routing_key(),
            content_type = %envelope.content_type(),
            body = %envelope.body_text(),
            "event_received"
        );
        Ok(())
    }
}
