//! Message values exchanged with the broker.

use std::borrow::Cow;

/// Default content type for emitted messages.
pub const TEXT_PLAIN: &str = "text/plain";

/// Content type of messages published with `Emitter::publish_json`.
pub const APPLICATION_JSON: &str = "application/json";

/// A message body plus the metadata the broker routes and delivers it by.
///
/// Envelopes are immutable once built; the `with_*` methods consume and
/// return a new value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Envelope {
    body: Vec<u8>,
    routing_key: String,
    content_type: String,
    message_id: Option<String>,
    persistent: bool,
}

impl Envelope {
    /// A persistent `text/plain` envelope.
    pub fn new(body: impl Into<Vec<u8>>, routing_key: impl Into<String>) -> Self {
        Self {
            body: body.into(),
            routing_key: routing_key.into(),
            content_type: TEXT_PLAIN.to_string(),
            message_id: None,
            persistent: true,
        }
    }

    pub fn with_content_type(mut self, content_type: impl Into<String>) -> Self {
        self.content_type = content_type.into();
        self
    }

    pub fn with_message_id(mut self, message_id: impl Into<String>) -> Self {
        self.message_id = Some(message_id.into());
        self
    }

    /// Persistent messages survive a broker restart when their queue is durable.
    pub fn with_persistent(mut self, persistent: bool) -> Self {
        self.persistent = persistent;
        self
    }

    pub fn body(&self) -> &[u8] {
        &self.body
    }

    /// The body decoded as UTF-8, with invalid sequences replaced.
    pub fn body_text(&self) -> Cow<'_, str> {
        String::from_utf8_lossy(&self.body)
    }

    pub fn into_body(self) -> Vec<u8> {
        self.body
    }

    pub fn routing_key(&self) -> &str {
        &self.routing_key
    }

    pub fn content_type(&self) -> &str {
        &self.content_type
    }

    pub fn message_id(&self) -> Option<&str> {
        self.message_id.as_deref()
    }

    pub fn is_persistent(&self) -> bool {
        self.persistent
    }
}

/// An envelope handed to a consumer, tagged for acknowledgement.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
    /// Channel-scoped tag used to ack or reject this delivery.
    pub delivery_tag: u64,
    /// Set when the broker has handed this envelope out before.
    pub redelivered: bool,
    pub envelope: Envelope,
}
