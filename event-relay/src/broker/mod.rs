//! Broker capabilities.
//!
//! The emitter and consumer never talk to a broker directly. They hold a
//! [`Channel`] obtained from a [`Connection`], and each backend implements
//! both traits:
//!
//! - [`amqp`]: RabbitMQ (or any AMQP 0-9-1 broker) through lapin
//! - [`memory`]: an in-process broker built on [`Topology`](crate::topology::Topology)
//!
//! A channel is owned by exactly one emitter or consumer; the traits take
//! `&self` only because the underlying clients are internally synchronised.

pub mod amqp;
pub mod memory;

use async_trait::async_trait;
use futures::stream::BoxStream;

use crate::envelope::{Delivery, Envelope};
use crate::error::BrokerError;
use crate::topology::{BindingPattern, ExchangeSpec, QueueSpec};

/// Deliveries pushed by the broker for one consumer. Ends when the channel
/// or connection closes.
pub type DeliveryStream = BoxStream<'static, Result<Delivery, BrokerError>>;

/// A broker connection that hands out channels.
#[async_trait]
pub trait Connection: Send + Sync {
    type Channel: Channel;

    async fn open_channel(&self) -> Result<Self::Channel, BrokerError>;

    /// Close the connection and every channel opened from it.
    async fn close(&self) -> Result<(), BrokerError>;
}

/// A single channel on a broker connection.
#[async_trait]
pub trait Channel: Send + Sync {
    async fn declare_exchange(&self, spec: &ExchangeSpec) -> Result<(), BrokerError>;

    /// Declare a queue and return the name the broker assigned to it.
    async fn declare_queue(&self, spec: &QueueSpec) -> Result<String, BrokerError>;

    async fn bind(
        &self,
        queue: &str,
        exchange: &str,
        pattern: &BindingPattern,
    ) -> Result<(), BrokerError>;

    /// Limit unacknowledged deliveries outstanding on this channel.
    async fn qos(&self, prefetch_count: u16) -> Result<(), BrokerError>;

    /// Ask the broker to confirm every subsequent publish.
    async fn confirm_select(&self) -> Result<(), BrokerError>;

    /// Publish and wait until the broker has taken the message.
    async fn publish(&self, exchange: &str, envelope: &Envelope) -> Result<(), BrokerError>;

    async fn consume(&self, queue: &str, consumer_tag: &str)
        -> Result<DeliveryStream, BrokerError>;

    /// Stop the broker pushing to the consumer `consumer_tag`. Its stream
    /// ends; deliveries it already received stay unacknowledged.
    async fn cancel(&self, consumer_tag: &str) -> Result<(), BrokerError>;

    async fn ack(&self, delivery_tag: u64) -> Result<(), BrokerError>;

    /// Reject a delivery, optionally putting it back on its queue.
    async fn nack(&self, delivery_tag: u64, requeue: bool) -> Result<(), BrokerError>;

    async fn close(&self) -> Result<(), BrokerError>;
}
