//! Consuming side: declares and binds a queue, then feeds its deliveries to a
//! handler one at a time.
//!
//! A consumer walks a fixed sequence of states:
//!
//! ```text
//! Created → ChannelOpen → ExchangeDeclared → QueueBound → Listening → Cancelled
//!                                                                   ↘ Failed
//! ```
//!
//! Only a `Listening` consumer yields deliveries. A delivery is acknowledged
//! after its handler succeeds and never before, which makes delivery
//! at-least-once: if the process dies between the handler finishing and the
//! ack reaching the broker, the envelope is delivered again.

use std::convert::Infallible;

use futures::StreamExt;
use tracing::{debug, error, info, warn};

use crate::broker::{Channel, Connection, DeliveryStream};
use crate::envelope::Delivery;
use crate::error::{BindError, BrokerError, DeclareError, ListenError, SetupError, StateError};
use crate::handler::Handler;
use crate::topology::{BindingPattern, ExchangeSpec, QueueSpec};

/// Consumer tag used when none is configured.
pub const DEFAULT_CONSUMER_TAG: &str = "event-relay";

/// Lifecycle of a [`Consumer`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConsumerState {
    Created,
    ChannelOpen,
    ExchangeDeclared,
    QueueBound,
    Listening,
    Cancelled,
    Failed,
}

/// What a [`Consumer`] declares and how it consumes.
#[derive(Debug, Clone)]
pub struct ConsumerSettings {
    pub exchange: ExchangeSpec,
    pub queue: QueueSpec,
    pub consumer_tag: String,
    /// Unacknowledged deliveries the broker may push ahead; 1 keeps
    /// processing strictly serial.
    pub prefetch_count: u16,
}

impl ConsumerSettings {
    pub fn new(exchange: ExchangeSpec, queue: QueueSpec) -> Self {
        Self {
            exchange,
            queue,
            consumer_tag: DEFAULT_CONSUMER_TAG.to_string(),
            prefetch_count: 1,
        }
    }
}

/// Owns a consuming channel and the queue declared on it.
pub struct Consumer<C: Channel> {
    channel: C,
    settings: ConsumerSettings,
    queue_name: String,
    bindings: Vec<BindingPattern>,
    state: ConsumerState,
}

impl<C: Channel> Consumer<C> {
    /// Open a channel on `connection`, declare the exchange and the queue.
    pub async fn open<K>(connection: &K, settings: ConsumerSettings) -> Result<Self, SetupError>
    where
        K: Connection<Channel = C>,
    {
        let channel = connection
            .open_channel()
            .await
            .map_err(SetupError::Channel)?;

        let mut consumer = Self {
            channel,
            settings,
            queue_name: String::new(),
            bindings: Vec::new(),
            state: ConsumerState::Created,
        };
        consumer.transition(ConsumerState::ChannelOpen);

        if let Err(e) = consumer.prepare().await {
            consumer.transition(ConsumerState::Failed);
            let _ = consumer.channel.close().await;
            return Err(e);
        }

        Ok(consumer)
    }

    async fn prepare(&mut self) -> Result<(), SetupError> {
        self.channel
            .qos(self.settings.prefetch_count)
            .await
            .map_err(SetupError::Configure)?;

        let exchange = &self.settings.exchange;
        self.channel
            .declare_exchange(exchange)
            .await
            .map_err(|e| SetupError::Declare {
                entity: "exchange",
                name: exchange.name.clone(),
                source: DeclareError::from_broker(&exchange.name, e),
            })?;
        self.transition(ConsumerState::ExchangeDeclared);

        let queue = &self.settings.queue;
        let name = self
            .channel
            .declare_queue(queue)
            .await
            .map_err(|e| SetupError::Declare {
                entity: "queue",
                name: queue.wire_name().to_string(),
                source: DeclareError::from_broker(queue.wire_name(), e),
            })?;

        info!(
            queue = %name,
            durable = queue.durable,
            exclusive = queue.exclusive,
            auto_delete = queue.auto_delete,
            "queue_declared"
        );
        self.queue_name = name;
        Ok(())
    }

    pub fn state(&self) -> ConsumerState {
        self.state
    }

    /// Name of the declared queue (broker-generated for anonymous queues).
    pub fn queue_name(&self) -> &str {
        &self.queue_name
    }

    pub fn bindings(&self) -> &[BindingPattern] {
        &self.bindings
    }

    pub fn settings(&self) -> &ConsumerSettings {
        &self.settings
    }

    fn transition(&mut self, next: ConsumerState) {
        debug!(
            queue = %self.queue_name,
            from = ?self.state,
            to = ?next,
            "consumer_state_changed"
        );
        self.state = next;
    }

    fn require(
        &self,
        operation: &'static str,
        allowed: &[ConsumerState],
    ) -> Result<(), StateError> {
        if allowed.contains(&self.state) {
            Ok(())
        } else {
            Err(StateError {
                operation,
                state: self.state,
            })
        }
    }

    /// Bind the queue to the exchange with each pattern.
    ///
    /// With no patterns the queue is bound to `#` unless it already has
    /// bindings. Patterns already bound are skipped. All patterns are
    /// validated before any binding is made.
    pub async fn bind<S: AsRef<str>>(&mut self, patterns: &[S]) -> Result<(), BindError> {
        self.require(
            "bind",
            &[ConsumerState::ExchangeDeclared, ConsumerState::QueueBound],
        )?;

        let mut parsed = patterns
            .iter()
            .map(|p| BindingPattern::parse(p.as_ref()))
            .collect::<Result<Vec<_>, _>>()?;
        if parsed.is_empty() && self.bindings.is_empty() {
            parsed.push(BindingPattern::catch_all());
        }

        let exchange = self.settings.exchange.name.clone();
        for pattern in parsed {
            if self.bindings.contains(&pattern) {
                continue;
            }
            if let Err(e) = self.channel.bind(&self.queue_name, &exchange, &pattern).await {
                warn!(
                    queue = %self.queue_name,
                    exchange = %exchange,
                    pattern = %pattern,
                    error = %e,
                    "queue_bind_failed"
                );
                return Err(e.into());
            }
            info!(
                queue = %self.queue_name,
                exchange = %exchange,
                pattern = %pattern,
                "queue_bound"
            );
            self.bindings.push(pattern);
        }

        if self.state == ConsumerState::ExchangeDeclared && !self.bindings.is_empty() {
            self.transition(ConsumerState::QueueBound);
        }
        Ok(())
    }

    /// Start consuming and return the lazy sequence of deliveries.
    pub async fn deliveries(&mut self) -> Result<Deliveries<'_, C>, ListenError> {
        self.require("consume", &[ConsumerState::QueueBound])?;

        let stream = match self
            .channel
            .consume(&self.queue_name, &self.settings.consumer_tag)
            .await
        {
            Ok(stream) => stream,
            Err(e) => {
                self.transition(ConsumerState::Failed);
                return Err(ListenError::Broker(e));
            }
        };

        self.transition(ConsumerState::Listening);
        info!(
            queue = %self.queue_name,
            consumer_tag = %self.settings.consumer_tag,
            "consumer_started"
        );

        Ok(Deliveries {
            consumer: self,
            stream,
        })
    }

    /// Bind `patterns` (`#` when empty) and hand every delivery to `handler`
    /// until the channel closes or the handler fails.
    ///
    /// A delivery is acked only after `handler` returns `Ok`. On handler
    /// failure it is rejected with requeue and the loop stops with
    /// [`ListenError::Handler`]; the broker will deliver it again.
    pub async fn listen<S, H>(&mut self, patterns: &[S], handler: H) -> Result<Infallible, ListenError>
    where
        S: AsRef<str>,
        H: Handler,
    {
        self.bind(patterns).await?;
        let mut deliveries = self.deliveries().await?;

        loop {
            let Delivery {
                delivery_tag,
                redelivered,
                envelope,
            } = match deliveries.next().await {
                Some(Ok(delivery)) => delivery,
                Some(Err(e)) => return Err(e),
                None => return Err(ListenError::Cancelled),
            };

            debug!(
                delivery_tag,
                redelivered,
                routing_key = %envelope.routing_key(),
                body_length = envelope.body().len(),
                "event_delivered"
            );

            if let Err(e) = handler.handle(envelope).await {
                error!(delivery_tag, error = %e, "handler_failed");
                // Cancel first so the broker hands the requeued delivery to
                // another consumer rather than back to this one.
                deliveries.fail().await;
                if let Err(nack_err) = deliveries.reject(delivery_tag, true).await {
                    error!(delivery_tag, error = %nack_err, "nack_failed");
                }
                return Err(ListenError::Handler {
                    delivery_tag,
                    source: e.into(),
                });
            }

            deliveries.ack(delivery_tag).await?;
        }
    }

    /// Close the consuming channel. Unacknowledged deliveries go back to
    /// the queue.
    pub async fn close(self) -> Result<(), BrokerError> {
        self.channel.close().await?;
        info!(queue = %self.queue_name, "consumer_closed");
        Ok(())
    }
}

/// Deliveries of a listening [`Consumer`], pulled one at a time.
///
/// Ends (returns `None`) once the channel or connection is closed, leaving
/// the consumer `Cancelled`.
pub struct Deliveries<'a, C: Channel> {
    consumer: &'a mut Consumer<C>,
    stream: DeliveryStream,
}

impl<'a, C: Channel> Deliveries<'a, C> {
    pub fn state(&self) -> ConsumerState {
        self.consumer.state
    }

    /// Wait for the next delivery.
    pub async fn next(&mut self) -> Option<Result<Delivery, ListenError>> {
        if self.consumer.state != ConsumerState::Listening {
            return None;
        }

        match self.stream.next().await {
            Some(Ok(delivery)) => Some(Ok(delivery)),
            Some(Err(BrokerError::Closed)) | None => {
                warn!(queue = %self.consumer.queue_name, "consumer_cancelled");
                self.consumer.transition(ConsumerState::Cancelled);
                None
            }
            Some(Err(e)) => {
                error!(queue = %self.consumer.queue_name, error = %e, "delivery_error");
                self.fail().await;
                Some(Err(ListenError::Broker(e)))
            }
        }
    }

    /// Acknowledge a processed delivery.
    pub async fn ack(&mut self, delivery_tag: u64) -> Result<(), ListenError> {
        match self.consumer.channel.ack(delivery_tag).await {
            Ok(()) => Ok(()),
            Err(BrokerError::Closed) => {
                self.consumer.transition(ConsumerState::Cancelled);
                Err(ListenError::Cancelled)
            }
            Err(source) => {
                error!(delivery_tag, error = %source, "ack_failed");
                self.fail().await;
                Err(ListenError::Ack {
                    delivery_tag,
                    source,
                })
            }
        }
    }

    /// Reject a delivery; with `requeue` the broker delivers it again.
    pub async fn reject(&mut self, delivery_tag: u64, requeue: bool) -> Result<(), ListenError> {
        self.consumer
            .channel
            .nack(delivery_tag, requeue)
            .await
            .map_err(ListenError::Broker)
    }

    /// Stop yielding deliveries after an unrecoverable processing error and
    /// cancel the broker-side consumer. Deliveries already received stay
    /// unacknowledged until acked, rejected or the channel closes.
    pub async fn fail(&mut self) {
        if self.consumer.state != ConsumerState::Listening {
            return;
        }
        self.consumer.transition(ConsumerState::Failed);

        let tag = &self.consumer.settings.consumer_tag;
        if let Err(e) = self.consumer.channel.cancel(tag).await {
            warn!(queue = %self.consumer.queue_name, consumer_tag = %tag, error = %e, "consumer_cancel_failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::memory::{MemoryBroker, MemoryChannel, MemoryConnection};
    use crate::envelope::Envelope;
    use crate::handler::LogHandler;

    fn settings() -> ConsumerSettings {
        ConsumerSettings::new(ExchangeSpec::topic("logs_topic"), QueueSpec::anonymous())
    }

    async fn open(broker: &MemoryBroker) -> (MemoryConnection, Consumer<MemoryChannel>) {
        let connection = broker.connect();
        let consumer = Consumer::open(&connection, settings()).await.unwrap();
        (connection, consumer)
    }

    #[tokio::test]
    async fn test_open_reaches_exchange_declared() {
        let broker = MemoryBroker::new();
        let (_connection, consumer) = open(&broker).await;
        assert_eq!(consumer.state(), ConsumerState::ExchangeDeclared);
        assert!(consumer.queue_name().starts_with("amq.gen-"));
        assert!(broker.has_queue(consumer.queue_name()));
    }

    #[tokio::test]
    async fn test_open_fails_on_queue_conflict() {
        let broker = MemoryBroker::new();
        let connection = broker.connect();
        let durable = ConsumerSettings::new(
            ExchangeSpec::topic("logs_topic"),
            QueueSpec::named("audit"),
        );
        Consumer::open(&connection, durable).await.unwrap();

        let transient = ConsumerSettings::new(
            ExchangeSpec::topic("logs_topic"),
            QueueSpec::named("audit").with_durable(false),
        );
        let err = Consumer::open(&connection, transient).await.err().unwrap();
        assert!(matches!(
            err,
            SetupError::Declare {
                entity: "queue",
                source: DeclareError::Conflict { .. },
                ..
            }
        ));
    }

    #[tokio::test]
    async fn test_bind_defaults_to_catch_all() {
        let broker = MemoryBroker::new();
        let (_connection, mut consumer) = open(&broker).await;
        consumer.bind::<&str>(&[]).await.unwrap();

        assert_eq!(consumer.state(), ConsumerState::QueueBound);
        assert_eq!(consumer.bindings(), &[BindingPattern::catch_all()]);
        assert_eq!(broker.bindings(consumer.queue_name()).len(), 1);
    }

    #[tokio::test]
    async fn test_bind_skips_duplicates() {
        let broker = MemoryBroker::new();
        let (_connection, mut consumer) = open(&broker).await;
        consumer.bind(&["kern.*", "*.critical", "kern.*"]).await.unwrap();
        consumer.bind(&["kern.*"]).await.unwrap();
        assert_eq!(consumer.bindings().len(), 2);
    }

    #[tokio::test]
    async fn test_bind_rejects_malformed_pattern_before_binding() {
        let broker = MemoryBroker::new();
        let (_connection, mut consumer) = open(&broker).await;
        let err = consumer.bind(&["error", "kern.ab*"]).await.unwrap_err();
        assert!(matches!(err, BindError::InvalidPattern(_)));
        assert!(consumer.bindings().is_empty());
        assert_eq!(consumer.state(), ConsumerState::ExchangeDeclared);
    }

    #[tokio::test]
    async fn test_deliveries_require_bound_queue() {
        let broker = MemoryBroker::new();
        let (_connection, mut consumer) = open(&broker).await;
        let err = consumer.deliveries().await.err().unwrap();
        assert!(matches!(
            err,
            ListenError::State(StateError {
                operation: "consume",
                state: ConsumerState::ExchangeDeclared,
            })
        ));
    }

    #[tokio::test]
    async fn test_connection_close_cancels_deliveries() {
        let broker = MemoryBroker::new();
        let (connection, mut consumer) = open(&broker).await;
        consumer.bind(&["error"]).await.unwrap();

        let mut deliveries = consumer.deliveries().await.unwrap();
        assert_eq!(deliveries.state(), ConsumerState::Listening);

        connection.close().await.unwrap();
        assert!(deliveries.next().await.is_none());
        assert_eq!(deliveries.state(), ConsumerState::Cancelled);
        assert!(deliveries.next().await.is_none());
    }

    #[tokio::test]
    async fn test_handler_failure_cancels_and_hands_off_delivery() {
        let broker = MemoryBroker::new();
        let connection = broker.connect();
        let shared = || {
            ConsumerSettings::new(ExchangeSpec::topic("logs_topic"), QueueSpec::named("jobs"))
        };

        let mut failing = Consumer::open(&connection, shared()).await.unwrap();
        failing.bind(&["job.#"]).await.unwrap();
        let publisher = connection.open_channel().await.unwrap();
        publisher
            .publish("logs_topic", &Envelope::new("build", "job.run"))
            .await
            .unwrap();

        let err = failing
            .listen(&["job.#"], |_envelope: Envelope| async {
                Err::<(), _>(anyhow::anyhow!("worker crashed"))
            })
            .await
            .unwrap_err();
        assert!(matches!(err, ListenError::Handler { .. }));
        assert_eq!(failing.state(), ConsumerState::Failed);
        assert_eq!(broker.consumer_count("jobs"), 0);

        // The failed consumer's channel is still open.
        let other = broker.connect();
        let mut healthy = Consumer::open(&other, shared()).await.unwrap();
        healthy.bind(&["job.#"]).await.unwrap();
        let mut deliveries = healthy.deliveries().await.unwrap();
        let delivery = tokio::time::timeout(std::time::Duration::from_secs(1), deliveries.next())
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert!(delivery.redelivered);
        assert_eq!(delivery.envelope.body(), b"build");
        deliveries.ack(delivery.delivery_tag).await.unwrap();

        assert_eq!(broker.unacked_count("jobs"), 0);
        failing.close().await.unwrap();
        assert_eq!(broker.queue_depth("jobs"), Some(0));
    }

    #[tokio::test]
    async fn test_listen_on_closed_connection_fails() {
        let broker = MemoryBroker::new();
        let (connection, mut consumer) = open(&broker).await;
        connection.close().await.unwrap();

        let err = consumer
            .listen(&["error"], LogHandler)
            .await
            .unwrap_err();
        assert!(matches!(err, ListenError::Bind(BindError::Broker(BrokerError::Closed))));
    }
}
