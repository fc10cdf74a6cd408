//! In-process broker.
//!
//! Routes through a [`Topology`] and keeps one FIFO per queue. Semantics
//! follow an AMQP broker closely enough to exercise emitters and consumers
//! without a network:
//!
//! - unroutable publishes are dropped
//! - deliveries stay unacknowledged until acked; closing the channel (or its
//!   connection) puts them back at the head of their queue marked redelivered
//! - exclusive queues disappear with the connection that declared them,
//!   auto-delete queues with their last consumer
//! - cancelling a consumer stops its stream but leaves its unacked
//!   deliveries on the channel
//!
//! State sits behind a `std::sync::Mutex` that is never held across an
//! `.await`; consumers park on a per-queue `Notify`.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use futures::{stream, StreamExt};
use tokio::sync::{watch, Notify};
use tracing::{debug, info};

use super::{Channel, Connection, DeliveryStream};
use crate::envelope::{Delivery, Envelope};
use crate::error::{BindError, BrokerError};
use crate::topology::{Binding, BindingPattern, ExchangeSpec, QueueSpec, Topology};

/// Handle to an in-process broker. Clones share the same state.
#[derive(Clone, Default)]
pub struct MemoryBroker {
    shared: Arc<Shared>,
}

#[derive(Default)]
struct Shared {
    state: Mutex<BrokerState>,
    next_id: AtomicU64,
}

#[derive(Default)]
struct BrokerState {
    topology: Topology,
    queues: HashMap<String, QueueState>,
    channels: HashMap<u64, ChannelState>,
}

#[derive(Default)]
struct QueueState {
    ready: VecDeque<Pending>,
    consumers: usize,
    notify: Arc<Notify>,
}

struct Pending {
    envelope: Envelope,
    redelivered: bool,
}

struct ChannelState {
    connection: u64,
    next_tag: u64,
    unacked: BTreeMap<u64, Unacked>,
    consuming: Vec<ActiveConsumer>,
}

struct ActiveConsumer {
    tag: String,
    queue: String,
    cancelled: watch::Sender<bool>,
}

struct Unacked {
    queue: String,
    envelope: Envelope,
}

impl QueueState {
    fn requeue(&mut self, envelope: Envelope) {
        self.ready.push_front(Pending {
            envelope,
            redelivered: true,
        });
        self.notify.notify_one();
    }
}

impl BrokerState {
    /// Drop one consumer from `queue`, deleting it if it is auto-delete and
    /// that was the last one.
    fn release_consumer(&mut self, name: &str) {
        let remove = match self.queues.get_mut(name) {
            Some(queue) => {
                queue.consumers = queue.consumers.saturating_sub(1);
                queue.consumers == 0
                    && self.topology.queue(name).is_some_and(|spec| spec.auto_delete)
            }
            None => false,
        };
        if remove {
            self.topology.delete_queue(name);
            self.queues.remove(name);
        }
    }
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, BrokerState> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn next_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed) + 1
    }

    fn close_channel(&self, channel_id: u64) {
        let mut guard = self.lock();
        let state = &mut *guard;
        let Some(channel) = state.channels.remove(&channel_id) else {
            return;
        };

        // Newest first, so pushing each to the front restores delivery order.
        let requeued = channel.unacked.len();
        for (_, unacked) in channel.unacked.into_iter().rev() {
            if let Some(queue) = state.queues.get_mut(&unacked.queue) {
                queue.requeue(unacked.envelope);
            }
        }

        for consumer in channel.consuming {
            consumer.cancelled.send_replace(true);
            state.release_consumer(&consumer.queue);
        }

        debug!(channel_id, requeued, "memory_channel_closed");
    }

    fn close_connection(&self, connection_id: u64) {
        let channel_ids: Vec<u64> = self
            .lock()
            .channels
            .iter()
            .filter(|(_, channel)| channel.connection == connection_id)
            .map(|(id, _)| *id)
            .collect();
        for id in channel_ids {
            self.close_channel(id);
        }

        let mut guard = self.lock();
        let state = &mut *guard;
        for name in state.topology.queues_owned_by(connection_id) {
            state.topology.delete_queue(&name);
            state.queues.remove(&name);
        }
    }
}

impl MemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Open a new connection to this broker.
    pub fn connect(&self) -> MemoryConnection {
        let id = self.shared.next_id();
        let (closed, _) = watch::channel(false);
        info!(connection_id = id, "memory_connection_opened");
        MemoryConnection {
            id,
            shared: Arc::clone(&self.shared),
            closed,
        }
    }

    pub fn has_queue(&self, name: &str) -> bool {
        self.shared.lock().queues.contains_key(name)
    }

    /// Messages waiting in `queue`, not counting unacknowledged ones.
    pub fn queue_depth(&self, queue: &str) -> Option<usize> {
        self.shared.lock().queues.get(queue).map(|q| q.ready.len())
    }

    /// Active consumers on `queue`.
    pub fn consumer_count(&self, queue: &str) -> usize {
        self.shared
            .lock()
            .queues
            .get(queue)
            .map_or(0, |q| q.consumers)
    }

    /// Messages from `queue` delivered but not yet acknowledged.
    pub fn unacked_count(&self, queue: &str) -> usize {
        self.shared
            .lock()
            .channels
            .values()
            .flat_map(|channel| channel.unacked.values())
            .filter(|unacked| unacked.queue == queue)
            .count()
    }

    pub fn exchange(&self, name: &str) -> Option<ExchangeSpec> {
        self.shared.lock().topology.exchange(name).cloned()
    }

    pub fn bindings(&self, queue: &str) -> Vec<Binding> {
        self.shared
            .lock()
            .topology
            .bindings_for(queue)
            .cloned()
            .collect()
    }
}

/// A connection to a [`MemoryBroker`]. Dropping it closes it.
pub struct MemoryConnection {
    id: u64,
    shared: Arc<Shared>,
    closed: watch::Sender<bool>,
}

impl MemoryConnection {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn is_closed(&self) -> bool {
        *self.closed.borrow()
    }

    fn shutdown(&self) {
        if self.closed.send_replace(true) {
            return;
        }
        self.shared.close_connection(self.id);
        info!(connection_id = self.id, "memory_connection_closed");
    }
}

impl Drop for MemoryConnection {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[async_trait]
impl Connection for MemoryConnection {
    type Channel = MemoryChannel;

    async fn open_channel(&self) -> Result<MemoryChannel, BrokerError> {
        if self.is_closed() {
            return Err(BrokerError::Closed);
        }

        let id = self.shared.next_id();
        self.shared.lock().channels.insert(
            id,
            ChannelState {
                connection: self.id,
                next_tag: 0,
                unacked: BTreeMap::new(),
                consuming: Vec::new(),
            },
        );
        let (closed, _) = watch::channel(false);
        debug!(connection_id = self.id, channel_id = id, "memory_channel_opened");

        Ok(MemoryChannel {
            id,
            connection_id: self.id,
            shared: Arc::clone(&self.shared),
            closed,
            connection_closed: self.closed.subscribe(),
        })
    }

    async fn close(&self) -> Result<(), BrokerError> {
        self.shutdown();
        Ok(())
    }
}

/// A channel on a [`MemoryConnection`]. Dropping it closes it.
pub struct MemoryChannel {
    id: u64,
    connection_id: u64,
    shared: Arc<Shared>,
    closed: watch::Sender<bool>,
    connection_closed: watch::Receiver<bool>,
}

impl MemoryChannel {
    pub fn id(&self) -> u64 {
        self.id
    }

    fn ensure_open(&self) -> Result<(), BrokerError> {
        if *self.closed.borrow() || *self.connection_closed.borrow() {
            return Err(BrokerError::Closed);
        }
        Ok(())
    }

    fn shutdown(&self) {
        if self.closed.send_replace(true) {
            return;
        }
        self.shared.close_channel(self.id);
    }
}

impl Drop for MemoryChannel {
    fn drop(&mut self) {
        self.shutdown();
    }
}

enum Take {
    Ready(Delivery),
    Empty,
    Gone,
}

/// Consumer-side state threaded through the delivery stream.
struct Cursor {
    shared: Arc<Shared>,
    channel_id: u64,
    tag: String,
    queue: String,
    notify: Arc<Notify>,
    cancelled: watch::Receiver<bool>,
    channel_closed: watch::Receiver<bool>,
    connection_closed: watch::Receiver<bool>,
}

impl Cursor {
    fn is_closed(&self) -> bool {
        *self.cancelled.borrow() || *self.channel_closed.borrow() || *self.connection_closed.borrow()
    }

    fn take(&self) -> Take {
        let mut guard = self.shared.lock();
        let state = &mut *guard;
        let Some(channel) = state.channels.get_mut(&self.channel_id) else {
            return Take::Gone;
        };
        if !channel.consuming.iter().any(|c| c.tag == self.tag) {
            return Take::Gone;
        }
        let Some(queue) = state.queues.get_mut(&self.queue) else {
            return Take::Gone;
        };
        let Some(pending) = queue.ready.pop_front() else {
            return Take::Empty;
        };

        channel.next_tag += 1;
        let delivery_tag = channel.next_tag;
        channel.unacked.insert(
            delivery_tag,
            Unacked {
                queue: self.queue.clone(),
                envelope: pending.envelope.clone(),
            },
        );

        Take::Ready(Delivery {
            delivery_tag,
            redelivered: pending.redelivered,
            envelope: pending.envelope,
        })
    }
}

async fn next_delivery(mut cursor: Cursor) -> Option<(Result<Delivery, BrokerError>, Cursor)> {
    loop {
        if cursor.is_closed() {
            return None;
        }

        let notify = Arc::clone(&cursor.notify);
        let notified = notify.notified();

        match cursor.take() {
            Take::Ready(delivery) => return Some((Ok(delivery), cursor)),
            Take::Gone => return None,
            Take::Empty => {}
        }

        tokio::select! {
            _ = notified => {}
            changed = cursor.cancelled.changed() => {
                if changed.is_err() {
                    return None;
                }
            }
            changed = cursor.channel_closed.changed() => {
                if changed.is_err() {
                    return None;
                }
            }
            changed = cursor.connection_closed.changed() => {
                if changed.is_err() {
                    return None;
                }
            }
        }
    }
}

#[async_trait]
impl Channel for MemoryChannel {
    async fn declare_exchange(&self, spec: &ExchangeSpec) -> Result<(), BrokerError> {
        self.ensure_open()?;
        self.shared.lock().topology.declare_exchange(spec)?;
        Ok(())
    }

    async fn declare_queue(&self, spec: &QueueSpec) -> Result<String, BrokerError> {
        self.ensure_open()?;
        let mut guard = self.shared.lock();
        let state = &mut *guard;
        let name = state.topology.declare_queue(spec, self.connection_id)?;
        state.queues.entry(name.clone()).or_default();
        Ok(name)
    }

    async fn bind(
        &self,
        queue: &str,
        exchange: &str,
        pattern: &BindingPattern,
    ) -> Result<(), BrokerError> {
        self.ensure_open()?;
        self.shared
            .lock()
            .topology
            .bind(queue, exchange, pattern.clone())
            .map_err(|err| match err {
                BindError::NotFound(what) => BrokerError::NotFound(what),
                other => BrokerError::PreconditionFailed(other.to_string()),
            })
    }

    // Deliveries are only taken when the consumer polls for the next one,
    // so there is nothing to limit.
    async fn qos(&self, _prefetch_count: u16) -> Result<(), BrokerError> {
        self.ensure_open()
    }

    // Every publish is already confirmed by the time it returns.
    async fn confirm_select(&self) -> Result<(), BrokerError> {
        self.ensure_open()
    }

    async fn publish(&self, exchange: &str, envelope: &Envelope) -> Result<(), BrokerError> {
        self.ensure_open()?;
        let mut guard = self.shared.lock();
        let state = &mut *guard;

        if state.topology.exchange(exchange).is_none() {
            return Err(BrokerError::NotFound(format!("exchange `{exchange}`")));
        }
        let targets = state.topology.route(exchange, envelope.routing_key());

        for name in &targets {
            if let Some(queue) = state.queues.get_mut(name) {
                queue.ready.push_back(Pending {
                    envelope: envelope.clone(),
                    redelivered: false,
                });
                queue.notify.notify_one();
            }
        }

        debug!(
            exchange = %exchange,
            routing_key = %envelope.routing_key(),
            queues = targets.len(),
            "memory_published"
        );
        Ok(())
    }

    async fn consume(
        &self,
        queue: &str,
        consumer_tag: &str,
    ) -> Result<DeliveryStream, BrokerError> {
        self.ensure_open()?;
        let (notify, cancelled) = {
            let mut guard = self.shared.lock();
            let state = &mut *guard;

            if state
                .topology
                .queue_owner(queue)
                .is_some_and(|owner| owner != self.connection_id)
            {
                return Err(BrokerError::ResourceLocked(format!("queue `{queue}`")));
            }
            let Some(queue_state) = state.queues.get_mut(queue) else {
                return Err(BrokerError::NotFound(format!("queue `{queue}`")));
            };
            let Some(channel) = state.channels.get_mut(&self.id) else {
                return Err(BrokerError::Closed);
            };
            if channel.consuming.iter().any(|c| c.tag == consumer_tag) {
                return Err(BrokerError::PreconditionFailed(format!(
                    "consumer tag `{consumer_tag}` already in use on this channel"
                )));
            }

            let (cancelled, watcher) = watch::channel(false);
            queue_state.consumers += 1;
            channel.consuming.push(ActiveConsumer {
                tag: consumer_tag.to_string(),
                queue: queue.to_string(),
                cancelled,
            });
            (Arc::clone(&queue_state.notify), watcher)
        };

        debug!(queue = %queue, consumer_tag = %consumer_tag, channel_id = self.id, "memory_consumer_started");

        let cursor = Cursor {
            shared: Arc::clone(&self.shared),
            channel_id: self.id,
            tag: consumer_tag.to_string(),
            queue: queue.to_string(),
            notify,
            cancelled,
            channel_closed: self.closed.subscribe(),
            connection_closed: self.connection_closed.clone(),
        };
        Ok(stream::unfold(cursor, next_delivery).boxed())
    }

    async fn cancel(&self, consumer_tag: &str) -> Result<(), BrokerError> {
        self.ensure_open()?;
        let mut guard = self.shared.lock();
        let state = &mut *guard;
        let Some(channel) = state.channels.get_mut(&self.id) else {
            return Err(BrokerError::Closed);
        };
        let Some(index) = channel.consuming.iter().position(|c| c.tag == consumer_tag) else {
            return Ok(());
        };

        let consumer = channel.consuming.remove(index);
        consumer.cancelled.send_replace(true);
        state.release_consumer(&consumer.queue);
        debug!(queue = %consumer.queue, consumer_tag = %consumer_tag, channel_id = self.id, "memory_consumer_cancelled");
        Ok(())
    }

    async fn ack(&self, delivery_tag: u64) -> Result<(), BrokerError> {
        self.ensure_open()?;
        let mut guard = self.shared.lock();
        let channel = guard
            .channels
            .get_mut(&self.id)
            .ok_or(BrokerError::Closed)?;
        channel
            .unacked
            .remove(&delivery_tag)
            .map(|_| ())
            .ok_or_else(|| {
                BrokerError::PreconditionFailed(format!("unknown delivery tag {delivery_tag}"))
            })
    }

    async fn nack(&self, delivery_tag: u64, requeue: bool) -> Result<(), BrokerError> {
        self.ensure_open()?;
        let mut guard = self.shared.lock();
        let state = &mut *guard;
        let channel = state
            .channels
            .get_mut(&self.id)
            .ok_or(BrokerError::Closed)?;
        let unacked = channel.unacked.remove(&delivery_tag).ok_or_else(|| {
            BrokerError::PreconditionFailed(format!("unknown delivery tag {delivery_tag}"))
        })?;

        if requeue {
            if let Some(queue) = state.queues.get_mut(&unacked.queue) {
                queue.requeue(unacked.envelope);
            }
        }
        Ok(())
    }

    async fn close(&self) -> Result<(), BrokerError> {
        self.shutdown();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use tokio::time::timeout;

    use super::*;

    async fn setup(broker: &MemoryBroker) -> (MemoryConnection, MemoryChannel) {
        let connection = broker.connect();
        let channel = connection.open_channel().await.unwrap();
        channel
            .declare_exchange(&ExchangeSpec::topic("logs_topic"))
            .await
            .unwrap();
        (connection, channel)
    }

    async fn assert_idle(stream: &mut DeliveryStream) {
        assert!(
            timeout(Duration::from_millis(50), stream.next()).await.is_err(),
            "expected no delivery"
        );
    }

    #[tokio::test]
    async fn test_unroutable_publish_is_dropped() {
        let broker = MemoryBroker::new();
        let (_connection, channel) = setup(&broker).await;
        channel
            .publish("logs_topic", &Envelope::new("lost", "error"))
            .await
            .unwrap();

        let queue = channel
            .declare_queue(&QueueSpec::named("late"))
            .await
            .unwrap();
        assert_eq!(broker.queue_depth(&queue), Some(0));
    }

    #[tokio::test]
    async fn test_publish_to_missing_exchange_fails() {
        let broker = MemoryBroker::new();
        let connection = broker.connect();
        let channel = connection.open_channel().await.unwrap();
        let err = channel
            .publish("missing", &Envelope::new("x", "error"))
            .await
            .unwrap_err();
        assert!(matches!(err, BrokerError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_publish_to_nameless_exchange_fails() {
        let broker = MemoryBroker::new();
        let (_connection, channel) = setup(&broker).await;
        channel
            .declare_queue(&QueueSpec::named("q"))
            .await
            .unwrap();
        let err = channel
            .publish("", &Envelope::new("hi", "q"))
            .await
            .unwrap_err();
        assert!(matches!(err, BrokerError::NotFound(_)));
        assert_eq!(broker.queue_depth("q"), Some(0));
    }

    #[tokio::test]
    async fn test_consume_ack_removes_message() {
        let broker = MemoryBroker::new();
        let (_connection, channel) = setup(&broker).await;
        let queue = channel.declare_queue(&QueueSpec::named("q")).await.unwrap();
        channel
            .bind(&queue, "logs_topic", &BindingPattern::catch_all())
            .await
            .unwrap();
        channel
            .publish("logs_topic", &Envelope::new("one", "error"))
            .await
            .unwrap();

        let mut stream = channel.consume(&queue, "test").await.unwrap();
        let delivery = stream.next().await.unwrap().unwrap();
        assert_eq!(delivery.envelope.body(), b"one");
        assert!(!delivery.redelivered);
        assert_eq!(broker.unacked_count(&queue), 1);

        channel.ack(delivery.delivery_tag).await.unwrap();
        assert_eq!(broker.unacked_count(&queue), 0);
        assert_eq!(broker.queue_depth(&queue), Some(0));

        let err = channel.ack(delivery.delivery_tag).await.unwrap_err();
        assert!(matches!(err, BrokerError::PreconditionFailed(_)));
    }

    #[tokio::test]
    async fn test_consumer_wakes_on_publish() {
        let broker = MemoryBroker::new();
        let (_connection, channel) = setup(&broker).await;
        let queue = channel.declare_queue(&QueueSpec::named("q")).await.unwrap();
        channel
            .bind(&queue, "logs_topic", &BindingPattern::catch_all())
            .await
            .unwrap();

        let mut stream = channel.consume(&queue, "test").await.unwrap();
        assert_idle(&mut stream).await;

        let publisher = broker.connect();
        let publish_channel = publisher.open_channel().await.unwrap();
        publish_channel
            .publish("logs_topic", &Envelope::new("late", "info"))
            .await
            .unwrap();

        let delivery = timeout(Duration::from_secs(1), stream.next())
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(delivery.envelope.body(), b"late");
    }

    #[tokio::test]
    async fn test_nack_requeue_redelivers_first() {
        let broker = MemoryBroker::new();
        let (_connection, channel) = setup(&broker).await;
        let queue = channel.declare_queue(&QueueSpec::named("q")).await.unwrap();
        channel
            .bind(&queue, "logs_topic", &BindingPattern::catch_all())
            .await
            .unwrap();
        for body in ["first", "second"] {
            channel
                .publish("logs_topic", &Envelope::new(body, "error"))
                .await
                .unwrap();
        }

        let mut stream = channel.consume(&queue, "test").await.unwrap();
        let first = stream.next().await.unwrap().unwrap();
        channel.nack(first.delivery_tag, true).await.unwrap();

        let again = stream.next().await.unwrap().unwrap();
        assert_eq!(again.envelope.body(), b"first");
        assert!(again.redelivered);
        assert_ne!(again.delivery_tag, first.delivery_tag);
    }

    #[tokio::test]
    async fn test_nack_without_requeue_discards() {
        let broker = MemoryBroker::new();
        let (_connection, channel) = setup(&broker).await;
        let queue = channel.declare_queue(&QueueSpec::named("q")).await.unwrap();
        channel
            .bind(&queue, "logs_topic", &BindingPattern::catch_all())
            .await
            .unwrap();
        channel
            .publish("logs_topic", &Envelope::new("poison", "error"))
            .await
            .unwrap();

        let mut stream = channel.consume(&queue, "test").await.unwrap();
        let delivery = stream.next().await.unwrap().unwrap();
        channel.nack(delivery.delivery_tag, false).await.unwrap();
        assert_eq!(broker.queue_depth(&queue), Some(0));
        assert_eq!(broker.unacked_count(&queue), 0);
    }

    #[tokio::test]
    async fn test_closing_channel_requeues_unacked_in_order() {
        let broker = MemoryBroker::new();
        let (connection, channel) = setup(&broker).await;
        let queue = channel.declare_queue(&QueueSpec::named("q")).await.unwrap();
        channel
            .bind(&queue, "logs_topic", &BindingPattern::catch_all())
            .await
            .unwrap();
        for body in ["a", "b", "c"] {
            channel
                .publish("logs_topic", &Envelope::new(body, "error"))
                .await
                .unwrap();
        }

        let mut stream = channel.consume(&queue, "test").await.unwrap();
        stream.next().await.unwrap().unwrap();
        stream.next().await.unwrap().unwrap();
        channel.close().await.unwrap();
        assert!(stream.next().await.is_none());
        assert!(matches!(
            channel.publish("logs_topic", &Envelope::new("x", "y")).await,
            Err(BrokerError::Closed)
        ));

        let channel = connection.open_channel().await.unwrap();
        let mut stream = channel.consume(&queue, "test").await.unwrap();
        let mut bodies = Vec::new();
        for _ in 0..3 {
            let delivery = stream.next().await.unwrap().unwrap();
            bodies.push((delivery.envelope.body_text().into_owned(), delivery.redelivered));
        }
        assert_eq!(
            bodies,
            vec![
                ("a".to_string(), true),
                ("b".to_string(), true),
                ("c".to_string(), false),
            ]
        );
    }

    #[tokio::test]
    async fn test_exclusive_queue_removed_with_connection() {
        let broker = MemoryBroker::new();
        let (connection, channel) = setup(&broker).await;
        let queue = channel
            .declare_queue(&QueueSpec::anonymous())
            .await
            .unwrap();
        channel
            .bind(&queue, "logs_topic", &BindingPattern::catch_all())
            .await
            .unwrap();

        let other = broker.connect();
        let other_channel = other.open_channel().await.unwrap();
        let err = other_channel.consume(&queue, "intruder").await.err().unwrap();
        assert!(matches!(err, BrokerError::ResourceLocked(_)));

        let mut stream = channel.consume(&queue, "owner").await.unwrap();
        connection.close().await.unwrap();
        assert!(stream.next().await.is_none());
        assert!(!broker.has_queue(&queue));
        assert!(broker.bindings(&queue).is_empty());
        assert!(matches!(
            connection.open_channel().await,
            Err(BrokerError::Closed)
        ));
    }

    #[tokio::test]
    async fn test_auto_delete_queue_removed_with_last_consumer() {
        let broker = MemoryBroker::new();
        let (_connection, channel) = setup(&broker).await;
        let queue = channel
            .declare_queue(&QueueSpec::named("transient").with_auto_delete(true))
            .await
            .unwrap();
        let _stream = channel.consume(&queue, "test").await.unwrap();
        assert!(broker.has_queue(&queue));

        channel.close().await.unwrap();
        assert!(!broker.has_queue(&queue));
    }

    #[tokio::test]
    async fn test_cancel_ends_stream_and_releases_queue() {
        let broker = MemoryBroker::new();
        let (_connection, channel) = setup(&broker).await;
        let queue = channel
            .declare_queue(&QueueSpec::named("transient").with_auto_delete(true))
            .await
            .unwrap();
        channel
            .bind(&queue, "logs_topic", &BindingPattern::catch_all())
            .await
            .unwrap();
        channel
            .publish("logs_topic", &Envelope::new("held", "error"))
            .await
            .unwrap();

        let mut stream = channel.consume(&queue, "worker").await.unwrap();
        assert!(matches!(
            channel.consume(&queue, "worker").await,
            Err(BrokerError::PreconditionFailed(_))
        ));
        assert_eq!(broker.consumer_count(&queue), 1);
        let held = stream.next().await.unwrap().unwrap();

        channel.cancel("worker").await.unwrap();
        assert!(stream.next().await.is_none());
        assert!(!broker.has_queue(&queue));
        channel.cancel("worker").await.unwrap();

        // The held delivery is still owned by the channel.
        channel.ack(held.delivery_tag).await.unwrap();
    }

    #[tokio::test]
    async fn test_cancelled_consumer_skips_requeued_delivery() {
        let broker = MemoryBroker::new();
        let (_connection, channel) = setup(&broker).await;
        let queue = channel.declare_queue(&QueueSpec::named("shared")).await.unwrap();
        channel
            .bind(&queue, "logs_topic", &BindingPattern::catch_all())
            .await
            .unwrap();
        channel
            .publish("logs_topic", &Envelope::new("retry me", "error"))
            .await
            .unwrap();

        let mut first = channel.consume(&queue, "first").await.unwrap();
        let delivery = first.next().await.unwrap().unwrap();
        channel.cancel("first").await.unwrap();
        channel.nack(delivery.delivery_tag, true).await.unwrap();
        assert_eq!(broker.consumer_count(&queue), 0);
        assert!(first.next().await.is_none());

        let other = broker.connect();
        let other_channel = other.open_channel().await.unwrap();
        let mut second = other_channel.consume(&queue, "second").await.unwrap();
        let again = timeout(Duration::from_secs(1), second.next())
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(again.envelope.body(), b"retry me");
        assert!(again.redelivered);
    }

    #[tokio::test]
    async fn test_exchange_conflict_maps_to_precondition_failed() {
        let broker = MemoryBroker::new();
        let (_connection, channel) = setup(&broker).await;
        let err = channel
            .declare_exchange(&ExchangeSpec::topic("logs_topic").with_durable(false))
            .await
            .unwrap_err();
        assert!(matches!(err, BrokerError::PreconditionFailed(_)));
        assert_eq!(
            broker.exchange("logs_topic"),
            Some(ExchangeSpec::topic("logs_topic"))
        );
    }
}
