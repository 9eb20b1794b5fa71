// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # In-Memory Broker
//!
//! An `AmqpTransport` running entirely in process. It follows the broker semantics the
//! dispatcher relies on: idempotent declarations that reject mismatched redeclarations,
//! routing for every exchange kind, mandatory publishes failing when unroutable, server
//! named queues and dead-lettering of rejected deliveries through the queue arguments.
//!
//! It backs the crate's tests and local development without a RabbitMQ server.

use crate::{
    envelope::Envelope,
    errors::AmqpError,
    exchange::{ExchangeDefinition, ExchangeKind},
    queue::{QueueBinding, QueueDefinition},
    transport::{
        Acknowledger, AmqpTransport, ConsumeOptions, Delivery, DeliveryStream, NoopAcker,
        OutboundMessage,
    },
};
use async_trait::async_trait;
use futures_util::{stream, StreamExt};
use parking_lot::Mutex;
use std::{
    collections::{hash_map::DefaultHasher, HashMap},
    hash::{Hash, Hasher},
    sync::{
        atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering},
        Arc,
    },
};
use tokio::sync::{mpsc, Mutex as AsyncMutex};
use tracing::debug;
use uuid::Uuid;

#[derive(Debug, Clone)]
struct QueuedMessage {
    envelope: Envelope,
    exchange: String,
    routing_key: String,
    redelivered: bool,
}

struct MemoryQueue {
    definition: QueueDefinition,
    sender: mpsc::UnboundedSender<QueuedMessage>,
    receiver: Arc<AsyncMutex<mpsc::UnboundedReceiver<QueuedMessage>>>,
    depth: AtomicU32,
}

impl MemoryQueue {
    fn new(definition: QueueDefinition) -> Self {
        let (sender, receiver) = mpsc::unbounded_channel();
        MemoryQueue {
            definition,
            sender,
            receiver: Arc::new(AsyncMutex::new(receiver)),
            depth: AtomicU32::new(0),
        }
    }

    fn push(&self, message: QueuedMessage) {
        if self.sender.send(message).is_ok() {
            self.depth.fetch_add(1, Ordering::SeqCst);
        }
    }
}

#[derive(Default)]
struct BrokerState {
    exchanges: HashMap<String, ExchangeDefinition>,
    queues: HashMap<String, Arc<MemoryQueue>>,
    bindings: Vec<QueueBinding>,
    published: Vec<OutboundMessage>,
}

#[derive(Default)]
struct Counters {
    acked: AtomicUsize,
    rejected: AtomicUsize,
}

/// In-process broker shared by clones.
#[derive(Clone, Default)]
pub struct InMemoryBroker {
    state: Arc<Mutex<BrokerState>>,
    counters: Arc<Counters>,
}

impl InMemoryBroker {
    pub fn new() -> Self {
        InMemoryBroker::default()
    }

    /// Every message accepted by `publish`, in order.
    pub fn published(&self) -> Vec<OutboundMessage> {
        self.state.lock().published.clone()
    }

    /// Messages published to the given exchange, in order.
    pub fn published_to(&self, exchange: &str) -> Vec<OutboundMessage> {
        self.state
            .lock()
            .published
            .iter()
            .filter(|message| message.exchange == exchange)
            .cloned()
            .collect()
    }

    pub fn has_exchange(&self, name: &str) -> bool {
        self.state.lock().exchanges.contains_key(name)
    }

    pub fn has_queue(&self, name: &str) -> bool {
        self.state.lock().queues.contains_key(name)
    }

    pub fn exchange_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.state.lock().exchanges.keys().cloned().collect();
        names.sort();
        names
    }

    pub fn queue_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.state.lock().queues.keys().cloned().collect();
        names.sort();
        names
    }

    pub fn bindings(&self) -> Vec<QueueBinding> {
        self.state.lock().bindings.clone()
    }

    pub fn acked(&self) -> usize {
        self.counters.acked.load(Ordering::SeqCst)
    }

    pub fn rejected(&self) -> usize {
        self.counters.rejected.load(Ordering::SeqCst)
    }

    /// Removes and returns the ready messages of a queue. Messages held by a consumer
    /// are not included.
    pub async fn drain(&self, queue: &str) -> Vec<Envelope> {
        let Some(queue) = self.queue(queue) else {
            return vec![];
        };

        let mut receiver = queue.receiver.lock().await;
        let mut drained = vec![];
        while let Ok(message) = receiver.try_recv() {
            queue.depth.fetch_sub(1, Ordering::SeqCst);
            drained.push(message.envelope);
        }

        drained
    }

    fn queue(&self, name: &str) -> Option<Arc<MemoryQueue>> {
        self.state.lock().queues.get(name).cloned()
    }

    /// Delivers a message to the queues its exchange routes it to.
    ///
    /// # Returns
    /// The number of queues that received the message
    fn route(&self, message: &OutboundMessage) -> Result<usize, AmqpError> {
        let state = self.state.lock();

        let targets: Vec<Arc<MemoryQueue>> = if message.exchange.is_empty() {
            state
                .queues
                .get(&message.routing_key)
                .cloned()
                .into_iter()
                .collect()
        } else {
            let exchange = state.exchanges.get(&message.exchange).ok_or_else(|| {
                AmqpError::PublishingError(format!("no exchange `{}`", message.exchange))
            })?;

            let bound: Vec<&QueueBinding> = state
                .bindings
                .iter()
                .filter(|binding| binding.exchange_name == message.exchange)
                .collect();

            let matched: Vec<&QueueBinding> = match exchange.kind {
                ExchangeKind::Direct => bound
                    .into_iter()
                    .filter(|binding| binding.routing_key == message.routing_key)
                    .collect(),
                ExchangeKind::Topic => bound
                    .into_iter()
                    .filter(|binding| topic_matches(&binding.routing_key, &message.routing_key))
                    .collect(),
                ExchangeKind::Fanout | ExchangeKind::Headers => bound,
                ExchangeKind::ConsistentHash => {
                    if bound.is_empty() {
                        bound
                    } else {
                        let mut hasher = DefaultHasher::new();
                        message.routing_key.hash(&mut hasher);
                        let index = (hasher.finish() % bound.len() as u64) as usize;
                        vec![bound[index]]
                    }
                }
            };

            let mut queues: Vec<Arc<MemoryQueue>> = vec![];
            for binding in matched {
                if let Some(queue) = state.queues.get(&binding.queue_name) {
                    if !queues.iter().any(|known| Arc::ptr_eq(known, queue)) {
                        queues.push(queue.clone());
                    }
                }
            }
            queues
        };

        for queue in &targets {
            queue.push(QueuedMessage {
                envelope: message.envelope.clone(),
                exchange: message.exchange.clone(),
                routing_key: message.routing_key.clone(),
                redelivered: false,
            });
        }

        Ok(targets.len())
    }

    /// Dead-letters a rejected message through the arguments of its queue.
    fn dead_letter(&self, queue: &MemoryQueue, message: QueuedMessage) {
        let Some(exchange) = queue.definition.dead_letter_exchange.clone() else {
            debug!(queue = %queue.definition.name, "rejected message dropped");
            return;
        };

        let routing_key = queue
            .definition
            .dead_letter_routing_key
            .clone()
            .unwrap_or(message.routing_key);

        let outbound = OutboundMessage::new(exchange, routing_key, message.envelope);
        if let Err(err) = self.route(&outbound) {
            debug!(error = err.to_string(), "rejected message dropped");
        }
    }
}

/// Matches an AMQP topic pattern: `*` is exactly one word, `#` zero or more.
fn topic_matches(pattern: &str, key: &str) -> bool {
    fn matches(pattern: &[&str], key: &[&str]) -> bool {
        match (pattern.first(), key.first()) {
            (None, None) => true,
            (Some(&"#"), _) => {
                matches(&pattern[1..], key) || (!key.is_empty() && matches(pattern, &key[1..]))
            }
            (Some(&"*"), Some(_)) => matches(&pattern[1..], &key[1..]),
            (Some(word), Some(part)) if word == part => matches(&pattern[1..], &key[1..]),
            _ => false,
        }
    }

    let pattern: Vec<&str> = pattern.split('.').collect();
    let key: Vec<&str> = if key.is_empty() {
        vec![]
    } else {
        key.split('.').collect()
    };

    matches(&pattern, &key)
}

struct MemoryAcker {
    broker: InMemoryBroker,
    queue: Arc<MemoryQueue>,
    message: QueuedMessage,
    settled: AtomicBool,
}

#[async_trait]
impl Acknowledger for MemoryAcker {
    async fn ack(&self) -> Result<(), AmqpError> {
        if self.settled.swap(true, Ordering::SeqCst) {
            return Err(AmqpError::AckMessageError);
        }

        self.broker.counters.acked.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn reject(&self, requeue: bool) -> Result<(), AmqpError> {
        if self.settled.swap(true, Ordering::SeqCst) {
            return Err(AmqpError::NackMessageError);
        }

        self.broker.counters.rejected.fetch_add(1, Ordering::SeqCst);
        let mut message = self.message.clone();
        if requeue {
            message.redelivered = true;
            self.queue.push(message);
        } else {
            self.broker.dead_letter(&self.queue, message);
        }

        Ok(())
    }
}

#[async_trait]
impl AmqpTransport for InMemoryBroker {
    async fn declare_exchange(&self, def: &ExchangeDefinition) -> Result<(), AmqpError> {
        let mut state = self.state.lock();

        match state.exchanges.get(&def.name) {
            Some(existing) => {
                if existing.kind != def.kind
                    || existing.durable != def.durable
                    || existing.params != def.params
                {
                    return Err(AmqpError::DeclareExchangeError(def.name.clone()));
                }
            }
            None if def.passive => return Err(AmqpError::DeclareExchangeError(def.name.clone())),
            None => {
                state.exchanges.insert(def.name.clone(), def.clone());
            }
        }

        Ok(())
    }

    async fn declare_queue(&self, def: &QueueDefinition) -> Result<String, AmqpError> {
        let mut state = self.state.lock();

        let name = if def.name.is_empty() {
            format!("amq.gen-{}", Uuid::new_v4())
        } else {
            def.name.clone()
        };

        match state.queues.get(&name) {
            Some(existing) => {
                let known = &existing.definition;
                if known.durable != def.durable
                    || known.exclusive != def.exclusive
                    || known.arguments() != def.arguments()
                {
                    return Err(AmqpError::DeclareQueueError(name));
                }
            }
            None if def.passive => return Err(AmqpError::DeclareQueueError(name)),
            None => {
                let mut definition = def.clone();
                definition.name = name.clone();
                state
                    .queues
                    .insert(name.clone(), Arc::new(MemoryQueue::new(definition)));
            }
        }

        Ok(name)
    }

    async fn bind_queue(&self, binding: &QueueBinding) -> Result<(), AmqpError> {
        let mut state = self.state.lock();

        if !state.queues.contains_key(&binding.queue_name)
            || !state.exchanges.contains_key(&binding.exchange_name)
        {
            return Err(AmqpError::BindingExchangeToQueueError(
                binding.exchange_name.clone(),
                binding.queue_name.clone(),
            ));
        }

        if !state.bindings.contains(binding) {
            state.bindings.push(binding.clone());
        }

        Ok(())
    }

    async fn publish(&self, message: OutboundMessage) -> Result<(), AmqpError> {
        let routed = self.route(&message)?;

        if routed == 0 {
            if message.mandatory {
                return Err(AmqpError::UnroutableMessage {
                    exchange: message.exchange,
                    routing_key: message.routing_key,
                });
            }
            debug!(
                exchange = %message.exchange,
                routing_key = %message.routing_key,
                "message dropped, no queue bound"
            );
        }

        self.state.lock().published.push(message);
        Ok(())
    }

    async fn consume(&self, options: ConsumeOptions) -> Result<DeliveryStream, AmqpError> {
        let queue = self
            .queue(&options.queue)
            .ok_or_else(|| AmqpError::BindingConsumerError(options.queue.clone()))?;

        let broker = self.clone();
        let no_ack = options.no_ack;

        let deliveries = stream::unfold(queue, move |queue| {
            let broker = broker.clone();
            async move {
                let message = queue.receiver.lock().await.recv().await?;
                queue.depth.fetch_sub(1, Ordering::SeqCst);

                let acker: Arc<dyn Acknowledger> = if no_ack {
                    Arc::new(NoopAcker)
                } else {
                    Arc::new(MemoryAcker {
                        broker,
                        queue: queue.clone(),
                        message: message.clone(),
                        settled: AtomicBool::new(false),
                    })
                };

                let delivery = Delivery::new(
                    message.envelope,
                    message.exchange,
                    message.routing_key,
                    message.redelivered,
                    acker,
                );

                Some((Ok(delivery), queue))
            }
        });

        Ok(deliveries.boxed())
    }

    async fn queue_depth(&self, queue: &str) -> Result<u32, AmqpError> {
        self.queue(queue)
            .map(|queue| queue.depth.load(Ordering::SeqCst))
            .ok_or_else(|| AmqpError::QueueInspectError(queue.to_owned()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn broker_with(kind: ExchangeKind, bindings: &[(&str, &str)]) -> InMemoryBroker {
        let broker = InMemoryBroker::new();
        let mut exchange = ExchangeDefinition::new("app.ex").kind(kind);
        if kind == ExchangeKind::ConsistentHash {
            exchange = exchange.param("hash-header", "X-Tenant");
        }
        broker.declare_exchange(&exchange).await.unwrap();

        for (queue, key) in bindings {
            broker
                .declare_queue(&QueueDefinition::new(*queue))
                .await
                .unwrap();
            broker
                .bind_queue(&QueueBinding::new(*queue).exchange("app.ex").routing_key(*key))
                .await
                .unwrap();
        }

        broker
    }

    fn message(key: &str) -> OutboundMessage {
        OutboundMessage::new("app.ex", key, Envelope::new(b"{}".to_vec())).mandatory()
    }

    #[test]
    fn topic_patterns() {
        assert!(topic_matches("#", "a.b.c"));
        assert!(topic_matches("#", ""));
        assert!(topic_matches("orders.*", "orders.created"));
        assert!(!topic_matches("orders.*", "orders.created.eu"));
        assert!(topic_matches("orders.#", "orders"));
        assert!(topic_matches("*.created.#", "orders.created.eu.west"));
        assert!(!topic_matches("app.inbox", "app.outbox"));
    }

    #[tokio::test]
    async fn topic_exchange_routes_by_pattern() {
        let broker = broker_with(
            ExchangeKind::Topic,
            &[("all", "#"), ("orders", "orders.*"), ("exact", "orders.created")],
        )
        .await;

        broker.publish(message("orders.created")).await.unwrap();
        broker.publish(message("users.created")).await.unwrap();

        assert_eq!(broker.queue_depth("all").await.unwrap(), 2);
        assert_eq!(broker.queue_depth("orders").await.unwrap(), 1);
        assert_eq!(broker.queue_depth("exact").await.unwrap(), 1);
    }

    #[tokio::test]
    async fn direct_and_fanout_exchanges() {
        let direct = broker_with(ExchangeKind::Direct, &[("a", "k1"), ("b", "k2")]).await;
        direct.publish(message("k1")).await.unwrap();
        assert_eq!(direct.queue_depth("a").await.unwrap(), 1);
        assert_eq!(direct.queue_depth("b").await.unwrap(), 0);

        let fanout = broker_with(ExchangeKind::Fanout, &[("a", "k1"), ("b", "k2")]).await;
        fanout.publish(message("whatever")).await.unwrap();
        assert_eq!(fanout.queue_depth("a").await.unwrap(), 1);
        assert_eq!(fanout.queue_depth("b").await.unwrap(), 1);
    }

    #[tokio::test]
    async fn consistent_hash_picks_one_queue_per_key() {
        let broker =
            broker_with(ExchangeKind::ConsistentHash, &[("p1", "1"), ("p2", "1"), ("p3", "1")]).await;

        for _ in 0..5 {
            broker.publish(message("tenant-42")).await.unwrap();
        }

        let depths = [
            broker.queue_depth("p1").await.unwrap(),
            broker.queue_depth("p2").await.unwrap(),
            broker.queue_depth("p3").await.unwrap(),
        ];
        assert_eq!(depths.iter().sum::<u32>(), 5);
        assert!(depths.contains(&5));
    }

    #[tokio::test]
    async fn unroutable_mandatory_publish_fails() {
        let broker = broker_with(ExchangeKind::Direct, &[("a", "k1")]).await;

        assert_eq!(
            broker.publish(message("nowhere")).await,
            Err(AmqpError::UnroutableMessage {
                exchange: "app.ex".to_owned(),
                routing_key: "nowhere".to_owned(),
            })
        );

        let relaxed = OutboundMessage::new("app.ex", "nowhere", Envelope::default());
        assert!(broker.publish(relaxed).await.is_ok());
    }

    #[tokio::test]
    async fn redeclaration_must_match() {
        let broker = InMemoryBroker::new();
        let def = ExchangeDefinition::new("app.ex").durable();

        broker.declare_exchange(&def).await.unwrap();
        broker.declare_exchange(&def).await.unwrap();
        assert_eq!(
            broker
                .declare_exchange(&ExchangeDefinition::new("app.ex").kind(ExchangeKind::Direct))
                .await,
            Err(AmqpError::DeclareExchangeError("app.ex".to_owned()))
        );

        let queue = QueueDefinition::new("app.inbox").durable();
        broker.declare_queue(&queue).await.unwrap();
        assert!(broker.declare_queue(&queue).await.is_ok());
        assert!(broker
            .declare_queue(&queue.clone().with_dead_letter("app.dlx", "x"))
            .await
            .is_err());
    }

    #[tokio::test]
    async fn server_named_queues_are_unique() {
        let broker = InMemoryBroker::new();
        let first = broker.declare_queue(&QueueDefinition::server_named()).await.unwrap();
        let second = broker.declare_queue(&QueueDefinition::server_named()).await.unwrap();

        assert!(first.starts_with("amq.gen-"));
        assert_ne!(first, second);
    }

    #[tokio::test]
    async fn rejected_delivery_is_dead_lettered() {
        let broker = InMemoryBroker::new();
        broker
            .declare_exchange(&ExchangeDefinition::new("app.dlx"))
            .await
            .unwrap();
        broker
            .declare_queue(&QueueDefinition::new("app.inbox").with_dead_letter("app.dlx", "app.inbox.dlq"))
            .await
            .unwrap();
        broker
            .declare_queue(&QueueDefinition::new("app.inbox.dlq"))
            .await
            .unwrap();
        broker
            .bind_queue(
                &QueueBinding::new("app.inbox.dlq")
                    .exchange("app.dlx")
                    .routing_key("app.inbox.dlq"),
            )
            .await
            .unwrap();

        broker
            .publish(OutboundMessage::new("", "app.inbox", Envelope::new(b"x".to_vec())))
            .await
            .unwrap();

        let mut deliveries = broker
            .consume(ConsumeOptions::new("app.inbox", "t"))
            .await
            .unwrap();
        let delivery = deliveries.next().await.unwrap().unwrap();
        delivery.reject(false).await.unwrap();

        assert_eq!(broker.rejected(), 1);
        let dead = broker.drain("app.inbox.dlq").await;
        assert_eq!(dead.len(), 1);
        assert_eq!(dead[0].body, b"x".to_vec());
        assert!(delivery.ack().await.is_err());
    }
}
