// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Broker Transport
//!
//! The operations the dispatcher needs from an AMQP broker. `LapinTransport` talks to
//! RabbitMQ and `InMemoryBroker` runs the same contract in process.

use crate::{
    envelope::Envelope,
    errors::AmqpError,
    exchange::ExchangeDefinition,
    queue::{QueueBinding, QueueDefinition},
};
use async_trait::async_trait;
use futures_util::stream::BoxStream;
use std::{fmt, sync::Arc};

/// Stream of deliveries produced by a consumer subscription.
pub type DeliveryStream = BoxStream<'static, Result<Delivery, AmqpError>>;

/// Broker operations used by the topology, the consumers and the publisher.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait AmqpTransport: Send + Sync {
    /// Declares an exchange. Declaring an identical exchange again is a no-op.
    async fn declare_exchange(&self, def: &ExchangeDefinition) -> Result<(), AmqpError>;

    /// Declares a queue and returns its name, which the broker chooses when the
    /// definition name is empty.
    async fn declare_queue(&self, def: &QueueDefinition) -> Result<String, AmqpError>;

    /// Binds a queue to an exchange.
    async fn bind_queue(&self, binding: &QueueBinding) -> Result<(), AmqpError>;

    /// Publishes a message and waits for the broker to accept it.
    ///
    /// A mandatory message no queue accepts fails with `AmqpError::UnroutableMessage`.
    async fn publish(&self, message: OutboundMessage) -> Result<(), AmqpError>;

    /// Subscribes to a queue.
    async fn consume(&self, options: ConsumeOptions) -> Result<DeliveryStream, AmqpError>;

    /// Number of messages ready in a queue.
    async fn queue_depth(&self, queue: &str) -> Result<u32, AmqpError>;
}

/// Settles a delivery with the broker.
#[async_trait]
pub trait Acknowledger: Send + Sync {
    async fn ack(&self) -> Result<(), AmqpError>;

    /// Rejects the delivery. Without requeue the broker dead-letters it through the
    /// queue's dead-letter exchange, if any.
    async fn reject(&self, requeue: bool) -> Result<(), AmqpError>;
}

/// A message to publish.
#[derive(Debug, Clone, PartialEq)]
pub struct OutboundMessage {
    pub exchange: String,
    pub routing_key: String,
    pub mandatory: bool,
    pub envelope: Envelope,
}

impl OutboundMessage {
    pub fn new(exchange: impl Into<String>, routing_key: impl Into<String>, envelope: Envelope) -> Self {
        OutboundMessage {
            exchange: exchange.into(),
            routing_key: routing_key.into(),
            mandatory: false,
            envelope,
        }
    }

    pub fn mandatory(mut self) -> Self {
        self.mandatory = true;
        self
    }
}

/// Options of a consumer subscription.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConsumeOptions {
    pub queue: String,
    pub consumer_tag: String,
    pub prefetch_count: u16,
    pub no_ack: bool,
    pub exclusive: bool,
}

impl ConsumeOptions {
    pub fn new(queue: impl Into<String>, consumer_tag: impl Into<String>) -> Self {
        ConsumeOptions {
            queue: queue.into(),
            consumer_tag: consumer_tag.into(),
            prefetch_count: 1,
            no_ack: false,
            exclusive: false,
        }
    }

    pub fn prefetch(mut self, count: u16) -> Self {
        self.prefetch_count = count;
        self
    }

    /// Deliveries are settled by the broker on send.
    pub fn no_ack(mut self) -> Self {
        self.no_ack = true;
        self
    }

    pub fn exclusive(mut self) -> Self {
        self.exclusive = true;
        self
    }
}

/// A message received from a queue, settled through its acknowledger.
#[derive(Clone)]
pub struct Delivery {
    pub envelope: Envelope,
    pub exchange: String,
    pub routing_key: String,
    pub redelivered: bool,
    acker: Arc<dyn Acknowledger>,
}

impl Delivery {
    pub fn new(
        envelope: Envelope,
        exchange: impl Into<String>,
        routing_key: impl Into<String>,
        redelivered: bool,
        acker: Arc<dyn Acknowledger>,
    ) -> Self {
        Delivery {
            envelope,
            exchange: exchange.into(),
            routing_key: routing_key.into(),
            redelivered,
            acker,
        }
    }

    pub async fn ack(&self) -> Result<(), AmqpError> {
        self.acker.ack().await
    }

    pub async fn reject(&self, requeue: bool) -> Result<(), AmqpError> {
        self.acker.reject(requeue).await
    }
}

impl fmt::Debug for Delivery {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Delivery")
            .field("envelope", &self.envelope)
            .field("exchange", &self.exchange)
            .field("routing_key", &self.routing_key)
            .field("redelivered", &self.redelivered)
            .finish_non_exhaustive()
    }
}

/// Acknowledger of deliveries the broker settled on send.
pub(crate) struct NoopAcker;

#[async_trait]
impl Acknowledger for NoopAcker {
    async fn ack(&self) -> Result<(), AmqpError> {
        Ok(())
    }

    async fn reject(&self, _requeue: bool) -> Result<(), AmqpError> {
        Ok(())
    }
}
