// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Queue Management for RabbitMQ
//!
//! This module provides types for defining queues and their bindings. A queue may
//! point at a dead-letter exchange so the broker itself routes rejected messages
//! to the DLQ.

use crate::headers::{HeaderValue, Headers};

/// Constant for the queue argument used to specify a dead letter exchange
pub const AMQP_HEADERS_DEAD_LETTER_EXCHANGE: &str = "x-dead-letter-exchange";
/// Constant for the queue argument used to specify a dead letter routing key
pub const AMQP_HEADERS_DEAD_LETTER_ROUTING_KEY: &str = "x-dead-letter-routing-key";

/// Definition of a RabbitMQ queue with its configuration parameters.
///
/// This struct implements the builder pattern to create and configure queue definitions.
/// An empty name asks the broker to generate one.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct QueueDefinition {
    pub(crate) name: String,
    pub(crate) durable: bool,
    pub(crate) delete: bool,
    pub(crate) exclusive: bool,
    pub(crate) passive: bool,
    pub(crate) dead_letter_exchange: Option<String>,
    pub(crate) dead_letter_routing_key: Option<String>,
}

impl QueueDefinition {
    /// Creates a new queue definition with the given name.
    ///
    /// By default, the queue is created with standard settings (non-durable, non-exclusive, etc.)
    ///
    /// # Parameters
    /// * `name` - The name of the queue
    ///
    /// # Returns
    /// A new queue definition with default settings
    pub fn new(name: impl Into<String>) -> QueueDefinition {
        QueueDefinition {
            name: name.into(),
            ..QueueDefinition::default()
        }
    }

    /// A private queue named by the broker, removed with its connection.
    ///
    /// Used as the reply queue of a publisher.
    pub fn server_named() -> QueueDefinition {
        QueueDefinition::new("").exclusive().delete()
    }

    /// Makes the queue durable, persisting across broker restarts.
    ///
    /// Durable queues will survive broker restart, preserving messages.
    pub fn durable(mut self) -> Self {
        self.durable = true;
        self
    }

    /// Sets durability from a configuration flag.
    pub fn durable_if(mut self, durable: bool) -> Self {
        self.durable = durable;
        self
    }

    /// Sets the queue to auto-delete when no longer used.
    pub fn delete(mut self) -> Self {
        self.delete = true;
        self
    }

    /// Makes the queue exclusive to the connection.
    ///
    /// Exclusive queues are deleted when the connection closes.
    pub fn exclusive(mut self) -> Self {
        self.exclusive = true;
        self
    }

    /// Makes the declaration passive, checking for existence without creating the queue.
    pub fn passive(mut self) -> Self {
        self.passive = true;
        self
    }

    /// Points rejected messages of this queue to a dead letter exchange.
    ///
    /// # Parameters
    /// * `exchange` - The dead letter exchange
    /// * `routing_key` - The routing key used when the broker dead-letters a message
    ///
    /// # Returns
    /// Self for method chaining
    pub fn with_dead_letter(
        mut self,
        exchange: impl Into<String>,
        routing_key: impl Into<String>,
    ) -> Self {
        self.dead_letter_exchange = Some(exchange.into());
        self.dead_letter_routing_key = Some(routing_key.into());
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_durable(&self) -> bool {
        self.durable
    }

    pub fn is_exclusive(&self) -> bool {
        self.exclusive
    }

    pub fn dead_letter_exchange(&self) -> Option<&str> {
        self.dead_letter_exchange.as_deref()
    }

    pub fn dead_letter_routing_key(&self) -> Option<&str> {
        self.dead_letter_routing_key.as_deref()
    }

    /// Declaration arguments sent to the broker.
    pub fn arguments(&self) -> Headers {
        let mut args = Headers::new();

        if let Some(exchange) = &self.dead_letter_exchange {
            args.insert(
                AMQP_HEADERS_DEAD_LETTER_EXCHANGE.to_owned(),
                HeaderValue::Str(exchange.clone()),
            );
        }

        if let Some(key) = &self.dead_letter_routing_key {
            args.insert(
                AMQP_HEADERS_DEAD_LETTER_ROUTING_KEY.to_owned(),
                HeaderValue::Str(key.clone()),
            );
        }

        args
    }
}

/// Configuration for binding a queue to an exchange.
///
/// Queue bindings define how messages flow from exchanges to queues based on
/// routing keys and exchange types.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueBinding {
    pub(crate) queue_name: String,
    pub(crate) exchange_name: String,
    pub(crate) routing_key: String,
}

impl QueueBinding {
    /// Creates a new queue binding for the given queue.
    ///
    /// By default, the exchange name and routing key are empty strings.
    /// These should be set using the `exchange` and `routing_key` methods.
    ///
    /// # Parameters
    /// * `queue` - The name of the queue to bind
    ///
    /// # Returns
    /// A new queue binding with default settings
    pub fn new(queue: impl Into<String>) -> QueueBinding {
        QueueBinding {
            queue_name: queue.into(),
            exchange_name: String::new(),
            routing_key: String::new(),
        }
    }

    /// Sets the exchange to bind the queue to.
    pub fn exchange(mut self, exchange: impl Into<String>) -> Self {
        self.exchange_name = exchange.into();
        self
    }

    /// Sets the routing key for the binding.
    pub fn routing_key(mut self, key: impl Into<String>) -> Self {
        self.routing_key = key.into();
        self
    }

    pub fn queue_name(&self) -> &str {
        &self.queue_name
    }

    pub fn exchange_name(&self) -> &str {
        &self.exchange_name
    }

    pub fn key(&self) -> &str {
        &self.routing_key
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dead_letter_arguments_point_to_dlx() {
        let def = QueueDefinition::new("app.inbox")
            .durable()
            .with_dead_letter("app.dlx", "app.inbox.dlq");

        let args = def.arguments();

        assert_eq!(
            args[AMQP_HEADERS_DEAD_LETTER_EXCHANGE],
            HeaderValue::from("app.dlx")
        );
        assert_eq!(
            args[AMQP_HEADERS_DEAD_LETTER_ROUTING_KEY],
            HeaderValue::from("app.inbox.dlq")
        );
    }

    #[test]
    fn server_named_queue_is_private() {
        let def = QueueDefinition::server_named();
        assert!(def.name().is_empty());
        assert!(def.is_exclusive());
        assert!(def.delete);
        assert!(def.arguments().is_empty());
    }
}
