// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Broker Topology Management
//!
//! This module declares the exchanges, queues and bindings the dispatcher owns:
//!
//! - the primary exchange of the configured kind,
//! - the primary queue, dead-lettering to the DLQ exchange,
//! - the binding of the primary queue on its routing key,
//! - the DLQ exchange, the DLQ and their binding,
//! - the entity events exchange when entity events are enabled.
//!
//! Every declaration is idempotent, installing the same topology twice is a no-op.
//! An existing object declared with different arguments fails the installation.

use crate::{
    config::ResolvedConfig,
    errors::{AmqpError, ConfigError},
    exchange::ExchangeDefinition,
    queue::{QueueBinding, QueueDefinition},
    transport::AmqpTransport,
};
use async_trait::async_trait;
use std::sync::Arc;
use tracing::{debug, error};

/// Trait defining the interface for topology management.
///
/// This trait provides methods for registering exchanges, queues, and bindings,
/// as well as installing the topology to the broker.
#[async_trait]
pub trait Topology {
    /// Adds an exchange definition to the topology.
    fn exchange(self, def: ExchangeDefinition) -> Self;

    /// Adds a queue definition to the topology.
    fn queue(self, def: QueueDefinition) -> Self;

    /// Adds a queue-to-exchange binding to the topology.
    fn queue_binding(self, binding: QueueBinding) -> Self;

    /// Installs the topology to the broker.
    ///
    /// This creates all the exchanges and queues, and sets up all the bindings.
    async fn install(&self) -> Result<(), AmqpError>;
}

/// Broker implementation of the Topology trait.
///
/// This struct maintains collections of exchanges, queues, and bindings,
/// and installs them through an `AmqpTransport`.
pub struct AmqpTopology {
    transport: Arc<dyn AmqpTransport>,
    pub(crate) exchanges: Vec<ExchangeDefinition>,
    pub(crate) queues: Vec<QueueDefinition>,
    pub(crate) queues_binding: Vec<QueueBinding>,
}

impl AmqpTopology {
    /// Creates a new, empty AmqpTopology.
    ///
    /// # Parameters
    /// * `transport` - The broker to declare the topology on
    ///
    /// # Returns
    /// A new AmqpTopology instance
    pub fn new(transport: Arc<dyn AmqpTransport>) -> AmqpTopology {
        AmqpTopology {
            transport,
            exchanges: vec![],
            queues: vec![],
            queues_binding: vec![],
        }
    }

    /// The topology of a dispatcher: primary exchange and queue dead-lettering to the
    /// DLQ exchange and queue, plus the entity events exchange when enabled.
    ///
    /// # Parameters
    /// * `transport` - The broker to declare the topology on
    /// * `cfg` - The resolved dispatcher configuration
    ///
    /// # Returns
    /// The topology, or a `ConfigError` when an exchange definition is invalid
    pub fn for_dispatcher(
        transport: Arc<dyn AmqpTransport>,
        cfg: &ResolvedConfig,
    ) -> Result<AmqpTopology, ConfigError> {
        cfg.exchange.validate()?;
        cfg.dead_letter.exchange.validate()?;

        let dlx = &cfg.dead_letter;

        let mut topology = AmqpTopology::new(transport)
            .exchange(cfg.exchange.clone())
            .queue(
                QueueDefinition::new(&cfg.queue)
                    .durable_if(cfg.durable)
                    .with_dead_letter(dlx.exchange.name(), &dlx.routing_key),
            )
            .queue_binding(
                QueueBinding::new(&cfg.queue)
                    .exchange(cfg.exchange.name())
                    .routing_key(&cfg.routing_key),
            )
            .exchange(dlx.exchange.clone())
            .queue(QueueDefinition::new(&dlx.queue).durable_if(dlx.durable))
            .queue_binding(
                QueueBinding::new(&dlx.queue)
                    .exchange(dlx.exchange.name())
                    .routing_key(&dlx.routing_key),
            );

        if let Some(entity_events) = &cfg.entity_events {
            entity_events.exchange.validate()?;
            topology = topology.exchange(entity_events.exchange.clone());
        }

        Ok(topology)
    }
}

#[async_trait]
impl Topology for AmqpTopology {
    /// Adds an exchange definition to the topology.
    ///
    /// # Parameters
    /// * `def` - An exchange definition
    ///
    /// # Returns
    /// Self for method chaining
    fn exchange(mut self, def: ExchangeDefinition) -> Self {
        self.exchanges.push(def);
        self
    }

    /// Adds a queue definition to the topology. A queue added twice is declared once.
    ///
    /// # Parameters
    /// * `def` - A queue definition
    ///
    /// # Returns
    /// Self for method chaining
    fn queue(mut self, def: QueueDefinition) -> Self {
        self.queues.retain(|queue| queue.name != def.name);
        self.queues.push(def);
        self
    }

    /// Adds a queue-to-exchange binding to the topology.
    ///
    /// # Parameters
    /// * `binding` - A queue binding
    ///
    /// # Returns
    /// Self for method chaining
    fn queue_binding(mut self, binding: QueueBinding) -> Self {
        self.queues_binding.push(binding);
        self
    }

    /// Installs the topology to the broker.
    ///
    /// This method performs the following operations in order:
    /// 1. Creates all exchanges
    /// 2. Creates all queues
    /// 3. Sets up queue-to-exchange bindings
    ///
    /// # Returns
    /// Ok(()) on success or AmqpError on failure
    async fn install(&self) -> Result<(), AmqpError> {
        self.install_exchange().await?;
        self.install_queue().await?;
        self.binding_queues().await
    }
}

impl AmqpTopology {
    /// Creates all exchanges defined in the topology.
    ///
    /// # Returns
    /// Ok(()) on success or AmqpError on failure
    async fn install_exchange(&self) -> Result<(), AmqpError> {
        for exch in &self.exchanges {
            debug!("creating exchange: {}", exch.name);

            match self.transport.declare_exchange(exch).await {
                Err(err) => {
                    error!(
                        error = err.to_string(),
                        name = %exch.name,
                        "error to declare the exchange"
                    );
                    Err(AmqpError::DeclareExchangeError(exch.name.clone()))
                }
                _ => Ok(()),
            }?;

            debug!("exchange: {} was created", exch.name);
        }

        Ok(())
    }

    /// Creates all queues defined in the topology.
    ///
    /// # Returns
    /// Ok(()) on success or AmqpError on failure
    async fn install_queue(&self) -> Result<(), AmqpError> {
        for def in &self.queues {
            debug!("creating queue: {}", def.name);

            match self.transport.declare_queue(def).await {
                Err(err) => {
                    error!(
                        error = err.to_string(),
                        name = %def.name,
                        "error to declare the queue"
                    );
                    Err(AmqpError::DeclareQueueError(def.name.clone()))
                }
                Ok(name) => {
                    debug!("queue: {} was created", name);
                    Ok(())
                }
            }?;
        }

        Ok(())
    }

    /// Sets up queue-to-exchange bindings.
    ///
    /// # Returns
    /// Ok(()) on success or AmqpError on failure
    async fn binding_queues(&self) -> Result<(), AmqpError> {
        for binding in &self.queues_binding {
            debug!(
                "binding queue: {} to the exchange: {} with the key: {}",
                binding.queue_name, binding.exchange_name, binding.routing_key
            );

            match self.transport.bind_queue(binding).await {
                Err(err) => {
                    error!(error = err.to_string(), "error to bind queue to exchange");

                    Err(AmqpError::BindingExchangeToQueueError(
                        binding.exchange_name.clone(),
                        binding.queue_name.clone(),
                    ))
                }
                _ => Ok(()),
            }?;
        }

        debug!("queues were bound");

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        config::DispatcherConfig,
        exchange::ExchangeKind,
        queue::{AMQP_HEADERS_DEAD_LETTER_EXCHANGE, AMQP_HEADERS_DEAD_LETTER_ROUTING_KEY},
        transport::MockAmqpTransport,
    };
    use mockall::Sequence;
    use std::sync::Mutex;

    fn resolved() -> ResolvedConfig {
        let mut cfg = DispatcherConfig::new("svc-A");
        cfg.exchange = "app.ex".to_owned();
        cfg.queue = Some("app.inbox".to_owned());
        cfg.resolve().unwrap()
    }

    #[tokio::test]
    async fn installs_exchanges_then_queues_then_bindings() {
        let mut transport = MockAmqpTransport::new();
        let mut seq = Sequence::new();

        transport
            .expect_declare_exchange()
            .withf(|def| def.name() == "app.ex" && def.exchange_kind() == ExchangeKind::Topic)
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_| Ok(()));
        transport
            .expect_declare_exchange()
            .withf(|def| def.name() == "app.dlx")
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_| Ok(()));
        transport
            .expect_declare_queue()
            .withf(|def| {
                let args = def.arguments();
                def.name() == "app.inbox"
                    && def.is_durable()
                    && args[AMQP_HEADERS_DEAD_LETTER_EXCHANGE].as_str() == Some("app.dlx")
                    && args[AMQP_HEADERS_DEAD_LETTER_ROUTING_KEY].as_str() == Some("app.inbox.dlq")
            })
            .times(1)
            .in_sequence(&mut seq)
            .returning(|def| Ok(def.name().to_owned()));
        transport
            .expect_declare_queue()
            .withf(|def| def.name() == "app.inbox.dlq" && def.arguments().is_empty())
            .times(1)
            .in_sequence(&mut seq)
            .returning(|def| Ok(def.name().to_owned()));
        transport
            .expect_bind_queue()
            .withf(|b| {
                b.queue_name() == "app.inbox" && b.exchange_name() == "app.ex" && b.key() == "app.inbox"
            })
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_| Ok(()));
        transport
            .expect_bind_queue()
            .withf(|b| {
                b.queue_name() == "app.inbox.dlq"
                    && b.exchange_name() == "app.dlx"
                    && b.key() == "app.inbox.dlq"
            })
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_| Ok(()));

        let topology = AmqpTopology::for_dispatcher(Arc::new(transport), &resolved()).unwrap();

        assert!(topology.install().await.is_ok());
    }

    #[tokio::test]
    async fn entity_events_exchange_is_declared_when_enabled() {
        let mut cfg = DispatcherConfig::new("svc-A");
        cfg.entity_events.enabled = true;
        let cfg = cfg.resolve().unwrap();

        let declared = Arc::new(Mutex::new(Vec::new()));
        let mut transport = MockAmqpTransport::new();
        let names = declared.clone();
        transport
            .expect_declare_exchange()
            .times(3)
            .returning(move |def| {
                names.lock().unwrap().push((def.name().to_owned(), def.is_durable()));
                Ok(())
            });
        transport
            .expect_declare_queue()
            .returning(|def| Ok(def.name().to_owned()));
        transport.expect_bind_queue().returning(|_| Ok(()));

        let topology = AmqpTopology::for_dispatcher(Arc::new(transport), &cfg).unwrap();

        assert!(topology.install().await.is_ok());
        assert_eq!(
            declared.lock().unwrap().last(),
            Some(&("svc-A-entity-events".to_owned(), true))
        );
    }

    #[tokio::test]
    async fn declaration_failure_stops_the_installation() {
        let mut transport = MockAmqpTransport::new();
        transport
            .expect_declare_exchange()
            .times(1)
            .returning(|_| Err(AmqpError::DeclareExchangeError("precondition failed".to_owned())));
        transport.expect_declare_queue().never();
        transport.expect_bind_queue().never();

        let topology = AmqpTopology::for_dispatcher(Arc::new(transport), &resolved()).unwrap();

        assert_eq!(
            topology.install().await,
            Err(AmqpError::DeclareExchangeError("app.ex".to_owned()))
        );
    }

    #[test]
    fn same_queue_is_declared_once() {
        let topology = AmqpTopology::new(Arc::new(MockAmqpTransport::new()))
            .queue(QueueDefinition::new("app.inbox"))
            .queue(QueueDefinition::new("app.inbox").durable());

        assert_eq!(topology.queues.len(), 1);
        assert!(topology.queues[0].is_durable());
    }
}
