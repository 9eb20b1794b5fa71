// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Dispatcher Runtime
//!
//! Installs the whole dispatcher from one configuration: the publisher and its reply
//! queue, the frozen handler registry, the broker topology and the consumer loop, plus
//! the entity events bridge when enabled.
//!
//! ```ignore
//! let dispatcher = MessageDispatcher::builder(DispatcherConfig::load()?)
//!     .listener(Arc::new(PaymentsListener::default()))
//!     .handlers_with(|publisher| vec![HandlerMethod::command("charge", move |_ctx, c: Charge| {
//!         let publisher = publisher.clone();
//!         async move { charge(publisher, c).await }
//!     })])
//!     .connect()
//!     .await?;
//! ```

use crate::{
    channel::LapinTransport,
    config::{DispatcherConfig, ResolvedConfig},
    consumer::DeliveryProcessor,
    dispatcher::{ConsumerHandle, ConsumerLoop},
    entity_events::EntityEventBridge,
    errors::StartupError,
    handler::{HandlerMethod, MessageListener},
    publisher::{MessagePublisher, RabbitMessagePublisher},
    registry::{HandlerRegistry, HandlerRegistryBuilder},
    retry::DeadLetterer,
    router::Router,
    topology::{AmqpTopology, Topology},
    transport::AmqpTransport,
};
use std::sync::Arc;
use tracing::{debug, info};

type HandlerFactory = Box<dyn FnOnce(Arc<dyn MessagePublisher>) -> Vec<HandlerMethod> + Send>;

/// Collects the handlers of a dispatcher before starting it.
pub struct MessageDispatcherBuilder {
    config: DispatcherConfig,
    registry: HandlerRegistryBuilder,
    factories: Vec<HandlerFactory>,
}

impl MessageDispatcherBuilder {
    /// Registers every handler of a listener object.
    pub fn listener<L: MessageListener>(mut self, listener: Arc<L>) -> Self {
        self.registry = self.registry.listener(listener);
        self
    }

    pub fn handler(mut self, method: HandlerMethod) -> Self {
        self.registry = self.registry.handler(method);
        self
    }

    /// Registers handlers that need the dispatcher's own publisher, created at start.
    pub fn handlers_with<F>(mut self, factory: F) -> Self
    where
        F: FnOnce(Arc<dyn MessagePublisher>) -> Vec<HandlerMethod> + Send + 'static,
    {
        self.factories.push(Box::new(factory));
        self
    }

    /// Connects to RabbitMQ with the configured connection settings and starts.
    pub async fn connect(self) -> Result<MessageDispatcher, StartupError> {
        let cfg = self.config.resolve()?;
        let transport = LapinTransport::connect(&cfg.connection, &cfg.app_name).await?;

        self.start_resolved(cfg, Arc::new(transport)).await
    }

    /// Starts the dispatcher on the given broker.
    ///
    /// Configuration, registry and topology failures are fatal: nothing keeps running
    /// when this returns an error.
    ///
    /// # Parameters
    /// * `transport` - The broker to run on
    ///
    /// # Returns
    /// The running dispatcher, or the `StartupError` that aborted the start
    pub async fn start(
        self,
        transport: Arc<dyn AmqpTransport>,
    ) -> Result<MessageDispatcher, StartupError> {
        let cfg = self.config.resolve()?;
        self.start_resolved(cfg, transport).await
    }

    async fn start_resolved(
        self,
        cfg: ResolvedConfig,
        transport: Arc<dyn AmqpTransport>,
    ) -> Result<MessageDispatcher, StartupError> {
        let publisher: Arc<dyn MessagePublisher> =
            Arc::new(RabbitMessagePublisher::new(transport.clone(), &cfg).await?);

        let mut registry = self.registry;
        for factory in self.factories {
            registry = registry.handlers(factory(publisher.clone()));
        }
        let registry = Arc::new(registry.build()?);
        debug!(handlers = registry.len(), "handler registry frozen");

        let consumers = if cfg.listener_enabled {
            AmqpTopology::for_dispatcher(transport.clone(), &cfg)?
                .install()
                .await?;

            let processor = DeliveryProcessor::new(
                Arc::new(Router::new(registry.clone(), cfg.log_messages)),
                cfg.retry,
                DeadLetterer::new(
                    transport.clone(),
                    cfg.dead_letter.exchange.name(),
                    &cfg.dead_letter.routing_key,
                ),
                transport.clone(),
                &cfg.app_name,
                cfg.return_exceptions,
            );

            let handle = ConsumerLoop::new(transport.clone(), Arc::new(processor), &cfg)
                .start()
                .await?;
            Some(handle)
        } else {
            info!("message listener disabled, no consumer started");
            if let Some(settings) = &cfg.entity_events {
                settings.exchange.validate()?;
                AmqpTopology::new(transport.clone())
                    .exchange(settings.exchange.clone())
                    .install()
                    .await?;
            }
            None
        };

        let entity_events = cfg
            .entity_events
            .as_ref()
            .map(|settings| EntityEventBridge::new(publisher.clone(), settings));

        info!(
            app = %cfg.app_name,
            exchange = cfg.exchange.name(),
            queue = %cfg.queue,
            "message dispatcher started"
        );

        Ok(MessageDispatcher {
            config: cfg,
            publisher,
            registry,
            consumers,
            entity_events,
        })
    }
}

/// A running dispatcher.
pub struct MessageDispatcher {
    config: ResolvedConfig,
    publisher: Arc<dyn MessagePublisher>,
    registry: Arc<HandlerRegistry>,
    consumers: Option<ConsumerHandle>,
    entity_events: Option<EntityEventBridge>,
}

impl MessageDispatcher {
    pub fn builder(config: DispatcherConfig) -> MessageDispatcherBuilder {
        MessageDispatcherBuilder {
            config,
            registry: HandlerRegistry::builder(),
            factories: vec![],
        }
    }

    pub fn publisher(&self) -> Arc<dyn MessagePublisher> {
        self.publisher.clone()
    }

    /// The entity events bridge, when entity events are enabled.
    pub fn entity_events(&self) -> Option<&EntityEventBridge> {
        self.entity_events.as_ref()
    }

    pub fn config(&self) -> &ResolvedConfig {
        &self.config
    }

    pub fn registry(&self) -> &HandlerRegistry {
        &self.registry
    }

    /// Number of consumer workers currently running.
    pub fn active_consumers(&self) -> usize {
        self.consumers
            .as_ref()
            .map_or(0, ConsumerHandle::active_workers)
    }

    /// Stops the consumers, draining in-flight deliveries within the shutdown grace.
    pub async fn shutdown(self) {
        if let Some(consumers) = self.consumers {
            consumers.shutdown().await;
        }
        info!(app = %self.config.app_name, "message dispatcher stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{errors::RegistryError, memory::InMemoryBroker};
    use serde::Deserialize;

    #[derive(Deserialize)]
    struct Lookup {}

    fn config() -> DispatcherConfig {
        let mut cfg = DispatcherConfig::new("svc-A");
        cfg.exchange = "app.ex".to_owned();
        cfg
    }

    #[tokio::test]
    async fn invalid_registry_aborts_start() {
        let broker = InMemoryBroker::new();

        let result = MessageDispatcher::builder(config())
            .handler(HandlerMethod::query("lookup", |_ctx, _q: Lookup| async { Ok(()) }))
            .start(Arc::new(broker.clone()))
            .await;

        assert!(matches!(
            result,
            Err(StartupError::Registry(RegistryError::MissingReturnValue { .. }))
        ));
        assert!(!broker.has_exchange("app.ex"));
    }

    #[tokio::test]
    async fn resolved_config_is_not_resolved_again() {
        let broker = InMemoryBroker::new();
        let mut cfg = config();
        cfg.listener.enabled = false;
        let resolved = cfg.resolve().unwrap();
        let mut unresolvable = config();
        unresolvable.concurrency = "many".to_owned();

        let dispatcher = MessageDispatcher::builder(unresolvable)
            .start_resolved(resolved, Arc::new(broker.clone()))
            .await
            .unwrap();

        assert_eq!(dispatcher.config().app_name, "svc-A");
        dispatcher.shutdown().await;
    }

    #[tokio::test]
    async fn disabled_listener_declares_no_topology() {
        let broker = InMemoryBroker::new();
        let mut cfg = config();
        cfg.listener.enabled = false;

        let dispatcher = MessageDispatcher::builder(cfg)
            .start(Arc::new(broker.clone()))
            .await
            .unwrap();

        assert_eq!(dispatcher.active_consumers(), 0);
        assert!(!broker.has_exchange("app.ex"));
        assert!(!broker.has_queue("svc-A"));
        dispatcher.shutdown().await;
    }

    #[tokio::test]
    async fn entity_events_bridge_is_created_when_enabled() {
        let broker = InMemoryBroker::new();
        let mut cfg = config();
        cfg.entity_events.enabled = true;

        let dispatcher = MessageDispatcher::builder(cfg)
            .start(Arc::new(broker.clone()))
            .await
            .unwrap();

        assert!(dispatcher.entity_events().is_some());
        assert!(broker.has_exchange("svc-A-entity-events"));
        assert_eq!(dispatcher.active_consumers(), 1);
        dispatcher.shutdown().await;
    }
}
