// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Message Dispatcher
//!
//! Typed command, query, notification and event messaging over RabbitMQ.
//!
//! Handlers are registered by `(kind, payload type)` and invoked for the deliveries
//! whose `handler-type` and `body-type` headers match. Failures are retried with
//! exponential backoff, dead-lettered when they cannot be processed and, for commands
//! and queries awaiting a reply, returned to the caller as remote errors.

mod consumer;
mod otel;

pub mod channel;
pub mod codec;
pub mod config;
pub mod context;
pub mod dispatcher;
pub mod entity_events;
pub mod envelope;
pub mod errors;
pub mod exchange;
pub mod handler;
pub mod headers;
pub mod memory;
pub mod publisher;
pub mod queue;
pub mod registry;
pub mod reply;
pub mod retry;
pub mod router;
pub mod runtime;
pub mod topology;
pub mod transport;

pub use config::DispatcherConfig;
pub use context::InboundContext;
pub use envelope::{Envelope, MessageKind, RemoteInvocationResult};
pub use errors::{AmqpError, ConfigError, DispatchError, RegistryError, StartupError};
pub use handler::{HandlerError, HandlerMethod, MessageListener, RetryClass};
pub use memory::InMemoryBroker;
pub use publisher::{MessagePublisher, MessagePublisherExt, PublishRequest};
pub use runtime::{MessageDispatcher, MessageDispatcherBuilder};
