// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Error Types for the Message Dispatcher
//!
//! This module groups every error the dispatcher can raise:
//!
//! - `AmqpError`: broker transport failures (connection, channel, declarations, publish, ack).
//! - `ConfigError`: configuration resolution failures, fatal at startup.
//! - `RegistryError`: invalid handler registrations, fatal at startup.
//! - `DispatchError`: the runtime taxonomy surfaced by routing, handlers and the publisher.
//! - `StartupError`: whatever aborts `MessageDispatcher::start`.

use crate::{envelope::MessageKind, handler::HandlerError};
use std::time::Duration;
use thiserror::Error;

/// Represents errors that can occur during AMQP/RabbitMQ operations.
///
/// Each variant provides specific context about what broker operation failed.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AmqpError {
    /// Internal errors that don't fit into other categories
    #[error("internal error")]
    InternalError,

    /// Error establishing a connection to the RabbitMQ server
    #[error("failure to connect")]
    ConnectionError,

    /// Error creating a channel from an established connection
    #[error("failure to create a channel")]
    ChannelError,

    /// Error enabling publisher confirms on a channel
    #[error("failure to enable publisher confirms")]
    ConfirmSelectError,

    /// Error declaring an exchange with the given name
    #[error("failure to declare an exchange `{0}`")]
    DeclareExchangeError(String),

    /// Error declaring a queue with the given name
    #[error("failure to declare a queue `{0}`")]
    DeclareQueueError(String),

    /// Error binding an exchange to a queue
    #[error("failure to binding exchange `{0}` to queue `{1}`")]
    BindingExchangeToQueueError(String, String),

    /// Error binding a consumer to a queue
    #[error("failure to declare consumer `{0}`")]
    BindingConsumerError(String),

    /// Error publishing a message
    #[error("failure to publish `{0}`")]
    PublishingError(String),

    /// The broker returned a mandatory message because no queue was bound for it
    #[error("message to exchange `{exchange}` with key `{routing_key}` is unroutable")]
    UnroutableMessage {
        exchange: String,
        routing_key: String,
    },

    /// The broker negatively confirmed a publish
    #[error("message was not confirmed by the broker")]
    PublishNotConfirmed,

    /// Error acknowledging a message
    #[error("failure to ack message")]
    AckMessageError,

    /// Error negative-acknowledging a message
    #[error("failure to nack message")]
    NackMessageError,

    /// Error publishing a message to the Dead Letter Queue (DLQ)
    #[error("failure to publish to dlq")]
    PublishingToDLQError,

    /// Error configuring Quality of Service parameters
    #[error("failure to configure qos `{0}`")]
    QoSDeclarationError(String),

    /// Error inspecting a queue
    #[error("failure to inspect queue `{0}`")]
    QueueInspectError(String),

    /// Error consuming a message
    #[error("failure to consume message `{0}`")]
    ConsumerError(String),
}

/// Configuration could not be resolved into a runnable setup.
#[derive(Error, Debug)]
pub enum ConfigError {
    /// Error from the Figment configuration library.
    #[error("configuration error: {0}")]
    Figment(Box<figment::Error>),

    #[error("`app_name` must be configured")]
    MissingAppName,

    #[error("unknown exchange type `{0}`")]
    InvalidExchangeKind(String),

    /// A `x-consistent-hash` exchange was configured without its broker arguments.
    #[error("exchange `{0}` is of type x-consistent-hash and requires non-empty arguments")]
    MissingExchangeArguments(String),

    #[error("exchange `{0}` does not accept arguments for its type")]
    UnexpectedExchangeArguments(String),

    #[error("invalid concurrency `{0}`, expected `min-max` with 1 <= min <= max")]
    InvalidConcurrency(String),

    #[error("prefetch count `{0}` must be between 1 and 100")]
    PrefetchOutOfRange(u16),

    #[error("invalid retry configuration: {0}")]
    InvalidRetry(String),
}

impl From<figment::Error> for ConfigError {
    fn from(err: figment::Error) -> Self {
        Self::Figment(Box::new(err))
    }
}

/// A handler registration that cannot be frozen into the registry.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RegistryError {
    #[error("handler @{kind} `{handler}` has no input parameter")]
    NoInputParameter { kind: MessageKind, handler: String },

    #[error("handler @{kind} `{handler}` declares {count} input parameters, only one is allowed")]
    MultipleInputParameters {
        kind: MessageKind,
        handler: String,
        count: usize,
    },

    #[error(
        "handler @{kind} `{duplicate}` declares the same input type `{payload_type}` as `{existing}`, duplicated handlers are not allowed"
    )]
    DuplicatedInputParameter {
        kind: MessageKind,
        payload_type: String,
        existing: String,
        duplicate: String,
    },

    #[error("query handler `{handler}` for `{payload_type}` must return a value")]
    MissingReturnValue {
        handler: String,
        payload_type: String,
    },
}

/// Runtime failures of the inbound dispatch pipeline and of the publisher.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum DispatchError {
    #[error("header `{0}` is missing from the message")]
    MissingHeader(String),

    #[error("header `{header}` carries an invalid value `{value}`")]
    InvalidHeader { header: String, value: String },

    #[error("no handler found to process {kind} `{payload_type}`")]
    HandlerNotFound {
        kind: MessageKind,
        payload_type: String,
    },

    #[error("failure to decode `{payload_type}`: {reason}")]
    Decoding {
        payload_type: String,
        reason: String,
    },

    #[error("failure to encode payload: {0}")]
    Encoding(String),

    #[error("{0}")]
    Handler(HandlerError),

    #[error("failure to publish message: {0}")]
    Publish(AmqpError),

    #[error("no reply received within {0:?}")]
    ReplyTimeout(Duration),

    #[error("remote service `{remote_service}` failed with {exception_type}: {message}")]
    RemoteResult {
        exception_type: String,
        message: String,
        remote_service: String,
    },

    #[error("publisher is shutting down")]
    Closed,
}

impl DispatchError {
    /// Short name of the root cause, as written into the `exception-root-cause` header.
    pub fn root_cause_name(&self) -> &str {
        match self {
            DispatchError::MissingHeader(_) => "MissingHeader",
            DispatchError::InvalidHeader { .. } => "InvalidHeader",
            DispatchError::HandlerNotFound { .. } => "HandlerNotFound",
            DispatchError::Decoding { .. } => "Decoding",
            DispatchError::Encoding(_) => "Encoding",
            DispatchError::Handler(err) => err.type_name(),
            DispatchError::Publish(_) => "Publish",
            DispatchError::ReplyTimeout(_) => "ReplyTimeout",
            DispatchError::RemoteResult { .. } => "RemoteResult",
            DispatchError::Closed => "Closed",
        }
    }

    /// Message of the root cause, as written into the `exception-message` header.
    pub fn root_cause_message(&self) -> String {
        match self {
            DispatchError::Handler(err) => err.message().to_owned(),
            other => other.to_string(),
        }
    }

    /// Whether the failure happened before any handler ran (routing or decoding).
    pub fn is_routing_failure(&self) -> bool {
        matches!(
            self,
            DispatchError::MissingHeader(_)
                | DispatchError::InvalidHeader { .. }
                | DispatchError::HandlerNotFound { .. }
                | DispatchError::Decoding { .. }
        )
    }
}

/// Anything that prevents the dispatcher runtime from starting.
#[derive(Error, Debug)]
pub enum StartupError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Registry(#[from] RegistryError),

    #[error(transparent)]
    Transport(#[from] AmqpError),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn root_cause_of_routing_failures_uses_taxonomy_names() {
        let err = DispatchError::MissingHeader("x-message-dispatcher-handler-type".to_owned());
        assert_eq!(err.root_cause_name(), "MissingHeader");
        assert!(err.is_routing_failure());
        assert_eq!(
            err.root_cause_message(),
            "header `x-message-dispatcher-handler-type` is missing from the message"
        );
    }

    #[test]
    fn root_cause_of_handler_failures_uses_handler_error() {
        let err = DispatchError::Handler(HandlerError::new("InvalidArgumentError", "bad id"));
        assert_eq!(err.root_cause_name(), "InvalidArgumentError");
        assert_eq!(err.root_cause_message(), "bad id");
        assert!(!err.is_routing_failure());
    }

    #[test]
    fn binding_error_names_both_sides() {
        let err = AmqpError::BindingExchangeToQueueError("app.ex".into(), "app.inbox".into());
        assert_eq!(
            err.to_string(),
            "failure to binding exchange `app.ex` to queue `app.inbox`"
        );
    }
}
