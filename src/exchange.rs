// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Exchange Management for RabbitMQ
//!
//! This module provides types for defining the exchanges the dispatcher owns.
//! Exchanges are the routing mechanism in RabbitMQ that determine how messages are
//! distributed to queues. Definitions follow a builder pattern and are validated
//! before they are declared.

use crate::{errors::ConfigError, headers::HeaderValue};
use serde::Deserialize;
use std::{collections::BTreeMap, fmt, str::FromStr};

/// Represents the types of exchanges the dispatcher can declare.
///
/// Each exchange type has specific routing behavior:
/// - Topic: Routes messages based on wildcard pattern matching of routing keys
/// - Direct: Routes messages to queues based on an exact match of routing keys
/// - Fanout: Broadcasts messages to all bound queues regardless of routing keys
/// - Headers: Routes based on message header values instead of routing keys
/// - ConsistentHash: Spreads messages over bound queues by hashing the routing key
///   (plugin required, needs broker-specific arguments)
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Deserialize)]
#[serde(try_from = "String")]
pub enum ExchangeKind {
    #[default]
    Topic,
    Direct,
    Fanout,
    Headers,
    ConsistentHash,
}

impl ExchangeKind {
    /// Name of the exchange type as the broker knows it.
    pub fn as_str(&self) -> &'static str {
        match self {
            ExchangeKind::Topic => "topic",
            ExchangeKind::Direct => "direct",
            ExchangeKind::Fanout => "fanout",
            ExchangeKind::Headers => "headers",
            ExchangeKind::ConsistentHash => "x-consistent-hash",
        }
    }

    pub fn requires_arguments(&self) -> bool {
        matches!(self, ExchangeKind::ConsistentHash)
    }
}

impl fmt::Display for ExchangeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ExchangeKind {
    type Err = ConfigError;

    /// Accepts both the broker names (`topic`, `x-consistent-hash`) and the
    /// configuration constants (`TOPIC`, `CONSISTENT_HASH`).
    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().replace('_', "-").as_str() {
            "topic" => Ok(ExchangeKind::Topic),
            "direct" => Ok(ExchangeKind::Direct),
            "fanout" => Ok(ExchangeKind::Fanout),
            "headers" => Ok(ExchangeKind::Headers),
            "x-consistent-hash" | "consistent-hash" => Ok(ExchangeKind::ConsistentHash),
            _ => Err(ConfigError::InvalidExchangeKind(value.to_owned())),
        }
    }
}

impl TryFrom<String> for ExchangeKind {
    type Error = ConfigError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<ExchangeKind> for lapin::ExchangeKind {
    /// Converts the dispatcher ExchangeKind to lapin's ExchangeKind.
    ///
    /// The consistent hash type is not native to AMQP and is declared as a custom type.
    fn from(kind: ExchangeKind) -> Self {
        match kind {
            ExchangeKind::Topic => lapin::ExchangeKind::Topic,
            ExchangeKind::Direct => lapin::ExchangeKind::Direct,
            ExchangeKind::Fanout => lapin::ExchangeKind::Fanout,
            ExchangeKind::Headers => lapin::ExchangeKind::Headers,
            ExchangeKind::ConsistentHash => lapin::ExchangeKind::Custom(kind.as_str().to_owned()),
        }
    }
}

/// Definition of a RabbitMQ exchange with its configuration parameters.
///
/// This struct implements the builder pattern to create and configure exchange definitions.
#[derive(Debug, Clone, PartialEq)]
pub struct ExchangeDefinition {
    pub(crate) name: String,
    pub(crate) kind: ExchangeKind,
    pub(crate) delete: bool,
    pub(crate) durable: bool,
    pub(crate) passive: bool,
    pub(crate) internal: bool,
    pub(crate) params: BTreeMap<String, HeaderValue>,
}

impl ExchangeDefinition {
    /// Creates a new exchange definition with the given name.
    ///
    /// By default, the exchange is created as a non-durable Topic exchange.
    ///
    /// # Parameters
    /// * `name` - The name of the exchange
    ///
    /// # Returns
    /// A new exchange definition with default settings
    pub fn new(name: impl Into<String>) -> ExchangeDefinition {
        ExchangeDefinition {
            name: name.into(),
            kind: ExchangeKind::Topic,
            delete: false,
            durable: false,
            passive: false,
            internal: false,
            params: BTreeMap::default(),
        }
    }

    /// Sets the exchange type.
    ///
    /// # Parameters
    /// * `kind` - The exchange type
    ///
    /// # Returns
    /// Self for method chaining
    pub fn kind(mut self, kind: ExchangeKind) -> Self {
        self.kind = kind;
        self
    }

    /// Sets the exchange parameters.
    ///
    /// # Parameters
    /// * `params` - A map of exchange parameters
    ///
    /// # Returns
    /// Self for method chaining
    pub fn params(mut self, params: BTreeMap<String, HeaderValue>) -> Self {
        self.params = params;
        self
    }

    /// Adds a single parameter to the exchange.
    ///
    /// # Parameters
    /// * `key` - The parameter name
    /// * `value` - The parameter value
    ///
    /// # Returns
    /// Self for method chaining
    pub fn param(mut self, key: impl Into<String>, value: impl Into<HeaderValue>) -> Self {
        self.params.insert(key.into(), value.into());
        self
    }

    /// Sets the exchange to auto-delete when no longer used.
    pub fn delete(mut self) -> Self {
        self.delete = true;
        self
    }

    /// Makes the exchange durable, persisting across broker restarts.
    pub fn durable(mut self) -> Self {
        self.durable = true;
        self
    }

    /// Sets durability from a configuration flag.
    pub fn durable_if(mut self, durable: bool) -> Self {
        self.durable = durable;
        self
    }

    /// Makes the exchange passive, checking for existence without creating it.
    pub fn passive(mut self) -> Self {
        self.passive = true;
        self
    }

    /// Makes the exchange internal, preventing direct publishing.
    pub fn internal(mut self) -> Self {
        self.internal = true;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn exchange_kind(&self) -> ExchangeKind {
        self.kind
    }

    pub fn is_durable(&self) -> bool {
        self.durable
    }

    pub fn arguments(&self) -> &BTreeMap<String, HeaderValue> {
        &self.params
    }

    /// Checks the arguments against the exchange type.
    ///
    /// # Returns
    /// * `ConfigError::MissingExchangeArguments` for a consistent hash exchange without arguments
    /// * `ConfigError::UnexpectedExchangeArguments` for any other type carrying arguments
    pub fn validate(&self) -> Result<(), ConfigError> {
        match (self.kind.requires_arguments(), self.params.is_empty()) {
            (true, true) => Err(ConfigError::MissingExchangeArguments(self.name.clone())),
            (false, false) => Err(ConfigError::UnexpectedExchangeArguments(self.name.clone())),
            _ => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_broker_and_constant_names() {
        assert_eq!("TOPIC".parse::<ExchangeKind>().unwrap(), ExchangeKind::Topic);
        assert_eq!("direct".parse::<ExchangeKind>().unwrap(), ExchangeKind::Direct);
        assert_eq!(
            "CONSISTENT_HASH".parse::<ExchangeKind>().unwrap(),
            ExchangeKind::ConsistentHash
        );
        assert_eq!(
            "x-consistent-hash".parse::<ExchangeKind>().unwrap(),
            ExchangeKind::ConsistentHash
        );
        assert!(matches!(
            "delayed".parse::<ExchangeKind>(),
            Err(ConfigError::InvalidExchangeKind(_))
        ));
    }

    #[test]
    fn consistent_hash_maps_to_custom_lapin_kind() {
        let kind: lapin::ExchangeKind = ExchangeKind::ConsistentHash.into();
        assert!(matches!(kind, lapin::ExchangeKind::Custom(ref name) if name == "x-consistent-hash"));
    }

    #[test]
    fn consistent_hash_requires_arguments() {
        let def = ExchangeDefinition::new("app.ex").kind(ExchangeKind::ConsistentHash);
        assert!(matches!(
            def.validate(),
            Err(ConfigError::MissingExchangeArguments(name)) if name == "app.ex"
        ));

        let def = def.param("hash-header", "X-Tenant");
        assert!(def.validate().is_ok());
    }

    #[test]
    fn other_kinds_reject_arguments() {
        let def = ExchangeDefinition::new("app.ex")
            .kind(ExchangeKind::Direct)
            .param("hash-header", "X-Tenant");
        assert!(matches!(
            def.validate(),
            Err(ConfigError::UnexpectedExchangeArguments(_))
        ));
    }
}
