// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Dispatcher Configuration
//!
//! `DispatcherConfig` mirrors the flat configuration surface of the dispatcher. It is
//! loaded with figment from an optional TOML file and `MESSAGE_DISPATCHER_` environment
//! variables (nested keys separated by `__`, e.g. `MESSAGE_DISPATCHER_RETRY__MAX_ATTEMPTS`),
//! then resolved into a validated `ResolvedConfig` with every default filled in.

use crate::{
    errors::ConfigError,
    exchange::{ExchangeDefinition, ExchangeKind},
    headers::Headers,
    retry::RetryPolicy,
};
use figment::{
    providers::{Env, Format, Toml},
    Figment,
};
use serde::{Deserialize, Deserializer};
use std::{path::Path, str::FromStr, time::Duration};

/// Environment variable prefix of every configuration key
pub const ENV_PREFIX: &str = "MESSAGE_DISPATCHER_";

/// Top-level dispatcher configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct DispatcherConfig {
    /// Identifier of this application, stamped as `remoteService` on every publish.
    #[serde(default)]
    pub app_name: String,

    #[serde(default)]
    pub connection: ConnectionConfig,

    /// Primary exchange name.
    #[serde(default = "default_exchange")]
    pub exchange: String,

    #[serde(default = "default_exchange_type")]
    pub exchange_type: String,

    /// Broker-specific arguments, required by `CONSISTENT_HASH` only.
    #[serde(default)]
    pub exchange_arguments: Headers,

    #[serde(default = "default_true")]
    pub durable: bool,

    /// Primary queue, defaults to the application name.
    #[serde(default)]
    pub queue: Option<String>,

    /// Binding key of the primary queue, defaults to the queue name.
    #[serde(default)]
    pub routing_key: Option<String>,

    /// Consumer workers range as `min-max`.
    #[serde(default = "default_concurrency")]
    pub concurrency: String,

    #[serde(default = "default_prefetch_count")]
    pub prefetch_count: u16,

    #[serde(default)]
    pub dead_letter: DeadLetterConfig,

    #[serde(default)]
    pub retry: RetryConfig,

    #[serde(default = "default_reply_timeout_ms")]
    pub reply_timeout_ms: u64,

    /// Inbound headers copied onto publishes made while handling a message.
    /// Accepts a list or a comma separated string.
    #[serde(default, deserialize_with = "deserialize_header_names")]
    pub mapped_headers: Vec<String>,

    /// Whether handler failures are sent back to waiting callers instead of retried.
    #[serde(default = "default_true")]
    pub return_exceptions: bool,

    #[serde(default)]
    pub listener: ListenerConfig,

    #[serde(default)]
    pub logging: LoggingConfig,

    #[serde(default)]
    pub entity_events: EntityEventsConfig,
}

fn default_exchange() -> String {
    "message.dispatcher.ex".to_owned()
}

fn default_exchange_type() -> String {
    "TOPIC".to_owned()
}

const fn default_true() -> bool {
    true
}

fn default_concurrency() -> String {
    "1-10".to_owned()
}

const fn default_prefetch_count() -> u16 {
    10
}

const fn default_reply_timeout_ms() -> u64 {
    15000
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            app_name: String::new(),
            connection: ConnectionConfig::default(),
            exchange: default_exchange(),
            exchange_type: default_exchange_type(),
            exchange_arguments: Headers::new(),
            durable: true,
            queue: None,
            routing_key: None,
            concurrency: default_concurrency(),
            prefetch_count: default_prefetch_count(),
            dead_letter: DeadLetterConfig::default(),
            retry: RetryConfig::default(),
            reply_timeout_ms: default_reply_timeout_ms(),
            mapped_headers: Vec::new(),
            return_exceptions: true,
            listener: ListenerConfig::default(),
            logging: LoggingConfig::default(),
            entity_events: EntityEventsConfig::default(),
        }
    }
}

/// Broker connection settings.
#[derive(Debug, Clone, Deserialize)]
pub struct ConnectionConfig {
    #[serde(default = "default_host")]
    pub host: String,

    #[serde(default = "default_port")]
    pub port: u16,

    #[serde(default = "default_guest")]
    pub user: String,

    #[serde(default = "default_guest")]
    pub password: String,

    #[serde(default = "default_vhost")]
    pub vhost: String,
}

fn default_host() -> String {
    "localhost".to_owned()
}

const fn default_port() -> u16 {
    5672
}

fn default_guest() -> String {
    "guest".to_owned()
}

fn default_vhost() -> String {
    "/".to_owned()
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            user: default_guest(),
            password: default_guest(),
            vhost: default_vhost(),
        }
    }
}

/// Dead-letter exchange and queue settings. Unset names derive from the primary ones.
#[derive(Debug, Clone, Deserialize)]
pub struct DeadLetterConfig {
    #[serde(default)]
    pub exchange: Option<String>,

    #[serde(default = "default_exchange_type")]
    pub exchange_type: String,

    #[serde(default)]
    pub exchange_arguments: Headers,

    #[serde(default = "default_true")]
    pub durable: bool,

    #[serde(default)]
    pub queue: Option<String>,

    #[serde(default)]
    pub routing_key: Option<String>,
}

impl Default for DeadLetterConfig {
    fn default() -> Self {
        Self {
            exchange: None,
            exchange_type: default_exchange_type(),
            exchange_arguments: Headers::new(),
            durable: true,
            queue: None,
            routing_key: None,
        }
    }
}

/// Retry backoff settings.
#[derive(Debug, Clone, Deserialize)]
pub struct RetryConfig {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    #[serde(default = "default_initial_interval_ms")]
    pub initial_interval_ms: u64,

    #[serde(default = "default_multiplier")]
    pub multiplier: f64,

    #[serde(default = "default_max_interval_ms")]
    pub max_interval_ms: u64,
}

const fn default_max_attempts() -> u32 {
    3
}

const fn default_initial_interval_ms() -> u64 {
    2000
}

const fn default_multiplier() -> f64 {
    2.0
}

const fn default_max_interval_ms() -> u64 {
    10000
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            initial_interval_ms: default_initial_interval_ms(),
            multiplier: default_multiplier(),
            max_interval_ms: default_max_interval_ms(),
        }
    }
}

/// Consumer side switches.
#[derive(Debug, Clone, Deserialize)]
pub struct ListenerConfig {
    /// When false neither the topology nor the consumers are started.
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Bounded drain of in-flight deliveries on shutdown.
    #[serde(default = "default_shutdown_grace_ms")]
    pub shutdown_grace_ms: u64,

    /// Period of the backlog checks that scale the workers.
    #[serde(default = "default_scale_interval_ms")]
    pub scale_interval_ms: u64,
}

const fn default_shutdown_grace_ms() -> u64 {
    5000
}

const fn default_scale_interval_ms() -> u64 {
    1000
}

impl Default for ListenerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            shutdown_grace_ms: default_shutdown_grace_ms(),
            scale_interval_ms: default_scale_interval_ms(),
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct LoggingConfig {
    /// Logs every routed message, body included.
    #[serde(default)]
    pub message_router: bool,
}

/// Entity change events.
#[derive(Debug, Clone, Deserialize)]
pub struct EntityEventsConfig {
    #[serde(default)]
    pub enabled: bool,

    /// Defaults to `{app_name}-entity-events`.
    #[serde(default)]
    pub exchange: Option<String>,

    #[serde(default = "default_entity_routing_key")]
    pub routing_key: String,

    #[serde(default = "default_exchange_type")]
    pub exchange_type: String,
}

fn default_entity_routing_key() -> String {
    "#".to_owned()
}

impl Default for EntityEventsConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            exchange: None,
            routing_key: default_entity_routing_key(),
            exchange_type: default_exchange_type(),
        }
    }
}

fn deserialize_header_names<'de, D>(deserializer: D) -> Result<Vec<String>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum HeaderNames {
        List(Vec<String>),
        Csv(String),
    }

    let names = match HeaderNames::deserialize(deserializer)? {
        HeaderNames::List(list) => list,
        HeaderNames::Csv(csv) => csv.split(',').map(str::to_owned).collect(),
    };

    Ok(names
        .into_iter()
        .map(|name| name.trim().to_owned())
        .filter(|name| !name.is_empty())
        .collect())
}

impl DispatcherConfig {
    /// Configuration with defaults for the given application.
    pub fn new(app_name: impl Into<String>) -> Self {
        Self {
            app_name: app_name.into(),
            ..Self::default()
        }
    }

    /// Load configuration from `MESSAGE_DISPATCHER_` environment variables.
    pub fn load() -> Result<Self, ConfigError> {
        Ok(Figment::new()
            .merge(Env::prefixed(ENV_PREFIX).split("__"))
            .extract()?)
    }

    /// Load configuration from a TOML file, overridden by environment variables.
    pub fn load_from(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        Ok(Figment::new()
            .merge(Toml::file(path.as_ref()))
            .merge(Env::prefixed(ENV_PREFIX).split("__"))
            .extract()?)
    }

    /// Parse configuration from a TOML string.
    pub fn parse(toml: &str) -> Result<Self, ConfigError> {
        Ok(Figment::new().merge(Toml::string(toml)).extract()?)
    }

    /// Validates the configuration and fills in every derived default.
    ///
    /// # Returns
    /// The resolved configuration or the first configuration error found
    pub fn resolve(&self) -> Result<ResolvedConfig, ConfigError> {
        let app_name = self.app_name.trim();
        if app_name.is_empty() {
            return Err(ConfigError::MissingAppName);
        }

        let exchange = ExchangeDefinition::new(&self.exchange)
            .kind(ExchangeKind::from_str(&self.exchange_type)?)
            .params(self.exchange_arguments.clone())
            .durable_if(self.durable);
        exchange.validate()?;

        let queue = non_blank(&self.queue).unwrap_or(app_name).to_owned();
        let routing_key = non_blank(&self.routing_key).unwrap_or(&queue).to_owned();

        let dlx_name = non_blank(&self.dead_letter.exchange)
            .map(str::to_owned)
            .unwrap_or_else(|| dead_letter_exchange_name(&self.exchange));
        let dlx = ExchangeDefinition::new(dlx_name)
            .kind(ExchangeKind::from_str(&self.dead_letter.exchange_type)?)
            .params(self.dead_letter.exchange_arguments.clone())
            .durable_if(self.dead_letter.durable);
        dlx.validate()?;

        let dlq = non_blank(&self.dead_letter.queue)
            .map(str::to_owned)
            .unwrap_or_else(|| format!("{queue}.dlq"));
        let dlq_routing_key = non_blank(&self.dead_letter.routing_key)
            .unwrap_or(&dlq)
            .to_owned();

        if !(1..=100).contains(&self.prefetch_count) {
            return Err(ConfigError::PrefetchOutOfRange(self.prefetch_count));
        }

        let entity_events = if self.entity_events.enabled {
            let name = non_blank(&self.entity_events.exchange)
                .map(str::to_owned)
                .unwrap_or_else(|| format!("{app_name}-entity-events"));
            Some(EntityEventsSettings {
                exchange: ExchangeDefinition::new(name)
                    .kind(ExchangeKind::from_str(&self.entity_events.exchange_type)?)
                    .durable(),
                routing_key: self.entity_events.routing_key.clone(),
            })
        } else {
            None
        };

        Ok(ResolvedConfig {
            app_name: app_name.to_owned(),
            connection: self.connection.clone(),
            exchange,
            queue,
            routing_key,
            durable: self.durable,
            concurrency: self.concurrency.parse()?,
            prefetch_count: self.prefetch_count,
            dead_letter: DeadLetterSettings {
                exchange: dlx,
                queue: dlq,
                routing_key: dlq_routing_key,
                durable: self.dead_letter.durable,
            },
            retry: self.retry.policy()?,
            reply_timeout: Duration::from_millis(self.reply_timeout_ms),
            mapped_headers: self.mapped_headers.clone(),
            return_exceptions: self.return_exceptions,
            listener_enabled: self.listener.enabled,
            shutdown_grace: Duration::from_millis(self.listener.shutdown_grace_ms),
            scale_interval: Duration::from_millis(self.listener.scale_interval_ms.max(1)),
            log_messages: self.logging.message_router,
            entity_events,
        })
    }
}

impl RetryConfig {
    fn policy(&self) -> Result<RetryPolicy, ConfigError> {
        if self.max_attempts == 0 {
            return Err(ConfigError::InvalidRetry(
                "max_attempts must be at least 1".to_owned(),
            ));
        }
        if !self.multiplier.is_finite() || self.multiplier < 1.0 {
            return Err(ConfigError::InvalidRetry(format!(
                "multiplier {} must be a finite number >= 1",
                self.multiplier
            )));
        }
        if self.max_interval_ms < self.initial_interval_ms {
            return Err(ConfigError::InvalidRetry(format!(
                "max_interval_ms {} is lower than initial_interval_ms {}",
                self.max_interval_ms, self.initial_interval_ms
            )));
        }

        Ok(RetryPolicy::new(
            self.max_attempts,
            Duration::from_millis(self.initial_interval_ms),
            self.multiplier,
            Duration::from_millis(self.max_interval_ms),
        ))
    }
}

fn non_blank(value: &Option<String>) -> Option<&str> {
    value
        .as_deref()
        .map(str::trim)
        .filter(|value| !value.is_empty())
}

/// `orders.ex` becomes `orders.dlx`, any other name gets `.dlx` appended.
fn dead_letter_exchange_name(exchange: &str) -> String {
    match exchange.strip_suffix(".ex") {
        Some(base) => format!("{base}.dlx"),
        None => format!("{exchange}.dlx"),
    }
}

/// Number of consumer workers, `min` at start and up to `max` under backlog.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConcurrencyRange {
    pub min: usize,
    pub max: usize,
}

impl Default for ConcurrencyRange {
    fn default() -> Self {
        ConcurrencyRange { min: 1, max: 10 }
    }
}

impl FromStr for ConcurrencyRange {
    type Err = ConfigError;

    /// Parses `min-max`, or a single number for a fixed size.
    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let invalid = || ConfigError::InvalidConcurrency(value.to_owned());

        let (min, max) = match value.split_once('-') {
            Some((min, max)) => (min.trim(), max.trim()),
            None => (value.trim(), value.trim()),
        };

        let min: usize = min.parse().map_err(|_| invalid())?;
        let max: usize = max.parse().map_err(|_| invalid())?;

        if min == 0 || min > max {
            return Err(invalid());
        }

        Ok(ConcurrencyRange { min, max })
    }
}

#[derive(Debug, Clone)]
pub struct DeadLetterSettings {
    pub exchange: ExchangeDefinition,
    pub queue: String,
    pub routing_key: String,
    pub durable: bool,
}

#[derive(Debug, Clone)]
pub struct EntityEventsSettings {
    pub exchange: ExchangeDefinition,
    pub routing_key: String,
}

/// Validated configuration with every default applied.
#[derive(Debug, Clone)]
pub struct ResolvedConfig {
    pub app_name: String,
    pub connection: ConnectionConfig,
    pub exchange: ExchangeDefinition,
    pub queue: String,
    pub routing_key: String,
    pub durable: bool,
    pub concurrency: ConcurrencyRange,
    pub prefetch_count: u16,
    pub dead_letter: DeadLetterSettings,
    pub retry: RetryPolicy,
    pub reply_timeout: Duration,
    pub mapped_headers: Vec<String>,
    pub return_exceptions: bool,
    pub listener_enabled: bool,
    pub shutdown_grace: Duration,
    pub scale_interval: Duration,
    pub log_messages: bool,
    pub entity_events: Option<EntityEventsSettings>,
}
