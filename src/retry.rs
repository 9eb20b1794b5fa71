// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Retry and Dead-Lettering
//!
//! `RetryPolicy` runs an attempt function with bounded exponential backoff. The backoff
//! is computed from the attempt number alone, the only state carried between attempts
//! is the `retry-count` header of the delivery.
//!
//! `DeadLetterer` republishes a message that will not be processed to the DLQ exchange,
//! stamped with the failure that sent it there.

use crate::{
    envelope::Envelope,
    errors::{AmqpError, DispatchError},
    headers::{
        now_timestamp, HeaderValue, Headers, EXCEPTION_MESSAGE, EXCEPTION_ROOT_CAUSE, FAILED_AT,
        RETRY_COUNT,
    },
    transport::{AmqpTransport, OutboundMessage},
};
use std::{future::Future, sync::Arc, time::Duration};
use tracing::{debug, error, warn};

/// Bounded exponential backoff.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryPolicy {
    max_attempts: u32,
    initial_interval: Duration,
    multiplier: f64,
    max_interval: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        RetryPolicy {
            max_attempts: 3,
            initial_interval: Duration::from_millis(2000),
            multiplier: 2.0,
            max_interval: Duration::from_millis(10000),
        }
    }
}

impl RetryPolicy {
    /// Creates a policy.
    ///
    /// # Parameters
    /// * `max_attempts` - Total number of invocations, the first one included (at least 1)
    /// * `initial_interval` - Wait after the first failed attempt
    /// * `multiplier` - Growth factor between consecutive waits
    /// * `max_interval` - Upper bound of any wait
    pub fn new(
        max_attempts: u32,
        initial_interval: Duration,
        multiplier: f64,
        max_interval: Duration,
    ) -> Self {
        RetryPolicy {
            max_attempts: max_attempts.max(1),
            initial_interval,
            multiplier,
            max_interval,
        }
    }

    /// A policy that never retries.
    pub fn no_retry() -> Self {
        RetryPolicy {
            max_attempts: 1,
            ..RetryPolicy::default()
        }
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    /// Wait after the failed attempt number `attempt` (1-based):
    /// `min(initial * multiplier^(attempt - 1), max_interval)`.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let exponent = i32::try_from(attempt.saturating_sub(1)).unwrap_or(i32::MAX);
        let millis = self.initial_interval.as_millis() as f64 * self.multiplier.powi(exponent);
        let capped = millis.min(self.max_interval.as_millis() as f64).max(0.0);

        Duration::from_millis(capped as u64)
    }

    /// Runs `attempt` until it succeeds, fails with a non retryable error or the
    /// attempts are exhausted.
    ///
    /// Every attempt increments the `retry-count` header of `envelope` before running,
    /// so a message leaving the loop carries the number of invocations it went through.
    ///
    /// # Parameters
    /// * `envelope` - The delivery being processed
    /// * `attempt` - Runs one invocation on a copy of the envelope
    /// * `retryable` - Tells whether a failure may re-enter the loop
    ///
    /// # Returns
    /// The value of the first successful attempt or the last failure
    pub async fn execute<T, F, Fut, R>(
        &self,
        envelope: &mut Envelope,
        mut attempt: F,
        retryable: R,
    ) -> Result<T, DispatchError>
    where
        F: FnMut(Envelope) -> Fut,
        Fut: Future<Output = Result<T, DispatchError>>,
        R: Fn(&DispatchError) -> bool,
    {
        let mut number = 1;

        loop {
            increment_retry_count(&mut envelope.headers);

            match attempt(envelope.clone()).await {
                Ok(value) => return Ok(value),
                Err(err) if number < self.max_attempts && retryable(&err) => {
                    let wait = self.backoff(number);
                    warn!(
                        error = err.to_string(),
                        attempt = number,
                        wait_ms = wait.as_millis() as u64,
                        "failure to process message, retrying"
                    );
                    tokio::time::sleep(wait).await;
                    number += 1;
                }
                Err(err) => {
                    if number > 1 {
                        debug!(attempts = number, "retries exhausted");
                    }
                    return Err(err);
                }
            }
        }
    }
}

/// Increments the `retry-count` header, starting from 1 when it is absent.
pub fn increment_retry_count(headers: &mut Headers) -> i64 {
    let next = headers
        .get(RETRY_COUNT)
        .and_then(HeaderValue::as_i64)
        .unwrap_or(0)
        + 1;

    headers.insert(RETRY_COUNT.to_owned(), HeaderValue::Int(next));
    next
}

/// Republishes failed messages to the dead-letter exchange.
#[derive(Clone)]
pub struct DeadLetterer {
    transport: Arc<dyn AmqpTransport>,
    exchange: String,
    routing_key: String,
}

impl DeadLetterer {
    /// Creates a dead-letterer.
    ///
    /// # Parameters
    /// * `transport` - Broker used to republish
    /// * `exchange` - The dead-letter exchange
    /// * `routing_key` - Routing key binding the DLQ to the exchange
    pub fn new(
        transport: Arc<dyn AmqpTransport>,
        exchange: impl Into<String>,
        routing_key: impl Into<String>,
    ) -> Self {
        DeadLetterer {
            transport,
            exchange: exchange.into(),
            routing_key: routing_key.into(),
        }
    }

    /// Stamps the failure into the message headers and republishes it.
    ///
    /// # Parameters
    /// * `envelope` - The message as it was last processed
    /// * `err` - The failure that ends its processing
    ///
    /// # Returns
    /// Ok(()) once the broker accepted the copy, or `AmqpError::PublishingToDLQError`
    pub async fn dead_letter(
        &self,
        mut envelope: Envelope,
        err: &DispatchError,
    ) -> Result<(), AmqpError> {
        envelope.headers.insert(
            EXCEPTION_ROOT_CAUSE.to_owned(),
            HeaderValue::from(err.root_cause_name()),
        );
        envelope.headers.insert(
            EXCEPTION_MESSAGE.to_owned(),
            HeaderValue::from(err.root_cause_message()),
        );
        envelope
            .headers
            .insert(FAILED_AT.to_owned(), now_timestamp());
        if !envelope.headers.contains_key(RETRY_COUNT) {
            envelope
                .headers
                .insert(RETRY_COUNT.to_owned(), HeaderValue::Int(1));
        }

        debug!(
            exchange = %self.exchange,
            routing_key = %self.routing_key,
            root_cause = err.root_cause_name(),
            "sending message to dlq"
        );

        let message = OutboundMessage::new(&self.exchange, &self.routing_key, envelope).mandatory();
        match self.transport.publish(message).await {
            Err(publish_err) => {
                error!(
                    error = publish_err.to_string(),
                    exchange = %self.exchange,
                    "failure to publish to dlq"
                );
                Err(AmqpError::PublishingToDLQError)
            }
            _ => Ok(()),
        }
    }
}
