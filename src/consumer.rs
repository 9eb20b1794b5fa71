// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Delivery Processing
//!
//! This module implements the handling of one delivery, from its arrival to its
//! settlement:
//! 1. Opens a consumer span parented on the trace context the message carries
//! 2. Routes the message to its handler inside the retry loop
//! 3. Replies to the caller when the message asked for a reply
//! 4. Dead-letters the message when it cannot be processed
//! 5. Acknowledges the delivery, or rejects it when the DLQ publish failed
//!
//! A failure the caller can be told about (a command or query waiting for a reply,
//! with exceptions returned) is answered instead of being retried or dead-lettered,
//! unless the handler classified it explicitly. An answer that cannot be published
//! leaves the failure to the DLQ.

use crate::{
    codec::JsonCodec,
    envelope::{Envelope, MessageKind, RemoteInvocationResult},
    errors::{AmqpError, DispatchError},
    handler::RetryClass,
    headers::{now_timestamp, RESPONSE_FROM, RESPONSE_TIMESTAMP},
    otel,
    retry::{DeadLetterer, RetryPolicy},
    router::Router,
    transport::{AmqpTransport, Delivery, OutboundMessage},
};
use opentelemetry::{
    global::BoxedTracer,
    trace::{Span, Status},
};
use std::{borrow::Cow, sync::Arc};
use tracing::{debug, error, warn};

/// Runs deliveries through routing, retries, replies and dead-lettering.
pub(crate) struct DeliveryProcessor {
    router: Arc<Router>,
    retry: RetryPolicy,
    dead_letterer: DeadLetterer,
    transport: Arc<dyn AmqpTransport>,
    app_name: String,
    return_exceptions: bool,
}

impl DeliveryProcessor {
    /// Creates a processor.
    ///
    /// # Parameters
    /// * `router` - Routes messages to their handler
    /// * `retry` - Retry policy of handler failures
    /// * `dead_letterer` - Publishes messages that will not be processed to the DLQ
    /// * `transport` - Broker used to publish replies
    /// * `app_name` - Written into the `response-from` header of replies
    /// * `return_exceptions` - Whether handler failures are returned to waiting callers
    pub(crate) fn new(
        router: Arc<Router>,
        retry: RetryPolicy,
        dead_letterer: DeadLetterer,
        transport: Arc<dyn AmqpTransport>,
        app_name: impl Into<String>,
        return_exceptions: bool,
    ) -> Self {
        DeliveryProcessor {
            router,
            retry,
            dead_letterer,
            transport,
            app_name: app_name.into(),
            return_exceptions,
        }
    }

    /// Processes and settles one delivery.
    ///
    /// # Parameters
    /// * `tracer` - OpenTelemetry tracer for creating spans
    /// * `delivery` - The delivery to process
    ///
    /// # Returns
    /// Ok(()) once the delivery is settled, or the broker failure that prevented it
    pub(crate) async fn process(
        &self,
        tracer: &BoxedTracer,
        delivery: Delivery,
    ) -> Result<(), AmqpError> {
        let mut envelope = delivery.envelope.clone();
        let span_name = envelope.body_type().unwrap_or("unknown").to_owned();
        let (_ctx, mut span) = otel::new_span(&envelope.headers, tracer, &span_name);

        debug!(
            body_type = %span_name,
            exchange = %delivery.exchange,
            routing_key = %delivery.routing_key,
            "received"
        );

        let reply_capable = self.reply_capable(&envelope);
        let result = self
            .retry
            .execute(
                &mut envelope,
                |attempt| {
                    let router = self.router.clone();
                    async move { router.route(&attempt).await }
                },
                |err| self.is_retryable(err, reply_capable),
            )
            .await;

        match result {
            Ok(value) => {
                debug!("message successfully processed");
                if envelope.requires_reply() {
                    if let Err(err) = self
                        .reply(&envelope, RemoteInvocationResult::success(value, &self.app_name))
                        .await
                    {
                        error!(error = err.to_string(), "failure to publish reply");
                    }
                }
                span.set_status(Status::Ok);
                settle(&delivery, &mut span).await
            }
            Err(err) => {
                span.record_error(&err);
                span.set_status(Status::Error {
                    description: Cow::from(err.to_string()),
                });

                let replied = match (&err, reply_capable && self.return_exceptions) {
                    (DispatchError::Handler(handler_err), true) => {
                        match self
                            .reply(
                                &envelope,
                                RemoteInvocationResult::failure(handler_err, &self.app_name),
                            )
                            .await
                        {
                            Ok(()) => handler_err.retry_class() == RetryClass::Default,
                            Err(reply_err) => {
                                error!(
                                    error = reply_err.to_string(),
                                    "failure to publish failure reply"
                                );
                                false
                            }
                        }
                    }
                    _ => false,
                };

                if replied {
                    warn!(
                        error = err.to_string(),
                        "failure returned to the caller"
                    );
                    return settle(&delivery, &mut span).await;
                }

                error!(error = err.to_string(), "failure to process message, sending to dlq");
                if let Err(dlq_err) = self.dead_letterer.dead_letter(envelope, &err).await {
                    span.record_error(&dlq_err);
                    if let Err(reject_err) = delivery.reject(false).await {
                        error!(error = reject_err.to_string(), "error whiling nack msg");
                    }
                    return Err(dlq_err);
                }

                settle(&delivery, &mut span).await
            }
        }
    }

    /// Whether a failure of this message can be returned to a waiting caller.
    fn reply_capable(&self, envelope: &Envelope) -> bool {
        envelope.requires_reply()
            && matches!(
                envelope.kind(),
                Ok(Some(MessageKind::Command)) | Ok(Some(MessageKind::Query))
            )
    }

    fn is_retryable(&self, err: &DispatchError, reply_capable: bool) -> bool {
        match err {
            DispatchError::Handler(handler_err) => match handler_err.retry_class() {
                RetryClass::Retryable => true,
                RetryClass::Terminal => false,
                RetryClass::Default => !(reply_capable && self.return_exceptions),
            },
            _ => false,
        }
    }

    /// Publishes a reply to the `reply-to` queue of the message.
    ///
    /// # Returns
    /// Ok(()) once the reply is published or when the message has no `reply-to`
    async fn reply(&self, request: &Envelope, result: RemoteInvocationResult) -> Result<(), AmqpError> {
        let Some(reply_to) = request.reply_to.clone() else {
            return Ok(());
        };

        let envelope = reply_envelope(request, &result, &self.app_name)
            .map_err(|err| AmqpError::PublishingError(err.to_string()))?;

        self.transport
            .publish(OutboundMessage::new("", reply_to, envelope))
            .await
    }
}

/// Builds the reply to a request: the serialized result on the default exchange,
/// correlated with the request.
fn reply_envelope(
    request: &Envelope,
    result: &RemoteInvocationResult,
    app_name: &str,
) -> Result<Envelope, DispatchError> {
    let codec = JsonCodec;
    let body = codec
        .encode(result)
        .map_err(|err| DispatchError::Encoding(err.to_string()))?;

    let mut envelope = Envelope::new(body)
        .with_header(RESPONSE_FROM, app_name)
        .with_header(RESPONSE_TIMESTAMP, now_timestamp());
    envelope.content_type = Some(codec.content_type().to_owned());
    envelope.correlation_id = request.correlation_id.clone();

    Ok(envelope)
}

async fn settle(delivery: &Delivery, span: &mut impl Span) -> Result<(), AmqpError> {
    match delivery.ack().await {
        Err(err) => {
            error!("error whiling ack msg");
            span.record_error(&err);
            span.set_status(Status::Error {
                description: Cow::from("error to ack msg"),
            });
            Err(err)
        }
        _ => Ok(()),
    }
}
