// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Message Publisher
//!
//! This module provides the publishing side of the dispatcher: fire-and-forget sends
//! of events, commands and notifications, and request-reply invocations of commands
//! and queries.
//!
//! Every outbound message is stamped with the dispatcher headers (`handler-type`,
//! `body-type`, `timestamp`, `remoteService`), carries the mapped headers of the
//! delivery being handled when published from inside a handler, and propagates the
//! current OpenTelemetry context. Messages are published as mandatory, an unroutable
//! message fails the send.
//!
//! Replies arrive on a private, server-named queue consumed for the lifetime of the
//! publisher and are matched to their request by correlation id.

use crate::{
    codec::JsonCodec,
    config::ResolvedConfig,
    context::InboundContext,
    envelope::{payload_type_name, Envelope, MessageKind, RemoteInvocationResult},
    errors::{AmqpError, DispatchError},
    headers::{
        now_timestamp, HeaderValue, Headers, BODY_TYPE, HANDLER_TYPE, REMOTE_SERVICE,
        RESPONSE_FROM, TIMESTAMP,
    },
    otel,
    queue::QueueDefinition,
    reply::PendingReplies,
    transport::{AmqpTransport, ConsumeOptions, OutboundMessage},
};
use async_trait::async_trait;
use futures_util::StreamExt;
use serde::{de::DeserializeOwned, Serialize};
use serde_json::Value;
use std::{sync::Arc, time::Duration};
use tokio::task::JoinHandle;
use tracing::{debug, error, warn};
use uuid::Uuid;

/// A message ready to be published.
#[derive(Debug, Clone, PartialEq)]
pub struct PublishRequest {
    pub exchange: String,
    pub routing_key: String,
    pub kind: MessageKind,
    pub body_type: String,
    pub body: Vec<u8>,
    pub headers: Headers,
}

impl PublishRequest {
    /// Encodes `payload` into a request of the given kind.
    ///
    /// The `body-type` is the short type name of `T`.
    pub fn new<T: Serialize + ?Sized>(
        kind: MessageKind,
        exchange: impl Into<String>,
        routing_key: impl Into<String>,
        payload: &T,
    ) -> Result<Self, DispatchError> {
        let body = JsonCodec
            .encode(payload)
            .map_err(|err| DispatchError::Encoding(err.to_string()))?;

        Ok(PublishRequest {
            exchange: exchange.into(),
            routing_key: routing_key.into(),
            kind,
            body_type: payload_type_name::<T>().to_owned(),
            body,
            headers: Headers::new(),
        })
    }

    /// Overrides the `body-type` the consumer side routes on.
    pub fn with_body_type(mut self, body_type: impl Into<String>) -> Self {
        self.body_type = body_type.into();
        self
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<HeaderValue>) -> Self {
        self.headers.insert(name.into(), value.into());
        self
    }
}

/// Publishes dispatcher messages.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait MessagePublisher: Send + Sync {
    /// Publishes without waiting for a reply.
    async fn publish(&self, request: PublishRequest) -> Result<(), DispatchError>;

    /// Publishes and waits for the reply, up to the configured reply timeout.
    ///
    /// # Returns
    /// The value the remote handler returned, `None` when it returned nothing
    async fn request(&self, request: PublishRequest) -> Result<Option<Value>, DispatchError>;

    /// Exchange used by the `*_default` operations.
    fn default_exchange(&self) -> String;

    /// Routing key used by the `*_default` operations.
    fn default_routing_key(&self) -> String;
}

/// Typed operations of a `MessagePublisher`.
#[async_trait]
pub trait MessagePublisherExt: MessagePublisher {
    /// Sends an EVENT.
    async fn send_event<T>(&self, exchange: &str, routing_key: &str, payload: &T) -> Result<(), DispatchError>
    where
        T: Serialize + Sync,
    {
        self.publish(PublishRequest::new(MessageKind::Event, exchange, routing_key, payload)?)
            .await
    }

    /// Sends a COMMAND without waiting for its outcome.
    async fn send_command<T>(&self, exchange: &str, routing_key: &str, payload: &T) -> Result<(), DispatchError>
    where
        T: Serialize + Sync,
    {
        self.publish(PublishRequest::new(MessageKind::Command, exchange, routing_key, payload)?)
            .await
    }

    /// Sends a NOTIFICATION.
    async fn send_notification<T>(
        &self,
        exchange: &str,
        routing_key: &str,
        payload: &T,
    ) -> Result<(), DispatchError>
    where
        T: Serialize + Sync,
    {
        self.publish(PublishRequest::new(
            MessageKind::Notification,
            exchange,
            routing_key,
            payload,
        )?)
        .await
    }

    /// Sends an EVENT on the configured exchange and routing key.
    async fn send_event_default<T>(&self, payload: &T) -> Result<(), DispatchError>
    where
        T: Serialize + Sync,
    {
        let (exchange, routing_key) = (self.default_exchange(), self.default_routing_key());
        self.send_event(&exchange, &routing_key, payload).await
    }

    /// Sends a COMMAND on the configured exchange and routing key.
    async fn send_command_default<T>(&self, payload: &T) -> Result<(), DispatchError>
    where
        T: Serialize + Sync,
    {
        let (exchange, routing_key) = (self.default_exchange(), self.default_routing_key());
        self.send_command(&exchange, &routing_key, payload).await
    }

    /// Sends a NOTIFICATION on the configured exchange and routing key.
    async fn send_notification_default<T>(&self, payload: &T) -> Result<(), DispatchError>
    where
        T: Serialize + Sync,
    {
        let (exchange, routing_key) = (self.default_exchange(), self.default_routing_key());
        self.send_notification(&exchange, &routing_key, payload).await
    }

    /// Sends an EVENT on the configured exchange with the given routing key.
    async fn send_event_to<T>(&self, routing_key: &str, payload: &T) -> Result<(), DispatchError>
    where
        T: Serialize + Sync,
    {
        let exchange = self.default_exchange();
        self.send_event(&exchange, routing_key, payload).await
    }

    /// Sends a COMMAND on the configured exchange with the given routing key.
    async fn send_command_to<T>(&self, routing_key: &str, payload: &T) -> Result<(), DispatchError>
    where
        T: Serialize + Sync,
    {
        let exchange = self.default_exchange();
        self.send_command(&exchange, routing_key, payload).await
    }

    /// Sends a NOTIFICATION on the configured exchange with the given routing key.
    async fn send_notification_to<T>(&self, routing_key: &str, payload: &T) -> Result<(), DispatchError>
    where
        T: Serialize + Sync,
    {
        let exchange = self.default_exchange();
        self.send_notification(&exchange, routing_key, payload).await
    }

    /// Invokes a COMMAND and decodes its result into `R`.
    async fn do_command<T, R>(&self, exchange: &str, routing_key: &str, payload: &T) -> Result<R, DispatchError>
    where
        T: Serialize + Sync,
        R: DeserializeOwned + Send,
    {
        let request = PublishRequest::new(MessageKind::Command, exchange, routing_key, payload)?;
        decode_reply(self.request(request).await?)
    }

    /// Invokes a QUERY and decodes its result into `R`.
    async fn do_query<T, R>(&self, exchange: &str, routing_key: &str, payload: &T) -> Result<R, DispatchError>
    where
        T: Serialize + Sync,
        R: DeserializeOwned + Send,
    {
        let request = PublishRequest::new(MessageKind::Query, exchange, routing_key, payload)?;
        decode_reply(self.request(request).await?)
    }

    /// Invokes a COMMAND on the configured exchange with the given routing key.
    async fn do_command_to<T, R>(&self, routing_key: &str, payload: &T) -> Result<R, DispatchError>
    where
        T: Serialize + Sync,
        R: DeserializeOwned + Send,
    {
        let exchange = self.default_exchange();
        self.do_command(&exchange, routing_key, payload).await
    }

    /// Invokes a QUERY on the configured exchange with the given routing key.
    async fn do_query_to<T, R>(&self, routing_key: &str, payload: &T) -> Result<R, DispatchError>
    where
        T: Serialize + Sync,
        R: DeserializeOwned + Send,
    {
        let exchange = self.default_exchange();
        self.do_query(&exchange, routing_key, payload).await
    }

    /// Invokes a COMMAND on the configured exchange and routing key.
    async fn do_command_default<T, R>(&self, payload: &T) -> Result<R, DispatchError>
    where
        T: Serialize + Sync,
        R: DeserializeOwned + Send,
    {
        let (exchange, routing_key) = (self.default_exchange(), self.default_routing_key());
        self.do_command(&exchange, &routing_key, payload).await
    }

    /// Invokes a QUERY on the configured exchange and routing key.
    async fn do_query_default<T, R>(&self, payload: &T) -> Result<R, DispatchError>
    where
        T: Serialize + Sync,
        R: DeserializeOwned + Send,
    {
        let (exchange, routing_key) = (self.default_exchange(), self.default_routing_key());
        self.do_query(&exchange, &routing_key, payload).await
    }
}

impl<P: MessagePublisher + ?Sized> MessagePublisherExt for P {}

fn decode_reply<R: DeserializeOwned>(value: Option<Value>) -> Result<R, DispatchError> {
    serde_json::from_value(value.unwrap_or(Value::Null)).map_err(|err| DispatchError::Decoding {
        payload_type: payload_type_name::<R>().to_owned(),
        reason: err.to_string(),
    })
}

/// Broker-backed publisher with request-reply support.
pub struct RabbitMessagePublisher {
    transport: Arc<dyn AmqpTransport>,
    app_name: String,
    exchange: String,
    routing_key: String,
    mapped_headers: Vec<String>,
    reply_timeout: Duration,
    reply_queue: String,
    pending: Arc<PendingReplies>,
    reply_listener: JoinHandle<()>,
}

impl RabbitMessagePublisher {
    /// Creates a publisher and starts listening on its private reply queue.
    ///
    /// # Parameters
    /// * `transport` - Broker to publish to
    /// * `cfg` - App name, default destination, mapped headers and reply timeout
    ///
    /// # Returns
    /// The publisher, or the error declaring or consuming the reply queue
    pub async fn new(
        transport: Arc<dyn AmqpTransport>,
        cfg: &ResolvedConfig,
    ) -> Result<Self, AmqpError> {
        let reply_queue = transport
            .declare_queue(&QueueDefinition::server_named())
            .await?;

        let replies = transport
            .consume(
                ConsumeOptions::new(&reply_queue, format!("{}-replies", cfg.app_name))
                    .no_ack()
                    .exclusive(),
            )
            .await?;

        let pending = Arc::new(PendingReplies::new());
        let reply_listener = tokio::spawn({
            let pending = pending.clone();
            let mut replies = replies;
            async move {
                while let Some(result) = replies.next().await {
                    match result {
                        Ok(delivery) => {
                            let Some(id) = delivery.envelope.correlation_id.clone() else {
                                warn!("reply without correlation id discarded");
                                continue;
                            };
                            if !pending.complete(&id, delivery.envelope) {
                                debug!(correlation_id = %id, "late reply discarded");
                            }
                        }
                        Err(err) => error!(error = err.to_string(), "errors consume reply"),
                    }
                }
            }
        });

        debug!(reply_queue = %reply_queue, "publisher ready");

        Ok(RabbitMessagePublisher {
            transport,
            app_name: cfg.app_name.clone(),
            exchange: cfg.exchange.name().to_owned(),
            routing_key: cfg.routing_key.clone(),
            mapped_headers: cfg.mapped_headers.clone(),
            reply_timeout: cfg.reply_timeout,
            reply_queue,
            pending,
            reply_listener,
        })
    }

    /// Name of the queue replies are received on.
    pub fn reply_queue(&self) -> &str {
        &self.reply_queue
    }

    /// Builds the outbound envelope: caller headers, then mapped headers of the current
    /// delivery, then the dispatcher headers.
    fn envelope(&self, request: PublishRequest) -> Envelope {
        let mut headers = request.headers;

        if let Some(ctx) = InboundContext::current() {
            ctx.copy_mapped_headers_into(&self.mapped_headers, &mut headers);
        }

        headers.insert(HANDLER_TYPE.to_owned(), request.kind.as_str().into());
        headers.insert(BODY_TYPE.to_owned(), request.body_type.into());
        headers.insert(TIMESTAMP.to_owned(), now_timestamp());
        headers.insert(REMOTE_SERVICE.to_owned(), self.app_name.as_str().into());

        otel::inject(&mut headers);
        JsonCodec.strip_type_hints(&mut headers);

        Envelope {
            body: request.body,
            headers,
            content_type: Some(JsonCodec.content_type().to_owned()),
            message_id: Some(Uuid::new_v4().to_string()),
            reply_to: None,
            correlation_id: None,
        }
    }

    async fn send(
        &self,
        exchange: String,
        routing_key: String,
        envelope: Envelope,
    ) -> Result<(), DispatchError> {
        debug!(
            exchange = %exchange,
            routing_key = %routing_key,
            body_type = envelope.body_type().unwrap_or_default(),
            headers = ?envelope.headers,
            "publishing message"
        );

        match self
            .transport
            .publish(OutboundMessage::new(exchange, routing_key, envelope).mandatory())
            .await
        {
            Err(err) => {
                error!(error = err.to_string(), "error publishing message");
                Err(DispatchError::Publish(err))
            }
            _ => Ok(()),
        }
    }
}

impl Drop for RabbitMessagePublisher {
    fn drop(&mut self) {
        self.reply_listener.abort();
    }
}

#[async_trait]
impl MessagePublisher for RabbitMessagePublisher {
    async fn publish(&self, request: PublishRequest) -> Result<(), DispatchError> {
        let exchange = request.exchange.clone();
        let routing_key = request.routing_key.clone();
        let envelope = self.envelope(request);

        self.send(exchange, routing_key, envelope).await
    }

    async fn request(&self, request: PublishRequest) -> Result<Option<Value>, DispatchError> {
        let exchange = request.exchange.clone();
        let routing_key = request.routing_key.clone();
        let mut slot = self.pending.slot();

        let envelope = self
            .envelope(request)
            .with_reply_to(&self.reply_queue)
            .with_correlation_id(slot.correlation_id());

        self.send(exchange, routing_key, envelope).await?;

        let outcome = tokio::time::timeout(self.reply_timeout, slot.receiver()).await;
        let reply = match outcome {
            Ok(Ok(reply)) => reply,
            Ok(Err(_)) => return Err(DispatchError::Closed),
            Err(_) => {
                warn!(
                    correlation_id = slot.correlation_id(),
                    "no reply received in time"
                );
                return Err(DispatchError::ReplyTimeout(self.reply_timeout));
            }
        };
        drop(slot);

        let result: RemoteInvocationResult =
            JsonCodec
                .decode(&reply.body)
                .map_err(|err| DispatchError::Decoding {
                    payload_type: payload_type_name::<RemoteInvocationResult>().to_owned(),
                    reason: err.to_string(),
                })?;

        if result.has_exception() {
            let remote_service = result
                .remote_service
                .or_else(|| reply.header_str(RESPONSE_FROM).map(str::to_owned))
                .unwrap_or_default();

            return Err(DispatchError::RemoteResult {
                exception_type: result.exception_type.unwrap_or_default(),
                message: result.exception.unwrap_or_default(),
                remote_service,
            });
        }

        Ok(result.value)
    }

    fn default_exchange(&self) -> String {
        self.exchange.clone()
    }

    fn default_routing_key(&self) -> String {
        self.routing_key.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        config::DispatcherConfig,
        exchange::ExchangeDefinition,
        handler::HandlerError,
        headers::TYPE_ID,
        memory::InMemoryBroker,
        queue::QueueBinding,
    };
    use serde::Deserialize;

    #[derive(Debug, Serialize, Deserialize, PartialEq)]
    struct Charge {
        amount: u32,
    }

    async fn broker() -> InMemoryBroker {
        let broker = InMemoryBroker::new();
        broker
            .declare_exchange(&ExchangeDefinition::new("app.ex"))
            .await
            .unwrap();
        broker
            .declare_queue(&QueueDefinition::new("app.inbox"))
            .await
            .unwrap();
        broker
            .bind_queue(&QueueBinding::new("app.inbox").exchange("app.ex").routing_key("app.inbox"))
            .await
            .unwrap();
        broker
    }

    async fn publisher(broker: &InMemoryBroker) -> RabbitMessagePublisher {
        let mut cfg = DispatcherConfig::new("svc-A").resolve().unwrap();
        cfg.exchange = ExchangeDefinition::new("app.ex");
        cfg.routing_key = "app.inbox".to_owned();
        cfg.mapped_headers = vec!["X-Tenant".to_owned(), "X-Trace".to_owned()];
        cfg.reply_timeout = Duration::from_millis(500);

        RabbitMessagePublisher::new(Arc::new(broker.clone()), &cfg)
            .await
            .unwrap()
    }

    /// Answers the next request on `app.inbox` with `result`.
    fn responder(broker: &InMemoryBroker, result: RemoteInvocationResult) {
        let broker = broker.clone();
        tokio::spawn(async move {
            let mut requests = broker
                .consume(ConsumeOptions::new("app.inbox", "responder"))
                .await
                .unwrap();
            let request = requests.next().await.unwrap().unwrap();
            request.ack().await.unwrap();

            let reply = Envelope::new(serde_json::to_vec(&result).unwrap())
                .with_correlation_id(request.envelope.correlation_id.clone().unwrap());
            broker
                .publish(OutboundMessage::new(
                    "",
                    request.envelope.reply_to.clone().unwrap(),
                    reply,
                ))
                .await
                .unwrap();
        });
    }

    #[tokio::test]
    async fn publish_stamps_dispatcher_headers() {
        let broker = broker().await;
        let publisher = publisher(&broker).await;

        publisher
            .publish(
                PublishRequest::new(MessageKind::Event, "app.ex", "app.inbox", &Charge { amount: 1 })
                    .unwrap()
                    .with_header(TYPE_ID, "com.acme.Charge"),
            )
            .await
            .unwrap();

        let sent = broker.drain("app.inbox").await;
        let headers = &sent[0].headers;
        assert_eq!(headers[HANDLER_TYPE], HeaderValue::from("EVENT"));
        assert_eq!(headers[BODY_TYPE], HeaderValue::from("Charge"));
        assert_eq!(headers[REMOTE_SERVICE], HeaderValue::from("svc-A"));
        assert!(headers.contains_key(TIMESTAMP));
        assert!(!headers.contains_key(TYPE_ID));
        assert_eq!(sent[0].content_type.as_deref(), Some("application/json"));
        assert!(sent[0].message_id.is_some());
        assert!(broker.published_to("app.ex")[0].mandatory);
    }

    #[tokio::test]
    async fn unroutable_publish_fails() {
        let broker = broker().await;
        let publisher = publisher(&broker).await;

        let result = publisher
            .send_event("app.ex", "nowhere", &Charge { amount: 1 })
            .await;

        assert_eq!(
            result,
            Err(DispatchError::Publish(AmqpError::UnroutableMessage {
                exchange: "app.ex".to_owned(),
                routing_key: "nowhere".to_owned(),
            }))
        );
    }

    #[tokio::test]
    async fn mapped_headers_follow_the_inbound_context() {
        let broker = broker().await;
        let publisher = publisher(&broker).await;
        let inbound = InboundContext::new(Headers::from([
            ("X-Tenant".to_owned(), HeaderValue::from("t1")),
            ("X-Trace".to_owned(), HeaderValue::from("tr1")),
            ("X-Private".to_owned(), HeaderValue::from("p")),
        ]));

        inbound
            .scope(publisher.send_event_default(&Charge { amount: 1 }))
            .await
            .unwrap();

        let headers = &broker.drain("app.inbox").await[0].headers;
        assert_eq!(headers["X-Tenant"], HeaderValue::from("t1"));
        assert_eq!(headers["X-Trace"], HeaderValue::from("tr1"));
        assert!(!headers.contains_key("X-Private"));
    }

    #[tokio::test]
    async fn request_returns_the_decoded_reply() {
        let broker = broker().await;
        let publisher = publisher(&broker).await;
        responder(
            &broker,
            RemoteInvocationResult::success(Some(serde_json::json!({"amount": 20})), "svc-B"),
        );

        let charged: Charge = publisher
            .do_command("app.ex", "app.inbox", &Charge { amount: 10 })
            .await
            .unwrap();

        assert_eq!(charged, Charge { amount: 20 });
    }

    #[tokio::test]
    async fn remote_failure_surfaces_as_remote_result() {
        let broker = broker().await;
        let publisher = publisher(&broker).await;
        responder(
            &broker,
            RemoteInvocationResult::failure(
                &HandlerError::new("InvalidArgumentError", "bad id"),
                "svc-B",
            ),
        );

        let result: Result<Charge, _> = publisher.do_query_default(&Charge { amount: 10 }).await;

        assert_eq!(
            result,
            Err(DispatchError::RemoteResult {
                exception_type: "InvalidArgumentError".to_owned(),
                message: "bad id".to_owned(),
                remote_service: "svc-B".to_owned(),
            })
        );
    }

    #[tokio::test(start_paused = true)]
    async fn unanswered_request_times_out() {
        let broker = broker().await;
        let publisher = publisher(&broker).await;
        let started = tokio::time::Instant::now();

        let result: Result<Charge, _> = publisher
            .do_query("app.ex", "app.inbox", &Charge { amount: 10 })
            .await;

        assert_eq!(result, Err(DispatchError::ReplyTimeout(Duration::from_millis(500))));
        assert!(started.elapsed() >= Duration::from_millis(500));
        assert!(publisher.pending.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn cancelled_requests_release_their_slots() {
        let broker = broker().await;
        let publisher = publisher(&broker).await;

        for amount in 0..5 {
            let request = PublishRequest::new(
                MessageKind::Query,
                "app.ex",
                "app.inbox",
                &Charge { amount },
            )
            .unwrap();
            let cancelled =
                tokio::time::timeout(Duration::from_millis(50), publisher.request(request)).await;
            assert!(cancelled.is_err());
        }

        tokio::time::sleep(Duration::from_secs(5)).await;
        assert!(publisher.pending.is_empty());
        assert_eq!(broker.drain("app.inbox").await.len(), 5);
    }

    #[tokio::test]
    async fn default_operations_use_the_configured_destination() {
        let mut mock = MockMessagePublisher::new();
        mock.expect_default_exchange()
            .return_const("orders.ex".to_owned());
        mock.expect_default_routing_key()
            .return_const("orders".to_owned());
        mock.expect_publish()
            .withf(|request| {
                request.exchange == "orders.ex"
                    && request.routing_key == "orders"
                    && request.kind == MessageKind::Command
                    && request.body_type == "Charge"
            })
            .times(1)
            .returning(|_| Ok(()));

        mock.send_command_default(&Charge { amount: 3 }).await.unwrap();
    }

    #[test]
    fn unit_reply_decodes_from_null() {
        assert_eq!(decode_reply::<()>(None), Ok(()));
        assert!(matches!(
            decode_reply::<Charge>(Some(serde_json::json!("x"))),
            Err(DispatchError::Decoding { .. })
        ));
    }
}
