// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Message Handlers
//!
//! A handler is an async function taking the inbound context and exactly one payload.
//! Handlers are registered explicitly, either one by one or through a `MessageListener`
//! that hands out the handlers it owns.
//!
//! Handlers fail with a `HandlerError`, which carries the short type name of the
//! failure and its retry classification.

use crate::{
    codec::{CodecError, JsonCodec},
    context::InboundContext,
    envelope::{payload_type_name, MessageKind},
};
use futures_util::{future::BoxFuture, FutureExt};
use serde::{de::DeserializeOwned, Serialize};
use serde_json::Value;
use std::{any::TypeId, error::Error, fmt, future::Future, sync::Arc};

/// How a handler failure takes part in the retry loop.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum RetryClass {
    /// Retried unless the failure can be returned to a waiting caller.
    #[default]
    Default,
    /// Always retried until the attempts are exhausted.
    Retryable,
    /// Never retried.
    Terminal,
}

/// Failure raised by a message handler.
///
/// Any `std::error::Error` converts into a `HandlerError` with `?`. The conversion keeps
/// the short type name of the error and the message of its deepest source.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HandlerError {
    type_name: String,
    message: String,
    retry: RetryClass,
}

impl HandlerError {
    /// Creates a handler error with the default retry classification.
    ///
    /// # Parameters
    /// * `type_name` - Short name reported as the failure type (e.g. `InvalidArgumentError`)
    /// * `message` - Human readable description
    pub fn new(type_name: impl Into<String>, message: impl Into<String>) -> Self {
        HandlerError {
            type_name: type_name.into(),
            message: message.into(),
            retry: RetryClass::Default,
        }
    }

    /// Marks the failure as transient: it is retried with backoff.
    pub fn retryable(mut self) -> Self {
        self.retry = RetryClass::Retryable;
        self
    }

    /// Marks the failure as permanent: it is never retried.
    pub fn terminal(mut self) -> Self {
        self.retry = RetryClass::Terminal;
        self
    }

    pub fn type_name(&self) -> &str {
        &self.type_name
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    pub fn retry_class(&self) -> RetryClass {
        self.retry
    }
}

impl fmt::Display for HandlerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.type_name, self.message)
    }
}

impl<E> From<E> for HandlerError
where
    E: Error + Send + Sync + 'static,
{
    fn from(err: E) -> Self {
        let mut root: &(dyn Error + 'static) = &err;
        while let Some(source) = root.source() {
            root = source;
        }

        HandlerError::new(payload_type_name::<E>(), root.to_string())
    }
}

pub(crate) type HandlerFuture = BoxFuture<'static, Result<Option<Value>, HandlerError>>;

/// Decodes the body and starts the handler. A decoding failure never reaches user code.
pub(crate) type Invoker =
    Arc<dyn Fn(InboundContext, &[u8]) -> Result<HandlerFuture, CodecError> + Send + Sync>;

/// A registered handler: its marker kind, its declared input parameters and the
/// type-erased function that runs it.
#[derive(Clone)]
pub struct HandlerMethod {
    pub(crate) name: String,
    pub(crate) kind: MessageKind,
    pub(crate) parameter_types: Vec<String>,
    pub(crate) explicit_type: Option<String>,
    pub(crate) returns_value: bool,
    pub(crate) invoker: Invoker,
}

impl HandlerMethod {
    /// Creates a handler for payloads of type `P` returning `R`.
    ///
    /// The payload type name is the short name of `P`, unless overridden with
    /// [`HandlerMethod::payload_type`]. A handler returning `()` is treated as returning
    /// nothing.
    ///
    /// # Parameters
    /// * `kind` - The message kind the handler answers to
    /// * `name` - Name used in logs and registry errors
    /// * `handler` - The async function invoked for every matching message
    ///
    /// # Returns
    /// A handler ready to be registered
    pub fn new<P, R, F, Fut>(kind: MessageKind, name: impl Into<String>, handler: F) -> Self
    where
        P: DeserializeOwned + Send + 'static,
        R: Serialize + Send + 'static,
        F: Fn(InboundContext, P) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<R, HandlerError>> + Send + 'static,
    {
        let invoker: Invoker = Arc::new(move |ctx: InboundContext, body: &[u8]| {
            let payload: P = JsonCodec.decode(body)?;
            let running = handler(ctx, payload);

            Ok(async move {
                let value = running.await?;
                into_reply_value(&value)
            }
            .boxed())
        });

        HandlerMethod {
            name: name.into(),
            kind,
            parameter_types: vec![payload_type_name::<P>().to_owned()],
            explicit_type: None,
            returns_value: TypeId::of::<R>() != TypeId::of::<()>(),
            invoker,
        }
    }

    /// Shorthand for a `COMMAND` handler.
    pub fn command<P, R, F, Fut>(name: impl Into<String>, handler: F) -> Self
    where
        P: DeserializeOwned + Send + 'static,
        R: Serialize + Send + 'static,
        F: Fn(InboundContext, P) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<R, HandlerError>> + Send + 'static,
    {
        HandlerMethod::new(MessageKind::Command, name, handler)
    }

    /// Shorthand for a `QUERY` handler.
    pub fn query<P, R, F, Fut>(name: impl Into<String>, handler: F) -> Self
    where
        P: DeserializeOwned + Send + 'static,
        R: Serialize + Send + 'static,
        F: Fn(InboundContext, P) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<R, HandlerError>> + Send + 'static,
    {
        HandlerMethod::new(MessageKind::Query, name, handler)
    }

    /// Shorthand for a `NOTIFICATION` handler.
    pub fn notification<P, F, Fut>(name: impl Into<String>, handler: F) -> Self
    where
        P: DeserializeOwned + Send + 'static,
        F: Fn(InboundContext, P) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), HandlerError>> + Send + 'static,
    {
        HandlerMethod::new(MessageKind::Notification, name, handler)
    }

    /// Shorthand for an `EVENT` handler.
    pub fn event<P, F, Fut>(name: impl Into<String>, handler: F) -> Self
    where
        P: DeserializeOwned + Send + 'static,
        F: Fn(InboundContext, P) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), HandlerError>> + Send + 'static,
    {
        HandlerMethod::new(MessageKind::Event, name, handler)
    }

    /// Creates a handler working on raw JSON values.
    ///
    /// Useful for bridging handlers whose signature is only known at runtime. The
    /// declared parameter types are validated by the registry exactly like typed ones,
    /// and the body is handed over as a single `Value`.
    ///
    /// # Parameters
    /// * `kind` - The message kind the handler answers to
    /// * `name` - Name used in logs and registry errors
    /// * `parameter_types` - Short type names of the declared parameters
    /// * `returns_value` - Whether the handler produces a reply value
    /// * `handler` - The async function invoked for every matching message
    pub fn dynamic<F, Fut>(
        kind: MessageKind,
        name: impl Into<String>,
        parameter_types: Vec<String>,
        returns_value: bool,
        handler: F,
    ) -> Self
    where
        F: Fn(InboundContext, Value) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Option<Value>, HandlerError>> + Send + 'static,
    {
        let invoker: Invoker = Arc::new(move |ctx: InboundContext, body: &[u8]| {
            let payload: Value = JsonCodec.decode(body)?;
            Ok(handler(ctx, payload).boxed())
        });

        HandlerMethod {
            name: name.into(),
            kind,
            parameter_types,
            explicit_type: None,
            returns_value,
            invoker,
        }
    }

    /// Overrides the payload type name the handler is registered under.
    pub fn payload_type(mut self, name: impl Into<String>) -> Self {
        self.explicit_type = Some(name.into());
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn kind(&self) -> MessageKind {
        self.kind
    }

    pub fn returns_value(&self) -> bool {
        self.returns_value
    }

    /// The registry key of the handler: the explicit name if any, else the short name
    /// of its single parameter.
    pub fn payload_type_name(&self) -> Option<&str> {
        match (&self.explicit_type, self.parameter_types.as_slice()) {
            (Some(explicit), _) => Some(explicit.as_str()),
            (None, [single]) => Some(single.as_str()),
            _ => None,
        }
    }

    pub(crate) fn invoke(
        &self,
        ctx: InboundContext,
        body: &[u8],
    ) -> Result<HandlerFuture, CodecError> {
        (self.invoker)(ctx, body)
    }
}

impl fmt::Debug for HandlerMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HandlerMethod")
            .field("name", &self.name)
            .field("kind", &self.kind)
            .field("parameter_types", &self.parameter_types)
            .field("explicit_type", &self.explicit_type)
            .field("returns_value", &self.returns_value)
            .finish_non_exhaustive()
    }
}

fn into_reply_value<R: Serialize>(value: &R) -> Result<Option<Value>, HandlerError> {
    match serde_json::to_value(value) {
        Ok(Value::Null) => Ok(None),
        Ok(value) => Ok(Some(value)),
        Err(err) => Err(HandlerError::new("Encoding", err.to_string()).terminal()),
    }
}

/// An object owning a set of handlers.
///
/// Listeners are registered by object: the registry asks each one for its handlers
/// once, at startup.
pub trait MessageListener: Send + Sync + 'static {
    fn handlers(self: Arc<Self>) -> Vec<HandlerMethod>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::headers::Headers;
    use serde::Deserialize;

    #[derive(Debug, Deserialize)]
    struct Charge {
        amount: u32,
    }

    #[derive(Debug, thiserror::Error)]
    #[error("ledger unavailable")]
    struct LedgerError {
        #[source]
        source: std::io::Error,
    }

    #[test]
    fn conversion_keeps_type_and_root_cause() {
        let err: HandlerError = LedgerError {
            source: std::io::Error::new(std::io::ErrorKind::TimedOut, "socket timed out"),
        }
        .into();

        assert_eq!(err.type_name(), "LedgerError");
        assert_eq!(err.message(), "socket timed out");
        assert_eq!(err.retry_class(), RetryClass::Default);
    }

    #[test]
    fn typed_handler_declares_its_payload() {
        let handler = HandlerMethod::command("charge", |_ctx, charge: Charge| async move {
            Ok::<_, HandlerError>(charge.amount * 2)
        });

        assert_eq!(handler.payload_type_name(), Some("Charge"));
        assert!(handler.returns_value());
        assert_eq!(handler.kind(), MessageKind::Command);

        let unit = HandlerMethod::event("audit", |_ctx, _charge: Charge| async { Ok(()) });
        assert!(!unit.returns_value());
    }

    #[test]
    fn explicit_payload_type_wins() {
        let handler = HandlerMethod::event("created", |_ctx, _value: Value| async { Ok(()) })
            .payload_type("UserCreated");
        assert_eq!(handler.payload_type_name(), Some("UserCreated"));
    }

    #[tokio::test]
    async fn invoke_decodes_then_runs() {
        let handler = HandlerMethod::command("charge", |_ctx, charge: Charge| async move {
            Ok::<_, HandlerError>(charge.amount * 2)
        });

        let ctx = InboundContext::new(Headers::new());
        let value = handler
            .invoke(ctx.clone(), br#"{"amount":10}"#)
            .unwrap()
            .await
            .unwrap();
        assert_eq!(value, Some(Value::from(20)));

        assert!(handler.invoke(ctx, br#"{"amount":"ten"}"#).is_err());
    }
}
