// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Message Router
//!
//! Picks the handler of a delivery from its `handler-type` and `body-type` headers,
//! decodes the body into the handler's payload type and runs the handler with the
//! inbound context installed.
//!
//! Routing and decoding failures never reach user code. A panicking handler is
//! reported as a `Panic` handler failure instead of tearing down the consumer.

use crate::{
    context::InboundContext,
    envelope::Envelope,
    errors::DispatchError,
    handler::HandlerError,
    headers::{BODY_TYPE, HANDLER_TYPE},
    registry::HandlerRegistry,
};
use futures_util::FutureExt;
use serde_json::Value;
use std::{any::Any, panic::AssertUnwindSafe, sync::Arc};
use tracing::{debug, warn};

pub struct Router {
    registry: Arc<HandlerRegistry>,
    log_messages: bool,
}

impl Router {
    /// Creates a router over a frozen registry.
    ///
    /// # Parameters
    /// * `registry` - The handlers to route to
    /// * `log_messages` - Logs every routed message, headers and body included
    pub fn new(registry: Arc<HandlerRegistry>, log_messages: bool) -> Self {
        if log_messages {
            warn!("message router logging is enabled, message bodies will be logged");
        }

        Router {
            registry,
            log_messages,
        }
    }

    /// Routes one message to its handler.
    ///
    /// # Returns
    /// * `Ok(Some(value))` - the handler returned a value
    /// * `Ok(None)` - the handler returned nothing
    /// * `Err(..)` - a routing, decoding or handler failure
    pub async fn route(&self, envelope: &Envelope) -> Result<Option<Value>, DispatchError> {
        let ctx = InboundContext::new(envelope.headers.clone());
        ctx.clone().scope(self.dispatch(ctx, envelope)).await
    }

    async fn dispatch(
        &self,
        ctx: InboundContext,
        envelope: &Envelope,
    ) -> Result<Option<Value>, DispatchError> {
        let kind = envelope
            .kind()?
            .ok_or_else(|| DispatchError::MissingHeader(HANDLER_TYPE.to_owned()))?;

        let body_type = match envelope.header(BODY_TYPE) {
            None => return Err(DispatchError::MissingHeader(BODY_TYPE.to_owned())),
            Some(value) => value.to_string(),
        };

        if self.log_messages {
            debug!(
                headers = ?envelope.headers,
                body = %String::from_utf8_lossy(&envelope.body),
                "routing message"
            );
        }

        let handler = self.registry.get_handler(kind, &body_type)?;

        let running = handler
            .invoke(ctx, &envelope.body)
            .map_err(|err| DispatchError::Decoding {
                payload_type: body_type.clone(),
                reason: err.to_string(),
            })?;

        debug!(
            kind = %kind,
            body_type = body_type,
            handler = handler.name(),
            "invoking handler"
        );

        match AssertUnwindSafe(running).catch_unwind().await {
            Ok(result) => result.map_err(DispatchError::Handler),
            Err(panic) => Err(DispatchError::Handler(
                HandlerError::new("Panic", panic_message(panic.as_ref())).terminal(),
            )),
        }
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        (*message).to_owned()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "handler panicked".to_owned()
    }
}
