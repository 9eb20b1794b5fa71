// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Inbound Context
//!
//! The headers of the delivery being processed. The router hands the context to the
//! handler explicitly and also installs it in task-local storage for the duration of
//! the handler, so publishes made inside the handler can copy the mapped headers
//! without threading the context through user code.
//!
//! The task-local scope does not follow `tokio::spawn`; a handler that publishes from
//! a spawned task must pass its context along.

use crate::headers::{HeaderValue, Headers};
use std::{future::Future, sync::Arc};

tokio::task_local! {
    static INBOUND: InboundContext;
}

/// Read-only view of the headers of the message being handled.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct InboundContext {
    headers: Arc<Headers>,
}

impl InboundContext {
    pub fn new(headers: Headers) -> Self {
        InboundContext {
            headers: Arc::new(headers),
        }
    }

    pub fn headers(&self) -> &Headers {
        &self.headers
    }

    pub fn header(&self, name: &str) -> Option<&HeaderValue> {
        self.headers.get(name)
    }

    /// The context installed for the current task, if the task is handling a delivery.
    pub fn current() -> Option<InboundContext> {
        INBOUND.try_with(InboundContext::clone).ok()
    }

    /// Runs `fut` with this context installed. The context is removed when `fut`
    /// completes, whatever its outcome.
    pub async fn scope<F: Future>(self, fut: F) -> F::Output {
        INBOUND.scope(self, fut).await
    }

    /// Copies every mapped header present in the context into `outbound`.
    ///
    /// # Parameters
    /// * `mapped` - Names of the headers that propagate to outbound messages
    /// * `outbound` - Headers of the message about to be published
    pub fn copy_mapped_headers_into(&self, mapped: &[String], outbound: &mut Headers) {
        for name in mapped {
            if let Some(value) = self.headers.get(name) {
                outbound.insert(name.clone(), value.clone());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn inbound() -> InboundContext {
        let mut headers = Headers::new();
        headers.insert("X-Tenant".to_owned(), "t1".into());
        headers.insert("X-Trace".to_owned(), "tr1".into());
        headers.insert("X-Other".to_owned(), "o".into());
        InboundContext::new(headers)
    }

    #[test]
    fn copies_only_mapped_headers() {
        let mapped = vec!["X-Tenant".to_owned(), "X-Trace".to_owned(), "X-Missing".to_owned()];
        let mut outbound = Headers::new();

        inbound().copy_mapped_headers_into(&mapped, &mut outbound);

        assert_eq!(outbound.len(), 2);
        assert_eq!(outbound["X-Tenant"].as_str(), Some("t1"));
        assert_eq!(outbound["X-Trace"].as_str(), Some("tr1"));
    }

    #[tokio::test]
    async fn context_is_visible_only_inside_the_scope() {
        assert!(InboundContext::current().is_none());

        let seen = inbound()
            .scope(async {
                InboundContext::current()
                    .and_then(|ctx| ctx.header("X-Tenant").cloned())
            })
            .await;

        assert_eq!(seen, Some(HeaderValue::from("t1")));
        assert!(InboundContext::current().is_none());
    }
}
