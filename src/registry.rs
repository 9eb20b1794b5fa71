// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Handler Registry
//!
//! Maps `(kind, payload type name)` to exactly one handler. The registry is built and
//! validated once at startup and never changes afterwards, so lookups take no lock.

use crate::{
    envelope::MessageKind,
    errors::{DispatchError, RegistryError},
    handler::{HandlerMethod, MessageListener},
};
use std::{collections::HashMap, sync::Arc};
use tracing::debug;

/// Collects handlers before they are validated into a `HandlerRegistry`.
#[derive(Debug, Default)]
pub struct HandlerRegistryBuilder {
    methods: Vec<HandlerMethod>,
}

impl HandlerRegistryBuilder {
    pub fn new() -> Self {
        HandlerRegistryBuilder::default()
    }

    /// Registers every handler a listener owns.
    pub fn listener<L: MessageListener>(mut self, listener: Arc<L>) -> Self {
        self.methods.extend(listener.handlers());
        self
    }

    /// Registers a single handler.
    pub fn handler(mut self, method: HandlerMethod) -> Self {
        self.methods.push(method);
        self
    }

    /// Registers several handlers.
    pub fn handlers(mut self, methods: impl IntoIterator<Item = HandlerMethod>) -> Self {
        self.methods.extend(methods);
        self
    }

    /// Validates the registrations and freezes them.
    ///
    /// Each handler must declare exactly one input parameter, no two handlers may share
    /// a `(kind, payload type name)` key and query handlers must return a value.
    ///
    /// # Returns
    /// The frozen registry or the first invalid registration found
    pub fn build(self) -> Result<HandlerRegistry, RegistryError> {
        let mut handlers: HashMap<(MessageKind, String), Arc<HandlerMethod>> = HashMap::new();

        for method in self.methods {
            let count = method.parameter_types.len();
            if count == 0 {
                return Err(RegistryError::NoInputParameter {
                    kind: method.kind,
                    handler: method.name,
                });
            }
            if count > 1 {
                return Err(RegistryError::MultipleInputParameters {
                    kind: method.kind,
                    handler: method.name,
                    count,
                });
            }

            let payload_type = method.payload_type_name().unwrap_or_default().to_owned();

            if method.kind == MessageKind::Query && !method.returns_value {
                return Err(RegistryError::MissingReturnValue {
                    handler: method.name,
                    payload_type,
                });
            }

            let key = (method.kind, payload_type);
            if let Some(existing) = handlers.get(&key) {
                return Err(RegistryError::DuplicatedInputParameter {
                    kind: key.0,
                    payload_type: key.1,
                    existing: existing.name.clone(),
                    duplicate: method.name,
                });
            }

            debug!(
                kind = %key.0,
                payload_type = %key.1,
                handler = %method.name,
                "handler registered"
            );
            handlers.insert(key, Arc::new(method));
        }

        Ok(HandlerRegistry { handlers })
    }
}

/// Frozen `(kind, payload type name) -> handler` mapping.
#[derive(Debug, Default)]
pub struct HandlerRegistry {
    handlers: HashMap<(MessageKind, String), Arc<HandlerMethod>>,
}

impl HandlerRegistry {
    pub fn builder() -> HandlerRegistryBuilder {
        HandlerRegistryBuilder::default()
    }

    /// Finds the handler for a message.
    ///
    /// # Parameters
    /// * `kind` - Kind read from the `handler-type` header
    /// * `payload_type` - Name read from the `body-type` header
    ///
    /// # Returns
    /// The handler or `DispatchError::HandlerNotFound`
    pub fn get_handler(
        &self,
        kind: MessageKind,
        payload_type: &str,
    ) -> Result<Arc<HandlerMethod>, DispatchError> {
        self.handlers
            .get(&(kind, payload_type.to_owned()))
            .cloned()
            .ok_or_else(|| DispatchError::HandlerNotFound {
                kind,
                payload_type: payload_type.to_owned(),
            })
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handler::HandlerError;
    use serde::Deserialize;
    use serde_json::Value;

    #[derive(Debug, Deserialize)]
    struct Charge {}

    #[derive(Debug, Deserialize)]
    struct Refund {}

    fn charge_command(name: &str) -> HandlerMethod {
        HandlerMethod::command(name.to_owned(), |_ctx, _charge: Charge| async {
            Ok::<_, HandlerError>(true)
        })
    }

    struct Billing;

    impl MessageListener for Billing {
        fn handlers(self: Arc<Self>) -> Vec<HandlerMethod> {
            vec![
                charge_command("charge"),
                HandlerMethod::event("refunded", |_ctx, _refund: Refund| async { Ok(()) }),
            ]
        }
    }

    #[test]
    fn registers_listener_handlers() {
        let registry = HandlerRegistry::builder()
            .listener(Arc::new(Billing))
            .build()
            .unwrap();

        assert_eq!(registry.len(), 2);
        assert_eq!(
            registry
                .get_handler(MessageKind::Command, "Charge")
                .unwrap()
                .name(),
            "charge"
        );
        assert!(registry.get_handler(MessageKind::Event, "Refund").is_ok());
    }

    #[test]
    fn same_payload_under_different_kinds_is_allowed() {
        let registry = HandlerRegistry::builder()
            .handler(charge_command("charge"))
            .handler(HandlerMethod::event("charged", |_ctx, _c: Charge| async { Ok(()) }))
            .build();
        assert!(registry.is_ok());
    }

    #[test]
    fn duplicated_key_is_rejected() {
        let err = HandlerRegistry::builder()
            .handler(charge_command("charge"))
            .handler(charge_command("charge_again"))
            .build()
            .unwrap_err();

        assert_eq!(
            err,
            RegistryError::DuplicatedInputParameter {
                kind: MessageKind::Command,
                payload_type: "Charge".to_owned(),
                existing: "charge".to_owned(),
                duplicate: "charge_again".to_owned(),
            }
        );
    }

    #[test]
    fn parameter_count_is_checked() {
        let none = HandlerMethod::dynamic(MessageKind::Event, "none", vec![], false, |_c, _v| async {
            Ok(None)
        });
        assert!(matches!(
            HandlerRegistry::builder().handler(none).build(),
            Err(RegistryError::NoInputParameter { .. })
        ));

        let many = HandlerMethod::dynamic(
            MessageKind::Event,
            "many",
            vec!["Charge".to_owned(), "Refund".to_owned()],
            false,
            |_c, _v| async { Ok(None) },
        );
        assert!(matches!(
            HandlerRegistry::builder().handler(many).build(),
            Err(RegistryError::MultipleInputParameters { count: 2, .. })
        ));
    }

    #[test]
    fn query_must_return_a_value() {
        let query = HandlerMethod::dynamic(
            MessageKind::Query,
            "lookup",
            vec!["Charge".to_owned()],
            false,
            |_c, _v: Value| async { Ok(None) },
        );

        assert!(matches!(
            HandlerRegistry::builder().handler(query).build(),
            Err(RegistryError::MissingReturnValue { .. })
        ));
    }

    #[test]
    fn unknown_key_is_not_found() {
        let registry = HandlerRegistry::builder().build().unwrap();
        assert_eq!(
            registry.get_handler(MessageKind::Query, "Charge").unwrap_err(),
            DispatchError::HandlerNotFound {
                kind: MessageKind::Query,
                payload_type: "Charge".to_owned(),
            }
        );
    }
}
