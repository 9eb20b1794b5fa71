// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Entity Events
//!
//! Publishes committed entity changes as EVENT messages on the entity events exchange.
//!
//! An entity type opts in by implementing `PersistentEntity` with an
//! `EntityEventsPublish` marker. The persistence layer calls the bridge once the
//! transaction that created or updated the entity has durably committed; entities
//! without a marker, or whose marker disables the change kind, are dropped silently.

use crate::{
    config::EntityEventsSettings,
    errors::DispatchError,
    envelope::payload_type_name,
    publisher::{MessagePublisher, MessagePublisherExt},
};
use serde::Serialize;
use std::{fmt, sync::Arc};
use tracing::debug;

/// Which committed changes of an entity type are published.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EntityEventsPublish {
    pub publish_create: bool,
    pub publish_update: bool,
}

impl Default for EntityEventsPublish {
    fn default() -> Self {
        EntityEventsPublish {
            publish_create: true,
            publish_update: true,
        }
    }
}

impl EntityEventsPublish {
    pub fn allows(&self, change: ChangeKind) -> bool {
        match change {
            ChangeKind::Created => self.publish_create,
            ChangeKind::Updated => self.publish_update,
        }
    }
}

/// An entity managed by the persistence layer.
///
/// ```ignore
/// impl PersistentEntity for Person {
///     const ENTITY_EVENTS: Option<EntityEventsPublish> = Some(EntityEventsPublish {
///         publish_create: true,
///         publish_update: false,
///     });
/// }
/// ```
pub trait PersistentEntity: Serialize + Send + Sync {
    /// Marker enabling entity events for the type, absent by default.
    const ENTITY_EVENTS: Option<EntityEventsPublish> = None;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeKind {
    Created,
    Updated,
}

impl fmt::Display for ChangeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ChangeKind::Created => f.write_str("CREATED"),
            ChangeKind::Updated => f.write_str("UPDATED"),
        }
    }
}

/// Bridges post-commit callbacks of the persistence layer to the publisher.
#[derive(Clone)]
pub struct EntityEventBridge {
    publisher: Arc<dyn MessagePublisher>,
    exchange: String,
    routing_key: String,
}

impl EntityEventBridge {
    /// Creates a bridge publishing to the entity events exchange.
    ///
    /// # Parameters
    /// * `publisher` - Publisher sending the events
    /// * `settings` - Entity events exchange and routing key
    pub fn new(publisher: Arc<dyn MessagePublisher>, settings: &EntityEventsSettings) -> Self {
        debug!(
            exchange = settings.exchange.name(),
            routing_key = %settings.routing_key,
            "entity events will be published"
        );

        EntityEventBridge {
            publisher,
            exchange: settings.exchange.name().to_owned(),
            routing_key: settings.routing_key.clone(),
        }
    }

    /// Handles a committed change.
    ///
    /// # Returns
    /// `Ok(true)` when an event was published, `Ok(false)` when the entity does not
    /// publish this kind of change
    pub async fn on_post_commit<E: PersistentEntity>(
        &self,
        entity: &E,
        change: ChangeKind,
    ) -> Result<bool, DispatchError> {
        let Some(marker) = E::ENTITY_EVENTS else {
            return Ok(false);
        };
        if !marker.allows(change) {
            return Ok(false);
        }

        self.publisher
            .send_event(&self.exchange, &self.routing_key, entity)
            .await?;

        debug!(
            entity = payload_type_name::<E>(),
            change = %change,
            "entity event published"
        );
        Ok(true)
    }

    pub async fn on_post_insert<E: PersistentEntity>(&self, entity: &E) -> Result<bool, DispatchError> {
        self.on_post_commit(entity, ChangeKind::Created).await
    }

    pub async fn on_post_update<E: PersistentEntity>(&self, entity: &E) -> Result<bool, DispatchError> {
        self.on_post_commit(entity, ChangeKind::Updated).await
    }

    /// A transaction carrying the change failed to commit: nothing is published.
    pub fn on_commit_failed<E: PersistentEntity>(&self, _entity: &E, change: ChangeKind) {
        debug!(
            entity = payload_type_name::<E>(),
            change = %change,
            "commit failed, no entity event"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        envelope::MessageKind,
        exchange::ExchangeDefinition,
        publisher::MockMessagePublisher,
    };

    #[derive(Serialize)]
    struct Person {
        id: u64,
    }

    impl PersistentEntity for Person {
        const ENTITY_EVENTS: Option<EntityEventsPublish> = Some(EntityEventsPublish {
            publish_create: true,
            publish_update: false,
        });
    }

    #[derive(Serialize)]
    struct AuditLog {
        line: String,
    }

    impl PersistentEntity for AuditLog {}

    fn bridge(publisher: MockMessagePublisher) -> EntityEventBridge {
        EntityEventBridge::new(
            Arc::new(publisher),
            &EntityEventsSettings {
                exchange: ExchangeDefinition::new("svc-A-entity-events").durable(),
                routing_key: "#".to_owned(),
            },
        )
    }

    #[tokio::test]
    async fn created_entity_is_published_as_event() {
        let mut publisher = MockMessagePublisher::new();
        publisher
            .expect_publish()
            .withf(|request| {
                request.exchange == "svc-A-entity-events"
                    && request.routing_key == "#"
                    && request.kind == MessageKind::Event
                    && request.body_type == "Person"
                    && request.body == br#"{"id":7}"#.to_vec()
            })
            .times(1)
            .returning(|_| Ok(()));

        let published = bridge(publisher)
            .on_post_insert(&Person { id: 7 })
            .await
            .unwrap();

        assert!(published);
    }

    #[tokio::test]
    async fn disabled_change_kind_and_unmarked_entities_are_dropped() {
        let mut publisher = MockMessagePublisher::new();
        publisher.expect_publish().never();
        let bridge = bridge(publisher);

        assert!(!bridge.on_post_update(&Person { id: 7 }).await.unwrap());
        assert!(!bridge
            .on_post_insert(&AuditLog {
                line: "x".to_owned()
            })
            .await
            .unwrap());
        bridge.on_commit_failed(&Person { id: 7 }, ChangeKind::Created);
    }

    #[test]
    fn marker_defaults_publish_everything() {
        let marker = EntityEventsPublish::default();
        assert!(marker.allows(ChangeKind::Created));
        assert!(marker.allows(ChangeKind::Updated));
    }
}
