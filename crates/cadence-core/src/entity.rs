//! Built-in entity implementations: a serde-friendly static entity,
//! an in-memory repository, and a property-based recipient resolver.
//! These back the daemon's entities file and the engine's tests; real
//! deployments implement the traits against their own data store.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::{CadenceError, Result};
use crate::traits::{Entity, EntityRepository, RecipientResolver};
use crate::types::{Recipient, RecipientKind};

/// A plain entity with a fixed property map.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StaticEntity {
    pub id: String,
    pub entity_type: String,
    #[serde(default)]
    pub closed: bool,
    #[serde(default)]
    pub owner_id: Option<String>,
    #[serde(default)]
    pub properties: HashMap<String, String>,
}

impl StaticEntity {
    pub fn new(id: &str, entity_type: &str) -> Self {
        Self {
            id: id.to_string(),
            entity_type: entity_type.to_string(),
            closed: false,
            owner_id: None,
            properties: HashMap::new(),
        }
    }

    /// Builder-style property setter.
    pub fn with_property(mut self, name: &str, value: &str) -> Self {
        self.properties.insert(name.to_string(), value.to_string());
        self
    }
}

impl Entity for StaticEntity {
    fn id(&self) -> &str {
        &self.id
    }

    fn entity_type(&self) -> &str {
        &self.entity_type
    }

    fn is_closed(&self) -> bool {
        self.closed
    }

    fn owner_id(&self) -> Option<&str> {
        self.owner_id.as_deref()
    }

    fn property(&self, name: &str) -> Option<String> {
        self.properties.get(name).cloned()
    }

    fn properties(&self) -> HashMap<String, String> {
        self.properties.clone()
    }
}

/// In-memory entity repository keyed by scope.
#[derive(Default)]
pub struct MemoryEntityRepository {
    entities: HashMap<String, Vec<Arc<dyn Entity>>>,
}

impl MemoryEntityRepository {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, scope: &str, entity: StaticEntity) {
        self.entities
            .entry(scope.to_string())
            .or_default()
            .push(Arc::new(entity));
    }
}

#[async_trait]
impl EntityRepository for MemoryEntityRepository {
    async fn open_entities(&self, scope: &str) -> Result<Vec<Arc<dyn Entity>>> {
        Ok(self
            .entities
            .get(scope)
            .map(|v| v.iter().filter(|e| !e.is_closed()).cloned().collect())
            .unwrap_or_default())
    }
}

/// Resolves recipients from entity properties and a registered owner
/// table.
///
/// `EntityItself` reads `contact_phone`, `time_zone`, and `language`
/// properties off the entity; `EntityOwner` looks the owner id up in
/// the table registered with [`StaticRecipientResolver::add_owner`].
#[derive(Default)]
pub struct StaticRecipientResolver {
    owners: HashMap<String, Recipient>,
}

impl StaticRecipientResolver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_owner(&mut self, owner_id: &str, recipient: Recipient) {
        self.owners.insert(owner_id.to_string(), recipient);
    }
}

impl RecipientResolver for StaticRecipientResolver {
    fn resolve(&self, entity: &dyn Entity, kind: RecipientKind) -> Result<Recipient> {
        match kind {
            RecipientKind::EntityOwner => {
                let owner_id = entity
                    .owner_id()
                    .ok_or_else(|| CadenceError::RecipientNotFound(format!("entity {} has no owner", entity.id())))?;
                self.owners
                    .get(owner_id)
                    .cloned()
                    .ok_or_else(|| CadenceError::RecipientNotFound(format!("unknown owner {owner_id}")))
            }
            RecipientKind::EntityItself => {
                let address = entity.property("contact_phone").ok_or_else(|| {
                    CadenceError::RecipientNotFound(format!("entity {} has no contact_phone", entity.id()))
                })?;
                Ok(Recipient {
                    id: entity.id().to_string(),
                    address,
                    timezone: entity.property("time_zone"),
                    language: entity.property("language"),
                })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resolve_entity_itself() {
        let entity = StaticEntity::new("c1", "patient")
            .with_property("contact_phone", "+15551234")
            .with_property("time_zone", "America/New_York");
        let resolver = StaticRecipientResolver::new();
        let recipient = resolver.resolve(&entity, RecipientKind::EntityItself).unwrap();
        assert_eq!(recipient.address, "+15551234");
        assert_eq!(recipient.timezone.as_deref(), Some("America/New_York"));
    }

    #[test]
    fn resolve_missing_owner_fails() {
        let entity = StaticEntity::new("c1", "patient");
        let resolver = StaticRecipientResolver::new();
        assert!(resolver.resolve(&entity, RecipientKind::EntityOwner).is_err());
    }

    #[tokio::test]
    async fn open_entities_skips_closed() {
        let mut repo = MemoryEntityRepository::new();
        repo.insert("clinic", StaticEntity::new("a", "patient"));
        let mut closed = StaticEntity::new("b", "patient");
        closed.closed = true;
        repo.insert("clinic", closed);
        let open = repo.open_entities("clinic").await.unwrap();
        assert_eq!(open.len(), 1);
        assert_eq!(open[0].id(), "a");
    }
}
