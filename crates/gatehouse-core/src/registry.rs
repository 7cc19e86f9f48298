//! Entity registry
//!
//! Named entities, unique per type, with optional parent links. Only the
//! parent id is stored; children are found by scanning, so there are no
//! ownership cycles between entries.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use rand::distributions::Alphanumeric;
use rand::Rng;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::audit::{AuditRecord, AuditTrail, OperationKind};
use crate::error::{GatehouseError, Result};
use crate::store::{DocumentStore, Versioned};

/// Default document key of the registry
pub const DEFAULT_REGISTRY: &str = "registry";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Entity {
    pub id: String,
    #[serde(rename = "type")]
    pub entity_type: String,
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub parent_id: Option<String>,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub updated_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RegistryMetadata {
    pub version: u64,
    pub updated_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RegistryDocument {
    pub metadata: RegistryMetadata,
    pub entities: Vec<Entity>,
}

impl Versioned for RegistryDocument {
    fn version(&self) -> u64 {
        self.metadata.version
    }

    fn set_version(&mut self, version: u64) {
        self.metadata.version = version;
    }
}

impl RegistryDocument {
    fn find(&self, entity_type: &str, name: &str) -> Option<&Entity> {
        self.entities
            .iter()
            .find(|e| e.entity_type == entity_type && e.name == name)
    }

    fn position(&self, id: &str) -> Option<usize> {
        self.entities.iter().position(|e| e.id == id)
    }
}

/// `{type}_{millis}_{suffix}`
fn generate_id(entity_type: &str) -> String {
    let suffix: String = rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(8)
        .map(|b| char::from(b).to_ascii_lowercase())
        .collect();
    format!("{}_{}_{}", entity_type, Utc::now().timestamp_millis(), suffix)
}

/// Entity catalog persisted through the document store
#[derive(Debug, Clone)]
pub struct Registry {
    store: Arc<DocumentStore>,
    key: String,
    audit: Option<Arc<AuditTrail>>,
}

impl Registry {
    pub fn new(store: Arc<DocumentStore>) -> Self {
        Self {
            store,
            key: DEFAULT_REGISTRY.to_string(),
            audit: None,
        }
    }

    pub fn with_key(mut self, key: impl Into<String>) -> Self {
        self.key = key.into();
        self
    }

    pub fn with_audit(mut self, audit: Arc<AuditTrail>) -> Self {
        self.audit = Some(audit);
        self
    }

    /// Register a new entity and return its id
    pub fn register(
        &self,
        entity_type: &str,
        name: &str,
        description: &str,
        parent_id: Option<&str>,
    ) -> Result<String> {
        let result = self
            .store
            .update::<RegistryDocument, _, _>(&self.key, |doc| {
                if doc.find(entity_type, name).is_some() {
                    return Err(GatehouseError::DuplicateName {
                        entity_type: entity_type.to_string(),
                        name: name.to_string(),
                    });
                }
                if let Some(parent) = parent_id {
                    if doc.position(parent).is_none() {
                        return Err(GatehouseError::UnknownParent(parent.to_string()));
                    }
                }
                let entity = Entity {
                    id: generate_id(entity_type),
                    entity_type: entity_type.to_string(),
                    name: name.to_string(),
                    description: description.to_string(),
                    parent_id: parent_id.map(str::to_string),
                    created_at: Utc::now(),
                    updated_at: None,
                };
                let id = entity.id.clone();
                doc.entities.push(entity);
                doc.metadata.updated_at = Some(Utc::now());
                Ok(id)
            })
            .map(|(id, _)| id)
            .map_err(|e| match e {
                GatehouseError::ConcurrentModification { .. } => GatehouseError::RegistrationFailed {
                    attempts: self.store.max_commit_retries(),
                    reason: e.to_string(),
                },
                other => other,
            });

        if let Ok(id) = &result {
            info!(entity_type, name, id = %id, "entity registered");
        }
        self.audit(
            AuditRecord::from_result(OperationKind::Register, format!("{entity_type}/{name}"), &result),
        )?;
        result
    }

    pub fn find(&self, entity_type: &str, name: &str) -> Result<Option<Entity>> {
        Ok(self.load()?.find(entity_type, name).cloned())
    }

    pub fn get(&self, id: &str) -> Result<Option<Entity>> {
        Ok(self.load()?.entities.into_iter().find(|e| e.id == id))
    }

    pub fn children_of(&self, parent_id: &str) -> Result<Vec<Entity>> {
        Ok(self
            .load()?
            .entities
            .into_iter()
            .filter(|e| e.parent_id.as_deref() == Some(parent_id))
            .collect())
    }

    /// All entities, optionally of one type, in registration order
    pub fn list(&self, entity_type: Option<&str>) -> Result<Vec<Entity>> {
        Ok(self
            .load()?
            .entities
            .into_iter()
            .filter(|e| entity_type.map_or(true, |t| e.entity_type == t))
            .collect())
    }

    pub fn update_description(&self, id: &str, description: &str) -> Result<Entity> {
        let result = self
            .store
            .update::<RegistryDocument, _, _>(&self.key, |doc| {
                let at = doc
                    .position(id)
                    .ok_or_else(|| GatehouseError::EntityNotFound(id.to_string()))?;
                let now = Utc::now();
                let entity = &mut doc.entities[at];
                entity.description = description.to_string();
                entity.updated_at = Some(now);
                let updated = entity.clone();
                doc.metadata.updated_at = Some(now);
                Ok(updated)
            })
            .map(|(entity, _)| entity);

        self.audit(AuditRecord::from_result(OperationKind::UpdateEntity, id, &result))?;
        result
    }

    /// Remove an entity that has no children
    pub fn remove(&self, id: &str) -> Result<Entity> {
        let result = self
            .store
            .update::<RegistryDocument, _, _>(&self.key, |doc| {
                let at = doc
                    .position(id)
                    .ok_or_else(|| GatehouseError::EntityNotFound(id.to_string()))?;
                let children = doc
                    .entities
                    .iter()
                    .filter(|e| e.parent_id.as_deref() == Some(id))
                    .count();
                if children > 0 {
                    return Err(GatehouseError::EntityHasChildren {
                        id: id.to_string(),
                        children,
                    });
                }
                doc.metadata.updated_at = Some(Utc::now());
                Ok(doc.entities.remove(at))
            })
            .map(|(entity, _)| entity);

        if let Ok(entity) = &result {
            info!(id, entity_type = %entity.entity_type, name = %entity.name, "entity removed");
        }
        self.audit(AuditRecord::from_result(OperationKind::RemoveEntity, id, &result))?;
        result
    }

    fn load(&self) -> Result<RegistryDocument> {
        Ok(self.store.load::<RegistryDocument>(&self.key)?.document)
    }

    fn audit(&self, record: AuditRecord) -> Result<()> {
        if let Some(audit) = &self.audit {
            audit.record(record)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{FraudSettings, StoreSettings};
    use tempfile::TempDir;

    fn registry() -> (TempDir, Registry) {
        let dir = TempDir::new().unwrap();
        let store = Arc::new(DocumentStore::open(dir.path(), &StoreSettings::default()).unwrap());
        (dir, Registry::new(store))
    }

    #[test]
    fn test_register_and_find() {
        let (_dir, reg) = registry();
        let id = reg.register("scenario", "login", "user logs in", None).unwrap();
        assert!(id.starts_with("scenario_"));
        assert_eq!(id.split('_').count(), 3);

        let found = reg.find("scenario", "login").unwrap().unwrap();
        assert_eq!(found.id, id);
        assert_eq!(found.description, "user logs in");
        assert!(reg.find("scenario", "logout").unwrap().is_none());
        assert_eq!(reg.get(&id).unwrap().unwrap().name, "login");
    }

    #[test]
    fn test_name_unique_per_type() {
        let (_dir, reg) = registry();
        reg.register("scenario", "x", "", None).unwrap();
        assert!(matches!(
            reg.register("scenario", "x", "again", None),
            Err(GatehouseError::DuplicateName { .. })
        ));
        // same name in another type is fine
        reg.register("theme", "x", "", None).unwrap();
        assert_eq!(reg.list(None).unwrap().len(), 2);
        assert_eq!(reg.list(Some("theme")).unwrap().len(), 1);
    }

    #[test]
    fn test_parent_links() {
        let (_dir, reg) = registry();
        assert!(matches!(
            reg.register("story", "s", "", Some("epic_1_missing")),
            Err(GatehouseError::UnknownParent(_))
        ));

        let epic = reg.register("epic", "e", "", None).unwrap();
        let s1 = reg.register("story", "s1", "", Some(&epic)).unwrap();
        reg.register("story", "s2", "", Some(&epic)).unwrap();

        let children = reg.children_of(&epic).unwrap();
        assert_eq!(children.len(), 2);
        assert_eq!(children[0].id, s1);

        assert!(matches!(
            reg.remove(&epic),
            Err(GatehouseError::EntityHasChildren { children: 2, .. })
        ));
    }

    #[test]
    fn test_update_and_remove() {
        let (_dir, reg) = registry();
        let id = reg.register("theme", "dark", "old", None).unwrap();
        let updated = reg.update_description(&id, "new").unwrap();
        assert_eq!(updated.description, "new");
        assert!(updated.updated_at.is_some());

        let removed = reg.remove(&id).unwrap();
        assert_eq!(removed.name, "dark");
        assert!(reg.get(&id).unwrap().is_none());
        assert!(matches!(
            reg.update_description(&id, "x"),
            Err(GatehouseError::EntityNotFound(_))
        ));
    }

    #[test]
    fn test_mutations_are_audited() {
        let (_dir, reg) = registry();
        let audit = Arc::new(AuditTrail::new(FraudSettings::default()));
        let reg = reg.with_audit(audit.clone());

        reg.register("scenario", "x", "", None).unwrap();
        reg.register("scenario", "x", "", None).unwrap_err();
        reg.find("scenario", "x").unwrap();

        let log = audit.get_audit_log(&Default::default());
        assert_eq!(log.len(), 2);
        assert_eq!(log[0].target, "scenario/x");
        assert_eq!(log[1].outcome, crate::audit::Outcome::Error);
    }

    #[test]
    fn test_document_shape() {
        let (_dir, reg) = registry();
        reg.register("scenario", "x", "d", None).unwrap();
        let raw = std::fs::read_to_string(reg.store.path_for(DEFAULT_REGISTRY).unwrap()).unwrap();
        let json: serde_json::Value = serde_json::from_str(&raw).unwrap();
        assert_eq!(json["metadata"]["version"], 1);
        assert_eq!(json["entities"][0]["type"], "scenario");
        assert!(json["entities"][0]["parent_id"].is_null());
    }
}
