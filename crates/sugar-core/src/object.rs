//! Managed objects and change sets
//!
//! Objects live in contexts. A freshly inserted object carries a temporary
//! identity scoped to the context that created it; it receives a permanent,
//! disk-stable identity before any commit carries it across a context
//! boundary.

use std::collections::{BTreeMap, HashMap};
use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::context::ContextId;

/// Property values of an object, keyed by attribute name
pub type Properties = BTreeMap<String, Value>;

/// Identity of a managed object
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum ObjectId {
    /// Only meaningful inside the context that issued it
    Temporary { context: ContextId, serial: u64 },
    /// Stable across contexts and on disk
    Permanent(Uuid),
}

impl ObjectId {
    pub fn is_temporary(&self) -> bool {
        matches!(self, ObjectId::Temporary { .. })
    }

    pub fn is_permanent(&self) -> bool {
        matches!(self, ObjectId::Permanent(_))
    }

    pub(crate) fn new_permanent() -> Self {
        ObjectId::Permanent(Uuid::new_v4())
    }

    /// Key used for the store's primary key column
    pub fn store_key(&self) -> Option<String> {
        match self {
            ObjectId::Permanent(uuid) => Some(uuid.to_string()),
            ObjectId::Temporary { .. } => None,
        }
    }

    pub fn from_store_key(key: &str) -> Option<Self> {
        Uuid::parse_str(key).ok().map(ObjectId::Permanent)
    }
}

impl fmt::Display for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ObjectId::Temporary { context, serial } => write!(f, "temp:{}/{}", context, serial),
            ObjectId::Permanent(uuid) => write!(f, "{}", uuid),
        }
    }
}

/// An object of the graph as seen by one context
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ManagedObject {
    pub id: ObjectId,
    pub entity: String,
    pub properties: Properties,
}

impl ManagedObject {
    pub fn new(id: ObjectId, entity: impl Into<String>) -> Self {
        Self {
            id,
            entity: entity.into(),
            properties: Properties::new(),
        }
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.properties.get(key)
    }

    pub(crate) fn apply(&mut self, values: &Properties) {
        for (key, value) in values {
            self.properties.insert(key.clone(), value.clone());
        }
    }
}

/// Changed properties of an existing object
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PropertyChange {
    pub id: ObjectId,
    pub entity: String,
    pub values: Properties,
}

/// Uncommitted work of a context
#[derive(Debug, Clone, Default)]
pub struct ChangeSet {
    pub inserted: BTreeMap<ObjectId, ManagedObject>,
    pub updated: BTreeMap<ObjectId, PropertyChange>,
    /// Deleted ids with their entity name
    pub deleted: BTreeMap<ObjectId, String>,
}

impl ChangeSet {
    pub fn is_empty(&self) -> bool {
        self.inserted.is_empty() && self.updated.is_empty() && self.deleted.is_empty()
    }

    pub fn len(&self) -> usize {
        self.inserted.len() + self.updated.len() + self.deleted.len()
    }

    pub fn record_insert(&mut self, object: ManagedObject) {
        self.inserted.insert(object.id, object);
    }

    pub fn record_update(&mut self, id: ObjectId, entity: &str, key: &str, value: Value) {
        if let Some(object) = self.inserted.get_mut(&id) {
            object.properties.insert(key.to_string(), value);
            return;
        }
        self.updated
            .entry(id)
            .or_insert_with(|| PropertyChange {
                id,
                entity: entity.to_string(),
                values: Properties::new(),
            })
            .values
            .insert(key.to_string(), value);
    }

    pub fn record_delete(&mut self, id: ObjectId, entity: &str) {
        if self.inserted.remove(&id).is_some() {
            return;
        }
        self.updated.remove(&id);
        self.deleted.insert(id, entity.to_string());
    }

    /// Fold a child's committed changes into this (parent) change set
    pub fn absorb(&mut self, child: ChangeSet) {
        for (id, object) in child.inserted {
            self.deleted.remove(&id);
            self.inserted.insert(id, object);
        }
        for (id, change) in child.updated {
            if let Some(object) = self.inserted.get_mut(&id) {
                object.apply(&change.values);
            } else if !self.deleted.contains_key(&id) {
                match self.updated.get_mut(&id) {
                    Some(existing) => existing.values.extend(change.values),
                    None => {
                        self.updated.insert(id, change);
                    }
                }
            }
        }
        for (id, entity) in child.deleted {
            self.record_delete(id, &entity);
        }
    }

    /// Drop uncommitted values that a merged commit has overridden
    pub(crate) fn discard_properties(&mut self, id: &ObjectId, values: &Properties) {
        if let Some(change) = self.updated.get_mut(id) {
            for key in values.keys() {
                change.values.remove(key);
            }
            if change.values.is_empty() {
                self.updated.remove(id);
            }
        }
    }

    /// Whether any pending change refers to `id`
    pub(crate) fn touches(&self, id: &ObjectId) -> bool {
        self.inserted.contains_key(id) || self.updated.contains_key(id) || self.deleted.contains_key(id)
    }

    /// Forget every pending change for an object
    pub(crate) fn forget(&mut self, id: &ObjectId) {
        self.inserted.remove(id);
        self.updated.remove(id);
        self.deleted.remove(id);
    }

    pub fn temporary_ids(&self) -> Vec<ObjectId> {
        self.inserted
            .keys()
            .chain(self.updated.keys())
            .chain(self.deleted.keys())
            .filter(|id| id.is_temporary())
            .copied()
            .collect()
    }

    /// Rewrite identities according to `mapping`
    pub(crate) fn remap(&mut self, mapping: &HashMap<ObjectId, ObjectId>) {
        let remap_id = |id: ObjectId| mapping.get(&id).copied().unwrap_or(id);

        self.inserted = std::mem::take(&mut self.inserted)
            .into_values()
            .map(|mut object| {
                object.id = remap_id(object.id);
                (object.id, object)
            })
            .collect();
        self.updated = std::mem::take(&mut self.updated)
            .into_values()
            .map(|mut change| {
                change.id = remap_id(change.id);
                (change.id, change)
            })
            .collect();
        self.deleted = std::mem::take(&mut self.deleted)
            .into_iter()
            .map(|(id, entity)| (remap_id(id), entity))
            .collect();
    }

    pub fn into_event(self, source: ContextId) -> ChangeEvent {
        ChangeEvent {
            source,
            inserted: self.inserted.into_values().collect(),
            updated: self.updated.into_values().collect(),
            deleted: self.deleted.into_keys().collect(),
        }
    }
}

/// Emitted after a context commits successfully
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ChangeEvent {
    pub source: ContextId,
    pub inserted: Vec<ManagedObject>,
    pub updated: Vec<PropertyChange>,
    pub deleted: Vec<ObjectId>,
}

impl ChangeEvent {
    pub fn changed_ids(&self) -> Vec<ObjectId> {
        self.inserted
            .iter()
            .map(|o| o.id)
            .chain(self.updated.iter().map(|c| c.id))
            .chain(self.deleted.iter().copied())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn person(name: &str) -> ManagedObject {
        let mut object = ManagedObject::new(ObjectId::new_permanent(), "Person");
        object.properties.insert("name".to_string(), json!(name));
        object
    }

    #[test]
    fn test_update_of_inserted_object_folds_into_insert() {
        let mut changes = ChangeSet::default();
        let object = person("Ada");
        let id = object.id;
        changes.record_insert(object);
        changes.record_update(id, "Person", "age", json!(36));

        assert!(changes.updated.is_empty());
        assert_eq!(changes.inserted[&id].get("age"), Some(&json!(36)));
    }

    #[test]
    fn test_delete_of_inserted_object_cancels_insert() {
        let mut changes = ChangeSet::default();
        let object = person("Ada");
        let id = object.id;
        changes.record_insert(object);
        changes.record_delete(id, "Person");

        assert!(changes.is_empty());
    }

    #[test]
    fn test_absorb_unions_children() {
        let mut parent = ChangeSet::default();

        let mut first = ChangeSet::default();
        first.record_insert(person("Ada"));
        let mut second = ChangeSet::default();
        second.record_insert(person("Grace"));

        parent.absorb(first);
        parent.absorb(second);
        assert_eq!(parent.inserted.len(), 2);
    }

    #[test]
    fn test_absorb_update_then_delete() {
        let existing = ObjectId::new_permanent();
        let mut parent = ChangeSet::default();

        let mut update = ChangeSet::default();
        update.record_update(existing, "Person", "name", json!("Linus"));
        parent.absorb(update);
        assert_eq!(parent.updated.len(), 1);

        let mut delete = ChangeSet::default();
        delete.record_delete(existing, "Person");
        parent.absorb(delete);
        assert!(parent.updated.is_empty());
        assert!(parent.deleted.contains_key(&existing));
    }

    #[test]
    fn test_remap_replaces_temporary_ids() {
        let temp = ObjectId::Temporary {
            context: ContextId::from_raw(7),
            serial: 1,
        };
        let mut changes = ChangeSet::default();
        changes.record_insert(ManagedObject::new(temp, "Person"));
        assert_eq!(changes.temporary_ids(), vec![temp]);

        let permanent = ObjectId::new_permanent();
        changes.remap(&HashMap::from([(temp, permanent)]));

        assert!(changes.temporary_ids().is_empty());
        assert_eq!(changes.inserted[&permanent].id, permanent);
    }

    #[test]
    fn test_discard_properties() {
        let id = ObjectId::new_permanent();
        let mut changes = ChangeSet::default();
        changes.record_update(id, "Person", "name", json!("local"));
        changes.record_update(id, "Person", "age", json!(1));

        let merged = Properties::from([("name".to_string(), json!("remote"))]);
        changes.discard_properties(&id, &merged);
        assert_eq!(changes.updated[&id].values.len(), 1);

        let merged = Properties::from([("age".to_string(), json!(2))]);
        changes.discard_properties(&id, &merged);
        assert!(changes.is_empty());
    }

    #[test]
    fn test_store_key_round_trip() {
        let id = ObjectId::new_permanent();
        let key = id.store_key().unwrap();
        assert_eq!(ObjectId::from_store_key(&key), Some(id));
        assert!(ObjectId::Temporary {
            context: ContextId::from_raw(1),
            serial: 1
        }
        .store_key()
        .is_none());
    }
}
