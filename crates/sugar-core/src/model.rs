//! Object model descriptions
//!
//! A [`Model`] names the entities a stack may store and the attributes each
//! entity carries. Its version hash is written into every store it creates,
//! which is how an incompatible store is detected on open.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

/// One entity of the model
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntityDescription {
    pub name: String,
    /// Allowed attribute names; empty means "any attribute"
    pub attributes: BTreeSet<String>,
}

impl EntityDescription {
    pub fn allows(&self, attribute: &str) -> bool {
        self.attributes.is_empty() || self.attributes.contains(attribute)
    }
}

/// Schema of the object graph
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Model {
    entities: BTreeMap<String, EntityDescription>,
    /// Earlier versions this model can be migrated from
    #[serde(default)]
    previous_versions: Vec<Model>,
}

impl Model {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add an entity with the given attributes
    pub fn entity(mut self, name: impl Into<String>, attributes: &[&str]) -> Self {
        let name = name.into();
        self.entities.insert(
            name.clone(),
            EntityDescription {
                name,
                attributes: attributes.iter().map(|a| a.to_string()).collect(),
            },
        );
        self
    }

    /// Register an earlier model version as a migration source
    pub fn with_previous_version(mut self, previous: Model) -> Self {
        self.previous_versions.push(previous);
        self
    }

    pub fn entities(&self) -> impl Iterator<Item = &EntityDescription> {
        self.entities.values()
    }

    pub fn entity_description(&self, name: &str) -> Option<&EntityDescription> {
        self.entities.get(name)
    }

    pub fn contains_entity(&self, name: &str) -> bool {
        self.entities.contains_key(name)
    }

    /// Deterministic version hash (hex BLAKE3 of the canonical entity listing)
    ///
    /// Previous versions do not contribute to the hash.
    pub fn version_hash(&self) -> String {
        let mut hasher = blake3::Hasher::new();
        for entity in self.entities.values() {
            hasher.update(entity.name.as_bytes());
            hasher.update(b"{");
            for attribute in &entity.attributes {
                hasher.update(attribute.as_bytes());
                hasher.update(b",");
            }
            hasher.update(b"}");
        }
        hasher.finalize().to_hex().to_string()
    }

    /// Find the earlier version whose hash matches a store's recorded hash
    pub fn source_version(&self, hash: &str) -> Option<&Model> {
        self.previous_versions
            .iter()
            .find(|m| m.version_hash() == hash)
    }
}
