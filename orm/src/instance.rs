// SPDX-FileCopyrightText: © 2022 ChiselStrike <info@chiselstrike.com>

use crate::error::Result;
use crate::meta::{EntityMeta, Registry};
use crate::value::{EntityMap, EntityValue};

use parking_lot::Mutex;
use std::sync::Arc;

/// A materialised row of a single entity.
///
/// Assignments are recorded so `save()` can decide between insert and
/// update; hydration temporarily disables the recording so freshly loaded
/// instances start clean.
#[derive(Debug)]
pub struct EntityInstance {
    entity: String,
    values: EntityMap,
    old_values: EntityMap,
    changed_values: EntityMap,
    persisted: bool,
    hydrating: bool,
}

/// Shared handle with reference identity; what the identity map hands out.
pub type SharedInstance = Arc<Mutex<EntityInstance>>;

impl EntityInstance {
    pub fn new(entity: impl Into<String>) -> Self {
        Self {
            entity: entity.into(),
            values: EntityMap::new(),
            old_values: EntityMap::new(),
            changed_values: EntityMap::new(),
            persisted: false,
            hydrating: false,
        }
    }

    pub fn new_shared(entity: impl Into<String>) -> SharedInstance {
        Arc::new(Mutex::new(Self::new(entity)))
    }

    pub fn entity(&self) -> &str {
        &self.entity
    }

    pub fn persisted(&self) -> bool {
        self.persisted
    }

    pub fn mark_persisted(&mut self) {
        self.persisted = true;
    }

    /// While hydrating, assignments bypass change tracking.
    pub fn begin_hydration(&mut self) {
        self.hydrating = true;
    }

    pub fn end_hydration(&mut self) {
        self.hydrating = false;
    }

    pub fn is_hydrating(&self) -> bool {
        self.hydrating
    }

    pub fn get(&self, property: &str) -> Option<&EntityValue> {
        self.values.get(property)
    }

    pub fn values(&self) -> &EntityMap {
        &self.values
    }

    pub fn set(&mut self, property: impl Into<String>, value: EntityValue) {
        let property = property.into();
        if !self.hydrating {
            if let Some(previous) = self.values.get(&property) {
                if !self.old_values.contains_key(&property) {
                    self.old_values.insert(property.clone(), previous.clone());
                }
            }
            self.changed_values.insert(property.clone(), value.clone());
        }
        self.values.insert(property, value);
    }

    pub fn changed_values(&self) -> &EntityMap {
        &self.changed_values
    }

    pub fn old_values(&self) -> &EntityMap {
        &self.old_values
    }

    /// Snapshot the current state as the baseline and forget pending
    /// changes; called after hydration and after a successful save.
    pub fn reset_tracking(&mut self) {
        self.old_values = self.values.clone();
        self.changed_values.clear();
    }

    pub fn primary_key(&self, meta: &EntityMeta) -> Option<&EntityValue> {
        self.values.get(meta.primary_key_property())
    }

    /// JSON export; `hidden` properties are omitted and loaded relations
    /// (single or collection) render as the referenced primary keys.
    pub fn to_json(&self, registry: &Registry) -> Result<serde_json::Value> {
        let meta = registry.get(&self.entity)?;
        let mut out = serde_json::Map::new();
        for (key, value) in &self.values {
            if let Some(prop) = meta.property(key) {
                if prop.hidden {
                    continue;
                }
            }
            out.insert(key.clone(), render_value(registry, value)?);
        }
        Ok(serde_json::Value::Object(out))
    }
}

fn render_value(registry: &Registry, value: &EntityValue) -> Result<serde_json::Value> {
    match value {
        EntityValue::Ref(target) => {
            let target = target.lock();
            let target_meta = registry.get(target.entity())?;
            match target.primary_key(&target_meta) {
                Some(pk) => pk.to_json(),
                None => Ok(serde_json::Value::Null),
            }
        }
        EntityValue::Array(items) => {
            let rendered: Result<Vec<_>> =
                items.iter().map(|item| render_value(registry, item)).collect();
            Ok(serde_json::Value::Array(rendered?))
        }
        other => other.to_json(),
    }
}
