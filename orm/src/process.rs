// SPDX-FileCopyrightText: © 2022 ChiselStrike <info@chiselstrike.com>

use crate::error::{Error, Result};
use crate::instance::EntityInstance;
use crate::meta::{EntityMeta, Registry, RelationKind};
use crate::value::{EntityMap, EntityValue};

/// Which lifecycle point generated values are being produced for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Moment {
    Insert,
    Update,
}

/// Maps supplied property values to a column map for an INSERT: property
/// lookup first, then relation lookup; value objects are unwrapped and
/// nested instances coerce to their primary key. Keys prefixed with `$`
/// pass through untouched.
pub fn process_for_insert(
    registry: &Registry,
    meta: &EntityMeta,
    values: &EntityMap,
) -> Result<EntityMap> {
    process(registry, meta, values, true)
}

/// Same resolution as [process_for_insert], but nested instances are left
/// alone; updates reference other rows by id explicitly.
pub fn process_for_update(
    registry: &Registry,
    meta: &EntityMeta,
    values: &EntityMap,
) -> Result<EntityMap> {
    process(registry, meta, values, false)
}

fn process(
    registry: &Registry,
    meta: &EntityMeta,
    values: &EntityMap,
    coerce_instances: bool,
) -> Result<EntityMap> {
    let mut columns = EntityMap::new();
    for (key, value) in values {
        if key.starts_with('$') {
            columns.insert(key.clone(), value.clone());
            continue;
        }
        // To-many collections live on the other side; nothing to write.
        if let Some(relation) = meta.relation(key) {
            if relation.kind == RelationKind::OneToMany {
                continue;
            }
        }
        let column = meta.column_for_key(key)?;
        let value = match value {
            EntityValue::ValueObject(vo) => vo.value().unwrapped().clone(),
            EntityValue::Ref(instance) if coerce_instances => {
                let instance = instance.lock();
                let target = registry.get(instance.entity())?;
                instance
                    .primary_key(&target)
                    .cloned()
                    .ok_or_else(|| Error::UnsupportedValue(EntityValue::Null))?
            }
            other => other.clone(),
        };
        columns.insert(column, value);
    }
    Ok(columns)
}

/// Builds an instance from a column map, invoking defaults and the
/// matching `on_insert`/`on_update` generators, and assigning many-to-one
/// columns to their relation property as a bare foreign-key placeholder.
pub fn create_instance(
    meta: &EntityMeta,
    column_map: &EntityMap,
    moment: Moment,
) -> Result<EntityInstance> {
    let mut instance = EntityInstance::new(&meta.name);

    for (column, value) in column_map {
        if column.starts_with('$') {
            continue;
        }
        if let Some(prop) = meta.property_by_column(column) {
            instance.set(prop.name.clone(), value.clone());
        } else if let Some(relation) = meta.relation_by_column(column) {
            if relation.kind == RelationKind::ManyToOne {
                instance.set(relation.name.clone(), value.clone());
            }
        } else {
            return Err(Error::PropertyNotFound {
                entity: meta.name.clone(),
                property: column.clone(),
            });
        }
    }

    match moment {
        Moment::Insert => {
            for prop in meta.properties.values() {
                if instance.get(&prop.name).is_some() {
                    continue;
                }
                if let Some(generate) = &prop.on_insert {
                    instance.set(prop.name.clone(), generate());
                } else if let Some(default) = &prop.default {
                    instance.set(prop.name.clone(), default.clone());
                }
            }
        }
        Moment::Update => {
            for prop in meta.properties.values() {
                if let Some(generate) = &prop.on_update {
                    instance.set(prop.name.clone(), generate());
                }
            }
        }
    }

    Ok(instance)
}
