// SPDX-FileCopyrightText: © 2022 ChiselStrike <info@chiselstrike.com>

use crate::error::{Error, Result};
use crate::instance::EntityInstance;
use crate::value::EntityValue;

use convert_case::{Case, Casing};
use indexmap::IndexMap;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

/// Column types understood by both dialects. `Serial` renders as `SERIAL`
/// on PostgreSQL and `INT AUTO_INCREMENT` on MySQL.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DbType {
    Text,
    Varchar,
    Int,
    BigInt,
    Serial,
    Float,
    Double,
    Boolean,
    Date,
    Timestamp,
    Json,
    Uuid,
    Enum,
}

impl DbType {
    /// The type a foreign-key column referencing this type must use.
    pub fn as_reference(&self) -> DbType {
        match self {
            DbType::Serial => DbType::Int,
            other => other.clone(),
        }
    }

    /// How row values of this type are decoded from the driver.
    pub fn decode_class(&self) -> DecodeClass {
        match self {
            DbType::Text | DbType::Varchar | DbType::Uuid | DbType::Enum => DecodeClass::Text,
            DbType::Int | DbType::BigInt | DbType::Serial => DecodeClass::Integer,
            DbType::Float | DbType::Double => DecodeClass::Float,
            DbType::Boolean => DecodeClass::Boolean,
            DbType::Date | DbType::Timestamp => DecodeClass::Date,
            DbType::Json => DecodeClass::Json,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecodeClass {
    Text,
    Integer,
    Float,
    Boolean,
    Date,
    Json,
}

pub type ValueFactory = Arc<dyn Fn() -> EntityValue + Send + Sync>;

/// A persisted scalar field of an entity.
#[derive(Clone)]
pub struct PropertyMeta {
    pub name: String,
    pub column: String,
    pub db_type: DbType,
    pub length: Option<u32>,
    pub precision: Option<u32>,
    pub scale: Option<u32>,
    pub nullable: bool,
    pub default: Option<EntityValue>,
    pub on_insert: Option<ValueFactory>,
    pub on_update: Option<ValueFactory>,
    pub primary: bool,
    pub hidden: bool,
    pub unique: bool,
    pub index: bool,
    pub enum_values: Vec<String>,
    pub array: bool,
    pub auto_increment: bool,
    /// Set when the declared type is a value object; hydration re-wraps the
    /// column value into this class.
    pub value_object: Option<String>,
}

impl fmt::Debug for PropertyMeta {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PropertyMeta")
            .field("name", &self.name)
            .field("column", &self.column)
            .field("db_type", &self.db_type)
            .field("nullable", &self.nullable)
            .field("primary", &self.primary)
            .finish()
    }
}

impl PropertyMeta {
    pub fn new(name: impl Into<String>, db_type: DbType) -> Self {
        let name = name.into();
        let column = name.to_case(Case::Snake);
        Self {
            name,
            column,
            db_type,
            length: None,
            precision: None,
            scale: None,
            nullable: false,
            default: None,
            on_insert: None,
            on_update: None,
            primary: false,
            hidden: false,
            unique: false,
            index: false,
            enum_values: vec![],
            array: false,
            auto_increment: false,
            value_object: None,
        }
    }

    pub fn column(mut self, column: impl Into<String>) -> Self {
        self.column = column.into();
        self
    }

    pub fn primary(mut self) -> Self {
        self.primary = true;
        self
    }

    pub fn nullable(mut self) -> Self {
        self.nullable = true;
        self
    }

    pub fn hidden(mut self) -> Self {
        self.hidden = true;
        self
    }

    pub fn unique(mut self) -> Self {
        self.unique = true;
        self
    }

    pub fn indexed(mut self) -> Self {
        self.index = true;
        self
    }

    pub fn auto_increment(mut self) -> Self {
        self.auto_increment = true;
        self
    }

    pub fn length(mut self, length: u32) -> Self {
        self.length = Some(length);
        self
    }

    pub fn default_value(mut self, value: EntityValue) -> Self {
        self.default = Some(value);
        self
    }

    pub fn on_insert<F>(mut self, f: F) -> Self
    where
        F: Fn() -> EntityValue + Send + Sync + 'static,
    {
        self.on_insert = Some(Arc::new(f));
        self
    }

    pub fn on_update<F>(mut self, f: F) -> Self
    where
        F: Fn() -> EntityValue + Send + Sync + 'static,
    {
        self.on_update = Some(Arc::new(f));
        self
    }

    pub fn enum_of(mut self, values: &[&str]) -> Self {
        self.db_type = DbType::Enum;
        self.enum_values = values.iter().map(|v| v.to_string()).collect();
        self
    }

    pub fn value_object(mut self, class: impl Into<String>) -> Self {
        self.value_object = Some(class.into());
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelationKind {
    ManyToOne,
    OneToMany,
}

/// A persisted reference between entities. Many-to-one stores the foreign
/// key on the declaring side; one-to-many names the foreign-key property on
/// the other side.
#[derive(Debug, Clone)]
pub struct RelationMeta {
    pub kind: RelationKind,
    pub name: String,
    pub target: String,
    /// FK column on the owning side; defaults to `<property>_id`.
    pub column: String,
    /// For one-to-many: the property on the target entity holding the FK.
    pub fk_property: Option<String>,
    pub nullable: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HookKind {
    BeforeCreate,
    AfterCreate,
    BeforeUpdate,
    AfterUpdate,
}

pub type HookFn = Arc<dyn Fn(&mut EntityInstance) -> Result<()> + Send + Sync>;

#[derive(Clone)]
pub struct HookDef {
    pub kind: HookKind,
    pub name: String,
    pub callback: HookFn,
}

impl fmt::Debug for HookDef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HookDef")
            .field("kind", &self.kind)
            .field("name", &self.name)
            .finish()
    }
}

#[derive(Debug, Clone)]
pub struct IndexDef {
    pub name: String,
    pub properties: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct UniqueDef {
    pub name: String,
    pub properties: Vec<String>,
}

/// The descriptor of an entity's table, columns, relations, indexes and
/// hooks. Built once per entity class and registered for process lifetime.
#[derive(Debug, Clone)]
pub struct EntityMeta {
    pub name: String,
    pub table: String,
    /// `public` by default; dropped at emission time for MySQL.
    pub schema: String,
    pub properties: IndexMap<String, PropertyMeta>,
    pub relations: Vec<RelationMeta>,
    pub indexes: Vec<IndexDef>,
    pub uniques: Vec<UniqueDef>,
    pub hooks: Vec<HookDef>,
    primary_key_property: String,
    primary_key_column: String,
}

impl EntityMeta {
    pub fn builder(name: impl Into<String>) -> EntityMetaBuilder {
        EntityMetaBuilder::new(name)
    }

    /// Cached at registration time; never scanned per query.
    pub fn primary_key_property(&self) -> &str {
        &self.primary_key_property
    }

    pub fn primary_key_column(&self) -> &str {
        &self.primary_key_column
    }

    pub fn property(&self, name: &str) -> Option<&PropertyMeta> {
        self.properties.get(name)
    }

    pub fn relation(&self, name: &str) -> Option<&RelationMeta> {
        self.relations.iter().find(|r| r.name == name)
    }

    pub fn relation_names(&self) -> Vec<String> {
        self.relations.iter().map(|r| r.name.clone()).collect()
    }

    pub fn property_by_column(&self, column: &str) -> Option<&PropertyMeta> {
        self.properties.values().find(|p| p.column == column)
    }

    pub fn relation_by_column(&self, column: &str) -> Option<&RelationMeta> {
        self.relations.iter().find(|r| r.column == column)
    }

    /// Resolves a filter/value key to a column name: property lookup first,
    /// then relation lookup.
    pub fn column_for_key(&self, key: &str) -> Result<String> {
        if let Some(prop) = self.property(key) {
            return Ok(prop.column.clone());
        }
        if let Some(rel) = self.relation(key) {
            return Ok(rel.column.clone());
        }
        Err(Error::PropertyNotFound {
            entity: self.name.clone(),
            property: key.to_string(),
        })
    }

    pub fn hooks_of(&self, kind: HookKind) -> impl Iterator<Item = &HookDef> {
        self.hooks.iter().filter(move |h| h.kind == kind)
    }
}

pub struct EntityMetaBuilder {
    name: String,
    table: Option<String>,
    schema: String,
    properties: IndexMap<String, PropertyMeta>,
    relations: Vec<RelationMeta>,
    indexes: Vec<IndexDef>,
    uniques: Vec<UniqueDef>,
    hooks: Vec<HookDef>,
}

impl EntityMetaBuilder {
    fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            table: None,
            schema: "public".to_string(),
            properties: IndexMap::new(),
            relations: vec![],
            indexes: vec![],
            uniques: vec![],
            hooks: vec![],
        }
    }

    pub fn table(mut self, table: impl Into<String>) -> Self {
        self.table = Some(table.into());
        self
    }

    pub fn schema(mut self, schema: impl Into<String>) -> Self {
        self.schema = schema.into();
        self
    }

    pub fn property(mut self, prop: PropertyMeta) -> Self {
        self.properties.insert(prop.name.clone(), prop);
        self
    }

    pub fn many_to_one(mut self, name: impl Into<String>, target: impl Into<String>) -> Self {
        let name = name.into();
        let column = format!("{}_id", name.to_case(Case::Snake));
        self.relations.push(RelationMeta {
            kind: RelationKind::ManyToOne,
            name,
            target: target.into(),
            column,
            fk_property: None,
            nullable: false,
        });
        self
    }

    pub fn many_to_one_with(mut self, relation: RelationMeta) -> Self {
        self.relations.push(relation);
        self
    }

    /// `fk_property` is the property on the target entity that stores the
    /// foreign key back to this one.
    pub fn one_to_many(
        mut self,
        name: impl Into<String>,
        target: impl Into<String>,
        fk_property: impl Into<String>,
    ) -> Self {
        let name = name.into();
        self.relations.push(RelationMeta {
            kind: RelationKind::OneToMany,
            name,
            target: target.into(),
            column: String::new(),
            fk_property: Some(fk_property.into()),
            nullable: false,
        });
        self
    }

    pub fn index(mut self, name: impl Into<String>, properties: &[&str]) -> Self {
        self.indexes.push(IndexDef {
            name: name.into(),
            properties: properties.iter().map(|p| p.to_string()).collect(),
        });
        self
    }

    pub fn unique(mut self, name: impl Into<String>, properties: &[&str]) -> Self {
        self.uniques.push(UniqueDef {
            name: name.into(),
            properties: properties.iter().map(|p| p.to_string()).collect(),
        });
        self
    }

    pub fn hook<F>(mut self, kind: HookKind, name: impl Into<String>, callback: F) -> Self
    where
        F: Fn(&mut EntityInstance) -> Result<()> + Send + Sync + 'static,
    {
        self.hooks.push(HookDef {
            kind,
            name: name.into(),
            callback: Arc::new(callback),
        });
        self
    }

    pub fn build(self) -> Result<EntityMeta> {
        let table = self
            .table
            .unwrap_or_else(|| self.name.to_case(Case::Snake));

        let mut primary = None;
        let mut seen_columns: HashMap<String, String> = HashMap::new();
        for prop in self.properties.values() {
            if let Some(previous) = seen_columns.insert(prop.column.clone(), prop.name.clone()) {
                return Err(Error::InvalidMetadata {
                    entity: self.name.clone(),
                    message: format!(
                        "properties `{previous}` and `{}` both map to column `{}`",
                        prop.name, prop.column
                    ),
                });
            }
            if prop.primary {
                if primary.is_some() {
                    return Err(Error::InvalidMetadata {
                        entity: self.name.clone(),
                        message: "more than one primary key".to_string(),
                    });
                }
                primary = Some(prop);
            }
        }
        for rel in &self.relations {
            if rel.kind != RelationKind::ManyToOne {
                continue;
            }
            if let Some(previous) = seen_columns.insert(rel.column.clone(), rel.name.clone()) {
                return Err(Error::InvalidMetadata {
                    entity: self.name.clone(),
                    message: format!(
                        "`{previous}` and relation `{}` both map to column `{}`",
                        rel.name, rel.column
                    ),
                });
            }
        }

        let primary = primary.ok_or_else(|| Error::InvalidMetadata {
            entity: self.name.clone(),
            message: "entity has no primary key".to_string(),
        })?;
        let primary_key_property = primary.name.clone();
        let primary_key_column = primary.column.clone();

        Ok(EntityMeta {
            name: self.name,
            table,
            schema: self.schema,
            properties: self.properties,
            relations: self.relations,
            indexes: self.indexes,
            uniques: self.uniques,
            hooks: self.hooks,
            primary_key_property,
            primary_key_column,
        })
    }
}

/// Table/column/relation catalogue keyed by entity name. Mutated only during
/// startup discovery; read-only afterwards.
#[derive(Debug, Default, Clone)]
pub struct Registry {
    entities: HashMap<String, Arc<EntityMeta>>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers an entity. Re-registration overwrites the older entry.
    pub fn register(&mut self, meta: EntityMeta) {
        self.entities.insert(meta.name.clone(), Arc::new(meta));
    }

    pub fn get(&self, entity: &str) -> Result<Arc<EntityMeta>> {
        self.entities
            .get(entity)
            .cloned()
            .ok_or_else(|| Error::EntityNotRegistered(entity.to_string()))
    }

    pub fn contains(&self, entity: &str) -> bool {
        self.entities.contains_key(entity)
    }

    /// Ordered column list with foreign-key descriptors; the input to DDL
    /// emission.
    pub fn snapshot(&self, meta: &EntityMeta) -> Result<SchemaSnapshot> {
        let mut columns = vec![];
        for prop in meta.properties.values() {
            columns.push(ColumnSnapshot {
                name: prop.column.clone(),
                db_type: prop.db_type.clone(),
                nullable: prop.nullable,
                primary: prop.primary,
                unique: prop.unique,
                auto_increment: prop.auto_increment,
                default: prop.default.clone(),
                enum_values: prop.enum_values.clone(),
                references: None,
            });
        }
        for rel in &meta.relations {
            if rel.kind != RelationKind::ManyToOne {
                continue;
            }
            let target = self.get(&rel.target)?;
            let target_pk = target
                .property(target.primary_key_property())
                .expect("primary key cached at registration");
            columns.push(ColumnSnapshot {
                name: rel.column.clone(),
                // The FK adopts the referenced key's type, uuid included.
                db_type: target_pk.db_type.as_reference(),
                nullable: rel.nullable,
                primary: false,
                unique: false,
                auto_increment: false,
                default: None,
                enum_values: vec![],
                references: Some(ForeignKeyRef {
                    table: target.table.clone(),
                    column: target.primary_key_column().to_string(),
                }),
            });
        }
        Ok(SchemaSnapshot {
            table: meta.table.clone(),
            schema: meta.schema.clone(),
            columns,
        })
    }
}

#[derive(Debug, Clone)]
pub struct SchemaSnapshot {
    pub table: String,
    pub schema: String,
    pub columns: Vec<ColumnSnapshot>,
}

#[derive(Debug, Clone)]
pub struct ColumnSnapshot {
    pub name: String,
    pub db_type: DbType,
    pub nullable: bool,
    pub primary: bool,
    pub unique: bool,
    pub auto_increment: bool,
    pub default: Option<EntityValue>,
    pub enum_values: Vec<String>,
    pub references: Option<ForeignKeyRef>,
}

#[derive(Debug, Clone)]
pub struct ForeignKeyRef {
    pub table: String,
    pub column: String,
}

/// Epoch-millisecond timestamp for `on_insert`/`on_update` factories.
pub fn now() -> EntityValue {
    let ms = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .expect("system clock before epoch")
        .as_millis() as i64;
    EntityValue::Date(ms)
}

/// Random v4 uuid for generated primary keys.
pub fn new_uuid() -> EntityValue {
    EntityValue::String(uuid::Uuid::new_v4().to_string())
}
