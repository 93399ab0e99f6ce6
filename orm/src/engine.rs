// SPDX-FileCopyrightText: © 2022 ChiselStrike <info@chiselstrike.com>

use crate::cache::QueryCache;
use crate::context;
use crate::dbconn::{schema_builder_for, DbKind};
use crate::driver::{Driver, Row};
use crate::error::Result;
use crate::hydrate::{attach_children, Hydrator};
use crate::instance::SharedInstance;
use crate::meta::{DbType, EntityMeta, HookKind, Registry, RelationKind};
use crate::process;
use crate::statement::{Statement, StatementKind, SubSelectNode};
use crate::value::EntityValue;

use sea_query::{Alias, ColumnDef, Index, Table};
use std::future::Future;
use std::sync::Arc;

/// Executes statements against the driver and turns rows back into
/// instances: cache probe, dispatch, hydration, identity registration, and
/// cache invalidation on writes all happen here.
pub struct QueryEngine {
    registry: Arc<Registry>,
    driver: Arc<dyn Driver>,
    cache: Arc<QueryCache>,
}

impl QueryEngine {
    pub fn new(registry: Arc<Registry>, driver: Arc<dyn Driver>, cache: Arc<QueryCache>) -> Self {
        Self {
            registry,
            driver,
            cache,
        }
    }

    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    pub fn driver(&self) -> &Arc<dyn Driver> {
        &self.driver
    }

    pub fn db_kind(&self) -> DbKind {
        self.driver.db_kind()
    }

    /// Fetches rows for a read statement, honouring the cache directive.
    async fn fetch(&self, stmt: &Statement) -> Result<Vec<Row>> {
        if let Some(rows) = self.cache.get(stmt) {
            return Ok(rows);
        }
        let executed = self.driver.execute_statement(stmt).await?;
        self.cache.set(stmt, &executed.rows);
        Ok(executed.rows)
    }

    /// Runs a select and hydrates the result, then drains any deferred
    /// secondary-SELECT loads breadth-first down the relation tree.
    pub async fn select(&self, stmt: &Statement) -> Result<Vec<SharedInstance>> {
        let rows = self.fetch(stmt).await?;
        let instances = Hydrator::new(&self.registry, stmt).hydrate(&rows)?;

        let mut pending: Vec<(SubSelectNode, Vec<SharedInstance>)> = stmt
            .sub_selects
            .iter()
            .map(|node| (node.clone(), instances.clone()))
            .collect();
        while let Some((node, parents)) = pending.pop() {
            let children = self.load_sub_select(&node, &parents).await?;
            for nested in &node.statement.sub_selects {
                pending.push((nested.clone(), children.clone()));
            }
            attach_children(&self.registry, &node, &parents, &children)?;
        }

        Ok(instances)
    }

    async fn load_sub_select(
        &self,
        node: &SubSelectNode,
        parents: &[SharedInstance],
    ) -> Result<Vec<SharedInstance>> {
        let origin_meta = self.registry.get(&node.origin_entity)?;
        let mut keys: Vec<EntityValue> = vec![];
        for parent in parents {
            let parent = parent.lock();
            let key = match node.kind {
                RelationKind::OneToMany => parent.primary_key(&origin_meta).cloned(),
                RelationKind::ManyToOne => parent.get(&node.origin_property).cloned(),
            };
            match key {
                Some(EntityValue::Ref(_)) | Some(EntityValue::Null) | None => {}
                Some(key) if !keys.contains(&key) => keys.push(key),
                Some(_) => {}
            }
        }
        if keys.is_empty() {
            return Ok(vec![]);
        }

        let mut child = node.statement.clone();
        let literals: Result<Vec<String>> = keys
            .iter()
            .map(|k| crate::value::sql_literal(k, self.db_kind()))
            .collect();
        let correlation = format!(
            "({}.{} IN ({}))",
            child.alias,
            node.fk_column,
            literals?.join(", ")
        );
        child.where_clause = Some(match child.where_clause.take() {
            Some(existing) => format!("{existing} AND {correlation}"),
            None => correlation,
        });

        let rows = self.fetch(&child).await?;
        Hydrator::new(&self.registry, &child).hydrate(&rows)
    }

    /// Runs a count; the single result row carries a `count` column.
    pub async fn count(&self, stmt: &Statement) -> Result<u64> {
        let rows = self.fetch(stmt).await?;
        let count = rows
            .first()
            .and_then(|row| row.get("count"))
            .and_then(|v| v.as_i64().ok())
            .unwrap_or(0);
        Ok(count as u64)
    }

    fn run_hooks(&self, meta: &EntityMeta, kind: HookKind, instance: &SharedInstance) -> Result<()> {
        for hook in meta.hooks_of(kind) {
            let mut instance = instance.lock();
            (hook.callback)(&mut instance)?;
        }
        Ok(())
    }

    fn invalidate(&self, stmt: &Statement) {
        if self.cache.invalidate_on_write() {
            self.cache.invalidate(stmt.namespace());
        }
    }

    /// The decode shape of `RETURNING *` rows: every column of the table.
    fn returning_shape(&self, meta: &EntityMeta) -> Vec<(String, DbType)> {
        let mut shape: Vec<(String, DbType)> = meta
            .properties
            .values()
            .map(|p| (p.column.clone(), p.db_type.clone()))
            .collect();
        for relation in &meta.relations {
            if relation.kind != RelationKind::ManyToOne {
                continue;
            }
            let db_type = self
                .registry
                .get(&relation.target)
                .ok()
                .and_then(|target| {
                    target
                        .property(target.primary_key_property())
                        .map(|pk| pk.db_type.as_reference())
                })
                .unwrap_or(DbType::Int);
            shape.push((relation.column.clone(), db_type));
        }
        shape
    }

    /// Insert path: beforeCreate → execute → refresh from the returned row
    /// (or a follow-up select on MySQL) → afterCreate → invalidation.
    pub async fn insert(&self, mut stmt: Statement, instance: SharedInstance) -> Result<SharedInstance> {
        let meta = self.registry.get(&stmt.entity)?;
        self.run_hooks(&meta, HookKind::BeforeCreate, &instance)?;

        // Hooks may have touched the instance; the column map is built
        // afterwards.
        let values = instance.lock().values().clone();
        stmt.values = process::process_for_insert(&self.registry, &meta, &values)?;
        stmt.returning = self.returning_shape(&meta);

        let executed = self.driver.execute_statement(&stmt).await?;
        let returned = match executed.rows.into_iter().next() {
            Some(row) => Some(row),
            None => {
                self.fetch_inserted_row(&meta, &stmt, executed.last_insert_id)
                    .await?
            }
        };
        if let Some(row) = returned {
            refresh_from_columns(&meta, &instance, &row);
        }
        {
            let mut instance = instance.lock();
            instance.mark_persisted();
            instance.reset_tracking();
        }

        self.invalidate(&stmt);
        self.run_hooks(&meta, HookKind::AfterCreate, &instance)?;
        Ok(instance)
    }

    /// MySQL emits no RETURNING clause; re-read the row by key.
    async fn fetch_inserted_row(
        &self,
        meta: &EntityMeta,
        stmt: &Statement,
        last_insert_id: Option<i64>,
    ) -> Result<Option<Row>> {
        let pk = match stmt.values.get(meta.primary_key_column()) {
            Some(value) => value.clone(),
            None => match last_insert_id {
                Some(id) => EntityValue::Int64(id),
                None => return Ok(None),
            },
        };
        let mut follow_up = Statement::new(StatementKind::Select, &meta.name);
        follow_up.table = meta.table.clone();
        follow_up.schema = meta.schema.clone();
        follow_up.alias = format!("{}1", meta.table.chars().next().unwrap_or('t'));
        let alias = follow_up.alias.clone();
        for (column, db_type) in self.returning_shape(meta) {
            follow_up.columns.push(crate::statement::ProjectedColumn {
                alias: alias.clone(),
                column: column.clone(),
                property: column,
                entity: meta.name.clone(),
                db_type,
                nullable: true,
            });
        }
        follow_up.where_clause = Some(format!(
            "(({alias}.{} = {}))",
            meta.primary_key_column(),
            crate::value::sql_literal(&pk, self.db_kind())?
        ));
        let executed = self.driver.execute_statement(&follow_up).await?;
        // Result keys are alias-prefixed; strip back to bare columns.
        Ok(executed.rows.into_iter().next().map(|row| {
            row.into_iter()
                .map(|(key, value)| {
                    let bare = key
                        .strip_prefix(&format!("{alias}_"))
                        .map(|s| s.to_string())
                        .unwrap_or(key);
                    (bare, value)
                })
                .collect()
        }))
    }

    /// Update path: beforeUpdate → execute → afterUpdate → invalidation.
    /// `on_update` generators are merged into the column map here.
    pub async fn update(
        &self,
        mut stmt: Statement,
        instance: Option<SharedInstance>,
    ) -> Result<u64> {
        let meta = self.registry.get(&stmt.entity)?;
        if let Some(instance) = &instance {
            self.run_hooks(&meta, HookKind::BeforeUpdate, instance)?;
        }

        for prop in meta.properties.values() {
            if let Some(generate) = &prop.on_update {
                if !stmt.values.contains_key(&prop.column) {
                    stmt.values.insert(prop.column.clone(), generate());
                }
            }
        }

        let executed = self.driver.execute_statement(&stmt).await?;
        self.invalidate(&stmt);

        if let Some(instance) = &instance {
            {
                let mut locked = instance.lock();
                locked.reset_tracking();
            }
            self.run_hooks(&meta, HookKind::AfterUpdate, instance)?;
        }
        Ok(executed.rows_affected)
    }

    pub async fn delete(&self, stmt: Statement) -> Result<u64> {
        let executed = self.driver.execute_statement(&stmt).await?;
        self.invalidate(&stmt);
        Ok(executed.rows_affected)
    }

    /// Scopes `fut` in a driver transaction. Re-entry inside an existing
    /// scope reuses the outer handle; commit and rollback happen only at
    /// the outermost level.
    pub async fn transaction<T, F>(&self, fut: F) -> Result<T>
    where
        F: Future<Output = Result<T>>,
    {
        if context::current_transaction().is_some() {
            return fut.await;
        }
        let handle = self.driver.begin().await?;
        let result = context::with_transaction(handle.clone(), fut).await;
        match result {
            Ok(value) => {
                self.driver.commit(handle).await?;
                Ok(value)
            }
            Err(err) => {
                if let Err(rollback_err) = self.driver.rollback(handle).await {
                    warn!("rollback failed: {rollback_err}");
                }
                Err(err)
            }
        }
    }

    // ---- DDL from schema snapshots ----

    /// Creates the entity's backing table (and its declared indexes) from
    /// the registry snapshot.
    pub async fn create_table(&self, entity: &str) -> Result<()> {
        let meta = self.registry.get(entity)?;
        let snapshot = self.registry.snapshot(&meta)?;
        let kind = self.db_kind();

        let mut create = Table::create();
        if kind.supports_schema() {
            create.table((Alias::new(&snapshot.schema), Alias::new(&snapshot.table)));
        } else {
            create.table(Alias::new(&snapshot.table));
        }
        create.if_not_exists();

        for column in &snapshot.columns {
            let mut def = ColumnDef::new(Alias::new(&column.name));
            match &column.db_type {
                DbType::Text => def.text(),
                DbType::Varchar => def.string_len(255),
                DbType::Int => def.integer(),
                DbType::BigInt => def.big_integer(),
                DbType::Serial => def.integer().auto_increment(),
                DbType::Float => def.float(),
                DbType::Double => def.double(),
                DbType::Boolean => def.boolean(),
                DbType::Date => def.date(),
                DbType::Timestamp => def.timestamp(),
                DbType::Json => def.json(),
                DbType::Uuid => def.uuid(),
                DbType::Enum => def.text(),
            };
            if column.primary {
                def.primary_key();
            }
            if column.auto_increment && column.db_type != DbType::Serial {
                def.auto_increment();
            }
            if column.unique {
                def.unique_key();
            }
            if !column.nullable && !column.primary {
                def.not_null();
            }
            if let Some(default) = &column.default {
                match default {
                    EntityValue::String(s) => {
                        def.default(s.clone());
                    }
                    EntityValue::Int64(i) => {
                        def.default(*i);
                    }
                    EntityValue::Float64(f) => {
                        def.default(*f);
                    }
                    EntityValue::Boolean(b) => {
                        def.default(*b);
                    }
                    _ => {}
                }
            }
            create.col(&mut def);
        }

        let sql = create.build_any(schema_builder_for(kind));
        self.driver.execute_sql(&sql).await?;

        for unique in &meta.uniques {
            let mut index = Index::create();
            index
                .name(&unique.name)
                .table(Alias::new(&snapshot.table))
                .unique();
            for property in &unique.properties {
                index.col(Alias::new(&meta.column_for_key(property)?));
            }
            let sql = index.build_any(schema_builder_for(kind));
            self.driver.execute_sql(&sql).await?;
        }
        for index_def in &meta.indexes {
            let mut index = Index::create();
            index.name(&index_def.name).table(Alias::new(&snapshot.table));
            for property in &index_def.properties {
                index.col(Alias::new(&meta.column_for_key(property)?));
            }
            let sql = index.build_any(schema_builder_for(kind));
            self.driver.execute_sql(&sql).await?;
        }
        Ok(())
    }

    pub async fn drop_table(&self, entity: &str) -> Result<()> {
        let meta = self.registry.get(entity)?;
        let drop = Table::drop()
            .table(Alias::new(&meta.table))
            .if_exists()
            .to_owned();
        let sql = drop.build_any(schema_builder_for(self.db_kind()));
        self.driver.execute_sql(&sql).await?;
        Ok(())
    }
}

/// Writes a returned row (bare column keys) back onto the instance without
/// disturbing change tracking.
fn refresh_from_columns(meta: &EntityMeta, instance: &SharedInstance, row: &Row) {
    let mut instance = instance.lock();
    instance.begin_hydration();
    for (column, value) in row {
        if let Some(prop) = meta.property_by_column(column) {
            instance.set(prop.name.clone(), value.clone());
        } else if let Some(relation) = meta.relation_by_column(column) {
            if relation.kind == RelationKind::ManyToOne {
                // Keep a loaded reference if one is already assigned.
                let keep = matches!(instance.get(&relation.name), Some(EntityValue::Ref(_)));
                if !keep {
                    instance.set(relation.name.clone(), value.clone());
                }
            }
        }
    }
    instance.end_hydration();
}
