// SPDX-FileCopyrightText: © 2022 ChiselStrike <info@chiselstrike.com>

use crate::dbconn::DbKind;
use crate::error::{Error, Result};
use crate::filter::{Condition, Filter, FilterNode, FilterOp};
use crate::meta::{EntityMeta, Registry, RelationKind, RelationMeta};
use crate::statement::{
    JoinNode, LoadStrategy, ProjectedColumn, Statement, StatementKind, SubSelectNode,
};
use crate::value::{quote_like_pattern, sql_literal, EntityValue};

use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SortOrder {
    Asc,
    Desc,
}

impl SortOrder {
    fn as_sql(self) -> &'static str {
        match self {
            SortOrder::Asc => "ASC",
            SortOrder::Desc => "DESC",
        }
    }
}

/// A relation load deferred to a secondary batched SELECT; materialised
/// into a [SubSelectNode] when the plan is finished.
struct PendingSubSelect {
    relation: String,
    filter: Filter,
    loads: Vec<String>,
}

/// Builds a [Statement] from a declarative description: resolves filters
/// into WHERE fragments, relation references into joins or subqueries, and
/// assembles the projection list.
///
/// Aliases are the first letter of the aliased table plus a counter scoped
/// to this plan, so the same description always produces the same SQL.
pub struct QueryPlan<'r> {
    registry: &'r Registry,
    db: DbKind,
    meta: Arc<EntityMeta>,
    stmt: Statement,
    counter: usize,
    pending_sub_selects: Vec<PendingSubSelect>,
}

impl<'r> QueryPlan<'r> {
    pub fn new(
        registry: &'r Registry,
        db: DbKind,
        kind: StatementKind,
        entity: &str,
    ) -> Result<Self> {
        let meta = registry.get(entity)?;
        let mut plan = Self {
            registry,
            db,
            meta: meta.clone(),
            stmt: Statement::new(kind, entity),
            counter: 0,
            pending_sub_selects: vec![],
        };
        plan.stmt.table = meta.table.clone();
        plan.stmt.schema = meta.schema.clone();
        plan.stmt.alias = plan.next_alias(&meta.table);
        Ok(plan)
    }

    pub fn meta(&self) -> &Arc<EntityMeta> {
        &self.meta
    }

    pub fn statement_mut(&mut self) -> &mut Statement {
        &mut self.stmt
    }

    pub fn set_strategy(&mut self, strategy: LoadStrategy) {
        self.stmt.strategy = strategy;
    }

    fn next_alias(&mut self, table: &str) -> String {
        self.counter += 1;
        let letter = table.chars().next().unwrap_or('t');
        format!("{letter}{}", self.counter)
    }

    fn quote(&self) -> char {
        self.db.identifier_quote()
    }

    /// Conditions on select/count statements address columns through the
    /// statement alias; writes use bare columns.
    fn qualifies(&self) -> bool {
        matches!(self.stmt.kind, StatementKind::Select | StatementKind::Count)
    }

    // ---- condition building ----

    /// Resolves `filter` into the statement's WHERE clause. An empty filter
    /// leaves the statement without one.
    pub fn apply_filter(&mut self, filter: &Filter) -> Result<()> {
        let meta = self.meta.clone();
        let alias = self.stmt.alias.clone();
        let clause = self.build_filter(&meta, &alias, filter)?;
        if clause.is_empty() {
            return Ok(());
        }
        let wrapped = format!("({clause})");
        self.stmt.where_clause = Some(match self.stmt.where_clause.take() {
            Some(existing) => format!("{existing} AND {wrapped}"),
            None => wrapped,
        });
        Ok(())
    }

    fn build_filter(
        &mut self,
        meta: &Arc<EntityMeta>,
        alias: &str,
        filter: &Filter,
    ) -> Result<String> {
        let mut fragments = vec![];
        for node in &filter.nodes {
            let fragment = match node {
                FilterNode::Field { name, condition } => {
                    self.build_field(meta, alias, name, condition)?
                }
                FilterNode::And(filters) => self.build_group(meta, alias, filters, "AND")?,
                FilterNode::Or(filters) => self.build_group(meta, alias, filters, "OR")?,
                FilterNode::Exists(entries) => self.build_exists(meta, alias, entries, false)?,
                FilterNode::NotExists(entries) => self.build_exists(meta, alias, entries, true)?,
            };
            if !fragment.is_empty() {
                fragments.push(fragment);
            }
        }
        Ok(fragments.join(" AND "))
    }

    fn build_group(
        &mut self,
        meta: &Arc<EntityMeta>,
        alias: &str,
        filters: &[Filter],
        op: &str,
    ) -> Result<String> {
        let mut parts = vec![];
        for filter in filters {
            let inner = self.build_filter(meta, alias, filter)?;
            if !inner.is_empty() {
                parts.push(format!("({inner})"));
            }
        }
        if parts.is_empty() {
            return Ok(String::new());
        }
        Ok(format!("({})", parts.join(&format!(" {op} "))))
    }

    fn build_field(
        &mut self,
        meta: &Arc<EntityMeta>,
        alias: &str,
        name: &str,
        condition: &Condition,
    ) -> Result<String> {
        if let Some(relation) = meta.relation(name).cloned() {
            return self.build_relation_condition(meta, alias, &relation, condition);
        }

        let prop = meta
            .property(name)
            .ok_or_else(|| Error::PropertyNotFound {
                entity: meta.name.clone(),
                property: name.to_string(),
            })?;
        if matches!(condition, Condition::Related(_)) {
            // A nested filter only makes sense under a relation key.
            return Err(Error::InvalidRelationUsage {
                entity: meta.name.clone(),
                property: name.to_string(),
                valid: meta.relation_names(),
            });
        }
        let column = prop.column.clone();
        self.build_column_condition(alias, &column, condition)
    }

    fn build_relation_condition(
        &mut self,
        meta: &Arc<EntityMeta>,
        alias: &str,
        relation: &RelationMeta,
        condition: &Condition,
    ) -> Result<String> {
        match condition {
            // Nested filter: the relation becomes a join (or sub-select)
            // and the inner filter travels with it.
            Condition::Related(inner) => {
                match self.stmt.strategy {
                    LoadStrategy::Joined => {
                        let target = self.registry.get(&relation.target)?;
                        let join_alias = self.ensure_join(meta, alias, relation)?;
                        let clause = self.build_filter(&target, &join_alias, inner)?;
                        if !clause.is_empty() {
                            let join = self
                                .stmt
                                .joins
                                .iter_mut()
                                .find(|j| j.origin_alias == alias && j.property == relation.name)
                                .expect("join registered above");
                            join.where_clause = Some(match join.where_clause.take() {
                                Some(existing) => format!("{existing} AND ({clause})"),
                                None => format!("({clause})"),
                            });
                        }
                    }
                    LoadStrategy::Select => {
                        self.merge_pending_sub_select(&relation.name, Some(inner), None);
                    }
                }
                Ok(String::new())
            }
            // Scalar conditions address the FK column of the owning side.
            Condition::Value(_) | Condition::List(_) | Condition::Ops(_) => {
                if relation.kind != RelationKind::ManyToOne {
                    return Err(Error::InvalidRelationUsage {
                        entity: meta.name.clone(),
                        property: relation.name.clone(),
                        valid: meta.relation_names(),
                    });
                }
                let column = relation.column.clone();
                self.build_column_condition(alias, &column, condition)
            }
        }
    }

    fn build_column_condition(
        &mut self,
        alias: &str,
        column: &str,
        condition: &Condition,
    ) -> Result<String> {
        let lhs = if self.qualifies() {
            format!("{alias}.{column}")
        } else {
            column.to_string()
        };
        let fragment = match condition {
            Condition::Value(value) => self.comparison(&lhs, "=", value)?,
            Condition::List(items) => self.in_list(&lhs, items, false)?,
            Condition::Ops(ops) => {
                if ops.is_empty() {
                    return Ok(String::new());
                }
                let mut parts = vec![];
                for op in ops {
                    parts.push(self.operator_fragment(&lhs, op)?);
                }
                parts.join(" AND ")
            }
            Condition::Related(_) => unreachable!("nested filters resolve before this point"),
        };
        Ok(format!("({fragment})"))
    }

    fn operator_fragment(&self, lhs: &str, op: &FilterOp) -> Result<String> {
        let fragment = match op {
            FilterOp::Eq(value) => self.comparison(lhs, "=", value)?,
            FilterOp::Ne(value) => self.comparison(lhs, "!=", value)?,
            FilterOp::In(items) => self.in_list(lhs, items, false)?,
            FilterOp::Nin(items) => self.in_list(lhs, items, true)?,
            FilterOp::Like(pattern) => {
                format!("{lhs} LIKE {}", quote_like_pattern(pattern)?)
            }
            FilterOp::Gt(value) => self.comparison(lhs, ">", value)?,
            FilterOp::Gte(value) => self.comparison(lhs, ">=", value)?,
            FilterOp::Lt(value) => self.comparison(lhs, "<", value)?,
            FilterOp::Lte(value) => self.comparison(lhs, "<=", value)?,
        };
        Ok(fragment)
    }

    fn comparison(&self, lhs: &str, op: &str, value: &EntityValue) -> Result<String> {
        let value = self.resolve_value(value)?;
        if value.is_null() {
            return Ok(match op {
                "=" => format!("{lhs} IS NULL"),
                "!=" => format!("{lhs} IS NOT NULL"),
                other => format!("{lhs} {other} NULL"),
            });
        }
        Ok(format!("{lhs} {op} {}", sql_literal(&value, self.db)?))
    }

    fn in_list(&self, lhs: &str, items: &[EntityValue], negated: bool) -> Result<String> {
        let literals: Result<Vec<String>> = items
            .iter()
            .map(|item| {
                let item = self.resolve_value(item)?;
                sql_literal(&item, self.db)
            })
            .collect();
        let op = if negated { "NOT IN" } else { "IN" };
        Ok(format!("{lhs} {op} ({})", literals?.join(", ")))
    }

    /// Entity references compare by primary key; value objects by their
    /// wrapped value.
    fn resolve_value(&self, value: &EntityValue) -> Result<EntityValue> {
        match value {
            EntityValue::Ref(instance) => {
                let instance = instance.lock();
                let target = self.registry.get(instance.entity())?;
                instance
                    .primary_key(&target)
                    .cloned()
                    .ok_or_else(|| Error::UnsupportedValue(EntityValue::Null))
            }
            EntityValue::ValueObject(vo) => Ok(vo.value().clone()),
            other => Ok(other.clone()),
        }
    }

    // ---- joins ----

    /// Registers a LEFT JOIN for `relation` off `origin_alias`, reusing an
    /// existing node for the same origin and property.
    fn ensure_join(
        &mut self,
        origin: &Arc<EntityMeta>,
        origin_alias: &str,
        relation: &RelationMeta,
    ) -> Result<String> {
        if let Some(join) = self
            .stmt
            .joins
            .iter()
            .find(|j| j.origin_alias == origin_alias && j.property == relation.name)
        {
            return Ok(join.alias.clone());
        }

        let target = self.registry.get(&relation.target)?;
        let alias = self.next_alias(&target.table);
        let q = self.quote();
        let on = match relation.kind {
            RelationKind::ManyToOne => format!(
                "{origin_alias}.{q}{}{q} = {alias}.{q}{}{q}",
                relation.column,
                target.primary_key_column()
            ),
            RelationKind::OneToMany => {
                let fk_column = self.one_to_many_fk_column(relation, &target)?;
                format!(
                    "{alias}.{q}{fk_column}{q} = {origin_alias}.{q}{}{q}",
                    origin.primary_key_column()
                )
            }
        };
        self.stmt.joins.push(JoinNode {
            origin_alias: origin_alias.to_string(),
            origin_table: origin.table.clone(),
            origin_entity: origin.name.clone(),
            alias: alias.clone(),
            table: target.table.clone(),
            schema: target.schema.clone(),
            entity: target.name.clone(),
            property: relation.name.clone(),
            on,
            where_clause: None,
            kind: relation.kind,
        });
        Ok(alias)
    }

    fn one_to_many_fk_column(
        &self,
        relation: &RelationMeta,
        target: &Arc<EntityMeta>,
    ) -> Result<String> {
        let fk_property = relation.fk_property.as_deref().ok_or_else(|| {
            Error::InvalidMetadata {
                entity: relation.target.clone(),
                message: format!(
                    "one-to-many relation `{}` declares no foreign-key property",
                    relation.name
                ),
            }
        })?;
        target.column_for_key(fk_property)
    }

    /// Walks a dotted relation path (`"a.b.c"`), creating or reusing a node
    /// per segment.
    pub fn load(&mut self, path: &str) -> Result<()> {
        match self.stmt.strategy {
            LoadStrategy::Joined => {
                let mut meta = self.meta.clone();
                let mut alias = self.stmt.alias.clone();
                for segment in path.split('.') {
                    let relation = meta
                        .relation(segment)
                        .cloned()
                        .ok_or_else(|| Error::PropertyNotFound {
                            entity: meta.name.clone(),
                            property: segment.to_string(),
                        })?;
                    alias = self.ensure_join(&meta, &alias, &relation)?;
                    meta = self.registry.get(&relation.target)?;
                }
            }
            LoadStrategy::Select => {
                let (head, rest) = match path.split_once('.') {
                    Some((head, rest)) => (head, Some(rest)),
                    None => (path, None),
                };
                self.meta
                    .relation(head)
                    .ok_or_else(|| Error::PropertyNotFound {
                        entity: self.meta.name.clone(),
                        property: head.to_string(),
                    })?;
                self.merge_pending_sub_select(head, None, rest);
            }
        }
        Ok(())
    }

    fn merge_pending_sub_select(
        &mut self,
        relation: &str,
        filter: Option<&Filter>,
        load: Option<&str>,
    ) {
        let idx = match self
            .pending_sub_selects
            .iter()
            .position(|p| p.relation == relation)
        {
            Some(idx) => idx,
            None => {
                self.pending_sub_selects.push(PendingSubSelect {
                    relation: relation.to_string(),
                    filter: Filter::new(),
                    loads: vec![],
                });
                self.pending_sub_selects.len() - 1
            }
        };
        let pending = &mut self.pending_sub_selects[idx];
        if let Some(filter) = filter {
            pending.filter.nodes.extend(filter.nodes.iter().cloned());
        }
        if let Some(load) = load {
            pending.loads.push(load.to_string());
        }
    }

    // ---- EXISTS subqueries ----

    fn build_exists(
        &mut self,
        meta: &Arc<EntityMeta>,
        alias: &str,
        entries: &[(String, Filter)],
        negated: bool,
    ) -> Result<String> {
        let mut fragments = vec![];
        for (relation_name, inner) in entries {
            let relation = meta.relation(relation_name).cloned().ok_or_else(|| {
                Error::InvalidRelationUsage {
                    entity: meta.name.clone(),
                    property: relation_name.clone(),
                    valid: meta.relation_names(),
                }
            })?;
            let target = self.registry.get(&relation.target)?;
            let sq_alias = self.next_alias(&target.table);

            let correlation = match relation.kind {
                RelationKind::OneToMany => {
                    let fk_column = self.one_to_many_fk_column(&relation, &target)?;
                    format!(
                        "{sq_alias}.{fk_column} = {alias}.{}",
                        meta.primary_key_column()
                    )
                }
                RelationKind::ManyToOne => format!(
                    "{alias}.{} = {sq_alias}.{}",
                    relation.column,
                    target.primary_key_column()
                ),
            };

            let q = self.quote();
            let table_ref = if self.db.supports_schema() {
                format!("{q}{}{q}.{q}{}{q}", target.schema, target.table)
            } else {
                format!("{q}{}{q}", target.table)
            };

            let inner_clause = self.build_filter(&target, &sq_alias, inner)?;
            let body = if inner_clause.is_empty() {
                format!("SELECT 1 FROM {table_ref} {sq_alias} WHERE {correlation}")
            } else {
                format!(
                    "SELECT 1 FROM {table_ref} {sq_alias} WHERE {correlation} AND ({inner_clause})"
                )
            };
            let keyword = if negated { "NOT EXISTS" } else { "EXISTS" };
            fragments.push(format!("{keyword} ({body})"));
        }
        Ok(fragments.join(" AND "))
    }

    // ---- projection ----

    /// Emits the projection list: every property (and owning-side FK) of
    /// every entity participating in the statement, or the user-supplied
    /// field list with dotted paths resolved through the join map. Primary
    /// keys of involved aliases are always projected; hydration needs them.
    pub fn project(&mut self, fields: Option<&[String]>) -> Result<()> {
        match fields {
            None => {
                let root = self.meta.clone();
                let root_alias = self.stmt.alias.clone();
                self.project_entity(&root, &root_alias);
                for join in self.stmt.joins.clone() {
                    let target = self.registry.get(&join.entity)?;
                    self.project_entity(&target, &join.alias);
                }
            }
            Some(fields) => {
                for field in fields {
                    let column = self.projected_column_for_path(field)?;
                    self.stmt.columns.push(column);
                }
                let mut pk_aliases: Vec<(String, String)> = vec![(
                    self.stmt.alias.clone(),
                    self.meta.name.clone(),
                )];
                for join in &self.stmt.joins {
                    pk_aliases.push((join.alias.clone(), join.entity.clone()));
                }
                for (alias, entity) in pk_aliases {
                    let meta = self.registry.get(&entity)?;
                    let pk = meta
                        .property(meta.primary_key_property())
                        .expect("primary key cached at registration");
                    let already = self
                        .stmt
                        .columns
                        .iter()
                        .any(|c| c.alias == alias && c.column == pk.column);
                    if !already {
                        self.stmt.columns.push(ProjectedColumn {
                            alias,
                            column: pk.column.clone(),
                            property: pk.name.clone(),
                            entity: meta.name.clone(),
                            db_type: pk.db_type.clone(),
                            nullable: pk.nullable,
                        });
                    }
                }
            }
        }
        Ok(())
    }

    fn project_entity(&mut self, meta: &Arc<EntityMeta>, alias: &str) {
        for prop in meta.properties.values() {
            self.stmt.columns.push(ProjectedColumn {
                alias: alias.to_string(),
                column: prop.column.clone(),
                property: prop.name.clone(),
                entity: meta.name.clone(),
                db_type: prop.db_type.clone(),
                nullable: prop.nullable,
            });
        }
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
                .unwrap_or(crate::meta::DbType::Int);
            self.stmt.columns.push(ProjectedColumn {
                alias: alias.to_string(),
                column: relation.column.clone(),
                property: relation.name.clone(),
                entity: meta.name.clone(),
                db_type,
                nullable: relation.nullable,
            });
        }
    }

    fn projected_column_for_path(&self, path: &str) -> Result<ProjectedColumn> {
        let (meta, alias, property) = self.walk_path(path)?;
        if let Some(prop) = meta.property(&property) {
            return Ok(ProjectedColumn {
                alias,
                column: prop.column.clone(),
                property: prop.name.clone(),
                entity: meta.name.clone(),
                db_type: prop.db_type.clone(),
                nullable: prop.nullable,
            });
        }
        if let Some(relation) = meta.relation(&property) {
            if relation.kind == RelationKind::ManyToOne {
                let target = self.registry.get(&relation.target)?;
                let pk = target
                    .property(target.primary_key_property())
                    .expect("primary key cached at registration");
                return Ok(ProjectedColumn {
                    alias,
                    column: relation.column.clone(),
                    property: relation.name.clone(),
                    entity: meta.name.clone(),
                    db_type: pk.db_type.as_reference(),
                    nullable: relation.nullable,
                });
            }
        }
        Err(Error::PropertyNotFound {
            entity: meta.name.clone(),
            property,
        })
    }

    /// Resolves a dotted path against the join map; returns the owning
    /// meta, its alias, and the final segment.
    fn walk_path(&self, path: &str) -> Result<(Arc<EntityMeta>, String, String)> {
        let mut segments: Vec<&str> = path.split('.').collect();
        let last = segments.pop().expect("split always yields one segment");

        let mut meta = self.meta.clone();
        let mut alias = self.stmt.alias.clone();
        for segment in segments {
            let join = self
                .stmt
                .joins
                .iter()
                .find(|j| j.origin_alias == alias && j.property == segment)
                .ok_or_else(|| Error::PropertyNotFound {
                    entity: meta.name.clone(),
                    property: segment.to_string(),
                })?;
            alias = join.alias.clone();
            meta = self.registry.get(&join.entity)?;
        }
        Ok((meta, alias, last.to_string()))
    }

    /// Resolves a dotted path to `"alias"."column"`; with `only_alias`
    /// false the `as "alias_column"` rename is appended.
    pub fn discover_alias(&self, path: &str, only_alias: bool) -> Result<String> {
        let (meta, alias, property) = self.walk_path(path)?;
        let column = meta.column_for_key(&property)?;
        let q = self.quote();
        if only_alias {
            Ok(format!("{q}{alias}{q}.{q}{column}{q}"))
        } else {
            Ok(format!(
                "{q}{alias}{q}.{q}{column}{q} as {q}{alias}_{column}{q}"
            ))
        }
    }

    // ---- ordering ----

    pub fn order_by(&mut self, keys: &[(String, SortOrder)]) -> Result<()> {
        for (path, order) in keys {
            let (meta, alias, property) = self.walk_path(path)?;
            let column = meta.column_for_key(&property)?;
            self.stmt
                .order_by
                .push(format!("{alias}.{column} {}", order.as_sql()));
        }
        Ok(())
    }

    // ---- finishing ----

    /// Finishes the plan: projects missing columns and materialises
    /// deferred sub-selects into child statements.
    pub fn into_statement(mut self) -> Result<Statement> {
        if matches!(self.stmt.kind, StatementKind::Select) && self.stmt.columns.is_empty() {
            self.project(None)?;
        }

        let pending = std::mem::take(&mut self.pending_sub_selects);
        for p in pending {
            let relation = self
                .meta
                .relation(&p.relation)
                .cloned()
                .expect("pending sub-selects are created from resolved relations");
            let target = self.registry.get(&relation.target)?;

            let mut child = QueryPlan::new(
                self.registry,
                self.db,
                StatementKind::Select,
                &relation.target,
            )?;
            child.set_strategy(LoadStrategy::Select);
            for load in &p.loads {
                child.load(load)?;
            }
            if !p.filter.is_empty() {
                child.apply_filter(&p.filter)?;
            }

            let (fk_property, fk_column) = match relation.kind {
                RelationKind::OneToMany => {
                    let fk_column = self.one_to_many_fk_column(&relation, &target)?;
                    let fk_property = relation
                        .fk_property
                        .clone()
                        .expect("checked by one_to_many_fk_column");
                    (fk_property, fk_column)
                }
                RelationKind::ManyToOne => (
                    target.primary_key_property().to_string(),
                    target.primary_key_column().to_string(),
                ),
            };

            self.stmt.sub_selects.push(SubSelectNode {
                statement: child.into_statement()?,
                origin_alias: self.stmt.alias.clone(),
                origin_property: relation.name.clone(),
                origin_entity: self.meta.name.clone(),
                fk_property,
                fk_column,
                kind: relation.kind,
            });
        }

        Ok(self.stmt)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::meta::{DbType, PropertyMeta};
    use serde_json::json;

    fn registry() -> Registry {
        let mut registry = Registry::new();
        registry.register(
            EntityMeta::builder("User")
                .property(
                    PropertyMeta::new("id", DbType::Serial)
                        .primary()
                        .auto_increment(),
                )
                .property(PropertyMeta::new("email", DbType::Text))
                .property(PropertyMeta::new("name", DbType::Text).nullable())
                .one_to_many("addresses", "Address", "user")
                .one_to_many("posts", "Post", "user")
                .build()
                .unwrap(),
        );
        registry.register(
            EntityMeta::builder("Address")
                .property(
                    PropertyMeta::new("id", DbType::Serial)
                        .primary()
                        .auto_increment(),
                )
                .property(PropertyMeta::new("city", DbType::Text))
                .many_to_one("user", "User")
                .build()
                .unwrap(),
        );
        registry.register(
            EntityMeta::builder("Post")
                .property(
                    PropertyMeta::new("id", DbType::Serial)
                        .primary()
                        .auto_increment(),
                )
                .property(PropertyMeta::new("title", DbType::Text))
                .many_to_one("user", "User")
                .build()
                .unwrap(),
        );
        registry
    }

    fn plan<'r>(registry: &'r Registry, entity: &str) -> QueryPlan<'r> {
        QueryPlan::new(registry, DbKind::Postgres, StatementKind::Select, entity).unwrap()
    }

    #[test]
    fn simple_select_matches_the_expected_shape() {
        let registry = registry();
        let mut plan = plan(&registry, "User");
        plan.apply_filter(&Filter::from_json(&json!({"email": "a@b"})).unwrap())
            .unwrap();
        plan.project(Some(&["id".to_string(), "email".to_string()]))
            .unwrap();
        let stmt = plan.into_statement().unwrap();

        assert_eq!(
            stmt.to_sql(DbKind::Postgres).unwrap(),
            "SELECT \"u1\".\"id\" as \"u1_id\", \"u1\".\"email\" as \"u1_email\" \
             FROM \"public\".\"user\" u1 WHERE ((u1.email = 'a@b'))"
        );
    }

    #[test]
    fn operator_bags_emit_in_declaration_order() {
        let registry = registry();
        let mut plan = plan(&registry, "User");
        plan.apply_filter(
            &Filter::from_json(&json!({"id": {"$gte": 2, "$lt": 10}})).unwrap(),
        )
        .unwrap();
        let stmt = plan.into_statement().unwrap();
        assert_eq!(
            stmt.where_clause.as_deref(),
            Some("((u1.id >= 2 AND u1.id < 10))")
        );
    }

    #[test]
    fn null_values_use_is_null() {
        let registry = registry();
        let mut plan = plan(&registry, "User");
        plan.apply_filter(
            &Filter::from_json(&json!({"name": null, "email": {"$ne": null}})).unwrap(),
        )
        .unwrap();
        let stmt = plan.into_statement().unwrap();
        assert_eq!(
            stmt.where_clause.as_deref(),
            Some("((u1.name IS NULL) AND (u1.email IS NOT NULL))")
        );
    }

    #[test]
    fn bare_arrays_emit_in_lists() {
        let registry = registry();
        let mut plan = plan(&registry, "User");
        plan.apply_filter(&Filter::from_json(&json!({"id": [1, 2, 3]})).unwrap())
            .unwrap();
        let stmt = plan.into_statement().unwrap();
        assert_eq!(
            stmt.where_clause.as_deref(),
            Some("((u1.id IN (1, 2, 3)))")
        );
    }

    #[test]
    fn or_groups_parenthesise() {
        let registry = registry();
        let mut plan = plan(&registry, "User");
        plan.apply_filter(
            &Filter::from_json(&json!({
                "$or": [{"email": "a@b"}, {"email": "c@d"}],
            }))
            .unwrap(),
        )
        .unwrap();
        let stmt = plan.into_statement().unwrap();
        assert_eq!(
            stmt.where_clause.as_deref(),
            Some("((((u1.email = 'a@b')) OR ((u1.email = 'c@d'))))")
        );
    }

    #[test]
    fn relation_filters_travel_with_the_join() {
        let registry = registry();
        let mut plan = plan(&registry, "User");
        plan.apply_filter(
            &Filter::from_json(&json!({"addresses": {"city": "Oslo"}})).unwrap(),
        )
        .unwrap();
        let stmt = plan.into_statement().unwrap();

        assert!(stmt.where_clause.is_none());
        assert_eq!(stmt.joins.len(), 1);
        let join = &stmt.joins[0];
        assert_eq!(join.alias, "a2");
        assert_eq!(join.on, "a2.\"user_id\" = u1.\"id\"");
        assert_eq!(join.where_clause.as_deref(), Some("((a2.city = 'Oslo'))"));

        let sql = stmt.to_sql(DbKind::Postgres).unwrap();
        assert!(sql.contains(
            "LEFT JOIN \"public\".\"address\" a2 ON a2.\"user_id\" = u1.\"id\" AND ((a2.city = 'Oslo'))"
        ));
    }

    #[test]
    fn dotted_paths_reuse_join_nodes() {
        let registry = registry();
        let mut plan = plan(&registry, "Address");
        plan.load("user").unwrap();
        plan.load("user.addresses").unwrap();
        let stmt = plan.into_statement().unwrap();

        assert_eq!(stmt.joins.len(), 2);
        assert_eq!(stmt.joins[0].property, "user");
        assert_eq!(stmt.joins[0].alias, "u2");
        assert_eq!(stmt.joins[1].property, "addresses");
        assert_eq!(stmt.joins[1].origin_alias, "u2");
        assert_eq!(stmt.joins[1].alias, "a3");
    }

    #[test]
    fn exists_emits_a_correlated_subquery() {
        let registry = registry();
        let mut plan = plan(&registry, "User");
        plan.apply_filter(&Filter::from_json(&json!({"posts": {"$exists": {}}})).unwrap())
            .unwrap();
        let stmt = plan.into_statement().unwrap();
        assert_eq!(
            stmt.where_clause.as_deref(),
            Some(
                "(EXISTS (SELECT 1 FROM \"public\".\"post\" p2 WHERE p2.user_id = u1.id))"
            )
        );
    }

    #[test]
    fn nexists_negates_and_inner_filters_recurse() {
        let registry = registry();
        let mut plan = plan(&registry, "User");
        plan.apply_filter(
            &Filter::from_json(&json!({"$nexists": {"posts": {"title": "x"}}})).unwrap(),
        )
        .unwrap();
        let stmt = plan.into_statement().unwrap();
        assert_eq!(
            stmt.where_clause.as_deref(),
            Some(
                "(NOT EXISTS (SELECT 1 FROM \"public\".\"post\" p2 \
                 WHERE p2.user_id = u1.id AND ((p2.title = 'x'))))"
            )
        );
    }

    #[test]
    fn exists_on_a_scalar_lists_valid_relations() {
        let registry = registry();
        let mut plan = plan(&registry, "User");
        let err = plan
            .apply_filter(&Filter::from_json(&json!({"email": {"$exists": {}}})).unwrap())
            .unwrap_err();
        match err {
            Error::InvalidRelationUsage { valid, .. } => {
                assert_eq!(valid, vec!["addresses".to_string(), "posts".to_string()]);
            }
            other => panic!("unexpected error {other:?}"),
        }
    }

    #[test]
    fn nul_bytes_abort_before_emission() {
        let registry = registry();
        let mut plan = plan(&registry, "User");
        let err = plan
            .apply_filter(&Filter::from_json(&json!({"name": "x\u{0}y"})).unwrap())
            .unwrap_err();
        assert!(matches!(err, Error::InjectionDetected));
    }

    #[test]
    fn unknown_properties_fail_fast() {
        let registry = registry();
        let mut plan = plan(&registry, "User");
        let err = plan
            .apply_filter(&Filter::from_json(&json!({"nope": 1})).unwrap())
            .unwrap_err();
        assert!(matches!(err, Error::PropertyNotFound { .. }));
    }

    #[test]
    fn select_strategy_defers_to_sub_selects() {
        let registry = registry();
        let mut plan = plan(&registry, "User");
        plan.set_strategy(LoadStrategy::Select);
        plan.load("addresses").unwrap();
        let stmt = plan.into_statement().unwrap();

        assert!(stmt.joins.is_empty());
        assert_eq!(stmt.sub_selects.len(), 1);
        let node = &stmt.sub_selects[0];
        assert_eq!(node.origin_property, "addresses");
        assert_eq!(node.fk_property, "user");
        assert_eq!(node.fk_column, "user_id");
        assert_eq!(node.statement.entity, "Address");
    }

    #[test]
    fn order_by_keeps_declaration_order() {
        let registry = registry();
        let mut plan = plan(&registry, "User");
        plan.order_by(&[
            ("name".to_string(), SortOrder::Asc),
            ("id".to_string(), SortOrder::Desc),
        ])
        .unwrap();
        let stmt = plan.into_statement().unwrap();
        let sql = stmt.to_sql(DbKind::Postgres).unwrap();
        assert!(sql.ends_with("ORDER BY u1.name ASC, u1.id DESC"));
    }

    #[test]
    fn discover_alias_resolves_dotted_paths() {
        let registry = registry();
        let mut plan = plan(&registry, "User");
        plan.load("addresses").unwrap();
        assert_eq!(
            plan.discover_alias("addresses.city", true).unwrap(),
            "\"a2\".\"city\""
        );
        assert_eq!(
            plan.discover_alias("addresses.city", false).unwrap(),
            "\"a2\".\"city\" as \"a2_city\""
        );
    }
}
