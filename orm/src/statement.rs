// SPDX-FileCopyrightText: © 2022 ChiselStrike <info@chiselstrike.com>

use crate::dbconn::DbKind;
use crate::error::Result;
use crate::meta::{DbType, RelationKind};
use crate::value::{sql_literal, EntityMap};

use itertools::Itertools;
use std::fmt::Write;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatementKind {
    Select,
    Insert,
    Update,
    Delete,
    Count,
}

/// How relation loads are realised: one wide JOIN query, or a root query
/// plus one batched SELECT per relation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoadStrategy {
    Joined,
    Select,
}

/// Cache behaviour requested for a single statement.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheDirective {
    /// No cache interaction at all (the default).
    Bypass,
    Forever,
    /// Time-to-live in milliseconds.
    Ttl(u64),
    /// Absolute expiry as epoch milliseconds; past instants bypass.
    Until(i64),
}

impl CacheDirective {
    pub fn is_bypass(&self) -> bool {
        matches!(self, CacheDirective::Bypass)
    }
}

/// One projected column: `"alias"."column" as "alias_column"`.
#[derive(Debug, Clone)]
pub struct ProjectedColumn {
    pub alias: String,
    pub column: String,
    pub property: String,
    pub entity: String,
    pub db_type: DbType,
    pub nullable: bool,
}

impl ProjectedColumn {
    /// The name this column carries in result rows.
    pub fn result_name(&self) -> String {
        format!("{}_{}", self.alias, self.column)
    }
}

/// A LEFT JOIN produced by a relation load or a relation-keyed filter.
#[derive(Debug, Clone)]
pub struct JoinNode {
    pub origin_alias: String,
    pub origin_table: String,
    pub origin_entity: String,
    pub alias: String,
    pub table: String,
    pub schema: String,
    pub entity: String,
    /// Property on the origin entity this join loads.
    pub property: String,
    pub on: String,
    pub where_clause: Option<String>,
    pub kind: RelationKind,
}

/// A deferred batched SELECT for the secondary-select strategy. Carries the
/// correlation keys needed to attach children to their parents.
#[derive(Debug, Clone)]
pub struct SubSelectNode {
    pub statement: Statement,
    pub origin_alias: String,
    pub origin_property: String,
    pub origin_entity: String,
    /// FK property/column on the child side (one-to-many) or the referenced
    /// primary key (many-to-one).
    pub fk_property: String,
    pub fk_column: String,
    pub kind: RelationKind,
}

/// The internal descriptor of a query; created by the builder, consumed
/// exactly once by execute.
#[derive(Debug, Clone)]
pub struct Statement {
    pub kind: StatementKind,
    pub entity: String,
    pub alias: String,
    pub table: String,
    pub schema: String,
    pub columns: Vec<ProjectedColumn>,
    /// Column name → value, for write kinds.
    pub values: EntityMap,
    /// Decode shape for rows coming back from an insert.
    pub returning: Vec<(String, DbType)>,
    pub where_clause: Option<String>,
    pub order_by: Vec<String>,
    pub limit: Option<u64>,
    pub offset: Option<u64>,
    pub cache: CacheDirective,
    pub strategy: LoadStrategy,
    pub joins: Vec<JoinNode>,
    pub sub_selects: Vec<SubSelectNode>,
}

impl Statement {
    pub fn new(kind: StatementKind, entity: impl Into<String>) -> Self {
        Self {
            kind,
            entity: entity.into(),
            alias: String::new(),
            table: String::new(),
            schema: "public".to_string(),
            columns: vec![],
            values: EntityMap::new(),
            returning: vec![],
            where_clause: None,
            order_by: vec![],
            limit: None,
            offset: None,
            cache: CacheDirective::Bypass,
            strategy: LoadStrategy::Joined,
            joins: vec![],
            sub_selects: vec![],
        }
    }

    pub fn has_to_many_join(&self) -> bool {
        self.joins.iter().any(|j| j.kind == RelationKind::OneToMany)
    }

    /// The table reference, schema-qualified on PostgreSQL only.
    fn table_ref(&self, kind: DbKind) -> String {
        let q = kind.identifier_quote();
        if kind.supports_schema() {
            format!("{q}{}{q}.{q}{}{q}", self.schema, self.table)
        } else {
            format!("{q}{}{q}", self.table)
        }
    }

    fn join_ref(join: &JoinNode, kind: DbKind) -> String {
        let q = kind.identifier_quote();
        if kind.supports_schema() {
            format!("{q}{}{q}.{q}{}{q}", join.schema, join.table)
        } else {
            format!("{q}{}{q}", join.table)
        }
    }

    fn column_list(&self, kind: DbKind) -> String {
        let q = kind.identifier_quote();
        self.columns
            .iter()
            .map(|c| {
                format!(
                    "{q}{}{q}.{q}{}{q} as {q}{}{q}",
                    c.alias,
                    c.column,
                    c.result_name()
                )
            })
            .join(", ")
    }

    fn join_clauses(&self, kind: DbKind) -> String {
        let mut out = String::new();
        for join in &self.joins {
            write!(
                out,
                " LEFT JOIN {} {} ON {}",
                Self::join_ref(join, kind),
                join.alias,
                join.on
            )
            .expect("formatting failed");
            if let Some(where_clause) = &join.where_clause {
                write!(out, " AND {where_clause}").expect("formatting failed");
            }
        }
        out
    }

    fn tail_clauses(&self, suppress_limit: bool) -> String {
        let mut out = String::new();
        if let Some(where_clause) = &self.where_clause {
            write!(out, " WHERE {where_clause}").expect("formatting failed");
        }
        if !self.order_by.is_empty() {
            write!(out, " ORDER BY {}", self.order_by.join(", ")).expect("formatting failed");
        }
        if !suppress_limit {
            if let Some(limit) = self.limit {
                write!(out, " LIMIT {limit}").expect("formatting failed");
            }
        }
        if let Some(offset) = self.offset {
            write!(out, " OFFSET {offset}").expect("formatting failed");
        }
        out
    }

    /// Emits dialect SQL. Deterministic for identical inputs and metadata.
    pub fn to_sql(&self, kind: DbKind) -> Result<String> {
        let q = kind.identifier_quote();
        let sql = match self.kind {
            StatementKind::Select => {
                // A joined to-many load multiplies root rows; LIMIT is
                // applied after post-grouping, never in SQL.
                let suppress_limit =
                    self.strategy == LoadStrategy::Joined && self.has_to_many_join();
                format!(
                    "SELECT {} FROM {} {}{}{}",
                    self.column_list(kind),
                    self.table_ref(kind),
                    self.alias,
                    self.join_clauses(kind),
                    self.tail_clauses(suppress_limit),
                )
            }
            StatementKind::Count => format!(
                "SELECT COUNT(*) AS count FROM {} {}{}{}",
                self.table_ref(kind),
                self.alias,
                self.join_clauses(kind),
                self.tail_clauses(true),
            ),
            StatementKind::Insert => {
                let columns = self
                    .values
                    .keys()
                    .map(|c| format!("{q}{c}{q}"))
                    .join(", ");
                let values: Result<Vec<String>> = self
                    .values
                    .values()
                    .map(|v| sql_literal(v, kind))
                    .collect();
                let returning = match kind {
                    DbKind::Postgres => " RETURNING *",
                    DbKind::MySql => "",
                };
                format!(
                    "INSERT INTO {} ({columns}) VALUES ({}){returning}",
                    self.table_ref(kind),
                    values?.join(", "),
                )
            }
            StatementKind::Update => {
                let assignments: Result<Vec<String>> = self
                    .values
                    .iter()
                    .map(|(c, v)| Ok(format!("{q}{c}{q} = {}", sql_literal(v, kind)?)))
                    .collect();
                let mut sql = format!(
                    "UPDATE {} SET {}",
                    self.table_ref(kind),
                    assignments?.join(", ")
                );
                if let Some(where_clause) = &self.where_clause {
                    write!(sql, " WHERE {where_clause}").expect("formatting failed");
                }
                sql
            }
            StatementKind::Delete => {
                let mut sql = format!("DELETE FROM {}", self.table_ref(kind));
                if let Some(where_clause) = &self.where_clause {
                    write!(sql, " WHERE {where_clause}").expect("formatting failed");
                }
                sql
            }
        };
        Ok(sql)
    }

    /// Deterministic cache key over everything that shapes the result set.
    pub fn fingerprint(&self) -> String {
        let mut out = String::new();
        write!(
            out,
            "{:?}|{}.{}|{}",
            self.kind,
            self.schema,
            self.table,
            self.columns.iter().map(|c| c.result_name()).join(",")
        )
        .expect("formatting failed");
        write!(
            out,
            "|w:{}|o:{}|l:{:?}|s:{:?}",
            self.where_clause.as_deref().unwrap_or(""),
            self.order_by.join(","),
            self.limit,
            self.offset,
        )
        .expect("formatting failed");
        for join in &self.joins {
            write!(
                out,
                "|j:{}>{}:{}:{}",
                join.origin_alias,
                join.alias,
                join.on,
                join.where_clause.as_deref().unwrap_or("")
            )
            .expect("formatting failed");
        }
        out
    }

    /// Cache keys are bucketed by the root table.
    pub fn namespace(&self) -> &str {
        &self.table
    }

    /// The (result column, db type) pairs the driver decodes rows with.
    pub fn result_shape(&self) -> Vec<(String, DbType)> {
        match self.kind {
            StatementKind::Select => self
                .columns
                .iter()
                .map(|c| (c.result_name(), c.db_type.clone()))
                .collect(),
            StatementKind::Count => vec![("count".to_string(), DbType::BigInt)],
            StatementKind::Insert => self.returning.clone(),
            StatementKind::Update | StatementKind::Delete => vec![],
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::value::EntityValue;

    fn select_user() -> Statement {
        let mut stmt = Statement::new(StatementKind::Select, "User");
        stmt.alias = "u1".into();
        stmt.table = "user".into();
        stmt.columns = vec![
            ProjectedColumn {
                alias: "u1".into(),
                column: "id".into(),
                property: "id".into(),
                entity: "User".into(),
                db_type: DbType::Serial,
                nullable: false,
            },
            ProjectedColumn {
                alias: "u1".into(),
                column: "email".into(),
                property: "email".into(),
                entity: "User".into(),
                db_type: DbType::Text,
                nullable: false,
            },
        ];
        stmt
    }

    #[test]
    fn select_emits_aliased_projection() {
        let mut stmt = select_user();
        stmt.where_clause = Some("((u1.email = 'a@b'))".into());
        assert_eq!(
            stmt.to_sql(DbKind::Postgres).unwrap(),
            "SELECT \"u1\".\"id\" as \"u1_id\", \"u1\".\"email\" as \"u1_email\" \
             FROM \"public\".\"user\" u1 WHERE ((u1.email = 'a@b'))"
        );
    }

    #[test]
    fn mysql_drops_schema_and_quotes_with_backticks() {
        let stmt = select_user();
        assert_eq!(
            stmt.to_sql(DbKind::MySql).unwrap(),
            "SELECT `u1`.`id` as `u1_id`, `u1`.`email` as `u1_email` FROM `user` u1"
        );
    }

    #[test]
    fn insert_returns_rows_on_postgres_only() {
        let mut stmt = Statement::new(StatementKind::Insert, "User");
        stmt.table = "user".into();
        stmt.values
            .insert("email".into(), EntityValue::String("a@b".into()));

        assert_eq!(
            stmt.to_sql(DbKind::Postgres).unwrap(),
            "INSERT INTO \"public\".\"user\" (\"email\") VALUES ('a@b') RETURNING *"
        );
        assert_eq!(
            stmt.to_sql(DbKind::MySql).unwrap(),
            "INSERT INTO `user` (`email`) VALUES ('a@b')"
        );
    }

    #[test]
    fn joined_to_many_suppresses_limit() {
        let mut stmt = select_user();
        stmt.limit = Some(1);
        stmt.joins.push(JoinNode {
            origin_alias: "u1".into(),
            origin_table: "user".into(),
            origin_entity: "User".into(),
            alias: "a2".into(),
            table: "address".into(),
            schema: "public".into(),
            entity: "Address".into(),
            property: "addresses".into(),
            on: "a2.\"user_id\" = u1.\"id\"".into(),
            where_clause: None,
            kind: RelationKind::OneToMany,
        });

        let sql = stmt.to_sql(DbKind::Postgres).unwrap();
        assert!(sql.contains("LEFT JOIN \"public\".\"address\" a2 ON"));
        assert!(!sql.contains("LIMIT"));

        stmt.joins[0].kind = RelationKind::ManyToOne;
        let sql = stmt.to_sql(DbKind::Postgres).unwrap();
        assert!(sql.contains("LIMIT 1"));
    }

    #[test]
    fn count_uses_count_star() {
        let mut stmt = Statement::new(StatementKind::Count, "User");
        stmt.alias = "u1".into();
        stmt.table = "user".into();
        assert_eq!(
            stmt.to_sql(DbKind::Postgres).unwrap(),
            "SELECT COUNT(*) AS count FROM \"public\".\"user\" u1"
        );
    }

    #[test]
    fn fingerprint_is_stable_and_shape_sensitive() {
        let a = select_user();
        let b = select_user();
        assert_eq!(a.fingerprint(), b.fingerprint());

        let mut c = select_user();
        c.where_clause = Some("((u1.email = 'x'))".into());
        assert_ne!(a.fingerprint(), c.fingerprint());
    }
}
