// SPDX-FileCopyrightText: © 2022 ChiselStrike <info@chiselstrike.com>

use crate::config::ConnectionConfig;
use crate::error::Result;

use anyhow::Context;
use sea_query::{MysqlQueryBuilder, PostgresQueryBuilder, SchemaBuilder};
use serde_derive::{Deserialize, Serialize};
use sqlx::any::{AnyKind, AnyPool, AnyPoolOptions};

/// The SQL dialect a connection speaks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DbKind {
    Postgres,
    MySql,
}

impl DbKind {
    /// The glyph used to quote identifiers in this dialect.
    pub fn identifier_quote(self) -> char {
        match self {
            DbKind::Postgres => '"',
            DbKind::MySql => '`',
        }
    }

    /// MySQL has no schema prefix on table references.
    pub fn supports_schema(self) -> bool {
        matches!(self, DbKind::Postgres)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            DbKind::Postgres => "postgres",
            DbKind::MySql => "mysql",
        }
    }
}

#[derive(Debug, Clone)]
pub struct DbConnection {
    pub pool: AnyPool,
}

impl DbConnection {
    pub async fn connect(config: &ConnectionConfig) -> Result<Self> {
        let uri = config.uri();
        let pool = AnyPoolOptions::new()
            .max_connections(config.max_connections.unwrap_or(10))
            .connect(&uri)
            .await
            .with_context(|| format!("failed to connect to {}", config.redacted_uri()))?;
        Ok(Self { pool })
    }

    pub fn kind(&self) -> DbKind {
        match self.pool.any_kind() {
            AnyKind::Postgres => DbKind::Postgres,
            AnyKind::MySql => DbKind::MySql,
        }
    }

    pub fn schema_builder(&self) -> &'static dyn SchemaBuilder {
        schema_builder_for(self.kind())
    }
}

pub fn schema_builder_for(kind: DbKind) -> &'static dyn SchemaBuilder {
    match kind {
        DbKind::Postgres => &PostgresQueryBuilder,
        DbKind::MySql => &MysqlQueryBuilder,
    }
}
