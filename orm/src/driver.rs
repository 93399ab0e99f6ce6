// SPDX-FileCopyrightText: © 2022 ChiselStrike <info@chiselstrike.com>

use crate::config::ConnectionConfig;
use crate::context::{self, TransactionHandle};
use crate::dbconn::{DbConnection, DbKind};
use crate::error::{Error, Result};
use crate::meta::{DbType, DecodeClass};
use crate::statement::Statement;
use crate::value::{parse_date, EntityValue};

use async_trait::async_trait;
use indexmap::IndexMap;
use once_cell::sync::OnceCell;
use sqlx::any::AnyRow;
use sqlx::{Column, Row as SqlxRow};
use std::sync::Arc;
use std::time::Instant;

/// One result row, keyed by result column name (`alias_column` for
/// selects).
pub type Row = IndexMap<String, EntityValue>;

/// What a dispatched statement produced.
#[derive(Debug)]
pub struct ExecutedQuery {
    pub rows: Vec<Row>,
    pub sql: String,
    pub started_at: Instant,
    pub rows_affected: u64,
    /// MySQL inserts report the generated key here instead of RETURNING.
    pub last_insert_id: Option<i64>,
}

/// The backend abstraction. Pooling and the socket protocol are the
/// implementor's business; the core only sees rows of [EntityValue].
///
/// Transactions hand out an opaque [TransactionHandle]; the engine scopes
/// it through the transaction context so nested operations land on the
/// same handle.
#[async_trait]
pub trait Driver: Send + Sync {
    async fn connect(&self) -> Result<()>;
    async fn disconnect(&self) -> Result<()>;
    async fn execute_sql(&self, sql: &str) -> Result<Vec<Row>>;
    async fn execute_statement(&self, stmt: &Statement) -> Result<ExecutedQuery>;
    async fn begin(&self) -> Result<TransactionHandle>;
    async fn commit(&self, tx: TransactionHandle) -> Result<()>;
    async fn rollback(&self, tx: TransactionHandle) -> Result<()>;
    fn db_kind(&self) -> DbKind;

    fn identifier_quote(&self) -> char {
        self.db_kind().identifier_quote()
    }
}

pub(crate) type TransactionStatic =
    Arc<async_lock::Mutex<sqlx::Transaction<'static, sqlx::Any>>>;

/// sqlx-backed driver speaking PostgreSQL or MySQL through the `Any` pool.
pub struct SqlxDriver {
    config: ConnectionConfig,
    kind: DbKind,
    conn: OnceCell<DbConnection>,
}

impl SqlxDriver {
    pub fn new(config: ConnectionConfig) -> Self {
        let kind = config.kind();
        Self {
            config,
            kind,
            conn: OnceCell::new(),
        }
    }

    fn connection(&self) -> Result<&DbConnection> {
        self.conn.get().ok_or(Error::DriverNotInitialized)
    }

    /// The transaction scoped to the current task, if one was opened by
    /// this driver.
    fn current_transaction(&self) -> Option<TransactionStatic> {
        context::current_transaction()
            .and_then(|handle| handle.downcast::<async_lock::Mutex<sqlx::Transaction<'static, sqlx::Any>>>())
    }

    async fn fetch_all(&self, sql: &str) -> Result<Vec<AnyRow>> {
        let conn = self.connection()?;
        let rows = match self.current_transaction() {
            Some(tx) => {
                let mut tx = tx.lock().await;
                sqlx::query(sql).fetch_all(&mut *tx).await?
            }
            None => sqlx::query(sql).fetch_all(&conn.pool).await?,
        };
        Ok(rows)
    }

    async fn execute(&self, sql: &str) -> Result<(u64, Option<i64>)> {
        let conn = self.connection()?;
        let outcome = match self.current_transaction() {
            Some(tx) => {
                let mut tx = tx.lock().await;
                sqlx::query(sql).execute(&mut *tx).await?
            }
            None => sqlx::query(sql).execute(&conn.pool).await?,
        };
        Ok((outcome.rows_affected(), outcome.last_insert_id()))
    }
}

#[async_trait]
impl Driver for SqlxDriver {
    async fn connect(&self) -> Result<()> {
        if self.conn.get().is_some() {
            return Ok(());
        }
        let conn = DbConnection::connect(&self.config).await?;
        let _ = self.conn.set(conn);
        Ok(())
    }

    async fn disconnect(&self) -> Result<()> {
        if let Some(conn) = self.conn.get() {
            conn.pool.close().await;
        }
        Ok(())
    }

    async fn execute_sql(&self, sql: &str) -> Result<Vec<Row>> {
        debug!("sql: {sql}");
        let rows = self.fetch_all(sql).await?;
        rows.iter().map(decode_untyped_row).collect()
    }

    async fn execute_statement(&self, stmt: &Statement) -> Result<ExecutedQuery> {
        let sql = stmt.to_sql(self.kind)?;
        let started_at = Instant::now();
        debug!("statement: {sql}");

        let shape = stmt.result_shape();
        if shape.is_empty() {
            let (rows_affected, last_insert_id) = self.execute(&sql).await?;
            return Ok(ExecutedQuery {
                rows: vec![],
                sql,
                started_at,
                rows_affected,
                last_insert_id,
            });
        }

        // MySQL inserts carry a shape for the follow-up select but return
        // no rows themselves.
        if self.kind == DbKind::MySql && matches!(stmt.kind, crate::statement::StatementKind::Insert)
        {
            let (rows_affected, last_insert_id) = self.execute(&sql).await?;
            return Ok(ExecutedQuery {
                rows: vec![],
                sql,
                started_at,
                rows_affected,
                last_insert_id,
            });
        }

        let raw = self.fetch_all(&sql).await?;
        let rows: Result<Vec<Row>> = raw.iter().map(|row| decode_row(row, &shape)).collect();
        let rows = rows?;
        let rows_affected = rows.len() as u64;
        Ok(ExecutedQuery {
            rows,
            sql,
            started_at,
            rows_affected,
            last_insert_id: None,
        })
    }

    async fn begin(&self) -> Result<TransactionHandle> {
        let conn = self.connection()?;
        let tx = conn.pool.begin().await?;
        Ok(TransactionHandle::new(async_lock::Mutex::new(tx)))
    }

    async fn commit(&self, tx: TransactionHandle) -> Result<()> {
        let tx = tx
            .into_downcast::<async_lock::Mutex<sqlx::Transaction<'static, sqlx::Any>>>()
            .ok_or_else(|| anyhow::anyhow!("foreign transaction handle"))?;
        let tx = Arc::try_unwrap(tx)
            .map_err(|_| anyhow::anyhow!("transaction still has references held"))?;
        tx.into_inner().commit().await?;
        Ok(())
    }

    async fn rollback(&self, tx: TransactionHandle) -> Result<()> {
        let tx = tx
            .into_downcast::<async_lock::Mutex<sqlx::Transaction<'static, sqlx::Any>>>()
            .ok_or_else(|| anyhow::anyhow!("foreign transaction handle"))?;
        let tx = Arc::try_unwrap(tx)
            .map_err(|_| anyhow::anyhow!("transaction still has references held"))?;
        tx.into_inner().rollback().await?;
        Ok(())
    }

    fn db_kind(&self) -> DbKind {
        self.kind
    }
}

/// Decodes one row following the statement's declared shape.
fn decode_row(row: &AnyRow, shape: &[(String, DbType)]) -> Result<Row> {
    let mut out = Row::new();
    for (name, db_type) in shape {
        let value = decode_column(row, name, db_type)?;
        out.insert(name.clone(), value);
    }
    Ok(out)
}

fn decode_column(row: &AnyRow, name: &str, db_type: &DbType) -> Result<EntityValue> {
    let value = match db_type.decode_class() {
        DecodeClass::Text => row
            .try_get::<Option<String>, _>(name)?
            .map(EntityValue::String),
        DecodeClass::Integer => row.try_get::<Option<i64>, _>(name)?.map(EntityValue::Int64),
        DecodeClass::Float => row
            .try_get::<Option<f64>, _>(name)?
            .map(EntityValue::Float64),
        DecodeClass::Boolean => match row.try_get::<Option<bool>, _>(name) {
            Ok(value) => value.map(EntityValue::Boolean),
            // MySQL TINYINT(1) comes back as an integer.
            Err(_) => row
                .try_get::<Option<i64>, _>(name)?
                .map(|i| EntityValue::Boolean(i != 0)),
        },
        DecodeClass::Date => match row.try_get::<Option<String>, _>(name) {
            Ok(value) => value.map(|s| match parse_date(&s) {
                Some(ms) => EntityValue::Date(ms),
                None => EntityValue::String(s),
            }),
            Err(_) => row.try_get::<Option<i64>, _>(name)?.map(EntityValue::Date),
        },
        DecodeClass::Json => row.try_get::<Option<String>, _>(name)?.map(|s| {
            serde_json::from_str::<serde_json::Value>(&s)
                .map(|v| EntityValue::from_json(&v))
                .unwrap_or(EntityValue::String(s))
        }),
    };
    Ok(value.unwrap_or(EntityValue::Null))
}

/// Best-effort decoding for raw `execute_sql` results, where no shape is
/// known.
fn decode_untyped_row(row: &AnyRow) -> Result<Row> {
    let mut out = Row::new();
    for column in row.columns() {
        let name = column.name();
        let value = if let Ok(v) = row.try_get::<Option<i64>, _>(name) {
            v.map(EntityValue::Int64)
        } else if let Ok(v) = row.try_get::<Option<f64>, _>(name) {
            v.map(EntityValue::Float64)
        } else if let Ok(v) = row.try_get::<Option<bool>, _>(name) {
            v.map(EntityValue::Boolean)
        } else {
            row.try_get::<Option<String>, _>(name)
                .ok()
                .flatten()
                .map(EntityValue::String)
        };
        out.insert(name.to_string(), value.unwrap_or(EntityValue::Null));
    }
    Ok(out)
}
