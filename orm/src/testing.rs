//! Driver test double: canned rows in, executed SQL out. The scenario
//! suite runs entirely against this, so no database is needed.

use crate::context::TransactionHandle;
use crate::dbconn::DbKind;
use crate::driver::{Driver, ExecutedQuery, Row};
use crate::error::Result;
use crate::statement::Statement;
use crate::value::EntityValue;

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

pub struct MockDriver {
    kind: DbKind,
    responses: Mutex<VecDeque<Vec<Row>>>,
    statements: Mutex<Vec<String>>,
    next_insert_id: Mutex<Option<i64>>,
    begun: AtomicU64,
    committed: AtomicU64,
    rolled_back: AtomicU64,
}

/// The token a [MockDriver] hands out as its transaction handle.
pub struct MockTransaction(pub u64);

impl MockDriver {
    pub fn new(kind: DbKind) -> Self {
        Self {
            kind,
            responses: Mutex::new(VecDeque::new()),
            statements: Mutex::new(vec![]),
            next_insert_id: Mutex::new(None),
            begun: AtomicU64::new(0),
            committed: AtomicU64::new(0),
            rolled_back: AtomicU64::new(0),
        }
    }

    /// Queues the rows the next `execute_statement` call returns.
    pub fn queue_rows(&self, rows: Vec<Row>) {
        self.responses.lock().push_back(rows);
    }

    pub fn set_next_insert_id(&self, id: i64) {
        *self.next_insert_id.lock() = Some(id);
    }

    /// Every statement dispatched so far, as emitted SQL.
    pub fn executed(&self) -> Vec<String> {
        self.statements.lock().clone()
    }

    pub fn call_count(&self) -> usize {
        self.statements.lock().len()
    }

    pub fn begun(&self) -> u64 {
        self.begun.load(Ordering::SeqCst)
    }

    pub fn committed(&self) -> u64 {
        self.committed.load(Ordering::SeqCst)
    }

    pub fn rolled_back(&self) -> u64 {
        self.rolled_back.load(Ordering::SeqCst)
    }

    pub fn row(values: &[(&str, EntityValue)]) -> Row {
        values
            .iter()
            .map(|(k, v)| (k.to_string(), v.clone()))
            .collect()
    }
}

#[async_trait]
impl Driver for MockDriver {
    async fn connect(&self) -> Result<()> {
        Ok(())
    }

    async fn disconnect(&self) -> Result<()> {
        Ok(())
    }

    async fn execute_sql(&self, sql: &str) -> Result<Vec<Row>> {
        self.statements.lock().push(sql.to_string());
        Ok(vec![])
    }

    async fn execute_statement(&self, stmt: &Statement) -> Result<ExecutedQuery> {
        let sql = stmt.to_sql(self.kind)?;
        self.statements.lock().push(sql.clone());
        let rows = self.responses.lock().pop_front().unwrap_or_default();
        let rows_affected = rows.len().max(1) as u64;
        Ok(ExecutedQuery {
            rows,
            sql,
            started_at: Instant::now(),
            rows_affected,
            last_insert_id: self.next_insert_id.lock().take(),
        })
    }

    async fn begin(&self) -> Result<TransactionHandle> {
        let id = self.begun.fetch_add(1, Ordering::SeqCst);
        Ok(TransactionHandle::new(MockTransaction(id)))
    }

    async fn commit(&self, _tx: TransactionHandle) -> Result<()> {
        self.committed.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn rollback(&self, _tx: TransactionHandle) -> Result<()> {
        self.rolled_back.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn db_kind(&self) -> DbKind {
        self.kind
    }
}
