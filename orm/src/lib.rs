// SPDX-FileCopyrightText: © 2022 ChiselStrike <info@chiselstrike.com>

//! # Query core
//!
//! ## Requirements
//!
//! - Callers describe queries declaratively against a registry of entity
//!   metadata and get typed instance graphs back.
//! - Execution must stay efficient: filters, joins and projections are
//!   pushed down into one dialect-appropriate SQL statement wherever
//!   possible, with a secondary batched SELECT as the fallback strategy.
//!
//! ## Design
//!
//! A query flows through the crate in one direction:
//!
//! ```ignore
//! QueryBuilder → QueryPlan → Statement → QueryCache → Driver → Hydrator
//! ```
//!
//! The builder collects the description, the plan resolves it against the
//! metadata [meta::Registry] (conditions, joins, EXISTS subqueries,
//! projection aliases), and the [statement::Statement] renders dialect SQL
//! for PostgreSQL or MySQL. The engine probes the query cache, dispatches
//! through the [driver::Driver] abstraction, and the hydrator
//! re-materialises rows into [instance::EntityInstance] graphs with
//! identity-map reuse and one-to-many deduplication.
//!
//! Identity map, current transaction and active session are task-scoped:
//! entering a scope snapshots the outer state and restores it on exit, so
//! parallel branches never observe each other's instances.

#[macro_use]
extern crate log;

pub mod cache;
pub mod config;
pub mod context;
pub mod crud;
pub mod dbconn;
pub mod driver;
pub mod engine;
pub mod error;
pub mod filter;
pub mod hydrate;
pub mod instance;
pub mod meta;
pub mod orm;
pub mod process;
pub mod query;
pub mod statement;
pub mod testing;
pub mod value;

pub use config::{CacheSettings, ConnectionConfig};
pub use crud::{Execution, FindOptions, QueryBuilder, Repository};
pub use dbconn::DbKind;
pub use driver::{Driver, ExecutedQuery, Row};
pub use error::{Error, Result};
pub use filter::{Condition, Filter, FilterOp};
pub use instance::{EntityInstance, SharedInstance};
pub use meta::{
    DbType, EntityMeta, HookKind, PropertyMeta, Registry, RelationKind, RelationMeta,
};
pub use orm::Orm;
pub use query::SortOrder;
pub use statement::{CacheDirective, LoadStrategy, Statement, StatementKind};
pub use value::{EntityMap, EntityValue, ValueObject};
