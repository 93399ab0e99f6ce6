// SPDX-FileCopyrightText: © 2022 ChiselStrike <info@chiselstrike.com>

use crate::cache::QueryCache;
use crate::config::{CacheSettings, ConnectionConfig};
use crate::context;
use crate::crud::{QueryBuilder, Repository};
use crate::driver::{Driver, SqlxDriver};
use crate::engine::QueryEngine;
use crate::error::Result;
use crate::meta::Registry;

use std::future::Future;
use std::sync::Arc;

/// The assembled ORM: registry + driver + engine. Constructed explicitly;
/// the session context scopes an `Arc<Orm>` per task with an optional
/// process-wide default.
pub struct Orm {
    registry: Arc<Registry>,
    engine: Arc<QueryEngine>,
}

impl Orm {
    /// Connects the sqlx driver described by `config`.
    pub async fn connect(config: ConnectionConfig, registry: Registry) -> Result<Arc<Self>> {
        let cache = config.cache.clone();
        let driver = Arc::new(SqlxDriver::new(config));
        driver.connect().await?;
        Ok(Self::with_driver(registry, driver, cache))
    }

    /// Assembles an ORM over an already-built driver; what tests use.
    pub fn with_driver(
        registry: Registry,
        driver: Arc<dyn Driver>,
        cache: CacheSettings,
    ) -> Arc<Self> {
        let registry = Arc::new(registry);
        let cache = Arc::new(QueryCache::new(cache));
        let engine = Arc::new(QueryEngine::new(registry.clone(), driver, cache));
        Arc::new(Self { registry, engine })
    }

    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    pub fn engine(&self) -> &Arc<QueryEngine> {
        &self.engine
    }

    pub fn repository(&self, entity: &str) -> Repository {
        Repository::new(self.engine.clone(), entity)
    }

    pub fn query(&self, entity: &str) -> QueryBuilder {
        QueryBuilder::new(self.engine.clone(), entity)
    }

    pub async fn transaction<T, F>(&self, fut: F) -> Result<T>
    where
        F: Future<Output = Result<T>>,
    {
        self.engine.transaction(fut).await
    }

    pub async fn create_table(&self, entity: &str) -> Result<()> {
        self.engine.create_table(entity).await
    }

    pub async fn drop_table(&self, entity: &str) -> Result<()> {
        self.engine.drop_table(entity).await
    }

    /// The session scoped to the current task, or the process default.
    pub fn current() -> Option<Arc<Orm>> {
        context::current_session()
    }

    pub fn set_default(orm: Arc<Orm>) {
        context::set_default_session(orm);
    }
}
