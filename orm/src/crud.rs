// SPDX-FileCopyrightText: © 2022 ChiselStrike <info@chiselstrike.com>

use crate::engine::QueryEngine;
use crate::error::{Error, Result};
use crate::filter::Filter;
use crate::instance::SharedInstance;
use crate::process::{self, Moment};
use crate::query::{QueryPlan, SortOrder};
use crate::statement::{CacheDirective, LoadStrategy, Statement, StatementKind};
use crate::value::{EntityMap, EntityValue};

use parking_lot::Mutex;
use std::future::Future;
use std::sync::Arc;

/// What a builder execution produced.
#[derive(Debug)]
pub enum Execution {
    Instances(Vec<SharedInstance>),
    Count(u64),
    Affected(u64),
}

/// Fluent query surface tying the planner, engine, cache and hydrator
/// together. One builder describes one statement and is consumed by an
/// `execute*` call.
pub struct QueryBuilder {
    engine: Arc<QueryEngine>,
    entity: String,
    kind: StatementKind,
    filter: Filter,
    fields: Option<Vec<String>>,
    loads: Vec<String>,
    strategy: LoadStrategy,
    order: Vec<(String, SortOrder)>,
    limit: Option<u64>,
    offset: Option<u64>,
    cache: CacheDirective,
    values: EntityMap,
    instance: Option<SharedInstance>,
}

impl QueryBuilder {
    pub fn new(engine: Arc<QueryEngine>, entity: impl Into<String>) -> Self {
        Self {
            engine,
            entity: entity.into(),
            kind: StatementKind::Select,
            filter: Filter::new(),
            fields: None,
            loads: vec![],
            strategy: LoadStrategy::Joined,
            order: vec![],
            limit: None,
            offset: None,
            cache: CacheDirective::Bypass,
            values: EntityMap::new(),
            instance: None,
        }
    }

    pub fn select(mut self, fields: Option<Vec<String>>) -> Self {
        self.kind = StatementKind::Select;
        self.fields = fields;
        self
    }

    pub fn set_strategy(mut self, strategy: LoadStrategy) -> Self {
        self.strategy = strategy;
        self
    }

    pub fn set_instance(mut self, instance: SharedInstance) -> Self {
        self.instance = Some(instance);
        self
    }

    pub fn insert(mut self, values: EntityMap) -> Self {
        self.kind = StatementKind::Insert;
        self.values = values;
        self
    }

    pub fn update(mut self, values: EntityMap) -> Self {
        self.kind = StatementKind::Update;
        self.values = values;
        self
    }

    pub fn delete(mut self) -> Self {
        self.kind = StatementKind::Delete;
        self
    }

    pub fn count(mut self) -> Self {
        self.kind = StatementKind::Count;
        self
    }

    pub fn filter(mut self, filter: Filter) -> Self {
        self.filter.nodes.extend(filter.nodes);
        self
    }

    /// Accepts the public `$`-sentinel record format directly.
    pub fn filter_json(self, json: &serde_json::Value) -> Result<Self> {
        let filter = Filter::from_json(json)?;
        Ok(self.filter(filter))
    }

    pub fn order_by(mut self, keys: Vec<(String, SortOrder)>) -> Self {
        self.order = keys;
        self
    }

    pub fn limit(mut self, limit: u64) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn offset(mut self, offset: u64) -> Self {
        self.offset = Some(offset);
        self
    }

    pub fn cache(mut self, directive: CacheDirective) -> Self {
        self.cache = directive;
        self
    }

    pub fn load(mut self, paths: &[&str]) -> Self {
        self.loads.extend(paths.iter().map(|p| p.to_string()));
        self
    }

    /// Resolves the description into a [Statement].
    pub fn build(&self) -> Result<Statement> {
        let registry = self.engine.registry();
        let mut plan = QueryPlan::new(registry, self.engine.db_kind(), self.kind, &self.entity)?;
        plan.set_strategy(self.strategy);
        for path in &self.loads {
            plan.load(path)?;
        }
        plan.apply_filter(&self.filter)?;
        if !self.order.is_empty() {
            plan.order_by(&self.order)?;
        }
        if let Some(fields) = &self.fields {
            plan.project(Some(fields))?;
        }
        {
            let stmt = plan.statement_mut();
            stmt.limit = self.limit;
            stmt.offset = self.offset;
            stmt.cache = self.cache;
        }
        plan.into_statement()
    }

    pub async fn execute(self) -> Result<Execution> {
        let stmt = self.build()?;
        match self.kind {
            StatementKind::Select => {
                let instances = self.engine.select(&stmt).await?;
                Ok(Execution::Instances(instances))
            }
            StatementKind::Count => Ok(Execution::Count(self.engine.count(&stmt).await?)),
            StatementKind::Insert => {
                let meta = self.engine.registry().get(&self.entity)?;
                let instance = match self.instance {
                    Some(instance) => instance,
                    None => {
                        let columns = process::process_for_insert(
                            self.engine.registry(),
                            &meta,
                            &self.values,
                        )?;
                        let created = process::create_instance(&meta, &columns, Moment::Insert)?;
                        Arc::new(Mutex::new(created))
                    }
                };
                let instance = self.engine.insert(stmt, instance).await?;
                Ok(Execution::Instances(vec![instance]))
            }
            StatementKind::Update => {
                let meta = self.engine.registry().get(&self.entity)?;
                let mut stmt = stmt;
                stmt.values =
                    process::process_for_update(self.engine.registry(), &meta, &self.values)?;
                let affected = self.engine.update(stmt, self.instance).await?;
                Ok(Execution::Affected(affected))
            }
            StatementKind::Delete => {
                Ok(Execution::Affected(self.engine.delete(stmt).await?))
            }
        }
    }

    pub async fn execute_and_return_all(self) -> Result<Vec<SharedInstance>> {
        match self.execute().await? {
            Execution::Instances(instances) => Ok(instances),
            other => Err(anyhow::anyhow!("statement returned {other:?}, not instances").into()),
        }
    }

    pub async fn execute_and_return_first(self) -> Result<Option<SharedInstance>> {
        // LIMIT 1 is a hint; a joined to-many load suppresses it and the
        // grouping below picks the first root.
        let mut this = self;
        if this.limit.is_none() {
            this.limit = Some(1);
        }
        Ok(this.execute_and_return_all().await?.into_iter().next())
    }

    pub async fn execute_and_return_first_or_fail(self) -> Result<SharedInstance> {
        let entity = self.entity.clone();
        self.execute_and_return_first()
            .await?
            .ok_or(Error::ResultNotFound { entity })
    }

    pub async fn execute_count(self) -> Result<u64> {
        match self.count().execute().await? {
            Execution::Count(count) => Ok(count),
            other => Err(anyhow::anyhow!("statement returned {other:?}, not a count").into()),
        }
    }

    pub async fn in_transaction<T, F>(&self, fut: F) -> Result<T>
    where
        F: Future<Output = Result<T>>,
    {
        self.engine.transaction(fut).await
    }
}

/// Per-find knobs the repository surface accepts.
#[derive(Default)]
pub struct FindOptions {
    pub load: Vec<String>,
    pub order: Vec<(String, SortOrder)>,
    pub limit: Option<u64>,
    pub offset: Option<u64>,
    pub cache: Option<CacheDirective>,
    pub strategy: Option<LoadStrategy>,
    pub fields: Option<Vec<String>>,
}

impl FindOptions {
    pub fn load(paths: &[&str]) -> Self {
        Self {
            load: paths.iter().map(|p| p.to_string()).collect(),
            ..Default::default()
        }
    }

    pub fn cached(directive: CacheDirective) -> Self {
        Self {
            cache: Some(directive),
            ..Default::default()
        }
    }
}

/// Repository-level operations over one entity.
pub struct Repository {
    engine: Arc<QueryEngine>,
    entity: String,
}

impl Repository {
    pub fn new(engine: Arc<QueryEngine>, entity: impl Into<String>) -> Self {
        Self {
            engine,
            entity: entity.into(),
        }
    }

    pub fn query(&self) -> QueryBuilder {
        QueryBuilder::new(self.engine.clone(), &self.entity)
    }

    fn builder_with(&self, filter: Filter, options: FindOptions) -> QueryBuilder {
        let mut builder = self.query().filter(filter);
        for path in &options.load {
            builder = builder.load(&[path.as_str()]);
        }
        if !options.order.is_empty() {
            builder = builder.order_by(options.order);
        }
        if let Some(limit) = options.limit {
            builder = builder.limit(limit);
        }
        if let Some(offset) = options.offset {
            builder = builder.offset(offset);
        }
        if let Some(cache) = options.cache {
            builder = builder.cache(cache);
        }
        if let Some(strategy) = options.strategy {
            builder = builder.set_strategy(strategy);
        }
        if let Some(fields) = options.fields {
            builder = builder.select(Some(fields));
        }
        builder
    }

    pub async fn find(
        &self,
        filter: Filter,
        options: FindOptions,
    ) -> Result<Vec<SharedInstance>> {
        self.builder_with(filter, options)
            .execute_and_return_all()
            .await
    }

    pub async fn find_all(&self) -> Result<Vec<SharedInstance>> {
        self.find(Filter::new(), FindOptions::default()).await
    }

    pub async fn find_one(
        &self,
        filter: Filter,
        options: FindOptions,
    ) -> Result<Option<SharedInstance>> {
        self.builder_with(filter, options)
            .execute_and_return_first()
            .await
    }

    pub async fn find_one_or_fail(
        &self,
        filter: Filter,
        options: FindOptions,
    ) -> Result<SharedInstance> {
        self.builder_with(filter, options)
            .execute_and_return_first_or_fail()
            .await
    }

    fn pk_filter(&self, id: EntityValue) -> Result<Filter> {
        let meta = self.engine.registry().get(&self.entity)?;
        Ok(Filter::where_eq(meta.primary_key_property(), id))
    }

    pub async fn find_by_id(&self, id: impl Into<EntityValue>) -> Result<Option<SharedInstance>> {
        let filter = self.pk_filter(id.into())?;
        self.find_one(filter, FindOptions::default()).await
    }

    pub async fn find_by_id_or_fail(
        &self,
        id: impl Into<EntityValue>,
    ) -> Result<SharedInstance> {
        let filter = self.pk_filter(id.into())?;
        self.find_one_or_fail(filter, FindOptions::default()).await
    }

    pub async fn count(&self, filter: Filter) -> Result<u64> {
        self.query().filter(filter).execute_count().await
    }

    pub async fn exists(&self, filter: Filter) -> Result<bool> {
        Ok(self.count(filter).await? > 0)
    }

    pub async fn create(&self, values: EntityMap) -> Result<SharedInstance> {
        let executed = self.query().insert(values).execute().await?;
        match executed {
            Execution::Instances(mut instances) if !instances.is_empty() => {
                Ok(instances.remove(0))
            }
            _ => Err(anyhow::anyhow!("insert produced no instance").into()),
        }
    }

    pub async fn update_by_id(
        &self,
        id: impl Into<EntityValue>,
        values: EntityMap,
    ) -> Result<u64> {
        let filter = self.pk_filter(id.into())?;
        match self.query().update(values).filter(filter).execute().await? {
            Execution::Affected(n) => Ok(n),
            _ => Ok(0),
        }
    }

    pub async fn delete_by_id(&self, id: impl Into<EntityValue>) -> Result<u64> {
        let filter = self.pk_filter(id.into())?;
        self.delete(filter).await
    }

    pub async fn delete(&self, filter: Filter) -> Result<u64> {
        match self.query().delete().filter(filter).execute().await? {
            Execution::Affected(n) => Ok(n),
            _ => Ok(0),
        }
    }

    /// Persists an instance: fresh instances insert every value, persisted
    /// ones update only what changed since hydration or the last save.
    pub async fn save(&self, instance: &SharedInstance) -> Result<()> {
        let meta = self.engine.registry().get(&self.entity)?;
        let (persisted, changed, pk) = {
            let locked = instance.lock();
            (
                locked.persisted(),
                locked.changed_values().clone(),
                locked.primary_key(&meta).cloned(),
            )
        };

        if !persisted {
            self.query()
                .insert(EntityMap::new())
                .set_instance(instance.clone())
                .execute()
                .await?;
            return Ok(());
        }

        if changed.is_empty() {
            return Ok(());
        }
        let pk = pk.ok_or_else(|| {
            anyhow::anyhow!("cannot save `{}` without a primary key", self.entity)
        })?;
        let filter = Filter::where_eq(meta.primary_key_property(), pk);
        self.query()
            .update(changed)
            .filter(filter)
            .set_instance(instance.clone())
            .execute()
            .await?;
        Ok(())
    }
}
