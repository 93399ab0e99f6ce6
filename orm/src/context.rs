// SPDX-FileCopyrightText: © 2022 ChiselStrike <info@chiselstrike.com>

use crate::instance::SharedInstance;
use crate::orm::Orm;
use crate::value::EntityValue;

use once_cell::sync::Lazy;
use parking_lot::{Mutex, RwLock};
use std::any::Any;
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

/// Per-scope lookup `(entity, primary key) → instance`. Entering a scope
/// starts with an empty map; leaving restores the outer one. Parallel tasks
/// each see their own map, so instances never leak across branches.
#[derive(Clone, Default)]
pub struct IdentityMap {
    inner: Arc<Mutex<HashMap<(String, String), SharedInstance>>>,
}

impl IdentityMap {
    fn key(entity: &str, pk: &EntityValue) -> (String, String) {
        (entity.to_string(), pk.canonical())
    }

    pub fn get(&self, entity: &str, pk: &EntityValue) -> Option<SharedInstance> {
        self.inner.lock().get(&Self::key(entity, pk)).cloned()
    }

    pub fn insert(&self, entity: &str, pk: &EntityValue, instance: SharedInstance) {
        self.inner.lock().insert(Self::key(entity, pk), instance);
    }
}

/// An opaque driver transaction, shareable across the scope that opened it.
#[derive(Clone)]
pub struct TransactionHandle {
    inner: Arc<dyn Any + Send + Sync>,
}

impl TransactionHandle {
    pub fn new<T: Send + Sync + 'static>(inner: T) -> Self {
        Self {
            inner: Arc::new(inner),
        }
    }

    pub fn downcast<T: Send + Sync + 'static>(&self) -> Option<Arc<T>> {
        self.inner.clone().downcast::<T>().ok()
    }

    /// Consuming downcast; used when committing so no stray clone keeps the
    /// transaction alive.
    pub fn into_downcast<T: Send + Sync + 'static>(self) -> Option<Arc<T>> {
        self.inner.downcast::<T>().ok()
    }
}

tokio::task_local! {
    static IDENTITY_MAP: IdentityMap;
    static TRANSACTION: TransactionHandle;
    static SESSION: Arc<Orm>;
}

/// Runs `fut` inside a fresh identity-map scope.
pub async fn with_identity_map<F: Future>(fut: F) -> F::Output {
    IDENTITY_MAP.scope(IdentityMap::default(), fut).await
}

pub fn identity_map() -> Option<IdentityMap> {
    IDENTITY_MAP.try_with(|map| map.clone()).ok()
}

pub fn identity_lookup(entity: &str, pk: &EntityValue) -> Option<SharedInstance> {
    identity_map().and_then(|map| map.get(entity, pk))
}

pub fn identity_register(entity: &str, pk: &EntityValue, instance: SharedInstance) {
    if let Some(map) = identity_map() {
        map.insert(entity, pk, instance);
    }
}

/// Runs `fut` with `handle` as the scope's transaction. Nested entries see
/// the same handle through [current_transaction].
pub async fn with_transaction<F: Future>(handle: TransactionHandle, fut: F) -> F::Output {
    TRANSACTION.scope(handle, fut).await
}

pub fn current_transaction() -> Option<TransactionHandle> {
    TRANSACTION.try_with(|handle| handle.clone()).ok()
}

static DEFAULT_SESSION: Lazy<RwLock<Option<Arc<Orm>>>> = Lazy::new(|| RwLock::new(None));

/// Runs `fut` with `orm` as the scope's active session; used by test
/// harnesses to swap databases per test.
pub async fn with_session<F: Future>(orm: Arc<Orm>, fut: F) -> F::Output {
    SESSION.scope(orm, fut).await
}

/// The task-scoped session, falling back to the process-wide default.
pub fn current_session() -> Option<Arc<Orm>> {
    SESSION
        .try_with(|orm| orm.clone())
        .ok()
        .or_else(|| DEFAULT_SESSION.read().clone())
}

pub fn set_default_session(orm: Arc<Orm>) {
    *DEFAULT_SESSION.write() = Some(orm);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::instance::EntityInstance;

    #[tokio::test]
    async fn identity_scopes_nest_and_restore() {
        assert!(identity_map().is_none());

        with_identity_map(async {
            let pk = EntityValue::Int64(1);
            let instance = EntityInstance::new_shared("User");
            identity_register("User", &pk, instance.clone());
            let found = identity_lookup("User", &pk).unwrap();
            assert!(Arc::ptr_eq(&found, &instance));

            // The inner scope starts empty and does not disturb the outer.
            with_identity_map(async {
                assert!(identity_lookup("User", &pk).is_none());
            })
            .await;

            assert!(identity_lookup("User", &pk).is_some());
        })
        .await;

        assert!(identity_map().is_none());
    }

    #[tokio::test]
    async fn parallel_scopes_are_isolated() {
        let pk = EntityValue::Int64(7);
        let (a, b) = tokio::join!(
            with_identity_map(async {
                let instance = EntityInstance::new_shared("User");
                identity_register("User", &pk, instance);
                identity_lookup("User", &pk).unwrap()
            }),
            with_identity_map(async {
                let instance = EntityInstance::new_shared("User");
                identity_register("User", &pk, instance);
                identity_lookup("User", &pk).unwrap()
            }),
        );
        assert!(!Arc::ptr_eq(&a, &b));
    }

    #[tokio::test]
    async fn transactions_propagate_through_the_scope() {
        assert!(current_transaction().is_none());
        let handle = TransactionHandle::new(42u64);
        with_transaction(handle, async {
            let seen = current_transaction().unwrap();
            assert_eq!(*seen.downcast::<u64>().unwrap(), 42);
        })
        .await;
        assert!(current_transaction().is_none());
    }
}
