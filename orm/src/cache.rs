// SPDX-FileCopyrightText: © 2022 ChiselStrike <info@chiselstrike.com>

use crate::config::CacheSettings;
use crate::driver::Row;
use crate::statement::{CacheDirective, Statement};

use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

struct CacheEntry {
    rows: Vec<Row>,
    expires_at: Option<Instant>,
    namespace: String,
}

#[derive(Default)]
struct CacheInner {
    entries: HashMap<String, CacheEntry>,
    /// Insertion-ordered keys per root table, for bulk invalidation and
    /// oldest-first eviction.
    namespaces: HashMap<String, VecDeque<String>>,
}

/// Fingerprint → rows cache with per-table namespaces.
///
/// Only statements carrying a cache directive participate; everything else
/// passes straight through to the driver.
pub struct QueryCache {
    settings: CacheSettings,
    inner: Mutex<CacheInner>,
}

impl QueryCache {
    pub fn new(settings: CacheSettings) -> Self {
        Self {
            settings,
            inner: Mutex::new(CacheInner::default()),
        }
    }

    pub fn invalidate_on_write(&self) -> bool {
        self.settings.invalidate_on_write
    }

    pub fn get(&self, stmt: &Statement) -> Option<Vec<Row>> {
        if stmt.cache.is_bypass() {
            return None;
        }
        let key = stmt.fingerprint();
        let mut inner = self.inner.lock();
        let entry = inner.entries.get(&key)?;
        if let Some(expires_at) = entry.expires_at {
            if Instant::now() >= expires_at {
                let namespace = entry.namespace.clone();
                inner.entries.remove(&key);
                if let Some(keys) = inner.namespaces.get_mut(&namespace) {
                    keys.retain(|k| k != &key);
                }
                debug!("cache expired: {namespace}");
                return None;
            }
        }
        debug!("cache hit: {}", entry.namespace);
        Some(entry.rows.clone())
    }

    pub fn set(&self, stmt: &Statement, rows: &[Row]) {
        let expires_at = match stmt.cache {
            CacheDirective::Bypass => return,
            CacheDirective::Forever => None,
            CacheDirective::Ttl(ms) => Some(Instant::now() + Duration::from_millis(ms)),
            CacheDirective::Until(epoch_ms) => {
                let now_ms = SystemTime::now()
                    .duration_since(UNIX_EPOCH)
                    .expect("system clock before epoch")
                    .as_millis() as i64;
                if epoch_ms <= now_ms {
                    return;
                }
                Some(Instant::now() + Duration::from_millis((epoch_ms - now_ms) as u64))
            }
        };

        let key = stmt.fingerprint();
        let namespace = stmt.namespace().to_string();
        let mut inner = self.inner.lock();
        let CacheInner {
            entries,
            namespaces,
        } = &mut *inner;
        let is_new = !entries.contains_key(&key);
        entries.insert(
            key.clone(),
            CacheEntry {
                rows: rows.to_vec(),
                expires_at,
                namespace: namespace.clone(),
            },
        );
        let keys = namespaces.entry(namespace).or_default();
        if is_new {
            keys.push_back(key);
        }
        while keys.len() > self.settings.max_keys_per_table {
            if let Some(oldest) = keys.pop_front() {
                entries.remove(&oldest);
            }
        }
    }

    /// Drops every key registered under the statement's root table.
    pub fn invalidate(&self, namespace: &str) {
        let mut inner = self.inner.lock();
        if let Some(keys) = inner.namespaces.remove(namespace) {
            debug!("cache invalidate: {namespace} ({} keys)", keys.len());
            for key in keys {
                inner.entries.remove(&key);
            }
        }
    }
}
