//! Store adapter.
//!
//! Wraps a [`Backend`] with per-class timeouts, an availability flag driven by
//! a background probe, and soft failure: public operations never return an
//! error, only a neutral value.

use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::backend::{Backend, Batch};
use super::config::{OperationClass, Timeouts};
use super::error::CacheError;
use super::stats::CacheStats;

const TARGET: &str = "tagcache::cache::store";

pub struct StoreAdapter {
    backend: Arc<dyn Backend>,
    timeouts: Timeouts,
    available: AtomicBool,
    stats: Arc<CacheStats>,
}

impl StoreAdapter {
    pub fn new(backend: Arc<dyn Backend>, timeouts: Timeouts, stats: Arc<CacheStats>) -> Self {
        Self {
            backend,
            timeouts,
            available: AtomicBool::new(true),
            stats,
        }
    }

    pub fn is_available(&self) -> bool {
        self.available.load(Ordering::SeqCst)
    }

    fn set_available(&self, available: bool) {
        let previous = self.available.swap(available, Ordering::SeqCst);
        if previous != available {
            if available {
                info!(target = TARGET, "Backing store reachable again");
            } else {
                warn!(
                    target = TARGET,
                    "Backing store unreachable; cache operations short-circuit"
                );
            }
            self.stats.record_availability(available);
        }
    }

    /// Run one backend call under its timeout class. Skipped entirely while
    /// the store is marked unavailable.
    async fn run<T, F>(&self, op: &'static str, class: OperationClass, call: F) -> Result<T, CacheError>
    where
        F: Future<Output = Result<T, CacheError>>,
    {
        if !self.is_available() {
            return Err(CacheError::unavailable());
        }
        let limit = self.timeouts.for_class(class);
        let result = match tokio::time::timeout(limit, call).await {
            Ok(result) => result,
            Err(_) => Err(CacheError::timeout(op, class, limit)),
        };
        if let Err(CacheError::Connection { .. }) = &result {
            self.set_available(false);
        }
        result
    }

    /// Record a failure and substitute the neutral value.
    fn soften<T>(&self, op: &'static str, key: &str, result: Result<T, CacheError>, neutral: T) -> T {
        match result {
            Ok(value) => value,
            Err(err) => {
                self.record_failure(op, key, &err);
                neutral
            }
        }
    }

    /// Short-circuited calls are only traced; the outage itself was counted
    /// by the call that hit it.
    pub(crate) fn record_failure(&self, op: &'static str, key: &str, err: &CacheError) {
        if err.is_unavailable() {
            debug!(target = TARGET, op, key, "Skipped while backing store is unavailable");
            return;
        }
        self.stats.record_error(err);
        warn!(
            target = TARGET,
            op,
            key,
            error_kind = err.kind(),
            error = %err,
            "Cache store operation failed"
        );
    }

    pub async fn get(&self, key: &str) -> Option<Vec<u8>> {
        let result = self
            .run("get", OperationClass::Read, self.backend.get(key))
            .await;
        self.soften("get", key, result, None)
    }

    pub async fn set(&self, key: &str, value: Vec<u8>, ttl: Duration) -> bool {
        if ttl.is_zero() {
            warn!(target = TARGET, key, "Refusing to store entry with zero ttl");
            return false;
        }
        let result = self
            .run("set", OperationClass::Write, self.backend.set(key, value, ttl))
            .await
            .map(|()| true);
        let stored = self.soften("set", key, result, false);
        if stored {
            self.stats.record_set();
        }
        stored
    }

    pub async fn del(&self, key: &str) -> bool {
        self.mdel(&[key.to_string()]).await > 0
    }

    pub async fn exists(&self, key: &str) -> bool {
        let result = self
            .run("exists", OperationClass::Read, self.backend.exists(key))
            .await;
        self.soften("exists", key, result, false)
    }

    pub async fn mget(&self, keys: &[String]) -> Vec<Option<Vec<u8>>> {
        if keys.is_empty() {
            return Vec::new();
        }
        let result = self
            .run("mget", OperationClass::Read, self.backend.mget(keys))
            .await;
        let neutral = vec![None; keys.len()];
        let values = self.soften("mget", &keys[0], result, neutral.clone());
        // A backend returning the wrong arity is treated like a failed read.
        if values.len() == keys.len() {
            values
        } else {
            neutral
        }
    }

    pub async fn mset(&self, pairs: Vec<(String, Vec<u8>)>, ttl: Duration) -> bool {
        if pairs.is_empty() {
            return true;
        }
        if ttl.is_zero() {
            warn!(target = TARGET, "Refusing to store entries with zero ttl");
            return false;
        }
        let first = pairs[0].0.clone();
        let count = pairs.len() as u64;
        let result = self
            .run("mset", OperationClass::Write, self.backend.mset(pairs, ttl))
            .await
            .map(|()| true);
        let stored = self.soften("mset", &first, result, false);
        if stored {
            for _ in 0..count {
                self.stats.record_set();
            }
        }
        stored
    }

    pub async fn mdel(&self, keys: &[String]) -> u64 {
        if keys.is_empty() {
            return 0;
        }
        let result = self
            .run("mdel", OperationClass::Delete, self.backend.del(keys))
            .await;
        let removed = self.soften("mdel", &keys[0], result, 0);
        self.stats.record_deletes(removed);
        removed
    }

    // Fallible variants used by the tag index, which wraps failures itself.

    pub(crate) async fn try_members(&self, set_key: &str) -> Result<Vec<String>, CacheError> {
        self.run("members", OperationClass::Read, self.backend.members(set_key))
            .await
    }

    pub(crate) async fn try_members_many(
        &self,
        set_keys: &[String],
    ) -> Result<Vec<Vec<String>>, CacheError> {
        self.run(
            "members_many",
            OperationClass::Read,
            self.backend.members_many(set_keys),
        )
        .await
    }

    pub(crate) async fn try_union(&self, set_keys: &[String]) -> Result<Vec<String>, CacheError> {
        self.run("union", OperationClass::Read, self.backend.union(set_keys))
            .await
    }

    pub(crate) async fn try_apply(
        &self,
        op: &'static str,
        class: OperationClass,
        batch: Batch,
    ) -> Result<(), CacheError> {
        self.run(op, class, self.backend.apply(batch)).await
    }

    /// Check reachability right now, bypassing the short-circuit.
    pub async fn probe(&self) -> bool {
        let limit = self.timeouts.read;
        let reachable = matches!(
            tokio::time::timeout(limit, self.backend.ping()).await,
            Ok(Ok(()))
        );
        self.set_available(reachable);
        reachable
    }

    /// Re-probe every `interval` until the handle is aborted.
    pub fn spawn_health_probe(self: &Arc<Self>, interval: Duration) -> JoinHandle<()> {
        let store = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                ticker.tick().await;
                store.probe().await;
            }
        })
    }
}
