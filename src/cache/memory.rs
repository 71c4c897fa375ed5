//! In-process [`Backend`] used by tests and by single-process development runs.
//!
//! Mirrors the Redis semantics the cache relies on: per-key expiry, sets with
//! their own expiry, and batches applied under one lock. Reachability and
//! latency can be toggled to simulate outages and slow networks.

use std::collections::{HashMap, HashSet};
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use tokio::time::Instant;

use super::backend::{Backend, Batch, BatchOp};
use super::error::CacheError;
use super::lock::mutex_lock;

const SOURCE: &str = "cache::memory";

#[derive(Default)]
struct MemoryState {
    values: HashMap<String, (Vec<u8>, Instant)>,
    sets: HashMap<String, (HashSet<String>, Option<Instant>)>,
}

impl MemoryState {
    fn value(&mut self, key: &str, now: Instant) -> Option<&Vec<u8>> {
        if self
            .values
            .get(key)
            .is_some_and(|(_, expires_at)| *expires_at <= now)
        {
            self.values.remove(key);
        }
        self.values.get(key).map(|(value, _)| value)
    }

    fn set_members(&mut self, key: &str, now: Instant) -> Option<&HashSet<String>> {
        if self
            .sets
            .get(key)
            .is_some_and(|(_, expires_at)| expires_at.is_some_and(|at| at <= now))
        {
            self.sets.remove(key);
        }
        self.sets.get(key).map(|(members, _)| members)
    }

    fn remove(&mut self, key: &str, now: Instant) -> bool {
        let had_value = self.value(key, now).is_some();
        let had_set = self.set_members(key, now).is_some();
        self.values.remove(key);
        self.sets.remove(key);
        had_value || had_set
    }

    fn apply(&mut self, op: BatchOp, now: Instant) {
        match op {
            BatchOp::Set { key, value, ttl } => {
                self.values.insert(key, (value, now + ttl));
            }
            BatchOp::SetAdd { key, members } => {
                // Drop an expired set before extending it.
                self.set_members(&key, now);
                self.sets
                    .entry(key)
                    .or_insert_with(|| (HashSet::new(), None))
                    .0
                    .extend(members);
            }
            BatchOp::SetRemove { key, members } => {
                if let Some((set, _)) = self.sets.get_mut(&key) {
                    for member in &members {
                        set.remove(member);
                    }
                    if set.is_empty() {
                        self.sets.remove(&key);
                    }
                }
            }
            BatchOp::Expire { key, ttl } => {
                if let Some((_, expires_at)) = self.values.get_mut(&key) {
                    *expires_at = now + ttl;
                }
                if let Some((_, expires_at)) = self.sets.get_mut(&key) {
                    *expires_at = Some(now + ttl);
                }
            }
            BatchOp::ExtendExpire { key, ttl } => {
                let candidate = now + ttl;
                if let Some((_, expires_at)) = self.values.get_mut(&key) {
                    *expires_at = (*expires_at).max(candidate);
                }
                if let Some((_, expires_at)) = self.sets.get_mut(&key) {
                    *expires_at = Some(expires_at.map_or(candidate, |at| at.max(candidate)));
                }
            }
            BatchOp::Delete { keys } => {
                for key in keys {
                    self.remove(&key, now);
                }
            }
        }
    }
}

pub struct MemoryBackend {
    state: Mutex<MemoryState>,
    reachable: AtomicBool,
    latency_ms: AtomicU64,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(MemoryState::default()),
            reachable: AtomicBool::new(true),
            latency_ms: AtomicU64::new(0),
        }
    }

    /// Simulate the store going away (or coming back).
    pub fn set_reachable(&self, reachable: bool) {
        self.reachable.store(reachable, Ordering::SeqCst);
    }

    /// Delay every call by `latency` before it touches the data.
    pub fn set_latency(&self, latency: Duration) {
        let millis = u64::try_from(latency.as_millis()).unwrap_or(u64::MAX);
        self.latency_ms.store(millis, Ordering::SeqCst);
    }

    /// Number of live (unexpired) plain values.
    pub fn value_count(&self) -> usize {
        let now = Instant::now();
        mutex_lock(&self.state, SOURCE, "value_count")
            .values
            .values()
            .filter(|(_, expires_at)| *expires_at > now)
            .count()
    }

    async fn simulate(&self) -> Result<(), CacheError> {
        let latency = self.latency_ms.load(Ordering::SeqCst);
        if latency > 0 {
            tokio::time::sleep(Duration::from_millis(latency)).await;
        }
        if self.reachable.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(CacheError::connection("memory backend marked unreachable"))
        }
    }
}

impl Default for MemoryBackend {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Backend for MemoryBackend {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, CacheError> {
        self.simulate().await?;
        let now = Instant::now();
        Ok(mutex_lock(&self.state, SOURCE, "get").value(key, now).cloned())
    }

    async fn set(&self, key: &str, value: Vec<u8>, ttl: Duration) -> Result<(), CacheError> {
        self.simulate().await?;
        let now = Instant::now();
        mutex_lock(&self.state, SOURCE, "set").apply(
            BatchOp::Set {
                key: key.to_string(),
                value,
                ttl,
            },
            now,
        );
        Ok(())
    }

    async fn exists(&self, key: &str) -> Result<bool, CacheError> {
        self.simulate().await?;
        let now = Instant::now();
        let mut state = mutex_lock(&self.state, SOURCE, "exists");
        Ok(state.value(key, now).is_some() || state.set_members(key, now).is_some())
    }

    async fn mget(&self, keys: &[String]) -> Result<Vec<Option<Vec<u8>>>, CacheError> {
        self.simulate().await?;
        let now = Instant::now();
        let mut state = mutex_lock(&self.state, SOURCE, "mget");
        Ok(keys
            .iter()
            .map(|key| state.value(key, now).cloned())
            .collect())
    }

    async fn mset(&self, pairs: Vec<(String, Vec<u8>)>, ttl: Duration) -> Result<(), CacheError> {
        self.simulate().await?;
        let now = Instant::now();
        let mut state = mutex_lock(&self.state, SOURCE, "mset");
        for (key, value) in pairs {
            state.apply(BatchOp::Set { key, value, ttl }, now);
        }
        Ok(())
    }

    async fn del(&self, keys: &[String]) -> Result<u64, CacheError> {
        self.simulate().await?;
        let now = Instant::now();
        let mut state = mutex_lock(&self.state, SOURCE, "del");
        Ok(keys.iter().filter(|key| state.remove(key, now)).count() as u64)
    }

    async fn members(&self, set_key: &str) -> Result<Vec<String>, CacheError> {
        self.simulate().await?;
        let now = Instant::now();
        Ok(mutex_lock(&self.state, SOURCE, "members")
            .set_members(set_key, now)
            .map(|members| members.iter().cloned().collect())
            .unwrap_or_default())
    }

    async fn members_many(&self, set_keys: &[String]) -> Result<Vec<Vec<String>>, CacheError> {
        self.simulate().await?;
        let now = Instant::now();
        let mut state = mutex_lock(&self.state, SOURCE, "members_many");
        Ok(set_keys
            .iter()
            .map(|key| {
                state
                    .set_members(key, now)
                    .map(|members| members.iter().cloned().collect())
                    .unwrap_or_default()
            })
            .collect())
    }

    async fn union(&self, set_keys: &[String]) -> Result<Vec<String>, CacheError> {
        self.simulate().await?;
        let now = Instant::now();
        let mut state = mutex_lock(&self.state, SOURCE, "union");
        let mut union = HashSet::new();
        for key in set_keys {
            if let Some(members) = state.set_members(key, now) {
                union.extend(members.iter().cloned());
            }
        }
        Ok(union.into_iter().collect())
    }

    async fn apply(&self, batch: Batch) -> Result<(), CacheError> {
        self.simulate().await?;
        let now = Instant::now();
        let mut state = mutex_lock(&self.state, SOURCE, "apply");
        for op in batch.into_ops() {
            state.apply(op, now);
        }
        Ok(())
    }

    async fn ping(&self) -> Result<(), CacheError> {
        self.simulate().await
    }
}
