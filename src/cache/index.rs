//! Tag index: tag → set of cache keys, plus key → set of tags.
//!
//! Both directions live in the backing store as sets so every worker process
//! sees the same index. Every mutation touching more than one set goes out as
//! one atomic batch; the sets carry a safety TTL longer than any entry so a
//! half-applied cleanup heals itself.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use tracing::debug;

use super::backend::Batch;
use super::config::{CacheConfig, DebugFlags, OperationClass, TAG_SAFETY_BUFFER_SECS};
use super::error::CacheError;
use super::keys::KeyCodec;
use super::stats::CacheStats;
use super::store::StoreAdapter;
use super::tags::Tag;

const TARGET: &str = "tagcache::cache::index";

pub struct TagIndex {
    store: Arc<StoreAdapter>,
    keys: KeyCodec,
    stats: Arc<CacheStats>,
    safety_ttl: Duration,
    debug: DebugFlags,
}

impl TagIndex {
    pub fn new(
        store: Arc<StoreAdapter>,
        keys: KeyCodec,
        stats: Arc<CacheStats>,
        config: &CacheConfig,
    ) -> Self {
        Self {
            store,
            keys,
            stats,
            safety_ttl: config.tag_safety_ttl(),
            debug: config.debug,
        }
    }

    pub fn safety_ttl(&self) -> Duration {
        self.safety_ttl
    }

    /// Tag sets must outlive the entry they index, even when a route
    /// overrides the TTL past the longest configured one.
    fn tag_ttl(&self, entry_ttl: Duration) -> Duration {
        self.safety_ttl
            .max(entry_ttl.saturating_add(Duration::from_secs(TAG_SAFETY_BUFFER_SECS)))
    }

    fn register(&self, batch: &mut Batch, key: &str, tags: &[Tag], entry_ttl: Duration) {
        if tags.is_empty() {
            return;
        }
        let tag_ttl = self.tag_ttl(entry_ttl);
        for tag in tags {
            let tag_key = self.keys.generate_tag_key(tag);
            batch
                .add_members(tag_key.clone(), vec![key.to_string()])
                .extend_expire(tag_key, tag_ttl);
        }
        let reverse = self.keys.key_tags_key(key);
        batch
            .add_members(
                reverse.clone(),
                tags.iter().map(|tag| tag.as_str().to_string()).collect(),
            )
            .extend_expire(reverse, tag_ttl);
    }

    fn soft<T>(&self, op: &'static str, key: &str, result: Result<T, CacheError>, neutral: T) -> T {
        match result {
            Ok(value) => value,
            Err(err) if err.is_unavailable() => {
                self.store.record_failure(op, key, &err);
                neutral
            }
            Err(err) => {
                self.store
                    .record_failure(op, key, &err.into_tag_operation(op));
                neutral
            }
        }
    }

    /// Attach `tags` to an existing entry.
    pub async fn add_tags(&self, key: &str, tags: &[Tag]) -> bool {
        if tags.is_empty() {
            return true;
        }
        let mut batch = Batch::new();
        self.register(&mut batch, key, tags, Duration::ZERO);
        let result = self
            .store
            .try_apply("add_tags", OperationClass::Write, batch)
            .await
            .map(|()| true);
        let added = self.soft("add_tags", key, result, false);
        if added && self.debug.tag_operations {
            debug!(target = TARGET, key, tags = ?tags, "Tags added");
        }
        added
    }

    /// Write an entry and its tag memberships in one atomic batch, so an entry
    /// is never visible without the tags that can invalidate it.
    pub async fn store_tagged(&self, key: &str, value: Vec<u8>, ttl: Duration, tags: &[Tag]) -> bool {
        if ttl.is_zero() {
            return false;
        }
        let mut batch = Batch::new();
        batch.set(key, value, ttl);
        self.register(&mut batch, key, tags, ttl);
        let result = self
            .store
            .try_apply("store_tagged", OperationClass::Write, batch)
            .await
            .map(|()| true);
        let stored = self.soft("store_tagged", key, result, false);
        if stored {
            self.stats.record_set();
            if self.debug.tag_operations && !tags.is_empty() {
                debug!(target = TARGET, key, tags = ?tags, "Entry stored with tags");
            }
        }
        stored
    }

    /// Drop `key` from every tag set it belongs to, using the reverse index.
    pub async fn remove_all_tags_for_key(&self, key: &str) -> bool {
        let reverse = self.keys.key_tags_key(key);
        let result = async {
            let tags = self.store.try_members(&reverse).await?;
            let mut batch = Batch::new();
            for tag in &tags {
                batch.remove_members(
                    self.keys.generate_tag_key(&Tag::new(tag.as_str())),
                    vec![key.to_string()],
                );
            }
            batch.delete(vec![reverse.clone()]);
            self.store
                .try_apply("remove_all_tags_for_key", OperationClass::Delete, batch)
                .await?;
            Ok::<usize, CacheError>(tags.len())
        }
        .await;
        match self.soft("remove_all_tags_for_key", key, result.map(Some), None) {
            Some(count) => {
                if self.debug.tag_operations {
                    debug!(target = TARGET, key, tags = count, "Tags removed for key");
                }
                true
            }
            None => false,
        }
    }

    /// Keys currently indexed under `tag`.
    pub async fn members_of(&self, tag: &Tag) -> Vec<String> {
        let tag_key = self.keys.generate_tag_key(tag);
        let result = self.store.try_members(&tag_key).await;
        let mut members = self.soft("members_of", tag.as_str(), result, Vec::new());
        members.sort();
        members
    }

    /// Delete every entry carrying any of `tags` and unlink it from all of its
    /// tag sets. Returns the number of keys found through the index, whether
    /// or not they had already expired from the store.
    pub async fn invalidate(&self, tags: &[Tag]) -> u64 {
        let tags: BTreeSet<&Tag> = tags.iter().collect();
        if tags.is_empty() {
            return 0;
        }
        let label = tags
            .iter()
            .map(|tag| tag.as_str())
            .collect::<Vec<_>>()
            .join(",");

        let result = self.invalidate_inner(&tags).await;
        let count = self.soft("invalidate", &label, result, 0);
        self.stats.record_invalidation(count);
        if self.debug.invalidations {
            debug!(target = TARGET, tags = %label, keys = count, "Tags invalidated");
        }
        count
    }

    async fn invalidate_inner(&self, tags: &BTreeSet<&Tag>) -> Result<u64, CacheError> {
        let tag_keys: Vec<String> = tags
            .iter()
            .map(|tag| self.keys.generate_tag_key(tag))
            .collect();
        let keys = self.store.try_union(&tag_keys).await?;
        if keys.is_empty() {
            return Ok(0);
        }

        let reverse_keys: Vec<String> = keys.iter().map(|key| self.keys.key_tags_key(key)).collect();
        let key_tags = self.store.try_members_many(&reverse_keys).await?;

        // Every tag set that may still reference one of the doomed keys.
        let mut touched: BTreeSet<String> = tag_keys.into_iter().collect();
        for linked in &key_tags {
            for tag in linked {
                touched.insert(self.keys.generate_tag_key(&Tag::new(tag.as_str())));
            }
        }

        let mut batch = Batch::new();
        let mut doomed = keys.clone();
        doomed.extend(reverse_keys);
        batch.delete(doomed);
        for tag_key in touched {
            batch.remove_members(tag_key, keys.clone());
        }
        self.store
            .try_apply("invalidate", OperationClass::Delete, batch)
            .await?;

        Ok(keys.len() as u64)
    }
}
