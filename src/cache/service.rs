//! The cache service: one instance per process, shared by every middleware.

use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::debug;

use super::backend::Backend;
use super::compression::CompressionCodec;
use super::config::CacheConfig;
use super::error::CacheError;
use super::index::TagIndex;
use super::keys::KeyCodec;
use super::stats::CacheStats;
use super::store::StoreAdapter;
use super::tags::Tag;

const TARGET: &str = "tagcache::cache::service";

pub struct CacheService {
    config: CacheConfig,
    keys: KeyCodec,
    codec: CompressionCodec,
    stats: Arc<CacheStats>,
    store: Arc<StoreAdapter>,
    index: TagIndex,
}

impl CacheService {
    pub fn new(config: CacheConfig, backend: Arc<dyn Backend>) -> Self {
        let stats = Arc::new(CacheStats::new());
        let store = Arc::new(StoreAdapter::new(
            backend,
            config.timeouts,
            Arc::clone(&stats),
        ));
        let keys = KeyCodec::new(config.prefix.clone());
        let index = TagIndex::new(Arc::clone(&store), keys.clone(), Arc::clone(&stats), &config);
        Self {
            codec: CompressionCodec::new(config.compression),
            keys,
            stats,
            store,
            index,
            config,
        }
    }

    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    pub fn keys(&self) -> &KeyCodec {
        &self.keys
    }

    pub fn stats(&self) -> &Arc<CacheStats> {
        &self.stats
    }

    pub fn store(&self) -> &Arc<StoreAdapter> {
        &self.store
    }

    pub fn index(&self) -> &TagIndex {
        &self.index
    }

    pub fn is_enabled(&self) -> bool {
        self.config.is_enabled()
    }

    /// Fetch and decode an entry. Every failure along the way is a miss.
    pub async fn get<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        if !self.is_enabled() {
            return None;
        }
        let Some(stored) = self.store.get(key).await else {
            self.miss(key);
            return None;
        };
        let decoded = self
            .codec
            .decompress(&stored)
            .and_then(|raw| serde_json::from_slice::<T>(&raw).map_err(CacheError::from));
        match decoded {
            Ok(value) => {
                self.stats.record_hit();
                if self.config.debug.hits {
                    debug!(target = TARGET, key, "Cache hit");
                }
                Some(value)
            }
            Err(err) => {
                self.store.record_failure("get", key, &err);
                self.miss(key);
                None
            }
        }
    }

    fn miss(&self, key: &str) {
        self.stats.record_miss();
        if self.config.debug.misses {
            debug!(target = TARGET, key, "Cache miss");
        }
    }

    /// Encode, maybe compress, and store `value` together with its tags.
    pub async fn set<T: Serialize>(&self, key: &str, value: &T, ttl: Duration, tags: &[Tag]) -> bool {
        if !self.is_enabled() {
            return false;
        }
        let raw = match serde_json::to_vec(value) {
            Ok(raw) => raw,
            Err(err) => {
                self.store.record_failure("set", key, &CacheError::from(err));
                return false;
            }
        };
        let payload = self.codec.compress(raw);
        self.index.store_tagged(key, payload.data, ttl, tags).await
    }

    /// Remove one entry and its tag memberships.
    pub async fn delete(&self, key: &str) -> bool {
        if !self.is_enabled() {
            return false;
        }
        self.index.remove_all_tags_for_key(key).await;
        self.store.del(key).await
    }

    pub async fn exists(&self, key: &str) -> bool {
        self.is_enabled() && self.store.exists(key).await
    }

    pub async fn invalidate(&self, tags: &[Tag]) -> u64 {
        if !self.is_enabled() {
            return 0;
        }
        self.index.invalidate(tags).await
    }

    pub async fn members_of(&self, tag: &Tag) -> Vec<String> {
        if !self.is_enabled() {
            return Vec::new();
        }
        self.index.members_of(tag).await
    }
}
