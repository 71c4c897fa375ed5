//! Tagged response cache.
//!
//! Read routes are wrapped with [`response_cache_layer`]; mutating routes with
//! [`invalidation_layer`]. Both share one [`CacheService`], which owns the
//! store adapter, the tag index and the statistics.
//!
//! ```text
//! GET  ─► key ─► store hit? ─► replay
//!                   └─ miss ─► handler ─► capture ─► write-behind ─► store + tags
//! POST ─► handler ─► 2xx? ─► tags (static ∪ dynamic ∪ rules) ─► invalidate
//! ```
//!
//! Entries and the tag index live in the shared backing store only, so any
//! number of worker processes can sit behind one Redis.

mod backend;
mod compression;
mod config;
mod entry;
mod error;
mod index;
mod interceptor;
mod invalidation;
mod keys;
mod lock;
mod memory;
mod middleware;
mod redis;
pub mod rules;
mod route;
mod service;
mod stats;
mod store;
mod tags;
mod writeback;

pub use backend::{Backend, Batch, BatchOp};
pub use compression::{CompressionCodec, Compressed};
pub use config::{
    CacheConfig, CompressionConfig, DebugFlags, OperationClass, TAG_SAFETY_BUFFER_SECS, Timeouts,
};
pub use entry::{CachedResponse, X_CACHE, X_CACHE_KEY};
pub use error::CacheError;
pub use index::TagIndex;
pub use interceptor::{ResponseInterceptor, intercept};
pub use invalidation::{InvalidationState, invalidation_layer};
pub use keys::{KeyCodec, Params, hash_params, parse_query};
pub use memory::MemoryBackend;
pub use middleware::{ResponseCacheState, response_cache_layer};
pub use self::redis::RedisBackend;
pub use route::{
    CacheRoute, InvalidationPlan, InvalidationRoute, MutationDetector, MutationRequest,
    MutationResponse, Principal, ResolvedKey, TagFn,
};
pub use rules::{AffectedIds, ChangedFields, Mutation, Region};
pub use service::CacheService;
pub use stats::{
    CacheStats, METRIC_DELETE_TOTAL, METRIC_ERROR_TOTAL, METRIC_HIT_TOTAL, METRIC_INVALIDATE_KEYS,
    METRIC_MISS_TOTAL, METRIC_SET_TOTAL, METRIC_STORE_AVAILABLE, METRIC_WRITE_DROPPED_TOTAL,
    StatsSnapshot,
};
pub use store::StoreAdapter;
pub use tags::Tag;
pub use writeback::{PersistJob, WriteBehind};
