//! Backing store seam.
//!
//! [`Backend`] is the raw, fallible view of the shared key-value store. It
//! knows nothing about timeouts, availability or neutral return values; those
//! are layered on by [`super::StoreAdapter`].

use std::time::Duration;

use async_trait::async_trait;

use super::error::CacheError;

/// One command inside an atomic [`Batch`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BatchOp {
    Set {
        key: String,
        value: Vec<u8>,
        ttl: Duration,
    },
    SetAdd {
        key: String,
        members: Vec<String>,
    },
    SetRemove {
        key: String,
        members: Vec<String>,
    },
    Expire {
        key: String,
        ttl: Duration,
    },
    /// Like `Expire`, but never brings an existing expiry closer.
    ExtendExpire {
        key: String,
        ttl: Duration,
    },
    Delete {
        keys: Vec<String>,
    },
}

/// Commands applied all-or-nothing (`MULTI`/`EXEC` on Redis).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Batch {
    ops: Vec<BatchOp>,
}

impl Batch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&mut self, key: impl Into<String>, value: Vec<u8>, ttl: Duration) -> &mut Self {
        self.ops.push(BatchOp::Set {
            key: key.into(),
            value,
            ttl,
        });
        self
    }

    pub fn add_members(&mut self, key: impl Into<String>, members: Vec<String>) -> &mut Self {
        if !members.is_empty() {
            self.ops.push(BatchOp::SetAdd {
                key: key.into(),
                members,
            });
        }
        self
    }

    pub fn remove_members(&mut self, key: impl Into<String>, members: Vec<String>) -> &mut Self {
        if !members.is_empty() {
            self.ops.push(BatchOp::SetRemove {
                key: key.into(),
                members,
            });
        }
        self
    }

    pub fn expire(&mut self, key: impl Into<String>, ttl: Duration) -> &mut Self {
        self.ops.push(BatchOp::Expire {
            key: key.into(),
            ttl,
        });
        self
    }

    pub fn extend_expire(&mut self, key: impl Into<String>, ttl: Duration) -> &mut Self {
        self.ops.push(BatchOp::ExtendExpire {
            key: key.into(),
            ttl,
        });
        self
    }

    pub fn delete(&mut self, keys: Vec<String>) -> &mut Self {
        if !keys.is_empty() {
            self.ops.push(BatchOp::Delete { keys });
        }
        self
    }

    pub fn ops(&self) -> &[BatchOp] {
        &self.ops
    }

    pub fn into_ops(self) -> Vec<BatchOp> {
        self.ops
    }

    pub fn len(&self) -> usize {
        self.ops.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }
}

#[async_trait]
pub trait Backend: Send + Sync + 'static {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, CacheError>;

    async fn set(&self, key: &str, value: Vec<u8>, ttl: Duration) -> Result<(), CacheError>;

    async fn exists(&self, key: &str) -> Result<bool, CacheError>;

    /// Values in the same order as `keys`.
    async fn mget(&self, keys: &[String]) -> Result<Vec<Option<Vec<u8>>>, CacheError>;

    async fn mset(&self, pairs: Vec<(String, Vec<u8>)>, ttl: Duration) -> Result<(), CacheError>;

    /// Returns how many of `keys` existed.
    async fn del(&self, keys: &[String]) -> Result<u64, CacheError>;

    async fn members(&self, set_key: &str) -> Result<Vec<String>, CacheError>;

    /// Members of several sets, one entry per set, fetched in a single round trip.
    async fn members_many(&self, set_keys: &[String]) -> Result<Vec<Vec<String>>, CacheError>;

    async fn union(&self, set_keys: &[String]) -> Result<Vec<String>, CacheError>;

    async fn apply(&self, batch: Batch) -> Result<(), CacheError>;

    async fn ping(&self) -> Result<(), CacheError>;
}

/// Whole seconds for store-side expiry, never below one.
pub(crate) fn ttl_seconds(ttl: Duration) -> u64 {
    ttl.as_secs().max(1)
}
