//! Cache configuration.
//!
//! Resolved once at startup from the `[cache]` section of the settings (see
//! `crate::config`). Invalid values surface as [`CacheError::Configuration`]
//! and the caller falls back to [`CacheConfig::disabled`].

use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;

use super::error::CacheError;

pub const DEFAULT_PREFIX: &str = "app";
pub const DEFAULT_TTL_SECS: u64 = 3_600;
/// Added on top of the longest entry TTL to get the tag-set lifetime.
pub const TAG_SAFETY_BUFFER_SECS: u64 = 3_600;
const DEFAULT_READ_TIMEOUT_MS: u64 = 500;
const DEFAULT_WRITE_TIMEOUT_MS: u64 = 1_000;
const DEFAULT_DELETE_TIMEOUT_MS: u64 = 1_000;
const DEFAULT_COMPRESSION_THRESHOLD_BYTES: usize = 1_024;
const DEFAULT_HEALTH_CHECK_INTERVAL_MS: u64 = 30_000;
const DEFAULT_STATS_INTERVAL_SECS: u64 = 300;
const DEFAULT_WRITE_QUEUE_LIMIT: usize = 1_024;
const DEFAULT_BODY_LIMIT_BYTES: usize = 1024 * 1024;

/// Per-resource-type TTLs applied when no override is configured.
const DEFAULT_RESOURCE_TTLS: &[(&str, u64)] = &[
    ("card", 21_600),
    ("overview", 21_600),
    ("flashcards", 21_600),
    ("quiz", 21_600),
    ("category", 3_600),
    ("library", 1_800),
    ("members", 900),
    ("profile", 1_800),
    ("review_queue", 600),
    ("progress", 300),
    ("search", 300),
];

/// Timeout class of a store operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OperationClass {
    Read,
    Write,
    Delete,
}

impl OperationClass {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Read => "read",
            Self::Write => "write",
            Self::Delete => "delete",
        }
    }
}

impl fmt::Display for OperationClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Timeouts {
    pub read: Duration,
    pub write: Duration,
    pub delete: Duration,
}

impl Timeouts {
    pub fn for_class(&self, class: OperationClass) -> Duration {
        match class {
            OperationClass::Read => self.read,
            OperationClass::Write => self.write,
            OperationClass::Delete => self.delete,
        }
    }
}

impl Default for Timeouts {
    fn default() -> Self {
        Self {
            read: Duration::from_millis(DEFAULT_READ_TIMEOUT_MS),
            write: Duration::from_millis(DEFAULT_WRITE_TIMEOUT_MS),
            delete: Duration::from_millis(DEFAULT_DELETE_TIMEOUT_MS),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CompressionConfig {
    pub enabled: bool,
    /// Payloads strictly larger than this are compressed.
    pub threshold_bytes: usize,
}

impl Default for CompressionConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            threshold_bytes: DEFAULT_COMPRESSION_THRESHOLD_BYTES,
        }
    }
}

/// Independently toggleable debug logging.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DebugFlags {
    pub hits: bool,
    pub misses: bool,
    pub invalidations: bool,
    pub tag_operations: bool,
}

#[derive(Debug, Clone)]
pub struct CacheConfig {
    pub enabled: bool,
    /// Namespace for every key this process writes.
    pub prefix: String,
    pub default_ttl: Duration,
    pub ttls: BTreeMap<String, Duration>,
    pub timeouts: Timeouts,
    pub compression: CompressionConfig,
    pub debug: DebugFlags,
    pub health_check_interval: Duration,
    pub stats_interval: Duration,
    /// Pending post-response writes allowed before new ones are dropped.
    pub write_queue_limit: usize,
    /// Responses with larger bodies are passed through uncached.
    pub body_limit_bytes: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            prefix: DEFAULT_PREFIX.to_string(),
            default_ttl: Duration::from_secs(DEFAULT_TTL_SECS),
            ttls: DEFAULT_RESOURCE_TTLS
                .iter()
                .map(|(name, secs)| ((*name).to_string(), Duration::from_secs(*secs)))
                .collect(),
            timeouts: Timeouts::default(),
            compression: CompressionConfig::default(),
            debug: DebugFlags::default(),
            health_check_interval: Duration::from_millis(DEFAULT_HEALTH_CHECK_INTERVAL_MS),
            stats_interval: Duration::from_secs(DEFAULT_STATS_INTERVAL_SECS),
            write_queue_limit: DEFAULT_WRITE_QUEUE_LIMIT,
            body_limit_bytes: DEFAULT_BODY_LIMIT_BYTES,
        }
    }
}

impl CacheConfig {
    /// Configuration used when startup validation failed: everything passes through.
    pub fn disabled() -> Self {
        Self {
            enabled: false,
            ..Default::default()
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// TTL for a resource type, falling back to the default TTL.
    pub fn ttl_for(&self, resource_type: Option<&str>) -> Duration {
        resource_type
            .and_then(|name| self.ttls.get(name))
            .copied()
            .unwrap_or(self.default_ttl)
    }

    /// Lifetime of tag sets: the longest configured entry TTL plus a fixed buffer,
    /// so a tag never expires before an entry it indexes.
    pub fn tag_safety_ttl(&self) -> Duration {
        let longest = self
            .ttls
            .values()
            .copied()
            .fold(self.default_ttl, Duration::max);
        longest + Duration::from_secs(TAG_SAFETY_BUFFER_SECS)
    }

    pub fn validate(&self) -> Result<(), CacheError> {
        if self.prefix.trim().is_empty() {
            return Err(CacheError::configuration(
                "cache.prefix",
                "must not be empty",
            ));
        }
        if self.prefix.chars().any(|c| c.is_whitespace() || c == ':') {
            return Err(CacheError::configuration(
                "cache.prefix",
                "must not contain whitespace or `:`",
            ));
        }
        if self.default_ttl.is_zero() {
            return Err(CacheError::configuration(
                "cache.default_ttl_seconds",
                "must be greater than zero",
            ));
        }
        if let Some((name, _)) = self.ttls.iter().find(|(_, ttl)| ttl.is_zero()) {
            return Err(CacheError::configuration(
                "cache.ttl_seconds",
                format!("ttl for `{name}` must be greater than zero"),
            ));
        }
        for class in [
            OperationClass::Read,
            OperationClass::Write,
            OperationClass::Delete,
        ] {
            if self.timeouts.for_class(class).is_zero() {
                return Err(CacheError::configuration(
                    "cache.timeouts",
                    format!("{class} timeout must be greater than zero"),
                ));
            }
        }
        if self.health_check_interval.is_zero() {
            return Err(CacheError::configuration(
                "cache.health_check_interval_ms",
                "must be greater than zero",
            ));
        }
        if self.stats_interval.is_zero() {
            return Err(CacheError::configuration(
                "cache.stats_interval_seconds",
                "must be greater than zero",
            ));
        }
        if self.write_queue_limit == 0 {
            return Err(CacheError::configuration(
                "cache.write_queue_limit",
                "must be greater than zero",
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_values() {
        let config = CacheConfig::default();
        assert!(config.enabled);
        assert_eq!(config.prefix, "app");
        assert_eq!(config.default_ttl, Duration::from_secs(3_600));
        assert_eq!(config.ttl_for(Some("card")), Duration::from_secs(21_600));
        assert_eq!(config.timeouts.read, Duration::from_millis(500));
        assert!(config.compression.enabled);
        assert_eq!(config.compression.threshold_bytes, 1_024);
        assert_eq!(config.debug, DebugFlags::default());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn unknown_resource_type_uses_default_ttl() {
        let config = CacheConfig::default();
        assert_eq!(config.ttl_for(Some("unheard-of")), config.default_ttl);
        assert_eq!(config.ttl_for(None), config.default_ttl);
    }

    #[test]
    fn tag_safety_ttl_outlives_longest_entry() {
        let mut config = CacheConfig::default();
        config
            .ttls
            .insert("archive".to_string(), Duration::from_secs(86_400));
        assert_eq!(
            config.tag_safety_ttl(),
            Duration::from_secs(86_400 + TAG_SAFETY_BUFFER_SECS)
        );
    }

    #[test]
    fn disabled_turns_everything_off() {
        assert!(!CacheConfig::disabled().is_enabled());
    }

    #[test]
    fn rejects_prefix_with_separator() {
        let config = CacheConfig {
            prefix: "app:v2".to_string(),
            ..Default::default()
        };
        let err = config.validate().expect_err("prefix with colon");
        assert_eq!(err.kind(), "configuration");
    }

    #[test]
    fn rejects_zero_timeout() {
        let config = CacheConfig {
            timeouts: Timeouts {
                delete: Duration::ZERO,
                ..Default::default()
            },
            ..Default::default()
        };
        assert!(matches!(
            config.validate(),
            Err(CacheError::Configuration {
                key: "cache.timeouts",
                ..
            })
        ));
    }

    #[test]
    fn rejects_zero_resource_ttl() {
        let mut config = CacheConfig::default();
        config.ttls.insert("card".to_string(), Duration::ZERO);
        assert!(config.validate().is_err());
    }
}
