//! Cache error taxonomy.
//!
//! Every variant except [`CacheError::Configuration`] is soft: it is caught at
//! the boundary of the operation that raised it and turned into a neutral
//! value (`None`, `false`, `0`, or a cache miss).

use std::time::Duration;

use thiserror::Error;

use super::config::OperationClass;

const UNAVAILABLE: &str = "store marked unavailable";

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CacheError {
    #[error("backing store unreachable: {message}")]
    Connection { message: String },
    #[error("`{op}` exceeded the {class} timeout of {timeout_ms}ms")]
    Timeout {
        op: &'static str,
        class: OperationClass,
        timeout_ms: u64,
    },
    #[error("cache payload could not be encoded or decoded: {message}")]
    Serialization { message: String },
    #[error("tag operation `{op}` failed: {message}")]
    TagOperation { op: &'static str, message: String },
    #[error("invalid cache configuration for `{key}`: {reason}")]
    Configuration { key: &'static str, reason: String },
}

impl CacheError {
    pub fn connection(message: impl Into<String>) -> Self {
        Self::Connection {
            message: message.into(),
        }
    }

    /// A call skipped because the store is already known to be down.
    pub(crate) fn unavailable() -> Self {
        Self::connection(UNAVAILABLE)
    }

    pub(crate) fn is_unavailable(&self) -> bool {
        matches!(self, Self::Connection { message } if message == UNAVAILABLE)
    }

    pub fn timeout(op: &'static str, class: OperationClass, limit: Duration) -> Self {
        Self::Timeout {
            op,
            class,
            timeout_ms: u64::try_from(limit.as_millis()).unwrap_or(u64::MAX),
        }
    }

    pub fn serialization(message: impl Into<String>) -> Self {
        Self::Serialization {
            message: message.into(),
        }
    }

    pub fn tag_operation(op: &'static str, message: impl Into<String>) -> Self {
        Self::TagOperation {
            op,
            message: message.into(),
        }
    }

    pub fn configuration(key: &'static str, reason: impl Into<String>) -> Self {
        Self::Configuration {
            key,
            reason: reason.into(),
        }
    }

    /// Stable label used for metrics and structured logs.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Connection { .. } => "connection",
            Self::Timeout { .. } => "timeout",
            Self::Serialization { .. } => "serialization",
            Self::TagOperation { .. } => "tag_operation",
            Self::Configuration { .. } => "configuration",
        }
    }

    /// Wrap a store-level failure that happened while maintaining the tag index.
    pub(crate) fn into_tag_operation(self, op: &'static str) -> Self {
        match self {
            Self::TagOperation { .. } => self,
            other => Self::tag_operation(op, other.to_string()),
        }
    }
}

impl From<serde_json::Error> for CacheError {
    fn from(err: serde_json::Error) -> Self {
        Self::serialization(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timeout_reports_class_and_limit() {
        let err = CacheError::timeout("get", OperationClass::Read, Duration::from_millis(250));
        assert_eq!(err.kind(), "timeout");
        assert_eq!(err.to_string(), "`get` exceeded the read timeout of 250ms");
    }

    #[test]
    fn short_circuit_is_distinguishable_from_a_real_outage() {
        assert!(CacheError::unavailable().is_unavailable());
        assert_eq!(CacheError::unavailable().kind(), "connection");
        assert!(!CacheError::connection("refused").is_unavailable());
    }

    #[test]
    fn tag_operation_wrapping_keeps_original_message() {
        let err = CacheError::connection("refused").into_tag_operation("invalidate");
        assert_eq!(
            err,
            CacheError::tag_operation("invalidate", "backing store unreachable: refused")
        );

        let already = CacheError::tag_operation("add_tags", "boom");
        assert_eq!(already.clone().into_tag_operation("invalidate"), already);
    }
}
