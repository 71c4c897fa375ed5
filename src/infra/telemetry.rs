use std::sync::Once;

use metrics::{Unit, describe_counter, describe_gauge, describe_histogram};
use tracing_error::ErrorLayer;
use tracing_subscriber::{
    EnvFilter, fmt,
    layer::{Layer, SubscriberExt},
    util::SubscriberInitExt,
};

use crate::cache::{
    METRIC_DELETE_TOTAL, METRIC_ERROR_TOTAL, METRIC_HIT_TOTAL, METRIC_INVALIDATE_KEYS,
    METRIC_MISS_TOTAL, METRIC_SET_TOTAL, METRIC_STORE_AVAILABLE, METRIC_WRITE_DROPPED_TOTAL,
};
use crate::config::{LogFormat, LoggingSettings};

use super::error::InfraError;

static METRIC_DESCRIPTIONS: Once = Once::new();

/// Install a global tracing subscriber using the provided logging settings.
pub fn init(logging: &LoggingSettings) -> Result<(), InfraError> {
    describe_metrics();

    let env_filter = EnvFilter::builder()
        .with_default_directive(logging.level.into())
        .from_env_lossy();

    let fmt_layer = match logging.format {
        LogFormat::Json => fmt::layer()
            .json()
            .with_current_span(true)
            .with_span_list(true)
            .with_target(true)
            .boxed(),
        LogFormat::Compact => fmt::layer().compact().with_target(true).boxed(),
    };

    tracing_subscriber::registry()
        .with(env_filter)
        .with(ErrorLayer::default())
        .with(fmt_layer)
        .try_init()
        .map_err(|err| {
            InfraError::telemetry(format!("failed to install tracing subscriber: {err}"))
        })
}

pub fn describe_metrics() {
    METRIC_DESCRIPTIONS.call_once(|| {
        describe_counter!(METRIC_HIT_TOTAL, Unit::Count, "Total number of cache hits.");
        describe_counter!(METRIC_MISS_TOTAL, Unit::Count, "Total number of cache misses.");
        describe_counter!(
            METRIC_SET_TOTAL,
            Unit::Count,
            "Total number of entries written to the backing store."
        );
        describe_counter!(
            METRIC_DELETE_TOTAL,
            Unit::Count,
            "Total number of entries deleted directly or through invalidation."
        );
        describe_counter!(
            METRIC_ERROR_TOTAL,
            Unit::Count,
            "Total number of soft cache failures, labelled by kind."
        );
        describe_counter!(
            METRIC_WRITE_DROPPED_TOTAL,
            Unit::Count,
            "Total number of post-response writes dropped because the queue was full."
        );
        describe_gauge!(
            METRIC_STORE_AVAILABLE,
            "1 when the backing store answered the last health probe, 0 otherwise."
        );
        describe_histogram!(
            METRIC_INVALIDATE_KEYS,
            Unit::Count,
            "Number of keys targeted by one invalidation."
        );
    });
}
