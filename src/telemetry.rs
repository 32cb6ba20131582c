use std::sync::Once;

use metrics::{Unit, describe_counter, describe_histogram};
use tracing_error::ErrorLayer;
use tracing_subscriber::{
    EnvFilter, fmt,
    layer::{Layer, SubscriberExt},
    util::SubscriberInitExt,
};

use crate::config::{LogFormat, LoggingSettings};
use crate::error::ConfigError;
use crate::stats::{
    METRIC_LOCAL_EVICT, METRIC_LOCAL_HIT, METRIC_LOCAL_MISS, METRIC_PRECOMPUTE,
    METRIC_REVALIDATION, METRIC_SHARED_ERROR, METRIC_SHARED_HIT, METRIC_SHARED_MISS,
    METRIC_SWEEP_REMOVED, METRIC_WARM_MS,
};

static METRIC_DESCRIPTIONS: Once = Once::new();

/// Install a global tracing subscriber using the provided logging settings.
pub fn init(logging: &LoggingSettings) -> Result<(), ConfigError> {
    describe_metrics();

    let env_filter = EnvFilter::builder()
        .with_default_directive(tracing::level_filters::LevelFilter::from(logging.level).into())
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
            ConfigError::invalid(format!("failed to install tracing subscriber: {err}"))
        })
}

/// Register metric descriptions with whatever recorder is installed.
///
/// Safe to call more than once; only the first call registers.
pub fn describe_metrics() {
    METRIC_DESCRIPTIONS.call_once(|| {
        describe_counter!(
            METRIC_LOCAL_HIT,
            Unit::Count,
            "Total number of local tier cache hits."
        );
        describe_counter!(
            METRIC_LOCAL_MISS,
            Unit::Count,
            "Total number of local tier cache misses."
        );
        describe_counter!(
            METRIC_LOCAL_EVICT,
            Unit::Count,
            "Total number of local tier evictions due to capacity."
        );
        describe_counter!(
            METRIC_SHARED_HIT,
            Unit::Count,
            "Total number of shared tier cache hits."
        );
        describe_counter!(
            METRIC_SHARED_MISS,
            Unit::Count,
            "Total number of shared tier cache misses."
        );
        describe_counter!(
            METRIC_SHARED_ERROR,
            Unit::Count,
            "Total number of shared tier transport failures absorbed as misses."
        );
        describe_counter!(
            METRIC_REVALIDATION,
            Unit::Count,
            "Total number of background revalidations started."
        );
        describe_counter!(
            METRIC_PRECOMPUTE,
            Unit::Count,
            "Total number of precomputed responses stored."
        );
        describe_counter!(
            METRIC_SWEEP_REMOVED,
            Unit::Count,
            "Total number of expired local entries removed by the sweep."
        );
        describe_histogram!(
            METRIC_WARM_MS,
            Unit::Milliseconds,
            "Duration of a full warm cycle."
        );
    });
}
