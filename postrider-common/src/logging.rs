use tracing::metadata::LevelFilter;
use tracing_subscriber::{
    EnvFilter, Layer, layer::SubscriberExt, util::SubscriberInitExt,
};

/// Initialise the process-wide tracing subscriber.
///
/// The filter is taken from `RUST_LOG` when set; otherwise debug builds
/// log at `TRACE` and release builds at `INFO`.
///
/// # Panics
/// Panics if a global subscriber has already been installed.
pub fn init() {
    let fallback = if cfg!(debug_assertions) {
        LevelFilter::TRACE
    } else {
        LevelFilter::INFO
    };

    let filter = EnvFilter::builder()
        .with_default_directive(fallback.into())
        .from_env_lossy();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::fmt::layer()
                .compact()
                .with_target(true)
                .with_filter(filter),
        )
        .init();
}

/// Like [`init`], but ignores an already-installed subscriber. Used by
/// tests that race to initialise logging.
pub fn try_init() {
    let filter = EnvFilter::builder()
        .with_default_directive(LevelFilter::WARN.into())
        .from_env_lossy();

    let _ = tracing_subscriber::registry()
        .with(
            tracing_subscriber::fmt::layer()
                .compact()
                .with_target(true)
                .with_filter(filter),
        )
        .try_init();
}
