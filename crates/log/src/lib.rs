use tracing_subscriber::{prelude::*, util::TryInitError, EnvFilter, Registry};

/// Filter used when `RUST_LOG` is unset or unparsable.
pub const DEFAULT_FILTER: &str = "info";

fn filter(default: &str) -> EnvFilter {
    EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(default))
        .unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER))
}

/// Installs the global subscriber: an `EnvFilter` read from `RUST_LOG`
/// feeding a formatter on stderr.
///
/// Fails if a global subscriber was already installed.
pub fn try_init_with(default_filter: &str) -> Result<(), TryInitError> {
    let subscriber = Registry::default();

    let fmt_layer = tracing_subscriber::fmt::Layer::default()
        .with_writer(std::io::stderr)
        .with_filter(filter(default_filter));

    subscriber.with(fmt_layer).try_init()
}

pub fn try_init() -> Result<(), TryInitError> {
    try_init_with(DEFAULT_FILTER)
}

/// Like [`try_init`], but a subscriber installed earlier (by a test harness
/// or an embedding application) is left in place.
pub fn init() {
    if try_init().is_err() {
        tracing::debug!("global subscriber already installed");
    }
}
