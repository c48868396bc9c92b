use tracing_subscriber::util::TryInitError;
use tracing_subscriber::{EnvFilter, Registry, layer::SubscriberExt, util::SubscriberInitExt};

const FALLBACK_FILTER: &str = "info";

/// Installs the global subscriber. Logs go to stderr so stdout stays free for
/// offer links and results.
pub fn init_tracing(filter: &str) -> Result<(), TryInitError> {
    let env_filter =
        EnvFilter::try_new(filter).unwrap_or_else(|_| EnvFilter::new(FALLBACK_FILTER));
    let fmt_layer = tracing_subscriber::fmt::layer()
        .with_target(false)
        .with_writer(std::io::stderr);
    Registry::default().with(env_filter).with(fmt_layer).try_init()
}
