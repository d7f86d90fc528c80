//! Structured logging initialization.

use std::sync::OnceLock;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

static LOGGER_INITIALIZED: OnceLock<()> = OnceLock::new();

/// Initialize structured logging once per process.
///
/// Filtering follows `RUST_LOG` and defaults to `info`. Setting
/// `CONDUCTOR_LOG_JSON=1` emits JSON lines instead of the human-readable
/// format. Safe to call from multiple entry points: if a global subscriber
/// is already installed this keeps it.
pub fn init_structured_logging() {
    LOGGER_INITIALIZED.get_or_init(|| {
        let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
        let json = std::env::var("CONDUCTOR_LOG_JSON").is_ok_and(|v| v == "1" || v == "true");

        let layer = if json {
            fmt::layer()
                .json()
                .with_target(true)
                .with_level(true)
                .boxed()
        } else {
            fmt::layer().with_target(true).with_level(true).boxed()
        };

        if tracing_subscriber::registry()
            .with(layer.with_filter(filter))
            .try_init()
            .is_err()
        {
            tracing::debug!("global tracing subscriber already initialized");
        }
    });
}
