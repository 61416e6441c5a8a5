//! Structured logging initialization (spec §10 ambient: logging init).
//!
//! Plain `tracing_subscriber::registry()` with an `EnvFilter` and a format
//! layer — the non-OTel-gated half of the teacher's own `knhk-cli::tracing`
//! initializer. Metrics/trace export are out of scope (spec §1 Non-goals),
//! so no `opentelemetry*` layer is assembled here.

use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

/// Reads `RUST_LOG` (default `info`) the way the teacher's `init_tracing`
/// reads `KNHK_TRACE`, and installs a global subscriber.
pub fn init(format: LogFormat) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    let registry = tracing_subscriber::registry().with(filter);

    match format {
        LogFormat::Text => {
            let _ = registry.with(fmt::layer()).try_init();
        }
        LogFormat::Json => {
            let _ = registry.with(fmt::layer().json()).try_init();
        }
    }
}
