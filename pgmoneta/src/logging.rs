//! Structured logging via `tracing` + `tracing-subscriber`, the ambient
//! stack named in SPEC_FULL.md ("Logging").

use tracing_subscriber::{fmt, EnvFilter};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Text,
    Json,
}

/// Installs the global `tracing` subscriber. `RUST_LOG` overrides the
/// default filter (`info`); call once, at process startup, before any
/// other initialization that might log.
pub fn init(format: LogFormat) -> anyhow::Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    match format {
        LogFormat::Text => {
            fmt().with_env_filter(filter).with_target(true).init();
        }
        LogFormat::Json => {
            fmt().with_env_filter(filter).json().with_target(true).init();
        }
    }
    Ok(())
}
