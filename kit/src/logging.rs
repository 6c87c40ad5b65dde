//! Subscriber setup for binaries embedding the runtime.

use blockflow_core::LoggingConfig;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Registry};

/// Install a global subscriber driven by `config`. `RUST_LOG` wins over
/// `config.filter` when set.
///
/// Fails if the directive does not parse or a global subscriber is already
/// installed.
pub fn init_tracing(config: &LoggingConfig) -> anyhow::Result<()> {
    let filter = EnvFilter::try_new(directive(config, std::env::var("RUST_LOG").ok()))?;

    if config.json {
        Registry::default()
            .with(filter)
            .with(tracing_subscriber::fmt::layer().json().with_current_span(true))
            .try_init()?;
    } else {
        Registry::default()
            .with(filter)
            .with(tracing_subscriber::fmt::layer())
            .try_init()?;
    }
    Ok(())
}

/// Initialize a simple stdout tracing subscriber for development
pub fn init_stdout_tracing() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,blockflow_runtime=debug"));

    tracing_subscriber::fmt().with_env_filter(filter).init();
}

fn directive(config: &LoggingConfig, env: Option<String>) -> String {
    match env {
        Some(value) if !value.trim().is_empty() => value,
        _ => config.filter.clone(),
    }
}
