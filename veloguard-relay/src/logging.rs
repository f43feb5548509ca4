use crate::config::LogLevel;
use crate::error::{RelayError, Result};
use std::sync::Once;
use tracing::Level;
use tracing_subscriber::filter::Directive;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

static INIT: Once = Once::new();

/// Initialize logging system
pub fn init_logging(level: LogLevel) -> Result<()> {
    let mut result = Ok(());

    INIT.call_once(|| {
        result = init_logging_inner(level);
    });

    result
}

fn tracing_level(level: LogLevel) -> Option<Level> {
    match level {
        LogLevel::Silent => None,
        LogLevel::Error => Some(Level::ERROR),
        LogLevel::Warning => Some(Level::WARN),
        LogLevel::Info => Some(Level::INFO),
        LogLevel::Debug => Some(Level::DEBUG),
    }
}

fn build_filter(level: Level) -> Result<EnvFilter> {
    let directive = |d: String| -> Result<Directive> {
        d.parse()
            .map_err(|e| RelayError::Config(format!("Invalid log directive: {}", e)))
    };

    Ok(EnvFilter::from_default_env()
        .add_directive(directive(format!("veloguard_relay={}", level))?)
        .add_directive(directive("tokio=warn".to_string())?)
        .add_directive(directive("mio=warn".to_string())?))
}

fn init_logging_inner(level: LogLevel) -> Result<()> {
    let Some(level) = tracing_level(level) else {
        return Ok(());
    };

    let fmt_layer = fmt::layer()
        .with_target(false)
        .with_thread_ids(false)
        .with_thread_names(false)
        .compact()
        .with_filter(build_filter(level)?);

    // Use try_init to avoid panic if tracing is already initialized
    if tracing_subscriber::registry().with(fmt_layer).try_init().is_ok() {
        tracing::info!("Logging initialized at level: {}", level);
    }
    Ok(())
}
